use chrono::{DateTime, Utc};

use streamlog_core::UserId;

/// A domain fact.
///
/// Each projection domain models its events as one closed enum; the variant
/// decides the type tag and the payload object written on the wire.
/// Decoding goes the other way through an [`crate::EventTypes`] registry.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable type tag (e.g. "chat.Message"), written as the `_` metadata field.
    fn meta_type(&self) -> &'static str;

    /// Serialize the payload object (single line JSON).
    fn encode_payload(&self) -> serde_json::Result<String>;
}

/// Metadata common to every event.
///
/// - `timestamp`: effective (business) time
/// - `timestamp_of_recording`: wall time of the write; equals `timestamp`
///   unless the event was explicitly backdated
/// - `user_id`: resource owner (`None` = system-authored)
/// - `impersonating_user_id`: actual actor when different from `user_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    timestamp: DateTime<Utc>,
    timestamp_of_recording: Option<DateTime<Utc>>,
    user_id: Option<UserId>,
    impersonating_user_id: Option<UserId>,
}

impl EventMeta {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            timestamp_of_recording: None,
            user_id: None,
            impersonating_user_id: None,
        }
    }

    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self.normalize();
        self
    }

    pub fn impersonated_by(mut self, actor: UserId) -> Self {
        self.impersonating_user_id = Some(actor);
        self.normalize();
        self
    }

    /// Record that the event was written at `recorded_at` although it took
    /// effect at `timestamp`.
    pub fn backdated(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.timestamp_of_recording = Some(recorded_at);
        self.normalize();
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn timestamp_of_recording(&self) -> DateTime<Utc> {
        self.timestamp_of_recording.unwrap_or(self.timestamp)
    }

    pub fn is_backdated(&self) -> bool {
        self.timestamp_of_recording.is_some()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn impersonating_user_id(&self) -> Option<&UserId> {
        self.impersonating_user_id.as_ref()
    }

    /// Whoever actually performed the action.
    pub fn actor(&self) -> Option<&UserId> {
        self.impersonating_user_id.as_ref().or(self.user_id.as_ref())
    }

    // Redundant encodings are never stored.
    fn normalize(&mut self) {
        if self.impersonating_user_id.is_some() && self.impersonating_user_id == self.user_id {
            self.impersonating_user_id = None;
        }
        if self.timestamp_of_recording == Some(self.timestamp) {
            self.timestamp_of_recording = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn impersonation_by_self_is_cleared() {
        let meta = EventMeta::now()
            .with_user(user("u1"))
            .impersonated_by(user("u1"));
        assert_eq!(meta.impersonating_user_id(), None);
        assert_eq!(meta.actor(), Some(&user("u1")));

        let meta = EventMeta::now()
            .impersonated_by(user("admin"))
            .with_user(user("admin"));
        assert_eq!(meta.impersonating_user_id(), None);
    }

    #[test]
    fn actor_prefers_impersonator() {
        let meta = EventMeta::now()
            .with_user(user("u1"))
            .impersonated_by(user("admin"));
        assert_eq!(meta.actor(), Some(&user("admin")));
        assert_eq!(meta.user_id(), Some(&user("u1")));
    }

    #[test]
    fn recording_time_defaults_to_timestamp() {
        let t = Utc.with_ymd_and_hms(2020, 8, 20, 8, 55, 0).unwrap();
        let meta = EventMeta::new(t);
        assert_eq!(meta.timestamp_of_recording(), t);
        assert!(!meta.is_backdated());

        let later = Utc.with_ymd_and_hms(2020, 9, 1, 0, 0, 0).unwrap();
        let meta = EventMeta::new(t).backdated(later);
        assert_eq!(meta.timestamp_of_recording(), later);
        assert!(meta.is_backdated());

        assert!(!EventMeta::new(t).backdated(t).is_backdated());
    }
}

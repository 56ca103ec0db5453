//! One-line text format for events.
//!
//! A serialized event is two JSON values separated by a single space:
//!
//! ```text
//! {"_":"credential.Created","t":"2020-08-20T08:55:00.123Z","u":"u987"} {"Id":"123"}
//! ```
//!
//! The first object is the metadata (strict: unknown fields are rejected),
//! the second is the payload (lenient: unknown fields are ignored so older
//! readers keep working when events gain fields).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use streamlog_core::UserId;

use crate::envelope::EventEnvelope;
use crate::error::CodecError;
use crate::event::{Event, EventMeta};

type DecodeFn<E> = Arc<dyn Fn(&str) -> serde_json::Result<E> + Send + Sync>;

/// Registry of the event types that may appear in a stream, keyed by tag.
///
/// A projection declares "which events can appear here" by the registry it
/// hands to its decoder; anything else fails with `UnknownType`.
pub struct EventTypes<E> {
    decoders: HashMap<&'static str, DecodeFn<E>>,
}

impl<E: 'static> EventTypes<E> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register payload type `P` under `tag`, wrapped into the domain enum by
    /// `wrap` (usually the variant constructor).
    pub fn register<P>(mut self, tag: &'static str, wrap: fn(P) -> E) -> Self
    where
        P: DeserializeOwned + 'static,
    {
        let decode: DecodeFn<E> = Arc::new(move |raw| serde_json::from_str::<P>(raw).map(wrap));
        self.decoders.insert(tag, decode);
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    fn decode(&self, tag: &str, payload: &str) -> Result<E, CodecError> {
        let decode = self
            .decoders
            .get(tag)
            .ok_or_else(|| CodecError::UnknownType(tag.to_string()))?;
        decode(payload).map_err(|source| CodecError::Payload {
            tag: tag.to_string(),
            source,
        })
    }
}

impl<E: 'static> Default for EventTypes<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventTypes<E> {
    fn clone(&self) -> Self {
        Self {
            decoders: self.decoders.clone(),
        }
    }
}

impl<E> core::fmt::Debug for EventTypes<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("EventTypes").field("tags", &tags).finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireMeta {
    #[serde(rename = "_")]
    tag: String,
    t: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    u: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ui: Option<String>,
}

/// Serialize one event to its line form (no trailing newline).
pub fn serialize_event<E: Event>(envelope: &EventEnvelope<E>) -> Result<String, CodecError> {
    let meta = envelope.meta();
    let wire = WireMeta {
        tag: envelope.payload().meta_type().to_string(),
        t: format_timestamp(meta.timestamp()),
        tr: meta
            .is_backdated()
            .then(|| format_timestamp(meta.timestamp_of_recording())),
        u: meta.user_id().map(|u| u.as_str().to_string()),
        ui: meta.impersonating_user_id().map(|u| u.as_str().to_string()),
    };

    let meta_json = serde_json::to_string(&wire).map_err(CodecError::Metadata)?;
    let payload_json = envelope
        .payload()
        .encode_payload()
        .map_err(|source| CodecError::Payload {
            tag: wire.tag.clone(),
            source,
        })?;

    Ok(format!("{meta_json} {payload_json}"))
}

/// Decode one line against `types`.
pub fn deserialize_event<E: 'static>(
    line: &str,
    types: &EventTypes<E>,
) -> Result<EventEnvelope<E>, CodecError> {
    let mut values = serde_json::Deserializer::from_str(line).into_iter::<WireMeta>();
    let wire = match values.next() {
        Some(Ok(wire)) => wire,
        Some(Err(e)) => return Err(CodecError::Metadata(e)),
        None => return Err(CodecError::Malformed("empty line".to_string())),
    };
    let payload = line[values.byte_offset()..]
        .strip_prefix(' ')
        .ok_or_else(|| CodecError::Malformed("expected a space after metadata".to_string()))?;

    let payload = types.decode(&wire.tag, payload)?;

    let mut meta = EventMeta::new(parse_timestamp(&wire.t)?);
    if let Some(tr) = wire.tr {
        meta = meta.backdated(parse_timestamp(&tr)?);
    }
    if let Some(u) = wire.u {
        meta = meta.with_user(UserId::new(u)?);
    }
    if let Some(ui) = wire.ui {
        meta = meta.impersonated_by(UserId::new(ui)?);
    }

    Ok(EventEnvelope::new(meta, payload))
}

/// RFC 3339 in UTC, rounded to milliseconds; the fraction is only written
/// when non-zero so the common case stays short.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    let rounded = ts.duration_round(TimeDelta::milliseconds(1)).unwrap_or(ts);
    if rounded.timestamp_subsec_millis() == 0 {
        rounded.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    } else {
        rounded.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, CodecError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CodecError::Timestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CredentialCreated {
        #[serde(rename = "Id")]
        id: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CredentialRemoved {
        #[serde(rename = "Id")]
        id: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum CredentialEvent {
        Created(CredentialCreated),
        Removed(CredentialRemoved),
    }

    impl Event for CredentialEvent {
        fn meta_type(&self) -> &'static str {
            match self {
                CredentialEvent::Created(_) => "credential.Created",
                CredentialEvent::Removed(_) => "credential.Removed",
            }
        }

        fn encode_payload(&self) -> serde_json::Result<String> {
            match self {
                CredentialEvent::Created(e) => serde_json::to_string(e),
                CredentialEvent::Removed(e) => serde_json::to_string(e),
            }
        }
    }

    fn types() -> EventTypes<CredentialEvent> {
        EventTypes::new()
            .register("credential.Created", CredentialEvent::Created)
            .register("credential.Removed", CredentialEvent::Removed)
    }

    fn created(id: &str) -> CredentialEvent {
        CredentialEvent::Created(CredentialCreated { id: id.to_string() })
    }

    #[test]
    fn matches_documented_line_format() {
        let t = Utc.with_ymd_and_hms(2020, 8, 20, 8, 55, 0).unwrap() + TimeDelta::milliseconds(123);
        let meta = EventMeta::new(t).with_user(UserId::new("u987").unwrap());
        let line = serialize_event(&EventEnvelope::new(meta, created("123"))).unwrap();
        assert_eq!(
            line,
            r#"{"_":"credential.Created","t":"2020-08-20T08:55:00.123Z","u":"u987"} {"Id":"123"}"#
        );
    }

    #[test]
    fn whole_seconds_omit_the_fraction_and_system_events_omit_the_user() {
        let t = Utc.with_ymd_and_hms(2020, 8, 20, 8, 55, 0).unwrap();
        let line = serialize_event(&EventEnvelope::new(EventMeta::new(t), created("1"))).unwrap();
        assert_eq!(line, r#"{"_":"credential.Created","t":"2020-08-20T08:55:00Z"} {"Id":"1"}"#);
    }

    #[test]
    fn sub_millisecond_precision_is_rounded() {
        let t = Utc.with_ymd_and_hms(2020, 8, 20, 8, 55, 0).unwrap() + TimeDelta::microseconds(999_700);
        assert_eq!(format_timestamp(t), "2020-08-20T08:55:01Z");
        let t = Utc.with_ymd_and_hms(2020, 8, 20, 8, 55, 0).unwrap() + TimeDelta::microseconds(1_600);
        assert_eq!(format_timestamp(t), "2020-08-20T08:55:00.002Z");
    }

    #[test]
    fn decodes_metadata_and_payload() {
        let line = r#"{"_":"credential.Removed","t":"2020-08-20T08:55:00.123Z","tr":"2020-08-21T00:00:00Z","u":"u987","ui":"admin"} {"Id":"9"}"#;
        let env = deserialize_event(line, &types()).unwrap();
        assert_eq!(
            env.payload(),
            &CredentialEvent::Removed(CredentialRemoved { id: "9".to_string() })
        );
        assert_eq!(env.meta().user_id().unwrap().as_str(), "u987");
        assert_eq!(env.meta().impersonating_user_id().unwrap().as_str(), "admin");
        assert!(env.meta().is_backdated());
        assert_eq!(
            env.meta().timestamp(),
            Utc.with_ymd_and_hms(2020, 8, 20, 8, 55, 0).unwrap() + TimeDelta::milliseconds(123)
        );
    }

    #[test]
    fn payload_tolerates_unknown_fields() {
        let line = r#"{"_":"credential.Created","t":"2020-08-20T08:55:00Z"} {"Id":"1","Added":"later"}"#;
        let env = deserialize_event(line, &types()).unwrap();
        assert_eq!(env.payload(), &created("1"));
    }

    #[test]
    fn metadata_rejects_unknown_fields() {
        let line = r#"{"_":"credential.Created","t":"2020-08-20T08:55:00Z","x":1} {"Id":"1"}"#;
        assert!(matches!(
            deserialize_event(line, &types()),
            Err(CodecError::Metadata(_))
        ));
    }

    #[test]
    fn unknown_type_tag_fails() {
        let line = r#"{"_":"credential.Rotated","t":"2020-08-20T08:55:00Z"} {"Id":"1"}"#;
        match deserialize_event(line, &types()) {
            Err(CodecError::UnknownType(tag)) => assert_eq!(tag, "credential.Rotated"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn malformed_lines_fail() {
        assert!(deserialize_event("", &types()).is_err());
        assert!(deserialize_event(r#"{"_":"credential.Created","t":"2020-08-20T08:55:00Z"}"#, &types()).is_err());
        assert!(deserialize_event(r#"{"_":"credential.Created","t":"yesterday"} {"Id":"1"}"#, &types()).is_err());
        assert!(deserialize_event(r#"{"_":"credential.Created","t":"2020-08-20T08:55:00Z"} {"Id":1}"#, &types()).is_err());
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_split() {
        let meta = EventMeta::new(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
        let ev = created("} {tricky");
        let line = serialize_event(&EventEnvelope::new(meta, ev.clone())).unwrap();
        assert_eq!(deserialize_event(&line, &types()).unwrap().payload(), &ev);
    }
}

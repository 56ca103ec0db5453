//! System bookkeeping events, written unencrypted as `Meta` log entries.

use serde::{Deserialize, Serialize};
use streamlog_core::{StreamName, SubscriberId};

use crate::codec::EventTypes;
use crate::crypto::DekEnvelope;
use crate::event::Event;

/// Version 0 of every stream. Carries the stream's wrapped DEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamStarted {
    pub dek_envelope: DekEnvelope,
}

/// Written to the parent when a child stream is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChildStreamCreated {
    pub stream: StreamName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionSubscribed {
    pub id: SubscriberId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionUnsubscribed {
    pub id: SubscriberId,
}

/// The fixed meta-event vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaEvent {
    StreamStarted(StreamStarted),
    ChildStreamCreated(ChildStreamCreated),
    SubscriptionSubscribed(SubscriptionSubscribed),
    SubscriptionUnsubscribed(SubscriptionUnsubscribed),
}

pub const STREAM_STARTED: &str = "StreamStarted";
pub const CHILD_STREAM_CREATED: &str = "ChildStreamCreated";
pub const SUBSCRIPTION_SUBSCRIBED: &str = "SubscriptionSubscribed";
pub const SUBSCRIPTION_UNSUBSCRIBED: &str = "SubscriptionUnsubscribed";

impl MetaEvent {
    pub fn stream_started(dek_envelope: DekEnvelope) -> Self {
        MetaEvent::StreamStarted(StreamStarted { dek_envelope })
    }

    pub fn child_stream_created(stream: StreamName) -> Self {
        MetaEvent::ChildStreamCreated(ChildStreamCreated { stream })
    }

    pub fn subscribed(id: SubscriberId) -> Self {
        MetaEvent::SubscriptionSubscribed(SubscriptionSubscribed { id })
    }

    pub fn unsubscribed(id: SubscriberId) -> Self {
        MetaEvent::SubscriptionUnsubscribed(SubscriptionUnsubscribed { id })
    }

    /// Registry used by every `Meta` decoder.
    pub fn types() -> EventTypes<MetaEvent> {
        EventTypes::new()
            .register(STREAM_STARTED, MetaEvent::StreamStarted)
            .register(CHILD_STREAM_CREATED, MetaEvent::ChildStreamCreated)
            .register(SUBSCRIPTION_SUBSCRIBED, MetaEvent::SubscriptionSubscribed)
            .register(SUBSCRIPTION_UNSUBSCRIBED, MetaEvent::SubscriptionUnsubscribed)
    }
}

impl Event for MetaEvent {
    fn meta_type(&self) -> &'static str {
        match self {
            MetaEvent::StreamStarted(_) => STREAM_STARTED,
            MetaEvent::ChildStreamCreated(_) => CHILD_STREAM_CREATED,
            MetaEvent::SubscriptionSubscribed(_) => SUBSCRIPTION_SUBSCRIBED,
            MetaEvent::SubscriptionUnsubscribed(_) => SUBSCRIPTION_UNSUBSCRIBED,
        }
    }

    fn encode_payload(&self) -> serde_json::Result<String> {
        match self {
            MetaEvent::StreamStarted(e) => serde_json::to_string(e),
            MetaEvent::ChildStreamCreated(e) => serde_json::to_string(e),
            MetaEvent::SubscriptionSubscribed(e) => serde_json::to_string(e),
            MetaEvent::SubscriptionUnsubscribed(e) => serde_json::to_string(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{deserialize_event, serialize_event};
    use crate::envelope::EventEnvelope;
    use crate::event::EventMeta;
    use chrono::{TimeZone, Utc};

    #[test]
    fn child_stream_created_line() {
        let meta = EventMeta::new(Utc.with_ymd_and_hms(2021, 3, 1, 12, 0, 0).unwrap());
        let ev = MetaEvent::child_stream_created(StreamName::new("/a/b").unwrap());
        let line = serialize_event(&EventEnvelope::new(meta, ev.clone())).unwrap();
        assert_eq!(
            line,
            r#"{"_":"ChildStreamCreated","t":"2021-03-01T12:00:00Z"} {"Stream":"/a/b"}"#
        );
        assert_eq!(deserialize_event(&line, &MetaEvent::types()).unwrap().payload(), &ev);
    }

    #[test]
    fn every_variant_is_registered() {
        let types = MetaEvent::types();
        for ev in [
            MetaEvent::stream_started(DekEnvelope::new(vec![7; 4])),
            MetaEvent::child_stream_created(StreamName::root()),
            MetaEvent::subscribed(SubscriberId::new("s1").unwrap()),
            MetaEvent::unsubscribed(SubscriberId::new("s1").unwrap()),
        ] {
            assert!(types.contains(ev.meta_type()));
        }
        assert_eq!(types.len(), 4);
    }
}

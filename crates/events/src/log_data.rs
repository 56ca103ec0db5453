use streamlog_core::Cursor;

use crate::codec::serialize_event;
use crate::crypto::{self, Dek};
use crate::envelope::EventEnvelope;
use crate::error::PayloadError;
use crate::event::Event;
use crate::meta::MetaEvent;

/// What a stored entry holds.
///
/// Codes are persisted; never renumber. Codes written by newer software are
/// kept as `Other` so older readers can still step over them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogDataKind {
    /// Exactly one unencrypted [`MetaEvent`] line.
    Meta,
    /// One or more application event lines, sealed with the stream's DEK.
    EncryptedData,
    Other(i16),
}

impl LogDataKind {
    pub fn code(self) -> i16 {
        match self {
            LogDataKind::Meta => 1,
            LogDataKind::EncryptedData => 2,
            LogDataKind::Other(code) => code,
        }
    }

    pub fn from_code(code: i16) -> Self {
        match code {
            1 => LogDataKind::Meta,
            2 => LogDataKind::EncryptedData,
            other => LogDataKind::Other(other),
        }
    }
}

impl core::fmt::Display for LogDataKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LogDataKind::Meta => f.write_str("meta"),
            LogDataKind::EncryptedData => f.write_str("encrypted-data"),
            LogDataKind::Other(code) => write!(f, "kind-{code}"),
        }
    }
}

/// The payload stored at one stream position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogData {
    pub kind: LogDataKind,
    pub raw: Vec<u8>,
}

impl LogData {
    pub fn new(kind: LogDataKind, raw: Vec<u8>) -> Self {
        Self { kind, raw }
    }

    pub fn meta(event: &EventEnvelope<MetaEvent>) -> Result<Self, PayloadError> {
        let line = serialize_event(event)?;
        Ok(Self::new(LogDataKind::Meta, line.into_bytes()))
    }

    /// Serialize each event to a line, join with `\n`, then seal under `dek`.
    pub fn encrypt_events<E: Event>(
        events: &[EventEnvelope<E>],
        dek: &Dek,
    ) -> Result<Self, PayloadError> {
        if events.is_empty() {
            return Err(PayloadError::EmptyBatch);
        }

        let lines = events
            .iter()
            .map(serialize_event)
            .collect::<Result<Vec<_>, _>>()?;

        let raw = crypto::seal(lines.join("\n").as_bytes(), dek)?;
        Ok(Self::new(LogDataKind::EncryptedData, raw))
    }

    /// Inverse of the framing in [`LogData::encrypt_events`]: the plaintext lines.
    pub fn decrypt_lines(&self, dek: &Dek) -> Result<Vec<String>, PayloadError> {
        let plaintext = String::from_utf8(crypto::open(&self.raw, dek)?)?;
        Ok(plaintext.split('\n').map(str::to_string).collect())
    }
}

/// `(cursor, data)`: the unit stored at one stream position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub cursor: Cursor,
    pub data: LogData,
}

impl LogEntry {
    pub fn new(cursor: Cursor, data: LogData) -> Self {
        Self { cursor, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMeta;
    use streamlog_core::StreamName;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(LogDataKind::Meta.code(), 1);
        assert_eq!(LogDataKind::EncryptedData.code(), 2);
        assert_eq!(LogDataKind::from_code(2), LogDataKind::EncryptedData);
        assert_eq!(LogDataKind::from_code(9), LogDataKind::Other(9));
        assert_eq!(LogDataKind::from_code(9).code(), 9);
    }

    #[test]
    fn empty_batches_are_rejected() {
        let none: Vec<EventEnvelope<MetaEvent>> = vec![];
        assert!(matches!(
            LogData::encrypt_events(&none, &Dek::generate()),
            Err(PayloadError::EmptyBatch)
        ));
    }

    #[test]
    fn encrypted_batch_keeps_one_line_per_event() {
        let dek = Dek::generate();
        let events: Vec<_> = ["/a", "/b", "/c"]
            .iter()
            .map(|s| {
                EventEnvelope::new(
                    EventMeta::now(),
                    MetaEvent::child_stream_created(StreamName::new(*s).unwrap()),
                )
            })
            .collect();

        let data = LogData::encrypt_events(&events, &dek).unwrap();
        assert_eq!(data.kind, LogDataKind::EncryptedData);

        let lines = data.decrypt_lines(&dek).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with(r#"{"Stream":"/b"}"#));
    }

    #[test]
    fn meta_entries_are_plain_text() {
        let ev = EventEnvelope::new(
            EventMeta::now(),
            MetaEvent::child_stream_created(StreamName::new("/x").unwrap()),
        );
        let data = LogData::meta(&ev).unwrap();
        assert_eq!(data.kind, LogDataKind::Meta);
        assert!(String::from_utf8(data.raw).unwrap().contains("ChildStreamCreated"));
    }
}

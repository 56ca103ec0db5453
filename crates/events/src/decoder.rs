//! Turning stored entries back into typed events.
//!
//! A projection declares, per [`LogDataKind`], how raw bytes become events.
//! Kinds it does not declare are stepped over by the reader with an empty
//! batch, so bookkeeping entries stay invisible to most projections.

use std::sync::Arc;

use async_trait::async_trait;
use streamlog_core::StreamName;

use crate::codec::{deserialize_event, EventTypes};
use crate::crypto::Dek;
use crate::envelope::EventEnvelope;
use crate::error::PayloadError;
use crate::log_data::{LogDataKind, LogEntry};
use crate::meta::MetaEvent;

/// Anything able to hand out a stream's DEK (normally the client's cache).
#[async_trait]
pub trait DekSource: Send + Sync {
    async fn load_dek(&self, stream: &StreamName) -> Result<Dek, PayloadError>;
}

#[async_trait]
impl<S> DekSource for Arc<S>
where
    S: DekSource + ?Sized,
{
    async fn load_dek(&self, stream: &StreamName) -> Result<Dek, PayloadError> {
        (**self).load_dek(stream).await
    }
}

/// Decodes the entries of one kind.
#[async_trait]
pub trait LogDataDecoder<E>: Send + Sync {
    async fn decode(
        &self,
        entry: &LogEntry,
        keys: &dyn DekSource,
    ) -> Result<Vec<EventEnvelope<E>>, PayloadError>;
}

/// `(kind, decoder, encrypted)`.
///
/// `encrypted` marks projections whose snapshots must be sealed with the
/// stream's DEK as well: if any registered kind is encrypted, so is the
/// snapshot.
pub struct LogDataKindDeserializer<E> {
    pub kind: LogDataKind,
    pub decoder: Arc<dyn LogDataDecoder<E>>,
    pub encrypted: bool,
}

impl<E: Send + Sync + 'static> LogDataKindDeserializer<E> {
    pub fn new(kind: LogDataKind, decoder: Arc<dyn LogDataDecoder<E>>, encrypted: bool) -> Self {
        Self {
            kind,
            decoder,
            encrypted,
        }
    }

    /// Application events sealed with the stream's DEK.
    pub fn encrypted_data(types: EventTypes<E>) -> Self {
        Self::new(
            LogDataKind::EncryptedData,
            Arc::new(EncryptedDataDecoder { types }),
            true,
        )
    }

    /// System meta events, mapped into the projection's own event type.
    pub fn meta(wrap: fn(MetaEvent) -> E) -> Self {
        Self::new(
            LogDataKind::Meta,
            Arc::new(MetaDecoder {
                types: MetaEvent::types(),
                wrap,
            }),
            false,
        )
    }
}

impl<E> Clone for LogDataKindDeserializer<E> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            decoder: Arc::clone(&self.decoder),
            encrypted: self.encrypted,
        }
    }
}

impl<E> core::fmt::Debug for LogDataKindDeserializer<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LogDataKindDeserializer")
            .field("kind", &self.kind)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

pub struct EncryptedDataDecoder<E> {
    types: EventTypes<E>,
}

#[async_trait]
impl<E: Send + Sync + 'static> LogDataDecoder<E> for EncryptedDataDecoder<E> {
    async fn decode(
        &self,
        entry: &LogEntry,
        keys: &dyn DekSource,
    ) -> Result<Vec<EventEnvelope<E>>, PayloadError> {
        let dek = keys.load_dek(entry.cursor.stream()).await?;
        entry
            .data
            .decrypt_lines(&dek)?
            .iter()
            .map(|line| deserialize_event(line, &self.types).map_err(PayloadError::from))
            .collect()
    }
}

pub struct MetaDecoder<E> {
    types: EventTypes<MetaEvent>,
    wrap: fn(MetaEvent) -> E,
}

#[async_trait]
impl<E: Send + Sync + 'static> LogDataDecoder<E> for MetaDecoder<E> {
    async fn decode(
        &self,
        entry: &LogEntry,
        _keys: &dyn DekSource,
    ) -> Result<Vec<EventEnvelope<E>>, PayloadError> {
        let line = String::from_utf8(entry.data.raw.clone())?;
        let event = deserialize_event(&line, &self.types)?;
        Ok(vec![event.map(self.wrap)])
    }
}

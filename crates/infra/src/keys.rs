//! Key management boundary.
//!
//! Every stream has its own data encryption key (DEK). The key service hands
//! out a wrapped DEK (the envelope) when a stream is created; the envelope
//! is stored in the stream's `StreamStarted` entry and later unwrapped again
//! to read the stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use streamlog_core::{Cursor, StreamName};
use streamlog_events::crypto;
use streamlog_events::{deserialize_event, CryptoError, Dek, DekEnvelope, LogDataKind, MetaEvent};

use crate::event_log::{EventLog, EventLogError};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("stream not found: {0}")]
    StreamNotFound(StreamName),

    #[error("no usable key envelope for {stream}: {reason}")]
    MissingEnvelope { stream: StreamName, reason: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Log(#[from] EventLogError),
}

/// The key service as seen by the client.
#[async_trait]
pub trait SystemConnector: Send + Sync {
    /// A freshly generated, wrapped DEK for a stream about to be created.
    async fn dek_envelope_for_new_stream(
        &self,
        stream: &StreamName,
    ) -> Result<DekEnvelope, KeyError>;

    /// The plaintext DEK of an existing stream.
    async fn resolve_dek(&self, stream: &StreamName) -> Result<Dek, KeyError>;
}

#[async_trait]
impl<S> SystemConnector for Arc<S>
where
    S: SystemConnector + ?Sized,
{
    async fn dek_envelope_for_new_stream(
        &self,
        stream: &StreamName,
    ) -> Result<DekEnvelope, KeyError> {
        (**self).dek_envelope_for_new_stream(stream).await
    }

    async fn resolve_dek(&self, stream: &StreamName) -> Result<Dek, KeyError> {
        (**self).resolve_dek(stream).await
    }
}

/// Single-process key service.
///
/// DEKs are wrapped under one key-encryption key (KEK) held in memory, with
/// the same IV-prefixed AES-CTR format used for payloads. Resolving reads the
/// envelope back from version 0 of the stream.
pub struct InMemorySystemConnector {
    kek: Dek,
    log: Arc<dyn EventLog>,
    resolve_calls: AtomicUsize,
}

impl InMemorySystemConnector {
    /// Uses a random KEK, so envelopes don't outlive the process. Durable
    /// logs need [`InMemorySystemConnector::with_kek`].
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self::with_kek(Dek::generate(), log)
    }

    pub fn with_kek(kek: Dek, log: Arc<dyn EventLog>) -> Self {
        Self {
            kek,
            log,
            resolve_calls: AtomicUsize::new(0),
        }
    }

    /// How many times a DEK was actually resolved (cache misses upstream).
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn wrap(&self, dek: &Dek) -> Result<DekEnvelope, KeyError> {
        Ok(DekEnvelope::new(crypto::encrypt(dek.as_bytes(), self.kek.as_bytes())?))
    }

    pub fn unwrap(&self, envelope: &DekEnvelope) -> Result<Dek, KeyError> {
        let bytes = crypto::decrypt(envelope.as_bytes(), self.kek.as_bytes())?;
        Ok(Dek::from_bytes(&bytes)?)
    }

    async fn stored_envelope(&self, stream: &StreamName) -> Result<DekEnvelope, KeyError> {
        let page = self.log.read(&Cursor::beginning_of(stream.clone())).await?;
        let first = page
            .entries
            .into_iter()
            .next()
            .ok_or_else(|| KeyError::StreamNotFound(stream.clone()))?;

        let missing = |reason: String| KeyError::MissingEnvelope {
            stream: stream.clone(),
            reason,
        };

        if first.data.kind != LogDataKind::Meta {
            return Err(missing(format!("version 0 holds {}", first.data.kind)));
        }

        let line = String::from_utf8(first.data.raw).map_err(|e| missing(e.to_string()))?;
        let event = deserialize_event(&line, &MetaEvent::types())
            .map_err(|e| missing(e.to_string()))?;

        match event.into_payload() {
            MetaEvent::StreamStarted(started) => Ok(started.dek_envelope),
            other => Err(missing(format!("version 0 holds {other:?}"))),
        }
    }
}

impl core::fmt::Debug for InMemorySystemConnector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemorySystemConnector")
            .field("resolve_calls", &self.resolve_calls())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SystemConnector for InMemorySystemConnector {
    async fn dek_envelope_for_new_stream(
        &self,
        stream: &StreamName,
    ) -> Result<DekEnvelope, KeyError> {
        tracing::debug!(stream = %stream, "issuing data key");
        self.wrap(&Dek::generate())
    }

    async fn resolve_dek(&self, stream: &StreamName) -> Result<Dek, KeyError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let envelope = self.stored_envelope(stream).await?;
        self.unwrap(&envelope)
    }
}

//! Client: the write path and the plumbing every reader shares.
//!
//! Wraps the event log, the snapshot store and the key service, and owns the
//! DEK cache. Appends encrypt events before they reach the log; reads hand
//! back raw entries for the reader to decode.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use streamlog_core::{Cursor, StreamName, SubscriberId};
use streamlog_events::{
    DekSource, Dek, Event, EventEnvelope, EventMeta, LogData, MetaEvent, PayloadError, Snapshot,
    SnapshotPerspective,
};

use crate::dek_cache::DekCache;
use crate::event_log::{AppendResult, EventLog, EventLogError, ReadResult};
use crate::keys::{KeyError, SystemConnector};
use crate::snapshot_store::{SnapshotStore, SnapshotStoreError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotStoreError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl ClientError {
    pub fn is_optimistic_locking(&self) -> bool {
        matches!(self, ClientError::EventLog(e) if e.is_optimistic_locking())
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::Snapshot(e) => e.is_not_found(),
            ClientError::EventLog(EventLogError::StreamNotFound(_)) => true,
            ClientError::Key(KeyError::StreamNotFound(_)) => true,
            _ => false,
        }
    }
}

pub struct Client {
    log: Arc<dyn EventLog>,
    snapshots: Arc<dyn SnapshotStore>,
    keys: Arc<dyn SystemConnector>,
    deks: DekCache,
}

impl Client {
    pub fn new(
        log: Arc<dyn EventLog>,
        snapshots: Arc<dyn SnapshotStore>,
        keys: Arc<dyn SystemConnector>,
    ) -> Self {
        Self {
            log,
            snapshots,
            keys,
            deks: DekCache::new(),
        }
    }

    /// Append at the head, whatever it is.
    pub async fn append<E: Event>(
        &self,
        stream: &StreamName,
        events: &[EventEnvelope<E>],
    ) -> Result<AppendResult, ClientError> {
        let data = self.encrypt(stream, events).await?;
        let result = self.log.append(stream, data).await?;
        tracing::debug!(
            stream = %stream,
            version = result.cursor.version(),
            events = events.len(),
            "appended"
        );
        Ok(result)
    }

    /// Append at `after.next()`; fails with an optimistic-locking error if
    /// someone else got there first.
    pub async fn append_after<E: Event>(
        &self,
        after: &Cursor,
        events: &[EventEnvelope<E>],
    ) -> Result<AppendResult, ClientError> {
        let data = self.encrypt(after.stream(), events).await?;
        let result = self.log.append_after(after, data).await?;
        tracing::debug!(
            stream = %after.stream(),
            version = result.cursor.version(),
            events = events.len(),
            "appended after"
        );
        Ok(result)
    }

    /// Write an unencrypted system event.
    pub async fn append_meta(
        &self,
        stream: &StreamName,
        event: MetaEvent,
    ) -> Result<AppendResult, ClientError> {
        let data = LogData::meta(&EventEnvelope::new(EventMeta::now(), event))?;
        Ok(self.log.append(stream, data).await?)
    }

    pub async fn subscribe(
        &self,
        stream: &StreamName,
        subscriber: SubscriberId,
    ) -> Result<AppendResult, ClientError> {
        self.append_meta(stream, MetaEvent::subscribed(subscriber)).await
    }

    pub async fn unsubscribe(
        &self,
        stream: &StreamName,
        subscriber: SubscriberId,
    ) -> Result<AppendResult, ClientError> {
        self.append_meta(stream, MetaEvent::unsubscribed(subscriber)).await
    }

    /// Create `stream` with a fresh key. The parent learns about the child in
    /// the same atomic write.
    pub async fn create_stream(
        &self,
        stream: &StreamName,
        initial_data: Option<LogData>,
    ) -> Result<AppendResult, ClientError> {
        let envelope = self.keys.dek_envelope_for_new_stream(stream).await?;
        let result = self.log.create_stream(stream, &envelope, initial_data).await?;
        tracing::info!(stream = %stream, "stream created");
        Ok(result)
    }

    pub async fn read(&self, after: &Cursor) -> Result<ReadResult, ClientError> {
        Ok(self.log.read(after).await?)
    }

    /// The stream's DEK, resolved at most once per process.
    pub async fn load_dek(&self, stream: &StreamName) -> Result<Dek, ClientError> {
        let dek = self
            .deks
            .get_or_load(stream, || self.keys.resolve_dek(stream))
            .await?;
        Ok(dek)
    }

    pub async fn read_snapshot(
        &self,
        stream: &StreamName,
        perspective: &SnapshotPerspective,
    ) -> Result<Snapshot, ClientError> {
        Ok(self.snapshots.read_snapshot(stream, perspective).await?)
    }

    pub async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), ClientError> {
        Ok(self.snapshots.write_snapshot(snapshot).await?)
    }

    pub async fn delete_snapshot(
        &self,
        stream: &StreamName,
        perspective: &SnapshotPerspective,
    ) -> Result<(), ClientError> {
        Ok(self.snapshots.delete_snapshot(stream, perspective).await?)
    }

    async fn encrypt<E: Event>(
        &self,
        stream: &StreamName,
        events: &[EventEnvelope<E>],
    ) -> Result<LogData, ClientError> {
        if events.is_empty() {
            return Err(PayloadError::EmptyBatch.into());
        }
        let dek = self.load_dek(stream).await?;
        Ok(LogData::encrypt_events(events, &dek)?)
    }
}

impl core::fmt::Debug for Client {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Client")
            .field("cached_keys", &self.deks.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DekSource for Client {
    async fn load_dek(&self, stream: &StreamName) -> Result<Dek, PayloadError> {
        Client::load_dek(self, stream)
            .await
            .map_err(|e| PayloadError::KeyUnavailable {
                stream: stream.clone(),
                source: Box::new(e),
            })
    }
}

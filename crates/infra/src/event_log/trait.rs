use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use streamlog_core::{Cursor, StreamName};
use streamlog_events::{DekEnvelope, LogData, LogEntry};

/// Where a just-written entry now lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    pub cursor: Cursor,
    /// Set by `create_stream`: the parent's `ChildStreamCreated` entry.
    pub parent: Option<Cursor>,
}

impl AppendResult {
    pub fn at(cursor: Cursor) -> Self {
        Self {
            cursor,
            parent: None,
        }
    }
}

/// One page of a stream, strictly after the requested cursor.
///
/// `last_entry` is the last position observed: the last returned entry, or
/// the requested cursor when nothing was returned. `more` means the page was
/// truncated and the caller must read again from `last_entry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub entries: Vec<LogEntry>,
    pub last_entry: Cursor,
    pub more: bool,
}

/// Event log operation error.
///
/// `OptimisticLockingFailed` is expected under concurrent writers and drives
/// the retry loops above this layer; everything else is propagated as-is.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("optimistic locking failed: {stream} already has an entry at version {version}")]
    OptimisticLockingFailed { stream: StreamName, version: i64 },

    #[error("stream not found: {0}")]
    StreamNotFound(StreamName),

    #[error("stream already exists: {0}")]
    StreamAlreadyExists(StreamName),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EventLogError {
    pub fn conflict(after: &Cursor) -> Self {
        EventLogError::OptimisticLockingFailed {
            stream: after.stream().clone(),
            version: after.next().version(),
        }
    }

    pub fn is_optimistic_locking(&self) -> bool {
        matches!(self, EventLogError::OptimisticLockingFailed { .. })
    }
}

/// Ordered, per-stream, append-only log.
///
/// Every stream starts with a `StreamStarted` meta entry at version 0, written
/// by [`EventLog::create_stream`]; appends to streams that were never created
/// fail with `StreamNotFound`.
///
/// ## Implementation requirements
///
/// - `read` is exclusive-after: the entry *at* `after` is never returned
/// - versions are gap-free and never rewritten
/// - `append_after` fails with `OptimisticLockingFailed` iff an entry already
///   exists at `after.next()`, and with `InvalidAppend` when `after` is
///   beyond the head
/// - `create_stream` writes the new stream's version 0, the parent's
///   `ChildStreamCreated` entry and the optional version 1 atomically
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn read(&self, after: &Cursor) -> Result<ReadResult, EventLogError>;

    /// Append at the current head, whatever it is.
    async fn append(
        &self,
        stream: &StreamName,
        data: LogData,
    ) -> Result<AppendResult, EventLogError>;

    /// Append at `after.next()`, only if that position is still free.
    async fn append_after(
        &self,
        after: &Cursor,
        data: LogData,
    ) -> Result<AppendResult, EventLogError>;

    async fn create_stream(
        &self,
        stream: &StreamName,
        dek_envelope: &DekEnvelope,
        initial_data: Option<LogData>,
    ) -> Result<AppendResult, EventLogError>;
}

#[async_trait]
impl<L> EventLog for Arc<L>
where
    L: EventLog + ?Sized,
{
    async fn read(&self, after: &Cursor) -> Result<ReadResult, EventLogError> {
        (**self).read(after).await
    }

    async fn append(
        &self,
        stream: &StreamName,
        data: LogData,
    ) -> Result<AppendResult, EventLogError> {
        (**self).append(stream, data).await
    }

    async fn append_after(
        &self,
        after: &Cursor,
        data: LogData,
    ) -> Result<AppendResult, EventLogError> {
        (**self).append_after(after, data).await
    }

    async fn create_stream(
        &self,
        stream: &StreamName,
        dek_envelope: &DekEnvelope,
        initial_data: Option<LogData>,
    ) -> Result<AppendResult, EventLogError> {
        (**self).create_stream(stream, dek_envelope, initial_data).await
    }
}

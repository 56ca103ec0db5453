//! Event log boundary: ordered per-stream storage of `LogData` entries.
//!
//! The contract lives in [`EventLog`]; [`InMemoryEventLog`] backs tests and
//! single-process setups, [`PostgresEventLog`] is the durable backend.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

use async_trait::async_trait;

use streamlog_core::{Cursor, StreamName};
use streamlog_events::{
    DekEnvelope, EventBus, EventEnvelope, EventMeta, LogData, MetaEvent, StreamChanged,
};

pub use in_memory::InMemoryEventLog;
pub use postgres::PostgresEventLog;
pub use r#trait::{AppendResult, EventLog, EventLogError, ReadResult};

/// How many times an unconditional `append` re-resolves the head after
/// losing a race.
pub const APPEND_RETRIES: usize = 3;

fn meta_entry(event: MetaEvent) -> Result<LogData, EventLogError> {
    LogData::meta(&EventEnvelope::new(EventMeta::now(), event))
        .map_err(|e| EventLogError::InvalidAppend(format!("meta entry: {e}")))
}

pub(crate) fn stream_started_entry(dek_envelope: &DekEnvelope) -> Result<LogData, EventLogError> {
    meta_entry(MetaEvent::stream_started(dek_envelope.clone()))
}

pub(crate) fn child_stream_created_entry(child: &StreamName) -> Result<LogData, EventLogError> {
    meta_entry(MetaEvent::child_stream_created(child.clone()))
}

/// Decorator that announces every successful write on an [`EventBus`].
///
/// Ordering invariant: **publish happens only after the write succeeded**.
/// Publication is best-effort; a failing bus is logged and never fails the
/// write, since the entry is already durable.
///
/// `create_stream` announces the new stream and then the parent, which
/// gained a `ChildStreamCreated` entry in the same write.
pub struct NotifyingEventLog<L, B> {
    log: L,
    bus: B,
}

impl<L, B> NotifyingEventLog<L, B> {
    pub fn new(log: L, bus: B) -> Self {
        Self { log, bus }
    }
}

impl<L, B> NotifyingEventLog<L, B>
where
    B: EventBus<StreamChanged>,
{
    fn notify(&self, cursor: &Cursor) {
        if let Err(err) = self.bus.publish(StreamChanged::new(cursor.clone())) {
            tracing::warn!(
                stream = %cursor.stream(),
                version = cursor.version(),
                error = ?err,
                "stream change notification failed"
            );
        }
    }
}

#[async_trait]
impl<L, B> EventLog for NotifyingEventLog<L, B>
where
    L: EventLog,
    B: EventBus<StreamChanged>,
{
    async fn read(&self, after: &Cursor) -> Result<ReadResult, EventLogError> {
        self.log.read(after).await
    }

    async fn append(
        &self,
        stream: &StreamName,
        data: LogData,
    ) -> Result<AppendResult, EventLogError> {
        let result = self.log.append(stream, data).await?;
        self.notify(&result.cursor);
        Ok(result)
    }

    async fn append_after(
        &self,
        after: &Cursor,
        data: LogData,
    ) -> Result<AppendResult, EventLogError> {
        let result = self.log.append_after(after, data).await?;
        self.notify(&result.cursor);
        Ok(result)
    }

    async fn create_stream(
        &self,
        stream: &StreamName,
        dek_envelope: &DekEnvelope,
        initial_data: Option<LogData>,
    ) -> Result<AppendResult, EventLogError> {
        let result = self
            .log
            .create_stream(stream, dek_envelope, initial_data)
            .await?;
        self.notify(&result.cursor);
        if let Some(parent) = &result.parent {
            self.notify(parent);
        }
        Ok(result)
    }
}

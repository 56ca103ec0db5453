//! Change notifications ("stream X now has an entry at version N").
//!
//! The bus carries *positions*, never payloads: a subscriber that cares about
//! a stream reacts by reloading its reader, and the event log stays the only
//! source of truth.
//!
//! ## Delivery
//!
//! - **At-least-once / best-effort**: a lost notification only delays a
//!   consumer until its next staleness-driven refresh
//! - **No ordering across streams**
//! - **Published after the write commits**, never before

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use streamlog_core::{Cursor, StreamName};

/// "`cursor.stream()` now has an entry at `cursor.version()`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChanged {
    pub cursor: Cursor,
}

impl StreamChanged {
    pub fn new(cursor: Cursor) -> Self {
        Self { cursor }
    }

    pub fn stream(&self) -> &StreamName {
        self.cursor.stream()
    }

    /// Whether this notification concerns `stream` or any stream below it.
    pub fn is_under(&self, stream: &StreamName) -> bool {
        self.cursor.stream().is_under(stream)
    }
}

/// A subscription to a bus.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics). Meant for a single consuming task.
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(changed) => reader_for(changed.stream()).load_until_realtime().await?,
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub.
///
/// `publish()` may fail (lock poisoned, broker unreachable). Writers treat
/// such failures as non-fatal: the entry is already durable in the log.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

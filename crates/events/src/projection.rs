//! The projection contract: consumer state machines replayed by a reader.
//!
//! A projection never sees the event log directly. The reader decodes one
//! stored entry at a time and calls [`Projection::process_events`] with a
//! callback; the projection opens a transaction over its own state and hands
//! it to that callback, which:
//!
//! 1. checks [`ProjectionTx::cursor_in_db`] against the reader's tracked cursor
//! 2. feeds every decoded event to [`ProjectionTx::handle_event`], in order
//! 3. calls [`ProjectionTx::commit`] exactly once with the entry's cursor
//!
//! State and cursor advance together or not at all: if the callback returns
//! an error, nothing from that batch may become visible. How the projection
//! achieves that (staged copy, database transaction, ...) is its own business;
//! [`process_staged`] covers the in-memory case.
//!
//! The reader also calls `process_events` once up front with a callback that
//! only reads `cursor_in_db`, to learn where the projection currently stands.

use streamlog_core::Cursor;
use thiserror::Error;

use crate::decoder::LogDataKindDeserializer;
use crate::envelope::EventEnvelope;
use crate::snapshot::{Snapshot, SnapshotPerspective};

/// One batch's worth of access to a projection's state.
pub trait ProjectionTx<E> {
    /// The cursor the projection's committed state corresponds to.
    fn cursor_in_db(&self) -> Cursor;

    fn handle_event(&mut self, event: EventEnvelope<E>) -> anyhow::Result<()>;

    /// Make everything handled in this transaction visible, at `cursor`.
    fn commit(&mut self, cursor: Cursor) -> anyhow::Result<()>;
}

/// The reader's side of [`Projection::process_events`].
pub type ProcessCallback<'a, E> =
    &'a mut dyn FnMut(&mut dyn ProjectionTx<E>) -> Result<(), ProjectionError>;

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The projection's cursor moved without the reader's involvement.
    #[error("projection reports cursor {found}, reader expected {expected}")]
    CursorMismatch { expected: Cursor, found: Cursor },

    #[error("handling event at {cursor} failed: {source}")]
    Handler {
        cursor: Cursor,
        #[source]
        source: anyhow::Error,
    },

    #[error("commit at {cursor} failed: {source}")]
    Commit {
        cursor: Cursor,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A consumer-defined state machine over one stream.
///
/// Owned and mutated exclusively by its reader.
pub trait Projection: Send + 'static {
    type Event: Send + Sync + 'static;

    /// Open a transaction over the current state and pass it to `process`.
    fn process_events(
        &mut self,
        process: ProcessCallback<'_, Self::Event>,
    ) -> Result<(), ProjectionError>;

    /// Which log-data kinds this projection understands, and how to decode them.
    fn event_types(&self) -> Vec<LogDataKindDeserializer<Self::Event>>;

    /// `None` opts out of snapshotting.
    fn snapshot_perspective(&self) -> Option<SnapshotPerspective> {
        None
    }

    /// Serialize the committed state.
    fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("projection does not support snapshots"))
    }

    /// Replace the state (and cursor) with a previously taken snapshot.
    fn install_snapshot(&mut self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let _ = snapshot;
        Err(anyhow::anyhow!("projection does not support snapshots"))
    }
}

struct StagedTx<'s, S, F> {
    cursor: Cursor,
    staged: &'s mut S,
    apply: F,
    committed: Option<Cursor>,
}

impl<S, E, F> ProjectionTx<E> for StagedTx<'_, S, F>
where
    F: FnMut(&mut S, EventEnvelope<E>) -> anyhow::Result<()>,
{
    fn cursor_in_db(&self) -> Cursor {
        self.cursor.clone()
    }

    fn handle_event(&mut self, event: EventEnvelope<E>) -> anyhow::Result<()> {
        if self.committed.is_some() {
            anyhow::bail!("event handled after commit");
        }
        (self.apply)(self.staged, event)
    }

    fn commit(&mut self, cursor: Cursor) -> anyhow::Result<()> {
        if let Some(previous) = &self.committed {
            anyhow::bail!("already committed at {previous}");
        }
        self.committed = Some(cursor);
        Ok(())
    }
}

/// `process_events` for projections whose state is a plain cloneable value.
///
/// Events are applied to a copy of `state`; the copy replaces `state` (and
/// `cursor` advances) only if the callback succeeds after committing.
pub fn process_staged<S, E, F>(
    state: &mut S,
    cursor: &mut Cursor,
    apply: F,
    process: ProcessCallback<'_, E>,
) -> Result<(), ProjectionError>
where
    S: Clone,
    F: FnMut(&mut S, EventEnvelope<E>) -> anyhow::Result<()>,
{
    let mut staged = state.clone();
    let mut tx = StagedTx {
        cursor: cursor.clone(),
        staged: &mut staged,
        apply,
        committed: None,
    };

    process(&mut tx)?;

    if let Some(committed) = tx.committed {
        *state = staged;
        *cursor = committed;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMeta;
    use streamlog_core::StreamName;

    fn at(version: i64) -> Cursor {
        Cursor::new(StreamName::new("/counter").unwrap(), version)
    }

    fn ev(n: i64) -> EventEnvelope<i64> {
        EventEnvelope::new(EventMeta::now(), n)
    }

    fn add(sum: &mut i64, e: EventEnvelope<i64>) -> anyhow::Result<()> {
        if *e.payload() < 0 {
            anyhow::bail!("negative");
        }
        *sum += e.payload();
        Ok(())
    }

    #[test]
    fn commit_swaps_in_staged_state() {
        let mut sum = 0i64;
        let mut cursor = at(-1);

        let mut cb = |tx: &mut dyn ProjectionTx<i64>| -> Result<(), ProjectionError> {
            assert_eq!(tx.cursor_in_db(), at(-1));
            tx.handle_event(ev(2))?;
            tx.handle_event(ev(3))?;
            tx.commit(at(0))?;
            Ok(())
        };
        process_staged(&mut sum, &mut cursor, add, &mut cb).unwrap();

        assert_eq!(sum, 5);
        assert_eq!(cursor, at(0));
    }

    #[test]
    fn failed_batch_leaves_state_untouched() {
        let mut sum = 10i64;
        let mut cursor = at(4);

        let mut cb = |tx: &mut dyn ProjectionTx<i64>| -> Result<(), ProjectionError> {
            tx.handle_event(ev(1))?;
            tx.handle_event(ev(-1)).map_err(|source| ProjectionError::Handler {
                cursor: at(5),
                source,
            })?;
            tx.commit(at(5))?;
            Ok(())
        };
        let err = process_staged(&mut sum, &mut cursor, add, &mut cb).unwrap_err();

        assert!(matches!(err, ProjectionError::Handler { .. }));
        assert_eq!(sum, 10);
        assert_eq!(cursor, at(4));
    }

    #[test]
    fn read_only_callback_changes_nothing() {
        let mut sum = 7i64;
        let mut cursor = at(3);
        let mut seen = None;

        let mut cb = |tx: &mut dyn ProjectionTx<i64>| -> Result<(), ProjectionError> {
            seen = Some(tx.cursor_in_db());
            Ok(())
        };
        process_staged(&mut sum, &mut cursor, add, &mut cb).unwrap();

        assert_eq!(seen, Some(at(3)));
        assert_eq!((sum, cursor), (7, at(3)));
    }

    #[test]
    fn second_commit_is_rejected() {
        let mut sum = 0i64;
        let mut cursor = at(-1);

        let mut cb = |tx: &mut dyn ProjectionTx<i64>| -> Result<(), ProjectionError> {
            tx.commit(at(0))?;
            tx.commit(at(1))?;
            Ok(())
        };
        assert!(process_staged(&mut sum, &mut cursor, add, &mut cb).is_err());
        assert_eq!(cursor, at(-1));
    }
}

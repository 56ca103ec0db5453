//! Reader: keeps one projection caught up with one stream.
//!
//! Lifecycle:
//!
//! - **Unstarted**: nothing known yet. The first load asks the projection
//!   where it stands (it may be backed by durable state).
//! - **Tracking**: the cursor is known. If it is the beginning of the stream
//!   and the projection has a snapshot perspective, a snapshot is tried first.
//! - **Catching up**: pages are read strictly after the cursor; each entry is
//!   decoded and handed to the projection as one committed batch.
//! - **Realtime**: the last page said there is nothing more. A snapshot is
//!   written if the cursor moved past the last attempted snapshot.
//!
//! Every entry is delivered exactly once and in order: the next entry must
//! sit at `cursor.next()`, and the projection's own cursor must agree with
//! the reader's before each batch. Any disagreement is fatal.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use streamlog_core::{Cursor, StreamName};
use streamlog_events::crypto;
use streamlog_events::{
    EventEnvelope, LogDataKind, LogDataKindDeserializer, LogEntry, PayloadError, Projection,
    ProjectionError, ProjectionTx, Snapshot, SnapshotPerspective,
};

use crate::client::{Client, ClientError};

/// `transact_write` gives up after this many tries.
pub const TRANSACT_WRITE_TRIES: u32 = 4;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("decoding entry at {cursor} failed: {source}")]
    Decode {
        cursor: Cursor,
        #[source]
        source: PayloadError,
    },

    /// The log or the projection broke the delivery contract. Not retryable.
    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error(transparent)]
    Projection(ProjectionError),

    #[error("write still conflicting after {tries} tries: {last}")]
    RetriesExhausted {
        tries: u32,
        #[source]
        last: Box<ReaderError>,
    },

    /// Failure raised by a `transact_write` body.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReaderError {
    pub fn is_optimistic_locking(&self) -> bool {
        match self {
            ReaderError::Client(e) => e.is_optimistic_locking(),
            _ => false,
        }
    }
}

impl From<ProjectionError> for ReaderError {
    fn from(err: ProjectionError) -> Self {
        match err {
            ProjectionError::CursorMismatch { .. } => ReaderError::Consistency(err.to_string()),
            other => ReaderError::Projection(other),
        }
    }
}

struct ReaderState<P: Projection> {
    projection: P,
    /// `None` until the projection was asked where it stands.
    cursor: Option<Cursor>,
    last_loaded: Option<Instant>,
    /// Highest version a snapshot write was attempted (or loaded) for.
    last_snapshot_version: i64,
}

pub struct Reader<P: Projection> {
    stream: StreamName,
    client: Arc<Client>,
    deserializers: HashMap<LogDataKind, LogDataKindDeserializer<P::Event>>,
    encrypted_snapshots: bool,
    state: Mutex<ReaderState<P>>,
}

impl<P: Projection> Reader<P> {
    pub fn new(stream: StreamName, projection: P, client: Arc<Client>) -> Self {
        let types = projection.event_types();
        let encrypted_snapshots = types.iter().any(|d| d.encrypted);
        let deserializers = types.into_iter().map(|d| (d.kind, d)).collect();

        Self {
            stream,
            client,
            deserializers,
            encrypted_snapshots,
            state: Mutex::new(ReaderState {
                projection,
                cursor: None,
                last_loaded: None,
                last_snapshot_version: streamlog_core::BEGINNING,
            }),
        }
    }

    pub fn stream(&self) -> &StreamName {
        &self.stream
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// The last delivered position, or the beginning if nothing was loaded.
    pub async fn cursor(&self) -> Cursor {
        let state = self.state.lock().await;
        state
            .cursor
            .clone()
            .unwrap_or_else(|| Cursor::beginning_of(self.stream.clone()))
    }

    /// Read access to the projection. Waits for any load in progress.
    pub async fn with_projection<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.projection)
    }

    /// Catch up with everything in the log right now.
    pub async fn load_until_realtime(&self) -> Result<(), ReaderError> {
        let mut state = self.state.lock().await;
        self.load(&mut state).await
    }

    /// Like [`Reader::load_until_realtime`], unless the last load finished
    /// less than `max_age` ago. Concurrent callers queue on the same lock,
    /// so a burst of requests costs one load.
    pub async fn load_until_realtime_if_stale(&self, max_age: Duration) -> Result<(), ReaderError> {
        let mut state = self.state.lock().await;
        if let Some(at) = state.last_loaded {
            if at.elapsed() < max_age {
                return Ok(());
            }
        }
        self.load(&mut state).await
    }

    /// Run `body` against a freshly loaded projection, retrying when it
    /// loses an optimistic-locking race.
    ///
    /// `body` gets the 1-based try number. It reads the projection with
    /// [`Reader::with_projection`] and writes with [`Client::append_after`]
    /// at [`Reader::cursor`].
    pub async fn transact_write<T, F, Fut>(&self, mut body: F) -> Result<T, ReaderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ReaderError>>,
    {
        let mut last = None;
        for attempt in 1..=TRANSACT_WRITE_TRIES {
            self.load_until_realtime().await?;

            match body(attempt).await {
                Err(err) if err.is_optimistic_locking() => {
                    tracing::warn!(
                        stream = %self.stream,
                        attempt,
                        error = %err,
                        "write lost an optimistic-locking race, reloading"
                    );
                    last = Some(err);
                }
                other => return other,
            }
        }

        let last = last.unwrap_or_else(|| {
            ReaderError::Consistency("transact_write made no attempt".to_string())
        });
        tracing::error!(
            stream = %self.stream,
            tries = TRANSACT_WRITE_TRIES,
            error = %last,
            "giving up on write"
        );
        Err(ReaderError::RetriesExhausted {
            tries: TRANSACT_WRITE_TRIES,
            last: Box::new(last),
        })
    }

    async fn load(&self, state: &mut ReaderState<P>) -> Result<(), ReaderError> {
        let mut cursor = match state.cursor.clone() {
            Some(cursor) => cursor,
            None => self.discover(&mut state.projection)?,
        };

        if cursor.is_beginning() {
            if let Some(restored) = self.try_snapshot(state).await? {
                cursor = restored;
            }
        }

        loop {
            let page = self.client.read(&cursor).await?;
            tracing::debug!(
                stream = %self.stream,
                after = cursor.version(),
                entries = page.entries.len(),
                more = page.more,
                "read page"
            );

            for entry in page.entries {
                let expected = cursor.next();
                if entry.cursor != expected {
                    return Err(ReaderError::Consistency(format!(
                        "expected entry at {expected}, log returned {}",
                        entry.cursor
                    )));
                }

                let events = self.decode(&entry).await?;
                deliver(&mut state.projection, &cursor, &entry.cursor, events)?;
                cursor = entry.cursor;
                state.cursor = Some(cursor.clone());
            }

            if !page.more {
                break;
            }
        }

        state.cursor = Some(cursor);
        state.last_loaded = Some(Instant::now());
        self.maybe_write_snapshot(state).await;
        Ok(())
    }

    /// Ask the projection for its cursor without changing anything.
    fn discover(&self, projection: &mut P) -> Result<Cursor, ReaderError> {
        let cursor = current_cursor(projection)?;
        if cursor.stream() != &self.stream {
            return Err(ReaderError::Consistency(format!(
                "projection tracks {}, reader reads {}",
                cursor.stream(),
                self.stream
            )));
        }
        Ok(cursor)
    }

    async fn decode(
        &self,
        entry: &LogEntry,
    ) -> Result<Vec<EventEnvelope<P::Event>>, ReaderError> {
        let Some(de) = self.deserializers.get(&entry.data.kind) else {
            return Ok(Vec::new());
        };

        de.decoder
            .decode(entry, &*self.client)
            .await
            .map_err(|source| ReaderError::Decode {
                cursor: entry.cursor.clone(),
                source,
            })
    }

    /// Install the stored snapshot, if there is a usable one. Returns the
    /// projection's cursor afterwards.
    async fn try_snapshot(
        &self,
        state: &mut ReaderState<P>,
    ) -> Result<Option<Cursor>, ReaderError> {
        let Some(perspective) = state.projection.snapshot_perspective() else {
            return Ok(None);
        };

        let stored = match self.client.read_snapshot(&self.stream, &perspective).await {
            Ok(snapshot) => snapshot,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => {
                tracing::warn!(
                    stream = %self.stream,
                    perspective = %perspective,
                    error = %err,
                    "snapshot read failed, replaying from the start"
                );
                return Ok(None);
            }
        };

        let version = stored.cursor.version();
        let snapshot = match self.open_snapshot(stored).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(
                    stream = %self.stream,
                    perspective = %perspective,
                    version,
                    error = %err,
                    "snapshot unreadable, replaying from the start"
                );
                return Ok(None);
            }
        };

        if let Err(err) = state.projection.install_snapshot(&snapshot) {
            tracing::warn!(
                stream = %self.stream,
                perspective = %perspective,
                version,
                error = %err,
                "snapshot rejected by projection, replaying from the start"
            );
            return Ok(None);
        }

        let cursor = self.discover(&mut state.projection)?;
        state.cursor = Some(cursor.clone());
        state.last_snapshot_version = state.last_snapshot_version.max(version);
        tracing::info!(
            stream = %self.stream,
            perspective = %perspective,
            version,
            "installed snapshot"
        );
        Ok(Some(cursor))
    }

    async fn open_snapshot(&self, stored: Snapshot) -> Result<Snapshot, ReaderError> {
        if !self.encrypted_snapshots {
            return Ok(stored);
        }
        let dek = self.client.load_dek(&self.stream).await?;
        let raw = crypto::open(&stored.raw_data, &dek).map_err(|e| ReaderError::Decode {
            cursor: stored.cursor.clone(),
            source: e.into(),
        })?;
        Ok(Snapshot::new(stored.cursor, raw, stored.perspective))
    }

    async fn maybe_write_snapshot(&self, state: &mut ReaderState<P>) {
        let Some(perspective) = state.projection.snapshot_perspective() else {
            return;
        };
        let Some(cursor) = state.cursor.clone() else {
            return;
        };
        if cursor.version() <= state.last_snapshot_version {
            return;
        }

        // Recorded before writing: a failed write is not retried until the
        // stream moves again.
        state.last_snapshot_version = cursor.version();

        let result = match state.projection.snapshot() {
            Ok(raw) => self.store_snapshot(cursor.clone(), raw, perspective.clone()).await,
            Err(err) => Err(ReaderError::Other(err)),
        };

        match result {
            Ok(()) => tracing::debug!(
                stream = %self.stream,
                perspective = %perspective,
                version = cursor.version(),
                "snapshot written"
            ),
            Err(err) => tracing::warn!(
                stream = %self.stream,
                perspective = %perspective,
                version = cursor.version(),
                error = %err,
                "snapshot write failed"
            ),
        }
    }

    async fn store_snapshot(
        &self,
        cursor: Cursor,
        mut raw: Vec<u8>,
        perspective: SnapshotPerspective,
    ) -> Result<(), ReaderError> {
        if self.encrypted_snapshots {
            let dek = self.client.load_dek(&self.stream).await?;
            raw = crypto::seal(&raw, &dek).map_err(|e| ReaderError::Decode {
                cursor: cursor.clone(),
                source: e.into(),
            })?;
        }
        self.client
            .write_snapshot(&Snapshot::new(cursor, raw, perspective))
            .await?;
        Ok(())
    }
}

impl<P: Projection> core::fmt::Debug for Reader<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reader")
            .field("stream", &self.stream)
            .field("kinds", &self.deserializers.keys().collect::<Vec<_>>())
            .field("encrypted_snapshots", &self.encrypted_snapshots)
            .finish_non_exhaustive()
    }
}

fn current_cursor<P: Projection>(projection: &mut P) -> Result<Cursor, ReaderError> {
    let mut found = None;
    let mut peek = |tx: &mut dyn ProjectionTx<P::Event>| -> Result<(), ProjectionError> {
        found = Some(tx.cursor_in_db());
        Ok(())
    };
    projection.process_events(&mut peek)?;
    found.ok_or_else(|| ReaderError::Consistency("projection did not report a cursor".to_string()))
}

/// Hand one entry's events to the projection as a single committed batch.
fn deliver<P: Projection>(
    projection: &mut P,
    expected: &Cursor,
    at: &Cursor,
    events: Vec<EventEnvelope<P::Event>>,
) -> Result<(), ReaderError> {
    let mut batch = Some(events);
    let mut committed = false;

    let mut process = |tx: &mut dyn ProjectionTx<P::Event>| -> Result<(), ProjectionError> {
        let found = tx.cursor_in_db();
        if found != *expected {
            return Err(ProjectionError::CursorMismatch {
                expected: expected.clone(),
                found,
            });
        }

        for event in batch.take().unwrap_or_default() {
            tx.handle_event(event)
                .map_err(|source| ProjectionError::Handler {
                    cursor: at.clone(),
                    source,
                })?;
        }

        tx.commit(at.clone())
            .map_err(|source| ProjectionError::Commit {
                cursor: at.clone(),
                source,
            })?;
        committed = true;
        Ok(())
    };
    projection.process_events(&mut process)?;

    if !committed {
        return Err(ReaderError::Consistency(format!(
            "projection returned without committing {at}"
        )));
    }
    Ok(())
}

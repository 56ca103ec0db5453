use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use streamlog_core::StreamName;
use streamlog_events::{Snapshot, SnapshotPerspective};

use super::r#trait::{SnapshotStore, SnapshotStoreError};

/// In-memory snapshot store for tests/dev.
///
/// Counts write calls and stored writes separately, and can be told to fail
/// reads or writes, so replay behaviour around snapshots is observable.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<(StreamName, String), Snapshot>>,
    write_calls: AtomicUsize,
    stored_writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `write_snapshot` call, including no-ops and failures.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Writes that replaced (or created) a stored snapshot.
    pub fn stored_writes(&self) -> usize {
        self.stored_writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn key(stream: &StreamName, perspective: &SnapshotPerspective) -> (StreamName, String) {
    (stream.clone(), perspective.key())
}

fn poisoned() -> SnapshotStoreError {
    SnapshotStoreError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn read_snapshot(
        &self,
        stream: &StreamName,
        perspective: &SnapshotPerspective,
    ) -> Result<Snapshot, SnapshotStoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SnapshotStoreError::Storage("injected read failure".to_string()));
        }

        let snapshots = self.snapshots.read().map_err(|_| poisoned())?;
        snapshots
            .get(&key(stream, perspective))
            .cloned()
            .ok_or_else(|| SnapshotStoreError::not_found(stream, perspective))
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotStoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SnapshotStoreError::Storage("injected write failure".to_string()));
        }

        let mut snapshots = self.snapshots.write().map_err(|_| poisoned())?;
        let k = key(snapshot.cursor.stream(), &snapshot.perspective);
        let newer = snapshots
            .get(&k)
            .is_none_or(|stored| stored.cursor.version() < snapshot.cursor.version());

        if newer {
            snapshots.insert(k, snapshot.clone());
            self.stored_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        stream: &StreamName,
        perspective: &SnapshotPerspective,
    ) -> Result<(), SnapshotStoreError> {
        let mut snapshots = self.snapshots.write().map_err(|_| poisoned())?;
        snapshots
            .remove(&key(stream, perspective))
            .map(|_| ())
            .ok_or_else(|| SnapshotStoreError::not_found(stream, perspective))
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use streamlog_core::StreamName;
use streamlog_events::{Snapshot, SnapshotPerspective};

#[derive(Debug, Error)]
pub enum SnapshotStoreError {
    /// Expected condition; callers treat it as "absent".
    #[error("no snapshot for {stream} ({perspective})")]
    NotFound { stream: StreamName, perspective: String },

    #[error("snapshot storage error: {0}")]
    Storage(String),
}

impl SnapshotStoreError {
    pub fn not_found(stream: &StreamName, perspective: &SnapshotPerspective) -> Self {
        SnapshotStoreError::NotFound {
            stream: stream.clone(),
            perspective: perspective.key(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotStoreError::NotFound { .. })
    }
}

/// Keyed by `(stream, perspective.key())`.
///
/// `write_snapshot` is a conditional put: it only replaces a stored snapshot
/// whose version is strictly older. Losing to an equal-or-newer snapshot is a
/// silent no-op, because another replayer already got further.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn read_snapshot(
        &self,
        stream: &StreamName,
        perspective: &SnapshotPerspective,
    ) -> Result<Snapshot, SnapshotStoreError>;

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotStoreError>;

    async fn delete_snapshot(
        &self,
        stream: &StreamName,
        perspective: &SnapshotPerspective,
    ) -> Result<(), SnapshotStoreError>;
}

#[async_trait]
impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    async fn read_snapshot(
        &self,
        stream: &StreamName,
        perspective: &SnapshotPerspective,
    ) -> Result<Snapshot, SnapshotStoreError> {
        (**self).read_snapshot(stream, perspective).await
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotStoreError> {
        (**self).write_snapshot(snapshot).await
    }

    async fn delete_snapshot(
        &self,
        stream: &StreamName,
        perspective: &SnapshotPerspective,
    ) -> Result<(), SnapshotStoreError> {
        (**self).delete_snapshot(stream, perspective).await
    }
}

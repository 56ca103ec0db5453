//! Snapshot cache: one opaque, versioned blob per `(stream, perspective)`.
//!
//! Snapshots only ever accelerate replay; the event log stays authoritative.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemorySnapshotStore;
pub use postgres::PostgresSnapshotStore;
pub use r#trait::{SnapshotStore, SnapshotStoreError};

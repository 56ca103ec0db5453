//! Storage backends and the client/reader engine.
//!
//! - `event_log` / `snapshot_store`: storage contracts, in-memory and Postgres
//! - `keys` / `dek_cache`: per-stream data keys
//! - `client`: appends, stream creation, raw reads
//! - `reader` / `reader_cache`: replaying streams into projections
//! - `config` / `setup`: environment configuration and wiring
//! - `event_bus`: cross-process change notifications

pub mod client;
pub mod config;
pub mod dek_cache;
pub mod event_bus;
pub mod event_log;
pub mod keys;
pub mod reader;
pub mod reader_cache;
pub mod setup;
pub mod snapshot_store;

#[cfg(test)]
mod integration_tests;

pub use client::{Client, ClientError};
pub use config::{ConfigError, StreamlogConfig};
pub use dek_cache::DekCache;
pub use event_log::{
    AppendResult, EventLog, EventLogError, InMemoryEventLog, NotifyingEventLog, PostgresEventLog,
    ReadResult,
};
pub use keys::{InMemorySystemConnector, KeyError, SystemConnector};
pub use reader::{Reader, ReaderError, TRANSACT_WRITE_TRIES};
pub use reader_cache::ReaderCache;
pub use setup::{Changes, Streamlog};
pub use snapshot_store::{
    InMemorySnapshotStore, PostgresSnapshotStore, SnapshotStore, SnapshotStoreError,
};

//! Events, their wire format, and the projection contract.
//!
//! - `event` / `envelope`: domain events and their common metadata
//! - `codec`: the one-line text format and the tag → decoder registry
//! - `meta`: system bookkeeping events written by the log itself
//! - `log_data` / `crypto`: what is physically stored at one stream position
//! - `decoder`: turning stored entries back into typed events
//! - `projection` / `snapshot`: consumer state machines replayed by the reader
//! - `bus`: change notifications ("stream X moved to version N")

pub mod bus;
pub mod codec;
pub mod crypto;
pub mod decoder;
pub mod envelope;
pub mod error;
pub mod event;
pub mod in_memory_bus;
pub mod log_data;
pub mod meta;
pub mod projection;
pub mod snapshot;

pub use bus::{EventBus, StreamChanged, Subscription};
pub use codec::{deserialize_event, format_timestamp, serialize_event, EventTypes};
pub use crypto::{Dek, DekEnvelope};
pub use decoder::{
    DekSource, EncryptedDataDecoder, LogDataDecoder, LogDataKindDeserializer, MetaDecoder,
};
pub use envelope::EventEnvelope;
pub use error::{CodecError, CryptoError, PayloadError};
pub use event::{Event, EventMeta};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use log_data::{LogData, LogDataKind, LogEntry};
pub use meta::MetaEvent;
pub use projection::{process_staged, ProcessCallback, Projection, ProjectionError, ProjectionTx};
pub use snapshot::{Snapshot, SnapshotPerspective};

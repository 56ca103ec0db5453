//! Cross-process change notifications.
//!
//! The bus contract and the in-process bus live in `streamlog-events`; this
//! module adds transports backed by external services.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};

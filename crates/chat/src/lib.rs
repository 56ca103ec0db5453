//! Chat rooms: a small event-sourced domain on top of the stream log.
//!
//! Each room is one stream (e.g. `/chatrooms/offtopic`); every message is an
//! encrypted `chat.Message` event. [`ChatProjection`] replays a room into its
//! rendered log and supports snapshots.

pub mod room;

pub use room::{ChatEvent, ChatLine, ChatMessage, ChatProjection, ChatRoom, SNAPSHOT_CONTEXT};

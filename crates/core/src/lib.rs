//! `streamlog-core`: value types shared by every layer of the log engine.
//!
//! This crate contains **pure** primitives (no IO): hierarchical stream names,
//! stream positions (cursors) and validated identifiers.

pub mod compact;
pub mod cursor;
pub mod error;
pub mod id;
pub mod stream;

pub use compact::{decode_compact, encode_compact};
pub use cursor::{Cursor, BEGINNING};
pub use error::{CoreError, CoreResult};
pub use id::{SubscriberId, UserId};
pub use stream::StreamName;

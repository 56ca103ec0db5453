//! Error types for encoding and decoding stored payloads.

use streamlog_core::StreamName;
use thiserror::Error;

/// Failure to turn one line into an event (or back).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed event line: {0}")]
    Malformed(String),

    #[error("invalid metadata: {0}")]
    Metadata(#[source] serde_json::Error),

    #[error("invalid timestamp '{value}': {reason}")]
    Timestamp { value: String, reason: String },

    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("invalid payload for {tag}: {source}")]
    Payload {
        tag: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid user id: {0}")]
    UserId(#[from] streamlog_core::CoreError),
}

/// Errors that can occur during payload encryption/compression.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("data too short: expected at least {expected} bytes, got {actual}")]
    DataTooShort { expected: usize, actual: usize },

    #[error("unknown payload framing marker: {0:#04x}")]
    UnknownMarker(u8),

    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),
}

/// Failure to build or read the payload of a `LogData` entry.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("refusing to write an empty event batch")]
    EmptyBatch,

    #[error("meta entry must hold exactly one event, found {0}")]
    MetaArity(usize),

    #[error("decryption key for {stream} unavailable: {source}")]
    KeyUnavailable {
        stream: StreamName,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

//! Core error model.

use thiserror::Error;

/// Result type used across the core value types.
pub type CoreResult<T> = Result<T, CoreError>;

/// Construction/parse failure of a core value type.
///
/// Invalid values are rejected when they are built, never when they are used.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A stream name failed validation.
    #[error("invalid stream name '{name}': {reason}")]
    InvalidStreamName { name: String, reason: &'static str },

    /// A serialized cursor could not be parsed.
    #[error("invalid cursor '{input}': {reason}")]
    InvalidCursor { input: String, reason: String },

    /// An identifier was invalid (e.g. empty).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn invalid_stream(name: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidStreamName {
            name: name.into(),
            reason,
        }
    }

    pub fn invalid_cursor(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCursor {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

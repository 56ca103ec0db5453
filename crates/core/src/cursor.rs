//! Stream positions.
//!
//! A cursor is totally ordered only against cursors of the *same* stream.
//! Mixing streams in a comparison means two unrelated replay sessions were
//! confused, so `before`/`equal` panic instead of returning a value.

use core::cmp::Ordering;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::stream::StreamName;

/// Version denoting "before the first committed entry".
pub const BEGINNING: i64 = -1;

/// Immutable `(stream, version)` position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cursor {
    stream: StreamName,
    version: i64,
}

impl Cursor {
    pub fn new(stream: StreamName, version: i64) -> Self {
        debug_assert!(version >= BEGINNING, "cursor version below beginning: {version}");
        Self { stream, version }
    }

    /// Cursor positioned before the first entry of `stream`.
    pub fn beginning_of(stream: StreamName) -> Self {
        Self::new(stream, BEGINNING)
    }

    pub fn stream(&self) -> &StreamName {
        &self.stream
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_beginning(&self) -> bool {
        self.version == BEGINNING
    }

    /// Position immediately after this one. Panics past `i64::MAX`.
    pub fn next(&self) -> Cursor {
        match self.version.checked_add(1) {
            Some(version) => Self::new(self.stream.clone(), version),
            None => panic!("cursor version overflow after {self}"),
        }
    }

    /// `self < other`. Panics if the cursors belong to different streams.
    pub fn before(&self, other: &Cursor) -> bool {
        self.assert_same_stream(other);
        self.version < other.version
    }

    /// `self == other`. Panics if the cursors belong to different streams.
    pub fn equal(&self, other: &Cursor) -> bool {
        self.assert_same_stream(other);
        self.version == other.version
    }

    /// `"<stream>@<version>"`.
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    pub fn deserialize(input: &str) -> CoreResult<Cursor> {
        let parts: Vec<&str> = input.split('@').collect();
        if parts.len() != 2 {
            return Err(CoreError::invalid_cursor(input, "expected <stream>@<version>"));
        }
        let stream = StreamName::new(parts[0])
            .map_err(|e| CoreError::invalid_cursor(input, e.to_string()))?;
        let version: i64 = parts[1]
            .parse()
            .map_err(|e| CoreError::invalid_cursor(input, format!("version: {e}")))?;
        if version < BEGINNING {
            return Err(CoreError::invalid_cursor(input, "version below beginning"));
        }
        // Only the form `serialize` produces: no sign prefix, no padding.
        if version.to_string() != parts[1] {
            return Err(CoreError::invalid_cursor(input, "version is not in canonical form"));
        }
        Ok(Self::new(stream, version))
    }

    fn assert_same_stream(&self, other: &Cursor) {
        assert!(
            self.stream == other.stream,
            "cannot compare cursors of different streams: {} vs {}",
            self,
            other
        );
    }
}

impl PartialOrd for Cursor {
    /// `None` across streams: positions of unrelated logs are incomparable.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.stream != other.stream {
            return None;
        }
        Some(self.version.cmp(&other.version))
    }
}

impl core::fmt::Display for Cursor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.stream, self.version)
    }
}

impl FromStr for Cursor {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::deserialize(s)
    }
}

impl TryFrom<String> for Cursor {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::deserialize(&value)
    }
}

impl From<Cursor> for String {
    fn from(value: Cursor) -> Self {
        value.serialize()
    }
}

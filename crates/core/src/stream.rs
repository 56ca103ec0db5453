//! Hierarchical stream names.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// A slash-delimited, hierarchical stream path (e.g. `/t-3/users/uid3`).
///
/// The root stream is `/`. Every other name starts with `/`, has no trailing
/// slash and no empty segments. Segments never contain `@` or `;`, which are
/// reserved by the cursor encodings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamName(String);

const ROOT: &str = "/";

impl StreamName {
    /// Parse and validate a stream name.
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(CoreError::invalid_stream(name, "empty"));
        }
        if !name.starts_with('/') {
            return Err(CoreError::invalid_stream(name, "must start with '/'"));
        }
        if name != ROOT {
            if name.ends_with('/') {
                return Err(CoreError::invalid_stream(name, "trailing '/'"));
            }
            for segment in name[1..].split('/') {
                validate_segment(&name, segment)?;
            }
        }
        Ok(Self(name))
    }

    /// The root stream (`/`).
    pub fn root() -> Self {
        Self(ROOT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT
    }

    /// Parent stream, or `None` for the root.
    pub fn parent(&self) -> Option<StreamName> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
        }
    }

    /// Child stream one level below this one.
    pub fn child(&self, name: &str) -> CoreResult<StreamName> {
        validate_segment(name, name)?;
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    /// Last path segment (empty for the root).
    pub fn base(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Segment-aware prefix test: true if `self` equals `ancestor` or lives
    /// anywhere below it. `/ab` is not under `/a`.
    pub fn is_under(&self, ancestor: &StreamName) -> bool {
        if ancestor.is_root() || self == ancestor {
            return true;
        }
        self.0
            .strip_prefix(ancestor.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

fn validate_segment(full: &str, segment: &str) -> CoreResult<()> {
    if segment.is_empty() {
        return Err(CoreError::invalid_stream(full, "empty segment"));
    }
    if segment.contains('/') {
        return Err(CoreError::invalid_stream(full, "segment contains '/'"));
    }
    if segment.contains('@') || segment.contains(';') {
        return Err(CoreError::invalid_stream(full, "segment contains a reserved character"));
    }
    Ok(())
}

impl core::fmt::Display for StreamName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StreamName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for StreamName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StreamName> for String {
    fn from(value: StreamName) -> Self {
        value.0
    }
}

impl AsRef<str> for StreamName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

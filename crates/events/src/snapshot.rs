use streamlog_core::Cursor;

/// Identifies one projection's snapshot format for a stream.
///
/// The schema version is part of the identity: bumping it makes old
/// snapshots invisible instead of being misread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotPerspective {
    pub context: String,
    pub version: u32,
}

impl SnapshotPerspective {
    pub fn new(context: impl Into<String>, version: u32) -> Self {
        Self {
            context: context.into(),
            version,
        }
    }

    /// Storage key, e.g. `chat:v1`.
    pub fn key(&self) -> String {
        format!("{}:v{}", self.context, self.version)
    }
}

impl core::fmt::Display for SnapshotPerspective {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:v{}", self.context, self.version)
    }
}

/// A projection's serialized state as of `cursor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub cursor: Cursor,
    pub raw_data: Vec<u8>,
    pub perspective: SnapshotPerspective,
}

impl Snapshot {
    pub fn new(cursor: Cursor, raw_data: Vec<u8>, perspective: SnapshotPerspective) -> Self {
        Self {
            cursor,
            raw_data,
            perspective,
        }
    }
}

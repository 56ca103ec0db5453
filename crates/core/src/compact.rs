//! Compact encoding for lists of cursors.
//!
//! Audit events may reference many positions, usually clustered on a few
//! streams. Entries are joined with `;` and a cursor whose stream equals the
//! previous entry's stream is written as `@<version>` only:
//!
//! `/a@1;@2;/b@7` = `[/a@1, /a@2, /b@7]`

use crate::cursor::Cursor;
use crate::error::{CoreError, CoreResult};
use crate::stream::StreamName;

pub fn encode_compact(cursors: &[Cursor]) -> String {
    let mut out = String::new();
    let mut previous: Option<&StreamName> = None;
    for (idx, cursor) in cursors.iter().enumerate() {
        if idx > 0 {
            out.push(';');
        }
        if previous != Some(cursor.stream()) {
            out.push_str(cursor.stream().as_str());
        }
        out.push('@');
        out.push_str(&cursor.version().to_string());
        previous = Some(cursor.stream());
    }
    out
}

pub fn decode_compact(input: &str) -> CoreResult<Vec<Cursor>> {
    if input.is_empty() {
        return Ok(vec![]);
    }

    let mut cursors: Vec<Cursor> = Vec::new();
    for entry in input.split(';') {
        let cursor = match entry.strip_prefix('@') {
            Some(version) => {
                let previous = cursors
                    .last()
                    .ok_or_else(|| CoreError::invalid_cursor(input, "first entry has no stream"))?;
                Cursor::deserialize(&format!("{}@{version}", previous.stream()))?
            }
            None => Cursor::deserialize(entry)?,
        };
        cursors.push(cursor);
    }
    Ok(cursors)
}

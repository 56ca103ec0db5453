use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use streamlog_core::{Cursor, StreamName};
use streamlog_events::{DekEnvelope, LogData, LogEntry};

use super::r#trait::{AppendResult, EventLog, EventLogError, ReadResult};
use super::{child_stream_created_entry, stream_started_entry};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// In-memory event log.
///
/// Intended for tests/dev. All writes happen under one lock. Writes to a
/// stream registered with [`InMemoryEventLog::fail_writes_to`] fail; in
/// `create_stream` that can happen after the parent was already written, and
/// the parent's entry is rolled back.
#[derive(Debug)]
pub struct InMemoryEventLog {
    streams: RwLock<HashMap<StreamName, Vec<LogData>>>,
    failing: RwLock<HashSet<StreamName>>,
    page_size: usize,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Small pages exercise the reader's pagination.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
            page_size: page_size.max(1),
        }
    }

    /// Make every write touching `stream` fail with a storage error.
    pub fn fail_writes_to(&self, stream: &StreamName) {
        if let Ok(mut failing) = self.failing.write() {
            failing.insert(stream.clone());
        }
    }

    pub fn heal(&self, stream: &StreamName) {
        if let Ok(mut failing) = self.failing.write() {
            failing.remove(stream);
        }
    }

    /// Version of the newest entry, `None` if the stream was never created.
    pub fn head(&self, stream: &StreamName) -> Option<i64> {
        let streams = self.streams.read().ok()?;
        streams
            .get(stream)
            .map(|entries| entries.len() as i64 - 1)
    }

    /// Write raw data at the head, bypassing stream bookkeeping. For seeding
    /// entries of kinds the client never produces.
    pub fn push_raw(&self, stream: &StreamName, data: LogData) -> Result<AppendResult, EventLogError> {
        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        let entries = streams
            .get_mut(stream)
            .ok_or_else(|| EventLogError::StreamNotFound(stream.clone()))?;
        entries.push(data);
        Ok(AppendResult::at(Cursor::new(stream.clone(), entries.len() as i64 - 1)))
    }

    fn check_writable(&self, streams: &[&StreamName]) -> Result<(), EventLogError> {
        let failing = self.failing.read().map_err(|_| poisoned())?;
        match streams.iter().find(|s| failing.contains(**s)) {
            Some(stream) => Err(EventLogError::Storage(format!(
                "injected write failure for {stream}"
            ))),
            None => Ok(()),
        }
    }
}

fn poisoned() -> EventLogError {
    EventLogError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn read(&self, after: &Cursor) -> Result<ReadResult, EventLogError> {
        let streams = self.streams.read().map_err(|_| poisoned())?;

        let Some(stored) = streams.get(after.stream()) else {
            return Ok(ReadResult {
                entries: vec![],
                last_entry: after.clone(),
                more: false,
            });
        };

        let start = after.next().version() as usize;
        let entries: Vec<LogEntry> = stored
            .iter()
            .enumerate()
            .skip(start)
            .take(self.page_size)
            .map(|(version, data)| {
                LogEntry::new(Cursor::new(after.stream().clone(), version as i64), data.clone())
            })
            .collect();

        let last_entry = entries
            .last()
            .map(|e| e.cursor.clone())
            .unwrap_or_else(|| after.clone());
        let more = stored.len() > start + entries.len();

        Ok(ReadResult {
            entries,
            last_entry,
            more,
        })
    }

    async fn append(
        &self,
        stream: &StreamName,
        data: LogData,
    ) -> Result<AppendResult, EventLogError> {
        self.check_writable(&[stream])?;
        self.push_raw(stream, data)
    }

    async fn append_after(
        &self,
        after: &Cursor,
        data: LogData,
    ) -> Result<AppendResult, EventLogError> {
        self.check_writable(&[after.stream()])?;

        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        let entries = streams
            .get_mut(after.stream())
            .ok_or_else(|| EventLogError::StreamNotFound(after.stream().clone()))?;

        let target = after.next().version();
        if (entries.len() as i64) > target {
            return Err(EventLogError::conflict(after));
        }
        if (entries.len() as i64) < target {
            return Err(EventLogError::InvalidAppend(format!(
                "{after} is beyond the head of {}",
                after.stream()
            )));
        }

        entries.push(data);
        Ok(AppendResult::at(after.next()))
    }

    async fn create_stream(
        &self,
        stream: &StreamName,
        dek_envelope: &DekEnvelope,
        initial_data: Option<LogData>,
    ) -> Result<AppendResult, EventLogError> {
        let parent = stream.parent();
        let started = stream_started_entry(dek_envelope)?;
        let child_created = match &parent {
            Some(_) => Some(child_stream_created_entry(stream)?),
            None => None,
        };

        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        if streams.contains_key(stream) {
            return Err(EventLogError::StreamAlreadyExists(stream.clone()));
        }

        // Parent first, then the child; a failing child write takes the
        // parent's entry back out before the lock is released.
        let mut parent_cursor = None;
        if let (Some(parent), Some(entry)) = (&parent, child_created) {
            let parent_entries = streams
                .get_mut(parent)
                .ok_or_else(|| EventLogError::StreamNotFound(parent.clone()))?;
            self.check_writable(&[parent])?;
            parent_entries.push(entry);
            parent_cursor = Some(Cursor::new(parent.clone(), parent_entries.len() as i64 - 1));
        }

        if let Err(err) = self.check_writable(&[stream]) {
            if let Some(parent_cursor) = &parent_cursor {
                if let Some(parent_entries) = streams.get_mut(parent_cursor.stream()) {
                    parent_entries.pop();
                }
            }
            return Err(err);
        }

        let mut entries = vec![started];
        entries.extend(initial_data);
        let head = entries.len() as i64 - 1;
        streams.insert(stream.clone(), entries);

        Ok(AppendResult {
            cursor: Cursor::new(stream.clone(), head),
            parent: parent_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamlog_events::LogDataKind;

    fn name(s: &str) -> StreamName {
        StreamName::new(s).unwrap()
    }

    fn blob(b: u8) -> LogData {
        LogData::new(LogDataKind::EncryptedData, vec![b])
    }

    async fn with_root_and(log: &InMemoryEventLog, stream: &str) {
        let env = DekEnvelope::new(vec![9]);
        log.create_stream(&StreamName::root(), &env, None).await.unwrap();
        log.create_stream(&name(stream), &env, None).await.unwrap();
    }

    #[tokio::test]
    async fn read_is_exclusive_after_and_paginated() {
        let log = InMemoryEventLog::with_page_size(2);
        with_root_and(&log, "/s").await;
        for b in 1..=4 {
            log.append(&name("/s"), blob(b)).await.unwrap();
        }

        let page = log.read(&Cursor::beginning_of(name("/s"))).await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].cursor.version(), 0);
        assert!(page.more);

        let page = log.read(&page.last_entry).await.unwrap();
        assert_eq!(page.entries[0].cursor.version(), 2);
        assert!(page.more);

        let page = log.read(&page.last_entry).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.last_entry.version(), 4);
        assert!(!page.more);

        let page = log.read(&page.last_entry).await.unwrap();
        assert!(page.entries.is_empty());
        assert_eq!(page.last_entry.version(), 4);
    }

    #[tokio::test]
    async fn append_after_detects_conflicts() {
        let log = InMemoryEventLog::new();
        with_root_and(&log, "/s").await;

        let head = Cursor::new(name("/s"), 0);
        assert_eq!(log.append_after(&head, blob(1)).await.unwrap().cursor.version(), 1);

        let err = log.append_after(&head, blob(2)).await.unwrap_err();
        assert!(err.is_optimistic_locking());
        assert!(err.to_string().contains("version 1"));

        let ahead = Cursor::new(name("/s"), 5);
        assert!(matches!(
            log.append_after(&ahead, blob(3)).await,
            Err(EventLogError::InvalidAppend(_))
        ));
    }

    #[tokio::test]
    async fn writes_require_a_created_stream() {
        let log = InMemoryEventLog::new();
        assert!(matches!(
            log.append(&name("/nope"), blob(1)).await,
            Err(EventLogError::StreamNotFound(_))
        ));
        let empty = log.read(&Cursor::beginning_of(name("/nope"))).await.unwrap();
        assert!(empty.entries.is_empty() && !empty.more);
    }

    #[tokio::test]
    async fn create_stream_writes_child_and_parent() {
        let log = InMemoryEventLog::new();
        with_root_and(&log, "/a").await;

        let res = log
            .create_stream(&name("/a/b"), &DekEnvelope::new(vec![1]), Some(blob(7)))
            .await
            .unwrap();
        assert_eq!(res.cursor, Cursor::new(name("/a/b"), 1));
        assert_eq!(res.parent, Some(Cursor::new(name("/a"), 1)));
        assert_eq!(log.head(&name("/a")), Some(1));
        assert_eq!(log.head(&StreamName::root()), Some(1));

        assert!(matches!(
            log.create_stream(&name("/a/b"), &DekEnvelope::new(vec![1]), None).await,
            Err(EventLogError::StreamAlreadyExists(_))
        ));
        assert!(matches!(
            log.create_stream(&name("/x/y"), &DekEnvelope::new(vec![1]), None).await,
            Err(EventLogError::StreamNotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_parent_failure_leaves_both_sides_unchanged() {
        let log = InMemoryEventLog::new();
        with_root_and(&log, "/a").await;
        log.fail_writes_to(&name("/a"));

        let err = log
            .create_stream(&name("/a/b"), &DekEnvelope::new(vec![1]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EventLogError::Storage(_)));
        assert_eq!(log.head(&name("/a/b")), None);
        assert_eq!(log.head(&name("/a")), Some(0));

        log.heal(&name("/a"));
        log.create_stream(&name("/a/b"), &DekEnvelope::new(vec![1]), None)
            .await
            .unwrap();
        assert_eq!(log.head(&name("/a")), Some(1));
    }

    #[tokio::test]
    async fn child_failure_after_parent_write_rolls_the_parent_back() {
        let log = InMemoryEventLog::new();
        with_root_and(&log, "/a").await;
        log.fail_writes_to(&name("/a/b"));

        let err = log
            .create_stream(&name("/a/b"), &DekEnvelope::new(vec![1]), Some(blob(7)))
            .await
            .unwrap_err();
        assert!(matches!(err, EventLogError::Storage(_)));
        assert_eq!(log.head(&name("/a/b")), None);
        assert_eq!(log.head(&name("/a")), Some(0));

        log.heal(&name("/a/b"));
        let res = log
            .create_stream(&name("/a/b"), &DekEnvelope::new(vec![1]), None)
            .await
            .unwrap();
        assert_eq!(res.parent, Some(Cursor::new(name("/a"), 1)));
    }
}

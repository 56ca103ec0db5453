//! Bounded cache of shared readers.
//!
//! Replaying a busy stream on every request is wasteful, so callers keep
//! readers here and refresh them with
//! [`Reader::load_until_realtime_if_stale`]. The cache is an ordinary value
//! owned by whoever constructs it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use streamlog_events::Projection;

use crate::reader::{Reader, ReaderError};

struct Entry<P: Projection> {
    reader: Arc<Reader<P>>,
    last_used: u64,
}

pub struct ReaderCache<P: Projection> {
    entries: Mutex<HashMap<String, Entry<P>>>,
    capacity: usize,
    stale_after: Duration,
    tick: Mutex<u64>,
}

impl<P: Projection> ReaderCache<P> {
    pub fn new(capacity: usize, stale_after: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            stale_after,
            tick: Mutex::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    fn next_tick(&self) -> u64 {
        let mut tick = self.tick.lock().unwrap_or_else(|e| e.into_inner());
        *tick += 1;
        *tick
    }

    /// The cached reader for `key`, or a new one from `factory`. Inserting
    /// into a full cache evicts the least recently used reader.
    pub fn get_or_insert_with(
        &self,
        key: &str,
        factory: impl FnOnce() -> Reader<P>,
    ) -> Arc<Reader<P>> {
        let now = self.next_tick();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = entries.get_mut(key) {
            entry.last_used = now;
            return entry.reader.clone();
        }

        if entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(key = %oldest, "evicting reader");
                entries.remove(&oldest);
            }
        }

        let reader = Arc::new(factory());
        entries.insert(
            key.to_string(),
            Entry {
                reader: reader.clone(),
                last_used: now,
            },
        );
        reader
    }

    /// Cached (or new) reader, caught up unless it loaded recently.
    pub async fn fresh(
        &self,
        key: &str,
        factory: impl FnOnce() -> Reader<P>,
    ) -> Result<Arc<Reader<P>>, ReaderError> {
        let reader = self.get_or_insert_with(key, factory);
        reader.load_until_realtime_if_stale(self.stale_after).await?;
        Ok(reader)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<Reader<P>>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .map(|entry| entry.reader)
    }
}

impl<P: Projection> core::fmt::Debug for ReaderCache<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReaderCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

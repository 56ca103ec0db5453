//! Process-wide cache of plaintext DEKs.
//!
//! Two levels of locking: a short synchronous lock over the map hands out a
//! per-stream async slot, and the slot's lock is held across the fetch. Two
//! callers asking for the same stream fetch once; different streams never
//! wait on each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use streamlog_core::StreamName;
use streamlog_events::Dek;

type Slot = Arc<AsyncMutex<Option<Dek>>>;

#[derive(Debug, Default)]
pub struct DekCache {
    slots: Mutex<HashMap<StreamName, Slot>>,
}

impl DekCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, stream: &StreamName) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(stream.clone()).or_default().clone()
    }

    /// The cached key, or the result of `load` (cached only on success).
    pub async fn get_or_load<F, Fut, E>(&self, stream: &StreamName, load: F) -> Result<Dek, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Dek, E>>,
    {
        let slot = self.slot(stream);
        let mut guard = slot.lock().await;
        if let Some(dek) = guard.as_ref() {
            return Ok(dek.clone());
        }

        match load().await {
            Ok(dek) => {
                *guard = Some(dek.clone());
                Ok(dek)
            }
            Err(err) => {
                drop(guard);
                self.discard_empty(stream, &slot);
                Err(err)
            }
        }
    }

    /// Remove `slot` if it is still the stream's slot and never got a key.
    /// Callers already waiting on it keep their handle and retry the load.
    fn discard_empty(&self, stream: &StreamName, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let unused = slots.get(stream).is_some_and(|current| {
            Arc::ptr_eq(current, slot) && current.try_lock().is_ok_and(|g| g.is_none())
        });
        if unused {
            slots.remove(stream);
        }
    }

    /// Number of streams with a resolved key.
    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.values().cloned().collect()
        };
        slots
            .iter()
            .filter(|slot| slot.try_lock().map(|g| g.is_some()).unwrap_or(false))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a stream's key, e.g. after key rotation.
    pub fn forget(&self, stream: &StreamName) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(stream);
    }
}

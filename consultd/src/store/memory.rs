//! In-memory store for tests and ephemeral runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{Store, StoreError};

/// Keeps records in a vector; can be switched offline to simulate outages.
pub struct MemoryStore<R> {
    records: Mutex<Vec<R>>,
    offline: AtomicBool,
}

impl<R> MemoryStore<R> {
    pub const fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Make subsequent appends fail until switched back on.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl<R> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Clone + Send> Store<R> for MemoryStore<R> {
    fn append(&self, record: &R) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn replay(&self) -> Result<Vec<R>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

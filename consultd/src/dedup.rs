//! Idempotency table shared by the ledger and the room relay.
//!
//! A key is claimed before the guarded mutation runs. The claim either hands
//! back the result committed by an earlier attempt, reports that another
//! attempt is still running, or issues a [`Ticket`] that must be completed
//! with the new result. Dropping an uncompleted ticket frees the key again,
//! so a failed attempt can be retried.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

enum Slot<V> {
    InFlight,
    Done(V),
}

/// Outcome of claiming a key.
pub enum Claim<'a, K: Eq + Hash, V> {
    /// First attempt: run the operation and complete the ticket.
    Fresh(Ticket<'a, K, V>),
    /// Already applied: the committed result.
    Replay(V),
    /// Another attempt holds the key right now.
    InFlight,
}

/// Results of idempotent operations, keyed by operation and caller key.
pub struct IdempotencyTable<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> IdempotencyTable<K, V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Claim `key` ahead of running the operation it guards.
    pub fn claim(&self, key: K) -> Claim<'_, K, V> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get(&key) {
            Some(Slot::Done(value)) => Claim::Replay(value.clone()),
            Some(Slot::InFlight) => Claim::InFlight,
            None => {
                slots.insert(key.clone(), Slot::InFlight);
                Claim::Fresh(Ticket {
                    table: self,
                    key: Some(key),
                })
            }
        }
    }

    /// Committed result for `key`, if any.
    #[cfg(test)]
    pub fn get(&self, key: &K) -> Option<V> {
        match self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            Some(Slot::Done(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Record a committed result directly (journal replay).
    pub fn insert(&self, key: K, value: V) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Slot::Done(value));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for IdempotencyTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to apply the operation behind a claimed key.
pub struct Ticket<'a, K: Eq + Hash, V> {
    table: &'a IdempotencyTable<K, V>,
    key: Option<K>,
}

impl<K: Eq + Hash, V> Ticket<'_, K, V> {
    /// Record the committed result; later claims replay it.
    pub fn complete(mut self, value: V) {
        if let Some(key) = self.key.take() {
            self.table
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, Slot::Done(value));
        }
    }
}

impl<K: Eq + Hash, V> Drop for Ticket<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut slots = self
                .table
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if matches!(slots.get(&key), Some(Slot::InFlight)) {
                slots.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_claim_replays() {
        let table = IdempotencyTable::<String, u32>::new();
        match table.claim("gw-123".into()) {
            Claim::Fresh(ticket) => ticket.complete(500),
            _ => panic!("first claim must be fresh"),
        }
        assert!(matches!(table.claim("gw-123".into()), Claim::Replay(500)));
        assert_eq!(table.get(&"gw-123".to_string()), Some(500));
    }

    #[test]
    fn concurrent_claim_sees_in_flight() {
        let table = IdempotencyTable::<&str, u32>::new();
        let first = table.claim("k");
        assert!(matches!(first, Claim::Fresh(_)));
        assert!(matches!(table.claim("k"), Claim::InFlight));
        drop(first);
    }

    #[test]
    fn dropped_ticket_frees_the_key() {
        let table = IdempotencyTable::<&str, u32>::new();
        if let Claim::Fresh(ticket) = table.claim("k") {
            drop(ticket);
        }
        assert!(table.is_empty());
        assert!(matches!(table.claim("k"), Claim::Fresh(_)));
    }
}

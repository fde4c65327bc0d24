//! One room: the live endpoints of a single active session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::dedup::IdempotencyTable;
use crate::models::{Envelope, ParticipantId, SessionId};

/// A connected endpoint.
pub(super) struct Member {
    pub connection_id: u64,
    pub tx: mpsc::Sender<Envelope>,
}

pub(super) struct Room {
    pub session_id: SessionId,
    /// The only identities allowed to join.
    pub allowed: [ParticipantId; 2],
    members: Mutex<HashMap<ParticipantId, Member>>,
    seq: AtomicU64,
    /// Set under the members lock when the room is torn down.
    closed: AtomicBool,
    /// Chat retries keyed by (sender, client message id) -> first seq.
    pub delivered: IdempotencyTable<(ParticipantId, String), u64>,
}

impl Room {
    pub fn new(session_id: &str, allowed: [ParticipantId; 2]) -> Self {
        Self {
            session_id: session_id.to_string(),
            allowed,
            members: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            delivered: IdempotencyTable::new(),
        }
    }

    pub fn admits(&self, participant: &str) -> bool {
        self.allowed.iter().any(|p| p == participant)
    }

    pub fn members(&self) -> MutexGuard<'_, HashMap<ParticipantId, Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the room closed and hand back whoever was still connected.
    pub fn close(&self) -> HashMap<ParticipantId, Member> {
        let mut members = self.members();
        self.closed.store(true, Ordering::SeqCst);
        std::mem::take(&mut *members)
    }

    /// Only meaningful while the members lock is held.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

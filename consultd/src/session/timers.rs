//! Cancellation handles for the background tasks tied to one session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::models::{ParticipantId, SessionId};

struct SessionTimers {
    /// Parent of every task for the session; cancelled on termination.
    root: CancellationToken,
    pending: CancellationToken,
    /// Nudges the billing clock to recompute its next deadline.
    wake: Arc<Notify>,
    grace: HashMap<ParticipantId, CancellationToken>,
}

impl SessionTimers {
    fn new() -> Self {
        let root = CancellationToken::new();
        let pending = root.child_token();
        Self {
            root,
            pending,
            wake: Arc::new(Notify::new()),
            grace: HashMap::new(),
        }
    }
}

#[derive(Default)]
pub(super) struct Timers {
    sessions: Mutex<HashMap<SessionId, SessionTimers>>,
}

impl Timers {
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionTimers>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token for the accept-deadline task.
    pub fn pending(&self, session_id: &str) -> CancellationToken {
        self.lock()
            .entry(session_id.to_string())
            .or_insert_with(SessionTimers::new)
            .pending
            .clone()
    }

    /// Token and wake handle for the billing clock.
    pub fn clock(&self, session_id: &str) -> (CancellationToken, Arc<Notify>) {
        let mut sessions = self.lock();
        let timers = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionTimers::new);
        (timers.root.child_token(), timers.wake.clone())
    }

    /// Token for a reconnect grace timer. Re-arming replaces the previous one.
    pub fn grace(&self, session_id: &str, participant_id: &str) -> CancellationToken {
        let mut sessions = self.lock();
        let timers = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionTimers::new);
        let token = timers.root.child_token();
        if let Some(previous) = timers
            .grace
            .insert(participant_id.to_string(), token.clone())
        {
            previous.cancel();
        }
        token
    }

    pub fn cancel_pending(&self, session_id: &str) {
        if let Some(timers) = self.lock().get(session_id) {
            timers.pending.cancel();
        }
    }

    pub fn cancel_grace(&self, session_id: &str, participant_id: &str) {
        if let Some(token) = self
            .lock()
            .get_mut(session_id)
            .and_then(|timers| timers.grace.remove(participant_id))
        {
            token.cancel();
        }
    }

    pub fn wake(&self, session_id: &str) {
        if let Some(timers) = self.lock().get(session_id) {
            timers.wake.notify_one();
        }
    }

    /// Cancel every task of a session and forget it.
    pub fn cancel_all(&self, session_id: &str) {
        if let Some(timers) = self.lock().remove(session_id) {
            timers.root.cancel();
        }
    }

    /// Cancel everything, for shutdown.
    pub fn shutdown(&self) {
        for (_, timers) in self.lock().drain() {
            timers.root.cancel();
        }
    }
}

//! Reactions to participants dropping out of and rejoining a room.
//!
//! A disconnect never ends a session by itself: it starts a grace timer,
//! and only a participant still absent when it fires ends the session.
//! With `bill_while_disconnected = false` the billing clock also pauses
//! until everyone is back.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{lock, SessionManager};
use crate::error::Result;
use crate::models::{EndReason, SessionState};
use crate::relay::RelayHint;

impl SessionManager {
    pub(super) fn on_hint(&self, hint: RelayHint) {
        let result = match &hint {
            RelayHint::Joined {
                session_id,
                participant_id,
            } => self.participant_joined(session_id, participant_id),
            RelayHint::Left {
                session_id,
                participant_id,
            } => self.participant_left(session_id, participant_id),
        };
        if let Err(err) = result {
            debug!(?hint, error = %err, "presence hint not applied");
        }
    }

    /// A participant's connection closed.
    pub fn participant_left(&self, session_id: &str, participant_id: &str) -> Result<()> {
        let cell = self.cell(session_id)?;
        let mut session = lock(&cell);
        session.require_participant(participant_id)?;
        if session.state != SessionState::Active {
            return Ok(());
        }

        let now = self.clock.now();
        let pause = !self.settings.bill_while_disconnected && session.paused_since.is_none();
        if pause {
            // Bill what is already due before the clock stops.
            self.tick_locked(&mut session, now)?;
            if session.state != SessionState::Active {
                return Ok(());
            }
        }

        let mut next = session.clone();
        if !next.absent.iter().any(|p| p == participant_id) {
            next.absent.push(participant_id.to_string());
        }
        if pause {
            next.paused_since = Some(now);
        }
        next.version += 1;
        self.persist(&next)?;
        *session = next;

        self.arm_grace(session_id, participant_id, now + self.settings.reconnect_grace);
        self.timers.wake(session_id);
        info!(session_id, participant_id, paused = pause, "participant disconnected");
        Ok(())
    }

    /// A participant (re)connected.
    pub fn participant_joined(&self, session_id: &str, participant_id: &str) -> Result<()> {
        let cell = self.cell(session_id)?;
        let mut session = lock(&cell);
        session.require_participant(participant_id)?;
        if session.state != SessionState::Active {
            return Ok(());
        }
        self.timers.cancel_grace(session_id, participant_id);

        let was_absent = session.absent.iter().any(|p| p == participant_id);
        if !was_absent && session.paused_since.is_none() {
            return Ok(());
        }

        let now = self.clock.now();
        let mut next = session.clone();
        next.absent.retain(|p| p != participant_id);
        if next.absent.is_empty() {
            if let Some(since) = next.paused_since.take() {
                next.paused_ms += (now - since).num_milliseconds().max(0);
            }
        }
        next.version += 1;
        self.persist(&next)?;
        *session = next;

        self.timers.wake(session_id);
        info!(
            session_id,
            participant_id,
            paused = session.paused_since.is_some(),
            "participant reconnected"
        );
        Ok(())
    }

    /// Grace period over: end the session if the participant is still away.
    /// Returns whether the session was ended.
    pub fn grace_expired(&self, session_id: &str, participant_id: &str) -> Result<bool> {
        let cell = self.cell(session_id)?;
        let mut session = lock(&cell);
        if session.state != SessionState::Active
            || !session.absent.iter().any(|p| p == participant_id)
        {
            return Ok(false);
        }
        let now = self.clock.now();
        self.complete_locked(&mut session, EndReason::Disconnected, now)?;
        Ok(true)
    }

    pub(super) fn arm_grace(&self, session_id: &str, participant_id: &str, deadline: DateTime<Utc>) {
        let token = self.timers.grace(session_id, participant_id);
        let this = self.this.clone();
        let session_id = session_id.to_string();
        let participant_id = participant_id.to_string();
        tokio::spawn(async move {
            let wait = match this.upgrade() {
                Some(manager) => (deadline - manager.clock.now()).to_std().unwrap_or_default(),
                None => return,
            };
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(wait) => {}
            }
            let Some(manager) = this.upgrade() else {
                return;
            };
            if let Err(err) = manager.grace_expired(&session_id, &participant_id) {
                warn!(%session_id, %participant_id, error = %err, "reconnect grace handling failed");
            }
        });
    }
}

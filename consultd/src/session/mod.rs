//! Session lifecycle: pending, active, expired, completed, cancelled.
//!
//! Every session sits behind its own mutex. Mutations are made on a copy:
//! transition, persist the snapshot, then publish the copy, so a failed
//! write leaves the session exactly as it was. Rooms are opened and closed
//! and timers cancelled while that lock is still held, which keeps a room
//! alive for precisely as long as its session is active.

mod billing;
mod presence;
mod timers;

#[cfg(test)]
mod fixture;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::dedup::{Claim, IdempotencyTable};
use crate::error::{EngineError, Result};
use crate::ledger::Ledger;
use crate::models::{
    Channel, EndReason, ParticipantId, PriceModel, Role, Session, SessionId, SessionState,
    StartKey,
};
use crate::relay::{Relay, RelayHint};
use crate::store::Store;
use timers::Timers;

/// Timing and policy knobs for the state machine and billing clock.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub accept_timeout: Duration,
    pub billing_interval: Duration,
    pub reconnect_grace: Duration,
    pub max_session_minutes: u32,
    pub bill_while_disconnected: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            accept_timeout: seconds(config.session.accept_timeout_secs),
            billing_interval: seconds(config.billing.interval_secs.max(1)),
            reconnect_grace: seconds(config.session.reconnect_grace_secs),
            max_session_minutes: config.session.max_session_minutes.max(1),
            bill_while_disconnected: config.billing.bill_while_disconnected,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// A client's request to open a consultation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub client_id: ParticipantId,
    pub consultant_id: ParticipantId,
    #[serde(default)]
    pub channel: Channel,
    pub price: PriceModel,
    /// Requested length; capped by the configured maximum.
    #[serde(default)]
    pub max_minutes: Option<u32>,
    /// Exact amount to hold for a per-minute session.
    #[serde(default)]
    pub budget: Option<i64>,
    pub idempotency_key: String,
}

/// A session plus values derived from it at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub ends_at: Option<DateTime<Utc>>,
    pub next_bill_at: Option<DateTime<Utc>>,
    pub elapsed_secs: i64,
    /// Participants currently connected to the room.
    pub connected: Vec<ParticipantId>,
}

/// Amount to hold and the duration limit for a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    amount: i64,
    max_duration_secs: i64,
}

type Cell = Arc<Mutex<Session>>;

/// Owns every session and drives its lifecycle.
pub struct SessionManager {
    this: Weak<Self>,
    sessions: RwLock<HashMap<SessionId, Cell>>,
    ledger: Arc<Ledger>,
    relay: Arc<Relay>,
    store: Arc<dyn Store<Session>>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    timers: Timers,
    starts: IdempotencyTable<(ParticipantId, String), SessionId>,
}

impl SessionManager {
    pub fn new(
        ledger: Arc<Ledger>,
        relay: Arc<Relay>,
        store: Arc<dyn Store<Session>>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            sessions: RwLock::new(HashMap::new()),
            ledger,
            relay,
            store,
            clock,
            settings,
            timers: Timers::default(),
            starts: IdempotencyTable::new(),
        })
    }

    /// Consume presence hints from the relay until the relay goes away.
    pub fn listen(self: &Arc<Self>, mut hints: mpsc::UnboundedReceiver<RelayHint>) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(hint) = hints.recv().await {
                let Some(manager) = this.upgrade() else {
                    break;
                };
                manager.on_hint(hint);
            }
            debug!("relay hint listener stopped");
        })
    }

    /// Reserve funds and create a pending session.
    ///
    /// Keys are scoped to the client. Retrying with the same key returns the
    /// session created by the first attempt, provided the request matches it.
    pub fn start(&self, req: StartRequest) -> Result<SessionView> {
        let claim = self
            .starts
            .claim((req.client_id.clone(), req.idempotency_key.clone()));
        let ticket = match claim {
            Claim::Fresh(ticket) => ticket,
            Claim::Replay(session_id) => return self.replay_start(&session_id, &req),
            Claim::InFlight => {
                return Err(EngineError::OperationInFlight {
                    key: req.idempotency_key,
                })
            }
        };

        let available = self.ledger.wallet(&req.client_id)?.available;
        let plan = self.plan_reservation(&req, available)?;
        let session_id = Uuid::now_v7().to_string();
        self.ledger.reserve(
            &req.client_id,
            plan.amount,
            &session_id,
            &format!("{session_id}:reserve"),
        )?;

        let mut session = Session::new(
            session_id.clone(),
            req.client_id,
            req.consultant_id,
            req.channel,
            req.price,
            plan.amount,
            plan.max_duration_secs,
            self.clock.now(),
            self.settings.accept_timeout,
        );
        session.start = Some(StartKey {
            key: req.idempotency_key,
            budget: req.budget,
            max_minutes: req.max_minutes,
        });
        if let Err(err) = self.persist(&session) {
            if let Err(release_err) = self.ledger.release_remaining(&session.client_id, &session_id) {
                warn!(%session_id, error = %release_err, "could not release reservation of unsaved session");
            }
            return Err(err);
        }

        let view = self.view(&session);
        let deadline = session.accept_deadline;
        info!(
            %session_id,
            client_id = %session.client_id,
            consultant_id = %session.consultant_id,
            reserved = plan.amount,
            "session pending"
        );
        self.write_sessions()
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));
        ticket.complete(session_id.clone());
        self.arm_pending(&session_id, deadline);
        Ok(view)
    }

    fn replay_start(&self, session_id: &str, req: &StartRequest) -> Result<SessionView> {
        let cell = self.cell(session_id)?;
        let session = lock(&cell);
        let same = session.consultant_id == req.consultant_id
            && session.channel == req.channel
            && session.price == req.price
            && session
                .start
                .as_ref()
                .is_some_and(|s| s.budget == req.budget && s.max_minutes == req.max_minutes);
        if !same {
            return Err(EngineError::IdempotencyConflict {
                key: req.idempotency_key.clone(),
            });
        }
        debug!(session_id, key = %req.idempotency_key, "replayed session start");
        Ok(self.view(&session))
    }

    /// Consultant accepts: pending -> active, room opened, billing started.
    pub fn accept(&self, session_id: &str, participant_id: &str) -> Result<SessionView> {
        let cell = self.cell(session_id)?;
        let mut session = lock(&cell);
        self.require_role(&session, participant_id, Role::Consultant)?;

        let now = self.clock.now();
        if session.state == SessionState::Pending && now >= session.accept_deadline {
            self.cancel_locked(&mut session, EndReason::AcceptTimeout, now)?;
            return Err(EngineError::ReservationExpired(session_id.to_string()));
        }

        let mut next = session.clone();
        next.transition(SessionState::Pending, SessionState::Active)?;
        next.started_at = Some(now);
        next.last_heartbeat = Some(now);
        self.persist(&next)?;
        *session = next;

        self.relay
            .open_room(session_id, &session.client_id, &session.consultant_id);
        self.timers.cancel_pending(session_id);
        self.arm_clock(session_id);
        info!(session_id, "session active");
        Ok(self.view(&session))
    }

    /// Consultant declines a pending session.
    pub fn decline(&self, session_id: &str, participant_id: &str) -> Result<SessionView> {
        let cell = self.cell(session_id)?;
        let mut session = lock(&cell);
        self.require_role(&session, participant_id, Role::Consultant)?;
        self.cancel_locked(&mut session, EndReason::Declined, self.clock.now())?;
        Ok(self.view(&session))
    }

    /// Either participant ends the session. A pending session is cancelled,
    /// an active one completed.
    pub fn end(&self, session_id: &str, participant_id: &str) -> Result<SessionView> {
        let cell = self.cell(session_id)?;
        let mut session = lock(&cell);
        let role = session.require_participant(participant_id)?;
        let now = self.clock.now();

        match (session.state, role) {
            (SessionState::Pending, Role::Client) => {
                self.cancel_locked(&mut session, EndReason::ClientWithdrew, now)?;
            }
            (SessionState::Pending, Role::Consultant) => {
                self.cancel_locked(&mut session, EndReason::Declined, now)?;
            }
            (SessionState::Active, role) => {
                let reason = match role {
                    Role::Client => EndReason::ClientEnded,
                    Role::Consultant => EndReason::ConsultantEnded,
                };
                self.complete_locked(&mut session, reason, now)?;
            }
            (actual, _) => {
                return Err(EngineError::StaleTransition {
                    session_id: session_id.to_string(),
                    expected: SessionState::Active,
                    actual,
                })
            }
        }
        Ok(self.view(&session))
    }

    /// Cancel a pending session whose accept deadline has passed.
    /// Returns whether it was cancelled.
    pub fn expire_pending(&self, session_id: &str) -> Result<bool> {
        let cell = self.cell(session_id)?;
        let mut session = lock(&cell);
        let now = self.clock.now();
        if session.state != SessionState::Pending || now < session.accept_deadline {
            return Ok(false);
        }
        self.cancel_locked(&mut session, EndReason::AcceptTimeout, now)?;
        Ok(true)
    }

    /// Record liveness from a participant. Kept in memory only.
    pub fn heartbeat(&self, session_id: &str, participant_id: &str) -> Result<SessionView> {
        let cell = self.cell(session_id)?;
        let mut session = lock(&cell);
        session.require_participant(participant_id)?;
        if session.state != SessionState::Active {
            return Err(EngineError::SessionNotActive(session_id.to_string()));
        }
        session.last_heartbeat = Some(self.clock.now());
        Ok(self.view(&session))
    }

    /// Current state of a session, optionally checked against a participant.
    pub fn status(&self, session_id: &str, participant_id: Option<&str>) -> Result<SessionView> {
        let cell = self.cell(session_id)?;
        let session = lock(&cell);
        if let Some(participant_id) = participant_id {
            session.require_participant(participant_id)?;
        }
        Ok(self.view(&session))
    }

    /// Sessions a participant belongs to, newest first.
    pub fn list_for(&self, participant_id: &str) -> Vec<SessionView> {
        let cells: Vec<Cell> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut views: Vec<SessionView> = cells
            .iter()
            .filter_map(|cell| {
                let session = lock(cell);
                session
                    .role_of(participant_id)
                    .map(|_| self.view(&session))
            })
            .collect();
        views.sort_by(|a, b| b.session.created_at.cmp(&a.session.created_at));
        views
    }

    /// Rebuild sessions from the store after a restart and re-arm their
    /// timers. Returns the number of sessions restored.
    pub fn resume(&self) -> Result<usize> {
        let mut latest: HashMap<SessionId, Session> = HashMap::new();
        for snapshot in self.store.replay()? {
            latest.insert(snapshot.id.clone(), snapshot);
        }

        {
            let mut sessions = self.write_sessions();
            for (session_id, session) in &latest {
                if let Some(start) = &session.start {
                    self.starts.insert(
                        (session.client_id.clone(), start.key.clone()),
                        session_id.clone(),
                    );
                }
                sessions.insert(session_id.clone(), Arc::new(Mutex::new(session.clone())));
            }
        }

        // A crash between reserve and the first snapshot leaves a hold that
        // no session owns.
        for hold in self.ledger.open_holds() {
            if !latest.contains_key(&hold.session_id) {
                warn!(
                    session_id = %hold.session_id,
                    wallet_id = %hold.wallet_id,
                    amount = hold.remaining(),
                    "releasing reservation with no session"
                );
                self.ledger
                    .release_remaining(&hold.wallet_id, &hold.session_id)?;
            }
        }

        let now = self.clock.now();
        for session_id in latest.keys() {
            if let Err(err) = self.recover(session_id, now) {
                warn!(%session_id, error = %err, "session recovery deferred");
                self.schedule_settlement(session_id);
            }
        }
        if !latest.is_empty() {
            info!(sessions = latest.len(), "sessions restored");
        }
        Ok(latest.len())
    }

    /// Cancel every timer. Sessions stay as persisted.
    pub fn shutdown(&self) {
        self.timers.shutdown();
    }

    fn recover(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        let cell = self.cell(session_id)?;
        let mut session = lock(&cell);
        match session.state {
            SessionState::Pending if now >= session.accept_deadline => {
                self.cancel_locked(&mut session, EndReason::AcceptTimeout, now)
            }
            SessionState::Pending => {
                self.arm_pending(session_id, session.accept_deadline);
                Ok(())
            }
            SessionState::Active => {
                self.relay
                    .open_room(session_id, &session.client_id, &session.consultant_id);
                // The room comes back empty: everyone must reconnect in time.
                let mut next = session.clone();
                for participant_id in [&session.client_id, &session.consultant_id] {
                    if !next.absent.contains(participant_id) {
                        next.absent.push(participant_id.clone());
                    }
                }
                if !self.settings.bill_while_disconnected && next.paused_since.is_none() {
                    next.paused_since = Some(now);
                }
                if next != *session {
                    next.version += 1;
                    self.persist(&next)?;
                    *session = next;
                }
                for participant_id in session.absent.clone() {
                    self.arm_grace(session_id, &participant_id, now + self.settings.reconnect_grace);
                }
                self.arm_clock(session_id);
                self.tick_locked(&mut session, now)
            }
            SessionState::Expired | SessionState::Completed | SessionState::Cancelled => {
                self.settle_locked(&mut session)
            }
        }
    }

    /// pending -> cancelled, then release the whole reservation.
    fn cancel_locked(
        &self,
        session: &mut Session,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut next = session.clone();
        next.transition(SessionState::Pending, SessionState::Cancelled)?;
        next.ended_at = Some(now);
        next.end_reason = Some(reason);
        self.persist(&next)?;
        *session = next;

        self.timers.cancel_all(&session.id);
        info!(session_id = %session.id, %reason, "session cancelled");
        self.settle_or_retry(session);
        Ok(())
    }

    /// active -> completed, tear down the room, then settle.
    fn complete_locked(
        &self,
        session: &mut Session,
        reason: EndReason,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut next = session.clone();
        next.transition(SessionState::Active, SessionState::Completed)?;
        next.ended_at = Some(ended_at);
        next.end_reason = Some(reason);
        self.persist(&next)?;
        *session = next;

        self.relay.close_room(&session.id, Some(reason));
        self.timers.cancel_all(&session.id);
        info!(session_id = %session.id, %reason, "session completed");
        self.settle_or_retry(session);
        Ok(())
    }

    /// active -> expired on fund exhaustion. Settlement moves it on to
    /// completed.
    fn expire_locked(&self, session: &mut Session, now: DateTime<Utc>) -> Result<()> {
        let mut next = session.clone();
        next.transition(SessionState::Active, SessionState::Expired)?;
        next.ended_at = Some(now);
        next.end_reason = Some(EndReason::InsufficientFunds);
        self.persist(&next)?;
        *session = next;

        self.relay
            .close_room(&session.id, Some(EndReason::InsufficientFunds));
        self.timers.cancel_all(&session.id);
        warn!(session_id = %session.id, captured = session.captured, "session expired: funds exhausted");
        self.settle_or_retry(session);
        Ok(())
    }

    fn plan_reservation(&self, req: &StartRequest, available: i64) -> Result<Reservation> {
        let cap = self.settings.max_session_minutes;
        let minutes = match req.max_minutes {
            Some(0) => {
                return Err(EngineError::InvalidAmount(
                    "max_minutes must be positive".to_string(),
                ))
            }
            Some(minutes) => minutes.min(cap),
            None => cap,
        };
        let max_duration_secs = i64::from(minutes) * 60;

        let unit = req.price.unit_price();
        if unit <= 0 {
            return Err(EngineError::InvalidAmount(format!(
                "price must be positive, got {unit}"
            )));
        }

        let amount = match req.price {
            PriceModel::Flat { amount } => amount,
            PriceModel::PerMinute { rate } => {
                let interval = self.settings.billing_interval.num_seconds().max(1);
                let increments = (max_duration_secs / interval).max(1);
                match (req.budget, req.max_minutes) {
                    (Some(budget), _) if budget < rate => {
                        return Err(EngineError::InvalidAmount(format!(
                            "budget {budget} does not cover one increment at rate {rate}"
                        )))
                    }
                    (Some(budget), _) => budget,
                    (None, Some(_)) => rate.saturating_mul(increments),
                    (None, None) => {
                        let affordable = (available / rate).min(increments);
                        if affordable == 0 {
                            return Err(EngineError::InsufficientFunds {
                                wallet_id: req.client_id.clone(),
                                available,
                                requested: rate,
                            });
                        }
                        affordable * rate
                    }
                }
            }
        };

        Ok(Reservation {
            amount,
            max_duration_secs,
        })
    }

    fn require_role(&self, session: &Session, participant_id: &str, role: Role) -> Result<()> {
        if session.require_participant(participant_id)? == role {
            Ok(())
        } else {
            Err(EngineError::NotParticipant {
                session_id: session.id.clone(),
                participant: participant_id.to_string(),
            })
        }
    }

    fn view(&self, session: &Session) -> SessionView {
        let next_bill_at = if session.state == SessionState::Active {
            session.next_bill_at(self.settings.billing_interval)
        } else {
            None
        };
        SessionView {
            ends_at: session.ends_at(),
            next_bill_at,
            elapsed_secs: session.active_elapsed(self.clock.now()).num_seconds(),
            connected: self.relay.members(&session.id),
            session: session.clone(),
        }
    }

    fn persist(&self, session: &Session) -> Result<()> {
        self.store.append(session)?;
        Ok(())
    }

    fn cell(&self, session_id: &str) -> Result<Cell> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    fn write_sessions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Cell>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(cell: &Mutex<Session>) -> MutexGuard<'_, Session> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

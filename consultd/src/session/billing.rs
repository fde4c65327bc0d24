//! Billing clock and settlement.
//!
//! Every capture carries a key derived from the session id and the
//! increment index (`{id}:tick:{n}`, `{id}:final`), so a tick repeated by a
//! racing timer or after a restart replays instead of charging twice. The
//! next due instant is always recomputed from the persisted session.

use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{lock, SessionManager, SessionView};
use crate::error::Result;
use crate::models::{EndReason, PriceModel, Session, SessionState};

/// Recheck interval while billing is paused and nothing wakes the clock.
const PAUSED_RECHECK: StdDuration = StdDuration::from_secs(3600);
/// Delay before retrying a failed tick.
const TICK_RETRY: StdDuration = StdDuration::from_secs(1);
const SETTLE_RETRY_MAX: StdDuration = StdDuration::from_secs(30);

enum NextTick {
    At(DateTime<Utc>),
    Paused,
    Stopped,
}

impl SessionManager {
    /// Capture every increment that has fallen due, then end the session if
    /// its duration limit is reached or its hold cannot cover another
    /// increment.
    pub fn tick(&self, session_id: &str) -> Result<SessionView> {
        let cell = self.cell(session_id)?;
        let mut session = lock(&cell);
        self.tick_locked(&mut session, self.clock.now())?;
        Ok(self.view(&session))
    }

    pub(super) fn tick_locked(&self, session: &mut Session, now: DateTime<Utc>) -> Result<()> {
        if session.state != SessionState::Active {
            return Ok(());
        }

        if let PriceModel::PerMinute { rate } = session.price {
            let due = session.elapsed_increments(now, self.settings.billing_interval);
            while session.captured_increments < due {
                let n = session.captured_increments + 1;
                let key = format!("{}:tick:{n}", session.id);
                match self
                    .ledger
                    .capture(&session.client_id, &session.id, rate, &key)
                {
                    Ok(receipt) => {
                        let mut next = session.clone();
                        next.captured += rate;
                        next.captured_increments = n;
                        next.version += 1;
                        self.persist(&next)?;
                        *session = next;
                        debug!(
                            session_id = %session.id,
                            increment = n,
                            amount = rate,
                            held = receipt.wallet.held,
                            replayed = receipt.replayed,
                            "increment captured"
                        );
                    }
                    Err(err) if err.is_funding_shortfall() => {
                        warn!(session_id = %session.id, increment = n, error = %err, "capture failed");
                        return self.expire_locked(session, now);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if let Some(ends_at) = session.ends_at() {
            if now >= ends_at {
                return self.complete_locked(session, EndReason::DurationElapsed, ends_at);
            }
        }

        if let PriceModel::PerMinute { rate } = session.price {
            if session.uncaptured() < rate {
                return self.expire_locked(session, now);
            }
        }
        Ok(())
    }

    /// Finish settlement of an ended session.
    pub fn settle(&self, session_id: &str) -> Result<SessionView> {
        let cell = self.cell(session_id)?;
        let mut session = lock(&cell);
        self.settle_locked(&mut session)?;
        Ok(self.view(&session))
    }

    /// Capture the final charge, release the rest of the hold and mark the
    /// session settled. Safe to repeat until it succeeds.
    pub(super) fn settle_locked(&self, session: &mut Session) -> Result<()> {
        if session.settled
            || !matches!(
                session.state,
                SessionState::Expired | SessionState::Completed | SessionState::Cancelled
            )
        {
            return Ok(());
        }

        let (charge, increments) = self.final_charge(session);
        let mut next = session.clone();
        if charge > 0 {
            self.ledger.capture(
                &session.client_id,
                &session.id,
                charge,
                &format!("{}:final", session.id),
            )?;
            next.captured += charge;
            next.captured_increments += increments;
        }
        let released = self
            .ledger
            .release_remaining(&session.client_id, &session.id)?
            .map_or(0, |receipt| receipt.entry.magnitude());

        next.settled = true;
        if next.state == SessionState::Expired {
            next.transition(SessionState::Expired, SessionState::Completed)?;
        } else {
            next.version += 1;
        }
        self.persist(&next)?;
        *session = next;

        info!(
            session_id = %session.id,
            state = %session.state,
            charge,
            released,
            captured = session.captured,
            "session settled"
        );
        Ok(())
    }

    /// Amount still owed at the end and the increments it pays for.
    fn final_charge(&self, session: &Session) -> (i64, u32) {
        if session.state == SessionState::Cancelled
            || session.started_at.is_none()
            || session.end_reason == Some(EndReason::InsufficientFunds)
        {
            return (0, 0);
        }
        match session.price {
            PriceModel::Flat { amount } => {
                ((amount - session.captured).clamp(0, session.uncaptured()), 0)
            }
            PriceModel::PerMinute { rate } => {
                let end = session.ended_at.unwrap_or_else(|| self.clock.now());
                let owed = session
                    .elapsed_increments(end, self.settings.billing_interval)
                    .saturating_sub(session.captured_increments);
                let charge = i64::from(owed)
                    .checked_mul(rate)
                    .map_or(session.uncaptured(), |owed| owed.min(session.uncaptured()));
                (charge.max(0), owed)
            }
        }
    }

    /// Settle now, or keep retrying in the background.
    pub(super) fn settle_or_retry(&self, session: &mut Session) {
        if let Err(err) = self.settle_locked(session) {
            warn!(session_id = %session.id, error = %err, "settlement failed; will retry");
            self.schedule_settlement(&session.id);
        }
    }

    pub(super) fn schedule_settlement(&self, session_id: &str) {
        let this = self.this.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let mut delay = TICK_RETRY;
            loop {
                tokio::time::sleep(delay).await;
                let Some(manager) = this.upgrade() else {
                    return;
                };
                match manager.settle(&session_id) {
                    Ok(_) => return,
                    Err(err) => {
                        warn!(%session_id, error = %err, "settlement retry failed");
                        delay = (delay * 2).min(SETTLE_RETRY_MAX);
                    }
                }
            }
        });
    }

    /// Start the billing clock task of an active session.
    pub(super) fn arm_clock(&self, session_id: &str) {
        let (token, wake) = self.timers.clock(session_id);
        tokio::spawn(run_clock(
            self.this.clone(),
            session_id.to_string(),
            token,
            wake,
        ));
    }

    /// Start the accept-deadline task of a pending session.
    pub(super) fn arm_pending(&self, session_id: &str, deadline: DateTime<Utc>) {
        let token = self.timers.pending(session_id);
        let this = self.this.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            loop {
                let wait = {
                    let Some(manager) = this.upgrade() else {
                        return;
                    };
                    (deadline - manager.clock.now()).to_std().unwrap_or_default()
                };
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(wait) => {}
                }
                let Some(manager) = this.upgrade() else {
                    return;
                };
                match manager.expire_pending(&session_id) {
                    Ok(true) => return,
                    Ok(false) if manager.clock.now() >= deadline => return,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(%session_id, error = %err, "accept deadline handling failed");
                        tokio::time::sleep(TICK_RETRY).await;
                    }
                }
            }
        });
    }

    fn next_tick(&self, session_id: &str) -> NextTick {
        let Ok(cell) = self.cell(session_id) else {
            return NextTick::Stopped;
        };
        let session = lock(&cell);
        if session.state != SessionState::Active {
            return NextTick::Stopped;
        }
        match (
            session.next_bill_at(self.settings.billing_interval),
            session.ends_at(),
        ) {
            (Some(bill), Some(end)) => NextTick::At(bill.min(end)),
            (Some(at), None) | (None, Some(at)) => NextTick::At(at),
            (None, None) => NextTick::Paused,
        }
    }
}

async fn run_clock(
    this: Weak<SessionManager>,
    session_id: String,
    token: CancellationToken,
    wake: Arc<Notify>,
) {
    loop {
        let wait = {
            let Some(manager) = this.upgrade() else {
                return;
            };
            match manager.next_tick(&session_id) {
                NextTick::Stopped => return,
                NextTick::Paused => PAUSED_RECHECK,
                NextTick::At(at) => (at - manager.clock.now()).to_std().unwrap_or_default(),
            }
        };

        tokio::select! {
            () = token.cancelled() => return,
            () = wake.notified() => continue,
            () = tokio::time::sleep(wait) => {}
        }

        let result = match this.upgrade() {
            Some(manager) => manager.tick(&session_id).map(|_| ()),
            None => return,
        };
        if let Err(err) = result {
            warn!(%session_id, error = %err, "billing tick failed");
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(TICK_RETRY) => {}
            }
        }
    }
}

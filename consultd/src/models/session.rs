//! Session model representing one billed consultation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{ParticipantId, SessionId};
use crate::error::{EngineError, Result};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Funds reserved, waiting for the consultant to accept.
    Pending,
    /// Consultant accepted; room open and billing running.
    Active,
    /// Funds ran out mid-session; settling before completion.
    Expired,
    /// Ended and settled.
    Completed,
    /// Never started; reservation fully released.
    Cancelled,
}

impl SessionState {
    /// Convert state to string for storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the lifecycle graph has an edge `self -> to`.
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Active | Self::Cancelled)
                | (Self::Active, Self::Completed | Self::Expired)
                | (Self::Expired, Self::Completed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a session is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PriceModel {
    /// One charge for the whole session, captured at the end.
    Flat { amount: i64 },
    /// Charged per billing increment of active time.
    PerMinute { rate: i64 },
}

impl PriceModel {
    /// Price of one billing increment, or of the whole session when flat.
    pub const fn unit_price(self) -> i64 {
        match self {
            Self::Flat { amount } => amount,
            Self::PerMinute { rate } => rate,
        }
    }

    pub const fn is_metered(self) -> bool {
        matches!(self, Self::PerMinute { .. })
    }
}

/// Medium of the consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Chat,
    Voice,
    Video,
}

/// Why a session left the active lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    ClientEnded,
    ConsultantEnded,
    ClientWithdrew,
    Declined,
    AcceptTimeout,
    DurationElapsed,
    InsufficientFunds,
    Disconnected,
}

impl EndReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientEnded => "client_ended",
            Self::ConsultantEnded => "consultant_ended",
            Self::ClientWithdrew => "client_withdrew",
            Self::Declined => "declined",
            Self::AcceptTimeout => "accept_timeout",
            Self::DurationElapsed => "duration_elapsed",
            Self::InsufficientFunds => "insufficient_funds",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which side of the consultation a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Consultant,
}

/// A consultation between one client and one consultant.
/// A client's start key and the sizing it was first used with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartKey {
    pub key: String,
    pub budget: Option<i64>,
    pub max_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Paying participant; also the wallet the session bills.
    pub client_id: ParticipantId,
    pub consultant_id: ParticipantId,
    pub channel: Channel,
    pub price: PriceModel,
    pub state: SessionState,
    /// Amount held for the session at start.
    pub reserved: i64,
    /// Amount captured so far.
    pub captured: i64,
    /// Billing increments already captured.
    pub captured_increments: u32,
    /// Upper bound on billable active time, in seconds.
    pub max_duration_secs: i64,
    pub created_at: DateTime<Utc>,
    /// Consultant must accept before this instant.
    pub accept_deadline: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Set while billing is paused for a disconnect.
    pub paused_since: Option<DateTime<Utc>>,
    /// Accumulated paused time from closed pauses, in milliseconds.
    pub paused_ms: i64,
    /// Participants currently disconnected from the room.
    #[serde(default)]
    pub absent: Vec<ParticipantId>,
    /// Idempotency key and sizing the session was started with.
    #[serde(default)]
    pub start: Option<StartKey>,
    /// Final charge captured and the remaining hold released.
    #[serde(default)]
    pub settled: bool,
    /// Bumped on every transition and mutation.
    pub version: u64,
}

impl Session {
    /// Create a pending session whose reservation has already been placed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        client_id: String,
        consultant_id: String,
        channel: Channel,
        price: PriceModel,
        reserved: i64,
        max_duration_secs: i64,
        now: DateTime<Utc>,
        accept_timeout: Duration,
    ) -> Self {
        Self {
            id,
            client_id,
            consultant_id,
            channel,
            price,
            state: SessionState::Pending,
            reserved,
            captured: 0,
            captured_increments: 0,
            max_duration_secs,
            created_at: now,
            accept_deadline: now + accept_timeout,
            started_at: None,
            ended_at: None,
            end_reason: None,
            last_heartbeat: None,
            paused_since: None,
            paused_ms: 0,
            absent: Vec::new(),
            start: None,
            settled: false,
            version: 0,
        }
    }

    /// Compare-and-swap transition: applies only if the session is still in
    /// `expected`.
    pub fn transition(&mut self, expected: SessionState, to: SessionState) -> Result<()> {
        if self.state != expected || !expected.can_transition_to(to) {
            return Err(EngineError::StaleTransition {
                session_id: self.id.clone(),
                expected,
                actual: self.state,
            });
        }
        self.state = to;
        self.version += 1;
        Ok(())
    }

    /// Role of a participant, if they belong to this session.
    pub fn role_of(&self, participant: &str) -> Option<Role> {
        if participant == self.client_id {
            Some(Role::Client)
        } else if participant == self.consultant_id {
            Some(Role::Consultant)
        } else {
            None
        }
    }

    /// Fail unless `participant` is the client or the consultant.
    pub fn require_participant(&self, participant: &str) -> Result<Role> {
        self.role_of(participant)
            .ok_or_else(|| EngineError::NotParticipant {
                session_id: self.id.clone(),
                participant: participant.to_string(),
            })
    }

    /// Total paused time including a pause still in progress.
    pub fn paused_total(&self, now: DateTime<Utc>) -> Duration {
        let open = self
            .paused_since
            .map_or_else(Duration::zero, |since| (now - since).max(Duration::zero()));
        Duration::milliseconds(self.paused_ms) + open
    }

    /// Billable time since acceptance, excluding pauses.
    pub fn active_elapsed(&self, now: DateTime<Utc>) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::zero();
        };
        let end = self.ended_at.map_or(now, |ended| ended.min(now));
        (end - started - self.paused_total(end)).max(Duration::zero())
    }

    /// Increments fully elapsed at `now`, capped by the duration limit.
    pub fn elapsed_increments(&self, now: DateTime<Utc>, interval: Duration) -> u32 {
        let interval_ms = interval.num_milliseconds().max(1);
        let elapsed_ms = self
            .active_elapsed(now)
            .num_milliseconds()
            .min(self.max_duration_secs * 1000);
        u32::try_from(elapsed_ms / interval_ms).unwrap_or(u32::MAX)
    }

    /// When the next increment falls due, or `None` while paused or unstarted.
    pub fn next_bill_at(&self, interval: Duration) -> Option<DateTime<Utc>> {
        if self.paused_since.is_some() || !self.price.is_metered() {
            return None;
        }
        let started = self.started_at?;
        Some(
            started
                + Duration::milliseconds(self.paused_ms)
                + interval * (i32::try_from(self.captured_increments).unwrap_or(i32::MAX) + 1),
        )
    }

    /// When the duration limit is reached, or `None` while paused or unstarted.
    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        if self.paused_since.is_some() {
            return None;
        }
        let started = self.started_at?;
        Some(
            started
                + Duration::milliseconds(self.paused_ms)
                + Duration::seconds(self.max_duration_secs),
        )
    }

    /// Amount reserved but not yet captured.
    pub const fn uncaptured(&self) -> i64 {
        self.reserved - self.captured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(now: DateTime<Utc>) -> Session {
        Session::new(
            "s1".into(),
            "alice".into(),
            "bob".into(),
            Channel::Video,
            PriceModel::PerMinute { rate: 100 },
            250,
            3600,
            now,
            Duration::seconds(30),
        )
    }

    #[test]
    fn transition_guards_expected_state() {
        let mut s = session(Utc::now());
        s.transition(SessionState::Pending, SessionState::Active).unwrap();
        assert_eq!(s.version, 1);

        let err = s
            .transition(SessionState::Pending, SessionState::Cancelled)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::StaleTransition {
                actual: SessionState::Active,
                ..
            }
        ));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [SessionState::Completed, SessionState::Cancelled] {
            for to in [
                SessionState::Pending,
                SessionState::Active,
                SessionState::Expired,
                SessionState::Completed,
                SessionState::Cancelled,
            ] {
                assert!(!from.can_transition_to(to));
            }
        }
        assert!(!SessionState::Pending.can_transition_to(SessionState::Completed));
        assert!(!SessionState::Active.can_transition_to(SessionState::Cancelled));
    }

    #[test]
    fn elapsed_excludes_pauses() {
        let t0 = Utc::now();
        let mut s = session(t0);
        s.started_at = Some(t0);
        s.paused_ms = 30_000;
        s.paused_since = Some(t0 + Duration::seconds(150));
        let now = t0 + Duration::seconds(180);
        assert_eq!(s.active_elapsed(now), Duration::seconds(120));
        assert_eq!(s.elapsed_increments(now, Duration::seconds(60)), 2);
        assert_eq!(s.next_bill_at(Duration::seconds(60)), None);
    }

    #[test]
    fn next_bill_derives_from_captured_increments() {
        let t0 = Utc::now();
        let mut s = session(t0);
        s.started_at = Some(t0);
        s.captured_increments = 2;
        assert_eq!(
            s.next_bill_at(Duration::seconds(60)),
            Some(t0 + Duration::seconds(180))
        );
    }

    #[test]
    fn elapsed_increments_capped_by_duration_limit() {
        let t0 = Utc::now();
        let mut s = session(t0);
        s.started_at = Some(t0);
        s.max_duration_secs = 120;
        let later = t0 + Duration::seconds(600);
        assert_eq!(s.elapsed_increments(later, Duration::seconds(60)), 2);
    }

    #[test]
    fn peer_and_role_lookup() {
        let s = session(Utc::now());
        assert_eq!(s.role_of("alice"), Some(Role::Client));
        assert_eq!(s.role_of("bob"), Some(Role::Consultant));
        assert!(s.require_participant("mallory").is_err());
    }
}

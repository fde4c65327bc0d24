use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use super::{SessionManager, SessionSettings, SessionView, StartRequest};
use crate::clock::{Clock, ManualClock, SystemClock};
use crate::ledger::{Ledger, LedgerCommit};
use crate::models::{Channel, PriceModel, Session};
use crate::relay::Relay;
use crate::store::MemoryStore;

pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub ledger: Arc<Ledger>,
    pub relay: Arc<Relay>,
    pub clock: Arc<ManualClock>,
    pub sessions: Arc<MemoryStore<Session>>,
    pub commits: Arc<MemoryStore<LedgerCommit>>,
    pub t0: DateTime<Utc>,
    settings: SessionSettings,
    system_clock: bool,
}

/// alice holds `balance`; bob consults at 100 per minute.
pub fn harness(balance: i64) -> Harness {
    harness_with(balance, SessionSettings::default())
}

pub fn harness_with(balance: i64, settings: SessionSettings) -> Harness {
    build(balance, settings, false)
}

impl Harness {
    /// Same wiring, but timers and billing follow the wall clock.
    pub fn with_system_clock(balance: i64, settings: SessionSettings) -> Self {
        build(balance, settings, true)
    }

    pub fn request(&self, key: &str, budget: Option<i64>, max_minutes: Option<u32>) -> StartRequest {
        StartRequest {
            client_id: "alice".into(),
            consultant_id: "bob".into(),
            channel: Channel::Video,
            price: PriceModel::PerMinute { rate: 100 },
            max_minutes,
            budget,
            idempotency_key: key.into(),
        }
    }

    pub fn start(&self, budget: Option<i64>) -> SessionView {
        self.manager
            .start(self.request("start-1", budget, None))
            .unwrap()
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }

    /// Fresh ledger, relay and manager over the same stores, as after a
    /// process restart.
    pub fn restart(&self) -> Self {
        let ledger = Arc::new(
            Ledger::open(self.commits.clone(), self.clock(), "USD").unwrap(),
        );
        let (relay, hints) = Relay::new();
        let manager = SessionManager::new(
            ledger.clone(),
            relay.clone(),
            self.sessions.clone(),
            self.clock(),
            self.settings.clone(),
        );
        manager.listen(hints);
        manager.resume().unwrap();
        Self {
            manager,
            ledger,
            relay,
            clock: self.clock.clone(),
            sessions: self.sessions.clone(),
            commits: self.commits.clone(),
            t0: self.t0,
            settings: self.settings.clone(),
            system_clock: self.system_clock,
        }
    }

    fn clock(&self) -> Arc<dyn Clock> {
        if self.system_clock {
            Arc::new(SystemClock)
        } else {
            self.clock.clone()
        }
    }
}

fn build(balance: i64, settings: SessionSettings, system_clock: bool) -> Harness {
    let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    let manual = Arc::new(ManualClock::new(t0));
    let clock: Arc<dyn Clock> = if system_clock {
        Arc::new(SystemClock)
    } else {
        manual.clone()
    };

    let commits = Arc::new(MemoryStore::<LedgerCommit>::new());
    let sessions = Arc::new(MemoryStore::<Session>::new());
    let ledger = Arc::new(Ledger::open(commits.clone(), clock.clone(), "USD").unwrap());
    ledger.credit("alice", balance, "seed").unwrap();

    let (relay, hints) = Relay::new();
    let manager = SessionManager::new(
        ledger.clone(),
        relay.clone(),
        sessions.clone(),
        clock,
        settings.clone(),
    );
    manager.listen(hints);

    Harness {
        manager,
        ledger,
        relay,
        clock: manual,
        sessions,
        commits,
        t0,
        settings,
        system_clock,
    }
}

//! Wallet ledger: reserve, capture, release, credit and refund.
//!
//! Each wallet is its own critical section. An operation claims its
//! idempotency key, validates against the locked wallet, appends one journal
//! record and only then updates the in-memory balance, all while holding
//! that wallet's lock. Operations on different wallets never contend.

mod receipt;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::dedup::{Claim, IdempotencyTable};
use crate::error::{EngineError, Result};
use crate::models::{EntryKind, Hold, LedgerEntry, SessionId, Wallet, WalletId};
use crate::store::Store;

pub use receipt::{Fingerprint, LedgerCommit, Receipt};
use receipt::{Committed, IdemKey};

/// Wallet balance plus everything recorded against it.
struct WalletCell {
    wallet: Wallet,
    holds: HashMap<SessionId, Hold>,
    entries: Vec<LedgerEntry>,
}

impl WalletCell {
    fn new(wallet: Wallet) -> Self {
        Self {
            wallet,
            holds: HashMap::new(),
            entries: Vec::new(),
        }
    }

    fn hold(&self, session_id: &str) -> Option<&Hold> {
        self.holds.get(session_id)
    }

    fn remaining_for(&self, session_id: &str) -> i64 {
        self.hold(session_id).map_or(0, Hold::remaining)
    }
}

/// A validated mutation waiting to be committed.
struct Plan<'a> {
    kind: EntryKind,
    amount: i64,
    session_id: Option<&'a str>,
    key: Option<&'a str>,
}

type Cell = Arc<Mutex<WalletCell>>;

/// The wallet ledger.
pub struct Ledger {
    wallets: RwLock<HashMap<WalletId, Cell>>,
    idempotency: IdempotencyTable<IdemKey, Committed>,
    store: Arc<dyn Store<LedgerCommit>>,
    clock: Arc<dyn Clock>,
    default_currency: String,
}

impl Ledger {
    /// Open the ledger, rebuilding balances, holds and idempotency records
    /// from the store.
    pub fn open(
        store: Arc<dyn Store<LedgerCommit>>,
        clock: Arc<dyn Clock>,
        default_currency: &str,
    ) -> Result<Self> {
        let ledger = Self {
            wallets: RwLock::new(HashMap::new()),
            idempotency: IdempotencyTable::new(),
            store,
            clock,
            default_currency: default_currency.to_string(),
        };

        let commits = ledger.store.replay()?;
        let count = commits.len();
        {
            let mut wallets = ledger.write_wallets();
            for commit in commits {
                match commit {
                    LedgerCommit::Open { wallet } => {
                        wallets
                            .entry(wallet.id.clone())
                            .or_insert_with(|| Arc::new(Mutex::new(WalletCell::new(wallet))));
                    }
                    LedgerCommit::Apply {
                        entry,
                        wallet,
                        hold,
                        fingerprint,
                    } => {
                        let cell = wallets.entry(wallet.id.clone()).or_insert_with(|| {
                            Arc::new(Mutex::new(WalletCell::new(wallet.clone())))
                        });
                        let mut cell = lock(cell);
                        cell.wallet = wallet.clone();
                        if let Some(ref h) = hold {
                            cell.holds.insert(h.session_id.clone(), h.clone());
                        }
                        cell.entries.push(entry.clone());
                        if let (Some(fingerprint), Some(key)) =
                            (fingerprint, entry.idempotency_key.clone())
                        {
                            ledger.idempotency.insert(
                                (entry.kind, key),
                                Committed {
                                    fingerprint,
                                    entry,
                                    wallet,
                                    hold,
                                },
                            );
                        }
                    }
                }
            }
        }
        if count > 0 {
            info!(commits = count, "ledger restored from journal");
        }
        Ok(ledger)
    }

    /// Open a wallet, or return it unchanged if it already exists.
    pub fn open_wallet(&self, wallet_id: &str, currency: &str) -> Result<Wallet> {
        let cell = self.cell_or_open(wallet_id, currency)?;
        let wallet = lock(&cell).wallet.clone();
        Ok(wallet)
    }

    /// Current balance of a wallet.
    pub fn wallet(&self, wallet_id: &str) -> Result<Wallet> {
        let cell = self.cell(wallet_id)?;
        let wallet = lock(&cell).wallet.clone();
        Ok(wallet)
    }

    /// Hold placed for a session, if any.
    pub fn hold(&self, wallet_id: &str, session_id: &str) -> Result<Option<Hold>> {
        let cell = self.cell(wallet_id)?;
        let hold = lock(&cell).hold(session_id).cloned();
        Ok(hold)
    }

    /// Every hold across all wallets that still has funds held.
    pub fn open_holds(&self) -> Vec<Hold> {
        let cells: Vec<Cell> = self
            .wallets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        cells
            .iter()
            .flat_map(|cell| {
                lock(cell)
                    .holds
                    .values()
                    .filter(|h| h.is_open())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// All entries of a wallet in commit order.
    pub fn entries(&self, wallet_id: &str) -> Result<Vec<LedgerEntry>> {
        let cell = self.cell(wallet_id)?;
        let entries = lock(&cell).entries.clone();
        Ok(entries)
    }

    /// Entries of a wallet attributed to one session.
    pub fn session_entries(&self, wallet_id: &str, session_id: &str) -> Result<Vec<LedgerEntry>> {
        let cell = self.cell(wallet_id)?;
        let entries = lock(&cell)
            .entries
            .iter()
            .filter(|e| e.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        Ok(entries)
    }

    /// Check that folding the wallet's log reproduces its cached balance.
    pub fn verify(&self, wallet_id: &str) -> Result<bool> {
        let cell = self.cell(wallet_id)?;
        let cell = lock(&cell);
        let consistent = Wallet::fold(
            &cell.wallet.id,
            &cell.wallet.currency,
            cell.wallet.created_at,
            &cell.entries,
        )
        .is_ok_and(|folded| {
            folded.available == cell.wallet.available
                && folded.held == cell.wallet.held
                && folded.spent == cell.wallet.spent
        });
        if !consistent {
            warn!(wallet_id, "cached balance diverges from ledger fold");
        }
        Ok(consistent)
    }

    /// Move `amount` from available to held for a session.
    pub fn reserve(&self, wallet_id: &str, amount: i64, session_id: &str, key: &str) -> Result<Receipt> {
        let cell = self.cell(wallet_id)?;
        let mut cell = lock(&cell);
        self.apply(
            &mut cell,
            Plan {
                kind: EntryKind::Reserve,
                amount,
                session_id: Some(session_id),
                key: Some(key),
            },
            |cell| {
                if cell.remaining_for(session_id) > 0 {
                    return Err(EngineError::ReservationExists(session_id.to_string()));
                }
                if cell.wallet.available < amount {
                    return Err(EngineError::InsufficientFunds {
                        wallet_id: wallet_id.to_string(),
                        available: cell.wallet.available,
                        requested: amount,
                    });
                }
                Ok(())
            },
        )
    }

    /// Convert `amount` of a session's hold into spent funds.
    pub fn capture(&self, wallet_id: &str, session_id: &str, amount: i64, key: &str) -> Result<Receipt> {
        let cell = self.cell(wallet_id)?;
        let mut cell = lock(&cell);
        self.apply(
            &mut cell,
            Plan {
                kind: EntryKind::Capture,
                amount,
                session_id: Some(session_id),
                key: Some(key),
            },
            |cell| {
                let held = cell.remaining_for(session_id);
                if held < amount {
                    return Err(EngineError::OverCapture {
                        session_id: session_id.to_string(),
                        held,
                        requested: amount,
                    });
                }
                Ok(())
            },
        )
    }

    /// Return `amount` of a session's hold to available.
    pub fn release(&self, wallet_id: &str, session_id: &str, amount: i64) -> Result<Receipt> {
        let cell = self.cell(wallet_id)?;
        let mut cell = lock(&cell);
        self.release_locked(&mut cell, session_id, amount)
    }

    /// Release whatever is still held for a session. `None` when nothing is.
    pub fn release_remaining(&self, wallet_id: &str, session_id: &str) -> Result<Option<Receipt>> {
        let cell = self.cell(wallet_id)?;
        let mut cell = lock(&cell);
        let remaining = cell.remaining_for(session_id);
        if remaining == 0 {
            return Ok(None);
        }
        self.release_locked(&mut cell, session_id, remaining).map(Some)
    }

    /// Add funds, opening the wallet in the default currency if needed.
    pub fn credit(&self, wallet_id: &str, amount: i64, key: &str) -> Result<Receipt> {
        let cell = self.cell_or_open(wallet_id, &self.default_currency)?;
        let mut cell = lock(&cell);
        self.apply(
            &mut cell,
            Plan {
                kind: EntryKind::Credit,
                amount,
                session_id: None,
                key: Some(key),
            },
            |_| Ok(()),
        )
    }

    /// Return captured funds of a session to available.
    pub fn refund(&self, wallet_id: &str, session_id: &str, amount: i64, key: &str) -> Result<Receipt> {
        let cell = self.cell(wallet_id)?;
        let mut cell = lock(&cell);
        self.apply(
            &mut cell,
            Plan {
                kind: EntryKind::Refund,
                amount,
                session_id: Some(session_id),
                key: Some(key),
            },
            |cell| {
                let refundable = cell.hold(session_id).map_or(0, Hold::refundable);
                if refundable < amount {
                    return Err(EngineError::OverRefund {
                        session_id: session_id.to_string(),
                        refundable,
                        requested: amount,
                    });
                }
                Ok(())
            },
        )
    }

    fn release_locked(&self, cell: &mut WalletCell, session_id: &str, amount: i64) -> Result<Receipt> {
        self.apply(
            cell,
            Plan {
                kind: EntryKind::Release,
                amount,
                session_id: Some(session_id),
                key: None,
            },
            |cell| {
                let held = cell.remaining_for(session_id);
                if held < amount {
                    return Err(EngineError::OverRelease {
                        session_id: session_id.to_string(),
                        held,
                        requested: amount,
                    });
                }
                Ok(())
            },
        )
    }

    /// Claim the key, validate, commit, then publish to memory.
    /// Must be called with the wallet's lock held.
    fn apply(
        &self,
        cell: &mut WalletCell,
        plan: Plan<'_>,
        validate: impl FnOnce(&WalletCell) -> Result<()>,
    ) -> Result<Receipt> {
        if plan.amount <= 0 {
            return Err(EngineError::InvalidAmount(format!(
                "{} amount must be positive, got {}",
                plan.kind, plan.amount
            )));
        }

        let fingerprint = Fingerprint {
            wallet_id: cell.wallet.id.clone(),
            session_id: plan.session_id.map(String::from),
            amount: plan.amount,
        };

        let ticket = match plan.key {
            None => None,
            Some(key) => match self.idempotency.claim((plan.kind, key.to_string())) {
                Claim::Replay(committed) => {
                    if committed.fingerprint != fingerprint {
                        return Err(EngineError::IdempotencyConflict {
                            key: key.to_string(),
                        });
                    }
                    debug!(wallet_id = %fingerprint.wallet_id, kind = %plan.kind, key, "replayed ledger operation");
                    return Ok(committed.receipt());
                }
                Claim::InFlight => {
                    return Err(EngineError::OperationInFlight {
                        key: key.to_string(),
                    })
                }
                Claim::Fresh(ticket) => Some(ticket),
            },
        };

        validate(cell)?;

        let entry = LedgerEntry::new(
            &cell.wallet.id,
            plan.kind,
            plan.amount,
            plan.session_id,
            plan.key,
            self.clock.now(),
        );
        let mut wallet = cell.wallet.clone();
        wallet.apply(&entry)?;
        let hold = match plan.session_id {
            Some(session_id) => {
                let mut hold = cell
                    .hold(session_id)
                    .cloned()
                    .unwrap_or_else(|| Hold::new(&wallet.id, session_id));
                hold.apply(&entry)?;
                Some(hold)
            }
            None => None,
        };
        if !wallet.is_consistent() {
            return Err(EngineError::InvalidAmount(format!(
                "{} of {} would leave wallet {} negative",
                plan.kind, plan.amount, wallet.id
            )));
        }

        let commit = LedgerCommit::Apply {
            entry: entry.clone(),
            wallet: wallet.clone(),
            hold: hold.clone(),
            fingerprint: ticket.as_ref().map(|_| fingerprint.clone()),
        };
        self.store.append(&commit)?;

        cell.wallet = wallet.clone();
        if let Some(ref h) = hold {
            cell.holds.insert(h.session_id.clone(), h.clone());
        }
        cell.entries.push(entry.clone());
        if let Some(ticket) = ticket {
            ticket.complete(Committed {
                fingerprint,
                entry: entry.clone(),
                wallet: wallet.clone(),
                hold: hold.clone(),
            });
        }

        info!(
            wallet_id = %wallet.id,
            kind = %entry.kind,
            amount = plan.amount,
            session_id = plan.session_id.unwrap_or("-"),
            available = wallet.available,
            held = wallet.held,
            "ledger entry committed"
        );

        Ok(Receipt {
            entry,
            wallet,
            hold,
            replayed: false,
        })
    }

    fn cell(&self, wallet_id: &str) -> Result<Cell> {
        self.wallets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(wallet_id)
            .cloned()
            .ok_or_else(|| EngineError::WalletNotFound(wallet_id.to_string()))
    }

    fn cell_or_open(&self, wallet_id: &str, currency: &str) -> Result<Cell> {
        if let Ok(cell) = self.cell(wallet_id) {
            return Ok(cell);
        }
        let mut wallets = self.write_wallets();
        if let Some(cell) = wallets.get(wallet_id) {
            return Ok(cell.clone());
        }
        let wallet = Wallet::new(wallet_id, currency, self.clock.now());
        self.store.append(&LedgerCommit::Open {
            wallet: wallet.clone(),
        })?;
        info!(wallet_id, currency, "wallet opened");
        let cell = Arc::new(Mutex::new(WalletCell::new(wallet)));
        wallets.insert(wallet_id.to_string(), cell.clone());
        Ok(cell)
    }

    fn write_wallets(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<WalletId, Cell>> {
        self.wallets.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(cell: &Mutex<WalletCell>) -> MutexGuard<'_, WalletCell> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::{JournalStore, MemoryStore};
    use std::thread;

    fn ledger_with(store: Arc<dyn Store<LedgerCommit>>) -> Ledger {
        Ledger::open(store, Arc::new(SystemClock), "USD").unwrap()
    }

    fn funded(balance: i64) -> Ledger {
        let ledger = ledger_with(Arc::new(MemoryStore::<LedgerCommit>::new()));
        ledger.credit("alice", balance, "seed").unwrap();
        ledger
    }

    #[test]
    fn session_settlement_scenario() {
        let ledger = funded(1000);

        let r = ledger.reserve("alice", 250, "s1", "start-s1").unwrap();
        assert_eq!((r.wallet.available, r.wallet.held), (750, 250));

        let c = ledger.capture("alice", "s1", 100, "s1:tick:1").unwrap();
        assert_eq!(c.wallet.held, 150);
        assert_eq!(c.wallet.spent, 100);

        let rel = ledger.release_remaining("alice", "s1").unwrap().unwrap();
        assert_eq!(rel.entry.amount, 150);
        let w = ledger.wallet("alice").unwrap();
        assert_eq!((w.available, w.held, w.spent), (900, 0, 100));
        assert!(ledger.verify("alice").unwrap());
    }

    #[test]
    fn reserve_then_release_restores_available() {
        let ledger = funded(1000);
        ledger.reserve("alice", 400, "s1", "k1").unwrap();
        ledger.release("alice", "s1", 400).unwrap();
        let w = ledger.wallet("alice").unwrap();
        assert_eq!((w.available, w.held), (1000, 0));
    }

    #[test]
    fn reserve_rejects_overdraft() {
        let ledger = funded(100);
        let err = ledger.reserve("alice", 101, "s1", "k1").unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFunds {
                available: 100,
                requested: 101,
                ..
            }
        ));
        assert_eq!(ledger.wallet("alice").unwrap().available, 100);
    }

    #[test]
    fn capture_cannot_exceed_hold() {
        let ledger = funded(1000);
        ledger.reserve("alice", 250, "s1", "k1").unwrap();
        ledger.capture("alice", "s1", 200, "c1").unwrap();
        let err = ledger.capture("alice", "s1", 100, "c2").unwrap_err();
        assert!(matches!(err, EngineError::OverCapture { held: 50, .. }));

        let err = ledger.capture("alice", "other", 1, "c3").unwrap_err();
        assert!(matches!(err, EngineError::OverCapture { held: 0, .. }));
    }

    #[test]
    fn release_cannot_exceed_hold() {
        let ledger = funded(1000);
        ledger.reserve("alice", 250, "s1", "k1").unwrap();
        let err = ledger.release("alice", "s1", 251).unwrap_err();
        assert!(matches!(err, EngineError::OverRelease { held: 250, .. }));
    }

    #[test]
    fn one_open_reservation_per_session() {
        let ledger = funded(1000);
        ledger.reserve("alice", 100, "s1", "k1").unwrap();
        let err = ledger.reserve("alice", 100, "s1", "k2").unwrap_err();
        assert!(matches!(err, EngineError::ReservationExists(_)));
    }

    #[test]
    fn replaying_a_key_applies_once() {
        let ledger = funded(1000);
        let first = ledger.reserve("alice", 300, "s1", "start-1").unwrap();
        for _ in 0..5 {
            let again = ledger.reserve("alice", 300, "s1", "start-1").unwrap();
            assert!(again.replayed);
            assert_eq!(again.entry, first.entry);
        }
        let w = ledger.wallet("alice").unwrap();
        assert_eq!((w.available, w.held), (700, 300));
        assert_eq!(ledger.session_entries("alice", "s1").unwrap().len(), 1);
    }

    #[test]
    fn reused_key_with_different_amount_conflicts() {
        let ledger = funded(1000);
        ledger.credit("alice", 500, "gw-1").unwrap();
        let err = ledger.credit("alice", 600, "gw-1").unwrap_err();
        assert!(matches!(err, EngineError::IdempotencyConflict { .. }));
    }

    #[test]
    fn same_key_for_different_operations_is_independent() {
        let ledger = funded(1000);
        ledger.reserve("alice", 100, "s1", "x").unwrap();
        let c = ledger.capture("alice", "s1", 100, "x").unwrap();
        assert!(!c.replayed);
    }

    #[test]
    fn concurrent_duplicate_credits_apply_once() {
        let ledger = Arc::new(ledger_with(Arc::new(MemoryStore::<LedgerCommit>::new())));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                thread::spawn(move || ledger.credit("alice", 500, "gw-123").unwrap())
            })
            .collect();
        let fresh = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| !r.replayed)
            .count();
        assert_eq!(fresh, 1);
        assert_eq!(ledger.wallet("alice").unwrap().available, 500);
    }

    #[test]
    fn concurrent_reserves_never_overdraw() {
        let ledger = Arc::new(funded(1000));
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    let session = format!("s{i}");
                    let ok = ledger.reserve("alice", 120, &session, &session).is_ok();
                    if ok && i % 2 == 0 {
                        ledger.capture("alice", &session, 60, &format!("{session}:c")).unwrap();
                        ledger.release_remaining("alice", &session).unwrap();
                    }
                    ok
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let w = ledger.wallet("alice").unwrap();
        assert!(w.is_consistent());
        assert_eq!(w.available + w.held + w.spent, 1000);
        assert!(ledger.verify("alice").unwrap());
    }

    #[test]
    fn refund_bounded_by_captured() {
        let ledger = funded(1000);
        ledger.reserve("alice", 200, "s1", "k").unwrap();
        ledger.capture("alice", "s1", 200, "c").unwrap();
        ledger.refund("alice", "s1", 150, "r1").unwrap();
        let err = ledger.refund("alice", "s1", 100, "r2").unwrap_err();
        assert!(matches!(err, EngineError::OverRefund { refundable: 50, .. }));
        let w = ledger.wallet("alice").unwrap();
        assert_eq!((w.available, w.spent), (950, 50));
    }

    #[test]
    fn non_positive_amounts_rejected() {
        let ledger = funded(1000);
        assert!(matches!(
            ledger.credit("alice", 0, "z").unwrap_err(),
            EngineError::InvalidAmount(_)
        ));
        assert!(matches!(
            ledger.reserve("alice", -5, "s1", "neg").unwrap_err(),
            EngineError::InvalidAmount(_)
        ));
    }

    #[test]
    fn overflowing_credit_is_rejected_before_commit() {
        let ledger = funded(i64::MAX);
        let err = ledger.credit("alice", 1, "gw-2").unwrap_err();
        assert!(matches!(err, EngineError::InvalidAmount(_)));

        let w = ledger.wallet("alice").unwrap();
        assert_eq!(w.available, i64::MAX);
        assert!(w.is_consistent());
        assert_eq!(ledger.entries("alice").unwrap().len(), 1);
        assert!(ledger.verify("alice").unwrap());

        // The key was never committed, so it stays usable.
        ledger.reserve("alice", 10, "s1", "hold").unwrap();
        ledger.credit("alice", 1, "gw-2").unwrap();
        assert_eq!(ledger.wallet("alice").unwrap().available, i64::MAX - 9);
    }

    #[test]
    fn unknown_wallet_is_not_found() {
        let ledger = funded(10);
        assert!(matches!(
            ledger.reserve("nobody", 1, "s1", "k").unwrap_err(),
            EngineError::WalletNotFound(_)
        ));
    }

    #[test]
    fn storage_failure_applies_nothing_and_key_stays_usable() {
        let store = Arc::new(MemoryStore::<LedgerCommit>::new());
        let ledger = ledger_with(store.clone());
        ledger.credit("alice", 1000, "seed").unwrap();

        store.set_offline(true);
        let err = ledger.reserve("alice", 250, "s1", "start").unwrap_err();
        assert!(err.retryable());
        let w = ledger.wallet("alice").unwrap();
        assert_eq!((w.available, w.held), (1000, 0));
        assert!(ledger.hold("alice", "s1").unwrap().is_none());

        store.set_offline(false);
        let r = ledger.reserve("alice", 250, "s1", "start").unwrap();
        assert!(!r.replayed);
    }

    #[test]
    fn journal_replay_restores_balances_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = ledger_with(Arc::new(JournalStore::<LedgerCommit>::open_at(&path).unwrap()));
            ledger.credit("alice", 1000, "gw-1").unwrap();
            ledger.reserve("alice", 250, "s1", "start").unwrap();
            ledger.capture("alice", "s1", 100, "s1:tick:1").unwrap();
        }

        let ledger = ledger_with(Arc::new(JournalStore::<LedgerCommit>::open_at(&path).unwrap()));
        let w = ledger.wallet("alice").unwrap();
        assert_eq!((w.available, w.held, w.spent), (750, 150, 100));
        assert_eq!(ledger.hold("alice", "s1").unwrap().unwrap().remaining(), 150);
        assert!(ledger.verify("alice").unwrap());

        let again = ledger.capture("alice", "s1", 100, "s1:tick:1").unwrap();
        assert!(again.replayed);
        assert_eq!(ledger.wallet("alice").unwrap().held, 150);
    }

    #[test]
    fn open_wallet_is_idempotent() {
        let ledger = ledger_with(Arc::new(MemoryStore::<LedgerCommit>::new()));
        let first = ledger.open_wallet("carol", "EUR").unwrap();
        ledger.credit("carol", 10, "k").unwrap();
        let second = ledger.open_wallet("carol", "USD").unwrap();
        assert_eq!(second.currency, "EUR");
        assert_eq!(second.available, 10);
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn open_holds_lists_only_unsettled_sessions() {
        let ledger = funded(1000);
        ledger.reserve("alice", 200, "s1", "k1").unwrap();
        ledger.reserve("alice", 300, "s2", "k2").unwrap();
        ledger.release_remaining("alice", "s1").unwrap();

        let open = ledger.open_holds();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].session_id, "s2");
        assert_eq!(open[0].remaining(), 300);
    }
}

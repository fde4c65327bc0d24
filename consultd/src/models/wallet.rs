//! Wallet, hold and ledger entry models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{SessionId, WalletId};
use crate::error::{EngineError, Result};

/// Kind of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Available funds moved into a session hold.
    Reserve,
    /// Held funds converted into spent funds.
    Capture,
    /// Unused held funds returned to available.
    Release,
    /// Funds added to the wallet (recharge).
    Credit,
    /// Spent funds returned to available.
    Refund,
}

impl EntryKind {
    /// Convert kind to string for storage and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reserve => "reserve",
            Self::Capture => "capture",
            Self::Release => "release",
            Self::Credit => "credit",
            Self::Refund => "refund",
        }
    }

    /// Sign applied to the magnitude when the entry is recorded.
    /// Reserve and capture are debits, everything else credits the user.
    pub const fn sign(self) -> i64 {
        match self {
            Self::Reserve | Self::Capture => -1,
            Self::Release | Self::Credit | Self::Refund => 1,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique, time-ordered entry id.
    pub id: String,
    /// Wallet this entry belongs to.
    pub wallet_id: WalletId,
    /// Signed amount in minor currency units.
    pub amount: i64,
    /// What the entry did to the wallet.
    pub kind: EntryKind,
    /// Session the entry is attributed to (absent for credits).
    pub session_id: Option<SessionId>,
    /// Idempotency key supplied by the caller, if any.
    pub idempotency_key: Option<String>,
    /// When the entry was committed.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create a new entry; `magnitude` is the unsigned amount moved.
    pub fn new(
        wallet_id: &str,
        kind: EntryKind,
        magnitude: i64,
        session_id: Option<&str>,
        idempotency_key: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            wallet_id: wallet_id.to_string(),
            amount: kind.sign() * magnitude,
            kind,
            session_id: session_id.map(String::from),
            idempotency_key: idempotency_key.map(String::from),
            created_at,
        }
    }

    /// Unsigned amount moved by this entry.
    pub const fn magnitude(&self) -> i64 {
        self.amount.abs()
    }
}

/// A user's prepaid balance.
///
/// The three buckets are a cache of the wallet's ledger entries folded in
/// order; [`Wallet::fold`] recomputes them from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Owning user id.
    pub id: WalletId,
    /// ISO currency code.
    pub currency: String,
    /// Spendable funds.
    pub available: i64,
    /// Funds reserved for sessions but not yet captured.
    pub held: i64,
    /// Lifetime captured funds, net of refunds.
    pub spent: i64,
    /// When the wallet was opened.
    pub created_at: DateTime<Utc>,
    /// When the last entry was applied.
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Open an empty wallet.
    pub fn new(id: &str, currency: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            currency: currency.to_string(),
            available: 0,
            held: 0,
            spent: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an already validated entry to the cached balances.
    ///
    /// Leaves the wallet untouched when any bucket would overflow.
    pub fn apply(&mut self, entry: &LedgerEntry) -> Result<()> {
        let amount = entry.magnitude();
        let (available, held, spent) = match entry.kind {
            EntryKind::Reserve => (
                self.available.checked_sub(amount),
                self.held.checked_add(amount),
                Some(self.spent),
            ),
            EntryKind::Capture => (
                Some(self.available),
                self.held.checked_sub(amount),
                self.spent.checked_add(amount),
            ),
            EntryKind::Release => (
                self.available.checked_add(amount),
                self.held.checked_sub(amount),
                Some(self.spent),
            ),
            EntryKind::Credit => (self.available.checked_add(amount), Some(self.held), Some(self.spent)),
            EntryKind::Refund => (
                self.available.checked_add(amount),
                Some(self.held),
                self.spent.checked_sub(amount),
            ),
        };
        let (Some(available), Some(held), Some(spent)) = (available, held, spent) else {
            return Err(overflow(entry));
        };
        self.available = available;
        self.held = held;
        self.spent = spent;
        self.updated_at = entry.created_at;
        Ok(())
    }

    /// Rebuild a wallet by folding its entries in commit order.
    pub fn fold<'a>(
        id: &str,
        currency: &str,
        created_at: DateTime<Utc>,
        entries: impl IntoIterator<Item = &'a LedgerEntry>,
    ) -> Result<Self> {
        let mut wallet = Self::new(id, currency, created_at);
        for entry in entries.into_iter().filter(|e| e.wallet_id == id) {
            wallet.apply(entry)?;
        }
        Ok(wallet)
    }

    /// Both buckets are non-negative.
    pub const fn is_consistent(&self) -> bool {
        self.available >= 0 && self.held >= 0 && self.spent >= 0
    }
}

/// Funds reserved for one session in one wallet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub wallet_id: WalletId,
    pub session_id: SessionId,
    pub reserved: i64,
    pub captured: i64,
    pub released: i64,
    pub refunded: i64,
}

impl Hold {
    /// Start tracking a hold for a session.
    pub fn new(wallet_id: &str, session_id: &str) -> Self {
        Self {
            wallet_id: wallet_id.to_string(),
            session_id: session_id.to_string(),
            ..Self::default()
        }
    }

    /// Amount still held, neither captured nor released.
    pub const fn remaining(&self) -> i64 {
        self.reserved - self.captured - self.released
    }

    /// Captured amount that has not been refunded.
    pub const fn refundable(&self) -> i64 {
        self.captured - self.refunded
    }

    /// Whether any funds are still held.
    pub const fn is_open(&self) -> bool {
        self.remaining() > 0
    }

    /// Apply a session-scoped entry to the hold.
    pub fn apply(&mut self, entry: &LedgerEntry) -> Result<()> {
        let bucket = match entry.kind {
            EntryKind::Reserve => &mut self.reserved,
            EntryKind::Capture => &mut self.captured,
            EntryKind::Release => &mut self.released,
            EntryKind::Refund => &mut self.refunded,
            EntryKind::Credit => return Ok(()),
        };
        *bucket = bucket.checked_add(entry.magnitude()).ok_or_else(|| overflow(entry))?;
        Ok(())
    }
}

fn overflow(entry: &LedgerEntry) -> EngineError {
    EngineError::InvalidAmount(format!(
        "{} of {} overflows wallet {}",
        entry.kind,
        entry.magnitude(),
        entry.wallet_id
    ))
}

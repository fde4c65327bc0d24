//! Ledger commit records and operation receipts.

use serde::{Deserialize, Serialize};

use crate::models::{EntryKind, Hold, LedgerEntry, Wallet};

/// Parameters an idempotency key was first used with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub wallet_id: String,
    pub session_id: Option<String>,
    pub amount: i64,
}

/// Journal record for one atomic ledger mutation.
///
/// `Apply` carries the entry together with the wallet and hold as they stand
/// after it, so balance and log can never diverge on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerCommit {
    Open {
        wallet: Wallet,
    },
    Apply {
        entry: LedgerEntry,
        wallet: Wallet,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hold: Option<Hold>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<Fingerprint>,
    },
}

/// Result of an applied (or replayed) ledger operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub entry: LedgerEntry,
    /// Wallet as of this entry.
    pub wallet: Wallet,
    /// Session hold as of this entry, for session-scoped operations.
    pub hold: Option<Hold>,
    /// True when an earlier commit with the same idempotency key was
    /// returned instead of applying again.
    pub replayed: bool,
}

/// What the idempotency table remembers per key.
#[derive(Debug, Clone)]
pub(super) struct Committed {
    pub fingerprint: Fingerprint,
    pub entry: LedgerEntry,
    pub wallet: Wallet,
    pub hold: Option<Hold>,
}

impl Committed {
    pub fn receipt(self) -> Receipt {
        Receipt {
            entry: self.entry,
            wallet: self.wallet,
            hold: self.hold,
            replayed: true,
        }
    }
}

pub(super) type IdemKey = (EntryKind, String);

//! Data models for wallets, ledger entries, sessions and relayed events.

mod event;
mod session;
mod wallet;

pub use event::{Envelope, RelayEvent};
pub use session::{Channel, EndReason, PriceModel, Role, Session, SessionState, StartKey};
pub use wallet::{EntryKind, Hold, LedgerEntry, Wallet};

/// Wallet identity: the owning user's id.
pub type WalletId = String;

/// Session identifier (UUIDv7 string).
pub type SessionId = String;

/// Authenticated participant identity as handed over by the transport.
pub type ParticipantId = String;

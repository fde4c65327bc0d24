//! Durable storage for ledger commits and session snapshots.
//!
//! Records are appended to a journal and replayed on startup. One append is
//! one atomic unit: a record is either fully durable or absent.

mod journal;
mod memory;

use thiserror::Error;

pub use journal::JournalStore;
pub use memory::MemoryStore;

/// Errors raised by a store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt journal record at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("{0}")]
    Unavailable(String),
}

/// Append-only record store.
pub trait Store<R>: Send + Sync {
    /// Durably append one record.
    fn append(&self, record: &R) -> Result<(), StoreError>;

    /// Read back every record in append order.
    fn replay(&self) -> Result<Vec<R>, StoreError>;
}

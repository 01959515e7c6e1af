//! Storage Trait Definitions
//!
//! One store holds both accounts and their ledger entries so that a
//! balance mutation and its ledger entry can be committed as a single
//! atomic unit. A balance change with no corresponding entry is a
//! data-integrity violation.
//!
//! Implementations:
//! - `MemoryLedgerStore` - in-memory, for tests and development
//! - `SqliteLedgerStore` - SQLite with connection pooling, for production

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{Account, DepositKey, EntryStatus, LedgerEntry};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check lost. A normal, expected outcome:
    /// another operation mutated the row between load and commit.
    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Account and ledger storage.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Register a new account.
    async fn insert_account(&self, account: &Account) -> StorageResult<()>;

    /// Load an account by id.
    async fn account(&self, id: &str) -> StorageResult<Option<Account>>;

    /// Load an account by its owner's national identifier.
    async fn account_by_national_id(&self, national_id: &str) -> StorageResult<Option<Account>>;

    /// Atomically apply `delta` to the account balance and append `entry`,
    /// guarded by the account's version: if the stored version differs
    /// from `expected_version` nothing happens and `Conflict` is returned.
    async fn apply(
        &self,
        account_id: &str,
        expected_version: u64,
        delta: Decimal,
        entry: &LedgerEntry,
    ) -> StorageResult<()>;

    /// Append an entry without touching any balance. Used for rejected
    /// attempts, which are always recorded for audit.
    async fn record(&self, entry: &LedgerEntry) -> StorageResult<()>;

    /// Transition a pending entry to a terminal status, optionally
    /// attaching the counterparty transaction id. Entries already
    /// terminal are immutable; attempting to touch one is a `Conflict`.
    async fn set_entry_status(
        &self,
        entry_id: &str,
        status: EntryStatus,
        txid: Option<&str>,
    ) -> StorageResult<()>;

    /// All entries of an account, oldest first.
    async fn entries(&self, account_id: &str) -> StorageResult<Vec<LedgerEntry>>;

    /// All entries with the given status, across accounts. `Failed` is the
    /// operator's manual-reconciliation queue.
    async fn entries_with_status(&self, status: EntryStatus) -> StorageResult<Vec<LedgerEntry>>;

    /// Whether a deposit matching the natural key has already been
    /// recorded.
    async fn deposit_exists(&self, key: &DepositKey) -> StorageResult<bool>;
}

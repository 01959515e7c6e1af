//! Persistence Layer
//!
//! Account and ledger storage behind one trait, with an in-memory
//! implementation for tests and an SQLite implementation for production.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryLedgerStore;
pub use sqlite::SqliteLedgerStore;
pub use traits::{LedgerStore, StorageError, StorageResult};

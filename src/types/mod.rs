//! Core Domain Types
//!
//! Accounts, ledger entries, and bank statement records shared by the
//! settlement engine and the reconciliation loop.

pub mod account;
pub mod bank;
pub mod ledger;

pub use account::Account;
pub use bank::{BankTransaction, DepositKey, CHANNEL_INCOMING_TRANSFER};
pub use ledger::{EntryKind, EntryStatus, LedgerEntry, LedgerError};

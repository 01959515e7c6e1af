//! Ledger Entry Types
//!
//! A [`LedgerEntry`] is the immutable-once-terminal record of an external
//! fiat deposit or an internal market operation. Entries are created once
//! per operation attempt, never deleted, and transition exactly once from
//! `Pending` to a terminal status (or are created already terminal).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bank::{BankTransaction, DepositKey};

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: EntryStatus, to: EntryStatus },
}

/// What kind of operation an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// External fiat deposit credited by reconciliation
    Deposit,
    /// Fiat debited, bitcoin paid out
    Buy,
    /// Bitcoin sold back for fiat
    Sell,
    /// Fiat paid back to the owner's bank account
    Withdrawal,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deposit => "deposit",
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Withdrawal => "withdrawal",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            "withdrawal" => Ok(Self::Withdrawal),
            _ => Err(format!("unknown entry kind: {}", s)),
        }
    }
}

/// Status of a ledger entry.
///
/// `Completed`, `Rejected` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Funds committed, outcome not yet known
    Pending,
    /// Operation finished, counterparty transaction recorded
    Completed,
    /// Business rule rejected the operation before any funds moved
    Rejected,
    /// Payout failed after the debit was committed; needs operator review
    Failed,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown entry status: {}", s)),
        }
    }
}

/// One ledger entry.
///
/// Sign convention: `amount` and `fee` are positive for credits and
/// negative for debits relative to the account's fiat balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry id
    pub id: String,
    /// Owning account
    pub account_id: String,
    /// When the operation was attempted (or booked, for deposits)
    pub time: DateTime<Utc>,
    pub kind: EntryKind,
    /// Fiat amount, signed
    pub amount: Decimal,
    /// Market rate used, if a conversion occurred
    pub rate: Option<Decimal>,
    /// Fee charged, signed
    pub fee: Decimal,
    /// Bitcoin paid out, in BTC truncated to 8 decimals
    pub coins: Option<Decimal>,
    /// Counterparty transaction id: bitcoin txid or bank reference
    pub txid: Option<String>,
    /// Bank statement reference (deposits only)
    pub reference: Option<String>,
    /// Bank short reference / slip number (deposits only)
    pub short_reference: Option<String>,
    /// Bank payment detail (deposits only)
    pub payment_detail: Option<String>,
    pub status: EntryStatus,
}

impl LedgerEntry {
    fn blank(account_id: &str, kind: EntryKind, amount: Decimal) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            time: Utc::now(),
            kind,
            amount,
            rate: None,
            fee: Decimal::ZERO,
            coins: None,
            txid: None,
            reference: None,
            short_reference: None,
            payment_detail: None,
            status: EntryStatus::Pending,
        }
    }

    /// New buy order debiting `amount` of fiat.
    pub fn buy(account_id: &str, amount: Decimal) -> Self {
        Self::blank(account_id, EntryKind::Buy, -amount)
    }

    /// New fiat withdrawal debiting `amount`.
    pub fn withdrawal(account_id: &str, amount: Decimal) -> Self {
        Self::blank(account_id, EntryKind::Withdrawal, -amount)
    }

    /// New deposit credited from a matched bank transaction.
    ///
    /// Deposits are created already terminal: by the time the entry exists
    /// the bank has settled the transfer.
    pub fn deposit(account_id: &str, tx: &BankTransaction) -> Self {
        let mut entry = Self::blank(account_id, EntryKind::Deposit, tx.amount);
        entry.time = tx.booked_at;
        entry.reference = Some(tx.reference.clone());
        entry.short_reference = Some(tx.short_reference.clone());
        entry.payment_detail = Some(tx.payment_detail.clone());
        entry.status = EntryStatus::Completed;
        entry
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`. Only `Pending -> terminal` is legal.
    pub fn transition(&mut self, next: EntryStatus) -> Result<(), LedgerError> {
        if self.status.is_terminal() || !next.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark completed with the counterparty transaction id.
    pub fn mark_completed(&mut self, txid: String) -> Result<(), LedgerError> {
        self.txid = Some(txid);
        self.transition(EntryStatus::Completed)
    }

    /// Mark rejected (business rule, nothing charged).
    pub fn mark_rejected(&mut self) -> Result<(), LedgerError> {
        self.transition(EntryStatus::Rejected)
    }

    /// Mark failed (debit already committed, payout did not happen).
    pub fn mark_failed(&mut self) -> Result<(), LedgerError> {
        self.transition(EntryStatus::Failed)
    }

    /// Whether this entry records the deposit identified by `key`.
    pub fn matches_deposit(&self, key: &DepositKey) -> bool {
        self.kind == EntryKind::Deposit
            && self.account_id == key.account_id
            && self.time == key.booked_at
            && self.reference.as_deref() == Some(key.reference.as_str())
            && self.short_reference.as_deref() == Some(key.short_reference.as_str())
            && self.payment_detail.as_deref() == Some(key.payment_detail.as_str())
            && self.amount == key.amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_buy_entry_is_a_debit() {
        let entry = LedgerEntry::buy("acct1", dec!(1000));
        assert_eq!(entry.kind, EntryKind::Buy);
        assert_eq!(entry.amount, dec!(-1000));
        assert_eq!(entry.status, EntryStatus::Pending);
    }

    #[test]
    fn test_deposit_entry_created_terminal() {
        let tx = BankTransaction {
            payer_id: "1234567890".to_string(),
            booked_at: Utc::now(),
            channel: "01".to_string(),
            reference: "ref".to_string(),
            short_reference: "1".to_string(),
            payment_detail: "d".to_string(),
            amount: dec!(500),
        };
        let entry = LedgerEntry::deposit("acct1", &tx);
        assert_eq!(entry.amount, dec!(500));
        assert_eq!(entry.status, EntryStatus::Completed);
        assert!(entry.matches_deposit(&tx.deposit_key("acct1")));
        assert!(!entry.matches_deposit(&tx.deposit_key("acct2")));
    }

    #[test]
    fn test_status_transitions_exactly_once() {
        let mut entry = LedgerEntry::buy("acct1", dec!(100));
        entry.mark_completed("txid".to_string()).unwrap();
        assert_eq!(entry.status, EntryStatus::Completed);

        // Terminal entries are immutable
        assert!(entry.mark_failed().is_err());
        assert!(entry.transition(EntryStatus::Pending).is_err());
    }

    #[test]
    fn test_pending_to_pending_is_invalid() {
        let mut entry = LedgerEntry::buy("acct1", dec!(100));
        assert!(entry.transition(EntryStatus::Pending).is_err());
        assert_eq!(entry.status, EntryStatus::Pending);
    }

    #[test]
    fn test_kind_and_status_round_trip_strings() {
        for kind in [
            EntryKind::Deposit,
            EntryKind::Buy,
            EntryKind::Sell,
            EntryKind::Withdrawal,
        ] {
            assert_eq!(kind.to_string().parse::<EntryKind>().unwrap(), kind);
        }
        for status in [
            EntryStatus::Pending,
            EntryStatus::Completed,
            EntryStatus::Rejected,
            EntryStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<EntryStatus>().unwrap(), status);
        }
    }
}

//! Account Types
//!
//! An account is the unit of custody: it holds a fiat balance, a wallet
//! derivation index assigned once at registration, and the owner-settable
//! payout destinations. The balance is only ever mutated through the
//! store's versioned `apply` so that every change carries a ledger entry.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A customer account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Stable account identifier
    pub id: String,
    /// National identifier of the owner, used to match incoming bank
    /// transfers to this account
    pub national_id: String,
    /// Fiat balance in minor units. Never negative.
    pub balance: Decimal,
    /// Wallet derivation index. Unique, assigned once, immutable.
    pub derivation: u32,
    /// External bitcoin address for withdrawals, settable by the owner
    pub withdrawal_address: Option<String>,
    /// Bank account number for fiat withdrawals, settable by the owner
    pub bank_account_number: Option<String>,
    /// Trading fee in percent (0.5 == 0.5%)
    pub fee_percent: Decimal,
    /// Row version for optimistic concurrency. Bumped by the store on
    /// every balance mutation.
    pub version: u64,
    /// Timestamp of registration
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with a zero balance.
    pub fn new(id: impl Into<String>, national_id: impl Into<String>, derivation: u32) -> Self {
        Self {
            id: id.into(),
            national_id: national_id.into(),
            balance: Decimal::ZERO,
            derivation,
            withdrawal_address: None,
            bank_account_number: None,
            fee_percent: Decimal::new(5, 1), // 0.5%
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// Trading fee for an order of `amount`, rounded to the fiat minor unit.
    pub fn fee_for(&self, amount: Decimal) -> Decimal {
        (amount * self.fee_percent / Decimal::ONE_HUNDRED).round_dp(2)
    }

    /// Whether the balance covers `amount`.
    pub fn covers(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }
}

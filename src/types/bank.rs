//! Bank Statement Types
//!
//! Records pulled from the banking collaborator. The bank supplies no
//! globally unique transaction id, so deduplication works on the composite
//! natural key captured by [`DepositKey`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Payment channel code for an ordinary incoming transfer. Other channel
/// codes (card batches, internal postings) are never reconciled.
pub const CHANNEL_INCOMING_TRANSFER: &str = "01";

/// One settled transaction from today's bank statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    /// National identifier of the payer
    pub payer_id: String,
    /// Booking timestamp at the bank
    pub booked_at: DateTime<Utc>,
    /// Payment channel code, see [`CHANNEL_INCOMING_TRANSFER`]
    pub channel: String,
    /// Statement reference
    pub reference: String,
    /// Short reference / slip number
    pub short_reference: String,
    /// Free-form payment detail entered by the payer
    pub payment_detail: String,
    /// Amount in fiat minor units
    pub amount: Decimal,
}

impl BankTransaction {
    /// Whether this record came in over the ordinary transfer channel.
    pub fn is_incoming_transfer(&self) -> bool {
        self.channel == CHANNEL_INCOMING_TRANSFER
    }

    /// Natural key of this record once matched to `account_id`.
    pub fn deposit_key(&self, account_id: &str) -> DepositKey {
        DepositKey {
            account_id: account_id.to_string(),
            booked_at: self.booked_at,
            reference: self.reference.clone(),
            short_reference: self.short_reference.clone(),
            payment_detail: self.payment_detail.clone(),
            amount: self.amount,
        }
    }
}

/// Composite natural key identifying a bank deposit.
///
/// The bank may return the same transaction on several consecutive polls;
/// a ledger entry matching every field of this key means the deposit has
/// already been credited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositKey {
    pub account_id: String,
    pub booked_at: DateTime<Utc>,
    pub reference: String,
    pub short_reference: String,
    pub payment_detail: String,
    pub amount: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> BankTransaction {
        BankTransaction {
            payer_id: "1234567890".to_string(),
            booked_at: Utc::now(),
            channel: CHANNEL_INCOMING_TRANSFER.to_string(),
            reference: "ref-1".to_string(),
            short_reference: "77".to_string(),
            payment_detail: "deposit".to_string(),
            amount: dec!(2500),
        }
    }

    #[test]
    fn test_channel_filter() {
        let mut tx = sample();
        assert!(tx.is_incoming_transfer());

        tx.channel = "03".to_string(); // card batch
        assert!(!tx.is_incoming_transfer());
    }

    #[test]
    fn test_deposit_key_carries_all_fields() {
        let tx = sample();
        let key = tx.deposit_key("acct1");
        assert_eq!(key.account_id, "acct1");
        assert_eq!(key.booked_at, tx.booked_at);
        assert_eq!(key.reference, tx.reference);
        assert_eq!(key.short_reference, tx.short_reference);
        assert_eq!(key.payment_detail, tx.payment_detail);
        assert_eq!(key.amount, tx.amount);
    }
}

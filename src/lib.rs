//! fiatramp - Custodial Ledger & Settlement Engine
//!
//! Backend of a fiat-to-bitcoin exchange. Customers deposit fiat by bank
//! transfer, buy bitcoin at the live market rate, and withdraw bitcoin to
//! an external address or fiat back to their bank account.
//!
//! ## Services
//!
//! 1. **Reconciliation** - Polls the bank statement and credits matched
//!    deposits to customer fiat balances, idempotently.
//! 2. **Settlement** - Executes buy orders: debits the fiat balance under
//!    optimistic concurrency and pays out bitcoin from the house hot
//!    wallet to the customer's deterministic receiving address.
//! 3. **Market data** - Keeps a cached rate and an open/closed market
//!    flag refreshed from the upstream exchange ticker.
//!
//! Balances only ever move together with a ledger entry in one atomic
//! unit; a balance change without a record is a data-integrity violation.

pub mod bank_gateway;
pub mod config;
pub mod logging;
pub mod node;
pub mod rates;
pub mod reconciliation;
pub mod settlement;
pub mod storage;
pub mod types;
pub mod wallet;

// Re-exports: Core types
pub use types::{
    Account, BankTransaction, DepositKey, EntryKind, EntryStatus, LedgerEntry, LedgerError,
    CHANNEL_INCOMING_TRANSFER,
};

// Re-exports: Wallet
pub use wallet::{
    DerivationError, DerivedKey, FeeUrgency, KeyVault, PaymentBuilder, PaymentError,
    SignedPayment, UnspentCoin, HOUSE_ACCOUNT_INDEX,
};

// Re-exports: Node access
pub use node::{EsploraNode, NodeError, UtxoSource};

// Re-exports: Rates
pub use rates::{MarketData, MarketState, Quote, RateError, RateSource, Ticker};

// Re-exports: Bank gateway
pub use bank_gateway::{BankError, BankGateway, HttpBankGateway};

// Re-exports: Storage
pub use storage::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore, StorageError};

// Re-exports: Engines
pub use reconciliation::{CycleReport, ReconciliationError, ReconciliationLoop};
pub use settlement::{SettlementConfig, SettlementEngine, SettlementError};

/// Decimal and satoshi conversion helpers
pub mod units {
    use rust_decimal::prelude::ToPrimitive;
    use rust_decimal::{Decimal, RoundingStrategy};

    pub const SATS_PER_BTC: u64 = 100_000_000;

    /// Truncate toward zero to 8 fractional digits. Never rounds up: the
    /// exchange must not pay out more bitcoin than the fiat covers.
    pub fn truncate8(btc: Decimal) -> Decimal {
        btc.round_dp_with_strategy(8, RoundingStrategy::ToZero)
    }

    /// Convert a BTC amount with at most 8 fractional digits to satoshis.
    /// Returns `None` for negative amounts, amounts with sub-satoshi
    /// precision, or amounts too large for `u64`.
    pub fn btc_to_sats(btc: Decimal) -> Option<u64> {
        if btc < Decimal::ZERO {
            return None;
        }
        let sats = btc.checked_mul(Decimal::from(SATS_PER_BTC))?;
        if sats.normalize().scale() != 0 {
            return None;
        }
        sats.to_u64()
    }

    pub fn sats_to_btc(sats: u64) -> Decimal {
        Decimal::from(sats) / Decimal::from(SATS_PER_BTC)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use rust_decimal_macros::dec;

        #[test]
        fn test_truncate8_never_rounds_up() {
            assert_eq!(truncate8(dec!(0.123456789)), dec!(0.12345678));
            assert_eq!(truncate8(dec!(0.999999999)), dec!(0.99999999));
            assert_eq!(truncate8(dec!(0.1)), dec!(0.1));
        }

        #[test]
        fn test_btc_to_sats_is_exact() {
            assert_eq!(btc_to_sats(dec!(0.00019900)), Some(19_900));
            assert_eq!(btc_to_sats(dec!(1)), Some(100_000_000));
            assert_eq!(btc_to_sats(dec!(0.000000001)), None); // sub-satoshi
            assert_eq!(btc_to_sats(dec!(-0.5)), None);
        }

        #[test]
        fn test_sats_round_trip() {
            assert_eq!(sats_to_btc(19_900), dec!(0.000199));
            assert_eq!(btc_to_sats(sats_to_btc(123_456_789)), Some(123_456_789));
        }
    }
}

//! Settlement Engine
//!
//! Executes customer orders against the live market rate and pays out the
//! bought bitcoin from the house hot wallet, and pays fiat withdrawals out
//! through the bank gateway.
//!
//! Order execution is a small state machine. Everything that can go wrong
//! before the balance debit commits (closed market, zero rate, insufficient
//! balance, unfunded hot wallet, unreachable upstream) ends in a `Rejected`
//! ledger entry with no balance change; the attempt is still recorded for
//! audit. The debit itself is an optimistic compare-and-swap on the account
//! version, committed together with a `Pending` entry. Anything that fails
//! after that commit point (the broadcast) ends in a `Failed` entry with
//! the debit retained, left for an operator to reconcile by hand. The
//! caller always gets a terminal record or an error, never an account in an
//! ambiguous state.
//!
//! The hot wallet's coin set is shared mutable state beyond what row
//! versioning covers: two concurrent payouts could list and spend the same
//! coin. `house_lock` serializes list, build and broadcast.

use bitcoin::{Address, Amount};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::bank_gateway::BankGateway;
use crate::node::UtxoSource;
use crate::rates::RateSource;
use crate::storage::{LedgerStore, StorageError};
use crate::types::{Account, EntryStatus, LedgerEntry, LedgerError};
use crate::units::{btc_to_sats, truncate8};
use crate::wallet::{FeeUrgency, KeyVault, PaymentBuilder};

/// Settlement errors
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// Another operation moved the account between load and commit. The
    /// order had no effect; the caller must re-read before retrying.
    #[error("concurrent update on account {0}, order aborted")]
    ConcurrencyConflict(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("key derivation failed: {0}")]
    Derivation(#[from] crate::wallet::DerivationError),

    #[error("ledger state error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Static settlement parameters.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Ticker pair orders execute against
    pub pair: String,
    /// Smallest accepted fiat order. Applies to orders only, never to
    /// incoming deposits.
    pub min_order: Decimal,
    /// Confirmations a hot-wallet coin needs before it is spendable
    pub min_confirmations: u32,
}

/// Executes orders and withdrawals against the ledger, the market, the
/// hot wallet, and the bank.
pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    rates: Arc<dyn RateSource>,
    node: Arc<dyn UtxoSource>,
    bank: Arc<dyn BankGateway>,
    vault: Arc<KeyVault>,
    builder: PaymentBuilder,
    house_lock: Mutex<()>,
    config: SettlementConfig,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        rates: Arc<dyn RateSource>,
        node: Arc<dyn UtxoSource>,
        bank: Arc<dyn BankGateway>,
        vault: Arc<KeyVault>,
        config: SettlementConfig,
    ) -> Self {
        let builder = PaymentBuilder::new(vault.network());
        Self {
            store,
            rates,
            node,
            bank,
            vault,
            builder,
            house_lock: Mutex::new(()),
            config,
        }
    }

    /// The account's own deterministic receiving address.
    pub fn deposit_address(&self, account: &Account) -> Result<Address, SettlementError> {
        Ok(self.vault.derive_receiving_key(account.derivation)?.address)
    }

    /// Entries awaiting manual reconciliation after a post-debit failure.
    pub async fn failed_payouts(&self) -> Result<Vec<LedgerEntry>, SettlementError> {
        Ok(self.store.entries_with_status(EntryStatus::Failed).await?)
    }

    /// Execute a buy order of `amount` fiat for `account_id`.
    ///
    /// Returns the terminal ledger entry: `Completed` with the payout txid,
    /// `Rejected` if a business rule stopped the order before any funds
    /// moved, or `Failed` if the broadcast failed after the debit committed.
    pub async fn execute_order(
        &self,
        account_id: &str,
        amount: Decimal,
    ) -> Result<LedgerEntry, SettlementError> {
        let account = self
            .store
            .account(account_id)
            .await?
            .ok_or_else(|| SettlementError::AccountNotFound(account_id.to_string()))?;

        let mut entry = LedgerEntry::buy(account_id, amount);

        if amount < self.config.min_order {
            return self.reject(entry, "below minimum order amount").await;
        }

        let fee = account.fee_for(amount);
        entry.fee = -fee;

        let quote = match self.rates.current_rate(&self.config.pair).await {
            Ok(quote) => quote,
            Err(e) => {
                warn!(account_id, "rate fetch failed: {}", e);
                return self.reject(entry, "rate unavailable").await;
            }
        };
        // A zero rate is a sentinel for "no valid quote", never a price.
        if !quote.market_open || quote.rate == Decimal::ZERO {
            return self.reject(entry, "market closed").await;
        }
        entry.rate = Some(quote.rate);

        let coins = truncate8((amount - fee) / quote.rate);
        entry.coins = Some(coins);
        let Some(payout_sats) = btc_to_sats(coins) else {
            return self.reject(entry, "amount not representable in satoshis").await;
        };
        if payout_sats == 0 {
            return self.reject(entry, "order too small to pay out").await;
        }

        if !account.covers(amount) {
            return self.reject(entry, "insufficient balance").await;
        }

        let receiver = self.vault.derive_receiving_key(account.derivation)?.address;
        let house = self.vault.house_key()?;

        // Hot-wallet critical section: list, build, broadcast.
        let _house = self.house_lock.lock().await;

        let spendable = match self
            .node
            .list_unspent(&house.address, self.config.min_confirmations)
            .await
        {
            Ok(spendable) => spendable,
            Err(e) => {
                warn!(account_id, "coin listing failed: {}", e);
                return self.reject(entry, "hot wallet unavailable").await;
            }
        };
        let fee_rate = match self
            .node
            .estimate_fee_rate(FeeUrgency::Routine.target_blocks())
            .await
        {
            Ok(rate) => rate,
            Err(e) => {
                warn!(account_id, "fee estimate failed: {}", e);
                return self.reject(entry, "fee estimate unavailable").await;
            }
        };

        // Affordability pre-check. Build and validate the full payout
        // before touching the balance; a hot wallet that cannot fund the
        // payment must never cost the customer a debit.
        let payment = match self.builder.build_payment(
            &house,
            &spendable,
            &receiver,
            Amount::from_sat(payout_sats),
            fee_rate,
        ) {
            Ok(payment) => payment,
            Err(e) => {
                warn!(account_id, payout_sats, "hot wallet cannot fund payout: {}", e);
                return self.reject(entry, "hot wallet cannot fund payout").await;
            }
        };

        // Commit point. Debit and entry persist in one atomic unit; after
        // this the order can only end Completed or Failed.
        match self
            .store
            .apply(&account.id, account.version, -amount, &entry)
            .await
        {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => {
                return Err(SettlementError::ConcurrencyConflict(account.id));
            }
            Err(StorageError::NotFound(_)) => {
                return Err(SettlementError::AccountNotFound(account.id));
            }
            Err(e) => return Err(e.into()),
        }

        match self.node.broadcast(&payment.tx).await {
            Ok(txid) => {
                let txid = txid.to_string();
                self.store
                    .set_entry_status(&entry.id, EntryStatus::Completed, Some(&txid))
                    .await?;
                entry.mark_completed(txid)?;
                info!(
                    account_id,
                    entry_id = %entry.id,
                    rate = %quote.rate,
                    coins = %coins,
                    txid = entry.txid.as_deref().unwrap_or_default(),
                    "order completed"
                );
            }
            Err(e) => {
                // Debit stays in place. No auto-refund: a refund could race
                // a delayed-but-eventually-successful broadcast.
                error!(
                    account_id,
                    entry_id = %entry.id,
                    "payout broadcast failed after debit, entry needs manual reconciliation: {}",
                    e
                );
                self.store
                    .set_entry_status(&entry.id, EntryStatus::Failed, None)
                    .await?;
                entry.mark_failed()?;
            }
        }

        Ok(entry)
    }

    /// Pay `amount` fiat back to the account's registered bank account.
    ///
    /// Same commit discipline as orders: the debit is versioned and atomic
    /// with the entry, and a bank failure after the commit leaves a
    /// `Failed` entry with the debit retained.
    pub async fn withdraw_fiat(
        &self,
        account_id: &str,
        amount: Decimal,
    ) -> Result<LedgerEntry, SettlementError> {
        let account = self
            .store
            .account(account_id)
            .await?
            .ok_or_else(|| SettlementError::AccountNotFound(account_id.to_string()))?;

        let mut entry = LedgerEntry::withdrawal(account_id, amount);

        let Some(bank_account) = account.bank_account_number.clone() else {
            return self.reject(entry, "no bank account registered").await;
        };
        if amount <= Decimal::ZERO {
            return self.reject(entry, "non-positive amount").await;
        }
        if !account.covers(amount) {
            return self.reject(entry, "insufficient balance").await;
        }

        match self
            .store
            .apply(&account.id, account.version, -amount, &entry)
            .await
        {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => {
                return Err(SettlementError::ConcurrencyConflict(account.id));
            }
            Err(StorageError::NotFound(_)) => {
                return Err(SettlementError::AccountNotFound(account.id));
            }
            Err(e) => return Err(e.into()),
        }

        match self.bank.pay(&bank_account, amount, &entry.id).await {
            Ok(reference) => {
                self.store
                    .set_entry_status(&entry.id, EntryStatus::Completed, Some(&reference))
                    .await?;
                entry.mark_completed(reference)?;
                info!(account_id, entry_id = %entry.id, %amount, "withdrawal completed");
            }
            Err(e) => {
                error!(
                    account_id,
                    entry_id = %entry.id,
                    "bank payment failed after debit, entry needs manual reconciliation: {}",
                    e
                );
                self.store
                    .set_entry_status(&entry.id, EntryStatus::Failed, None)
                    .await?;
                entry.mark_failed()?;
            }
        }

        Ok(entry)
    }

    /// Record a rejected attempt. No balance change has happened and none
    /// will; the entry exists purely as an audit trail.
    async fn reject(
        &self,
        mut entry: LedgerEntry,
        reason: &str,
    ) -> Result<LedgerEntry, SettlementError> {
        warn!(account_id = %entry.account_id, kind = %entry.kind, reason, "rejected");
        entry.mark_rejected()?;
        self.store.record(&entry).await?;
        Ok(entry)
    }
}

//! Bank Statement Reconciliation
//!
//! Polls the bank for today's settled transactions (the bank exposes no
//! event feed) and credits matched deposits to customer accounts. The
//! bank returns the same transaction on several consecutive polls and
//! supplies no unique id, so every credit is gated on the composite
//! natural key: repeated cycles over overlapping data produce exactly one
//! `Deposit` entry per distinct transaction.
//!
//! Matching and crediting for one transaction happens in one persistence
//! unit. A version conflict on the account (an order settling at the same
//! moment) is re-read and retried a few times; a transaction still
//! contended after that is left for the next poll, which will pick it up
//! again because no dedup entry was written.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::bank_gateway::{BankError, BankGateway};
use crate::storage::{LedgerStore, StorageError};
use crate::types::{BankTransaction, LedgerEntry};

/// Attempts per transaction before deferring it to the next poll.
const CREDIT_RETRIES: usize = 3;

/// Reconciliation errors
#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error(transparent)]
    Bank(#[from] BankError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What one cycle did, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Transactions the bank returned
    pub fetched: usize,
    /// Deposits credited this cycle
    pub credited: usize,
    /// Already on the ledger under the same natural key
    pub duplicates: usize,
    /// Wrong payment channel, never reconciled
    pub wrong_channel: usize,
    /// Payer matched no known account
    pub unknown_payer: usize,
    /// Lost the account version race repeatedly; retried next cycle
    pub deferred: usize,
}

enum CreditOutcome {
    Credited,
    Duplicate,
    UnknownPayer,
    Contended,
}

/// Periodic statement poller crediting customer deposits.
pub struct ReconciliationLoop {
    store: Arc<dyn LedgerStore>,
    bank: Arc<dyn BankGateway>,
    poll_interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl ReconciliationLoop {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        bank: Arc<dyn BankGateway>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            bank,
            poll_interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Fetch today's statement and credit every new matched deposit.
    pub async fn run_cycle(&self) -> Result<CycleReport, ReconciliationError> {
        let mut report = CycleReport::default();

        let Some(transactions) = self.bank.fetch_todays_transactions().await? else {
            // The bank had no statement data to give. Not an error and not
            // the same as an empty statement.
            info!("no statement data from bank");
            return Ok(report);
        };
        report.fetched = transactions.len();

        for tx in &transactions {
            // Only ordinary incoming transfers are ever credited. Card
            // batches and internal postings share the statement feed; this
            // filter must not be removed.
            if !tx.is_incoming_transfer() {
                report.wrong_channel += 1;
                continue;
            }

            match self.credit(tx).await {
                Ok(CreditOutcome::Credited) => report.credited += 1,
                Ok(CreditOutcome::Duplicate) => report.duplicates += 1,
                Ok(CreditOutcome::UnknownPayer) => {
                    warn!(
                        payer_id = %tx.payer_id,
                        amount = %tx.amount,
                        "deposit from unknown payer, needs manual follow-up"
                    );
                    report.unknown_payer += 1;
                }
                Ok(CreditOutcome::Contended) => {
                    debug!(payer_id = %tx.payer_id, "deposit contended, deferring to next poll");
                    report.deferred += 1;
                }
                Err(e) => {
                    // Skip this transaction; the missing dedup entry means
                    // the next cycle retries it.
                    error!(payer_id = %tx.payer_id, "crediting deposit failed: {}", e);
                    report.deferred += 1;
                }
            }
        }

        if report.credited > 0 {
            info!(
                credited = report.credited,
                duplicates = report.duplicates,
                "reconciliation cycle credited deposits"
            );
        }
        Ok(report)
    }

    /// Credit one transaction, retrying lost version races.
    async fn credit(&self, tx: &BankTransaction) -> Result<CreditOutcome, ReconciliationError> {
        for _ in 0..CREDIT_RETRIES {
            let Some(account) = self.store.account_by_national_id(&tx.payer_id).await? else {
                return Ok(CreditOutcome::UnknownPayer);
            };

            let key = tx.deposit_key(&account.id);
            if self.store.deposit_exists(&key).await? {
                return Ok(CreditOutcome::Duplicate);
            }

            let entry = LedgerEntry::deposit(&account.id, tx);
            match self
                .store
                .apply(&account.id, account.version, tx.amount, &entry)
                .await
            {
                Ok(()) => {
                    debug!(
                        account_id = %account.id,
                        amount = %tx.amount,
                        reference = %tx.reference,
                        "deposit credited"
                    );
                    return Ok(CreditOutcome::Credited);
                }
                // Re-read the account and try again.
                Err(StorageError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(CreditOutcome::Contended)
    }

    /// Run the poll loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }

        info!(
            interval_secs = self.poll_interval.as_secs(),
            "reconciliation service started"
        );

        loop {
            {
                let running = self.running.read().await;
                if !*running {
                    break;
                }
            }

            if let Err(e) = self.run_cycle().await {
                warn!("reconciliation cycle failed: {}", e);
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        info!("reconciliation service stopped");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }
}

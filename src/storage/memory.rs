//! In-Memory Storage Implementation
//!
//! Thread-safe store for tests and development. A single lock over all
//! state makes `apply` trivially atomic. Data is lost on restart.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{LedgerStore, StorageError, StorageResult};
use crate::types::{Account, DepositKey, EntryStatus, LedgerEntry};

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    /// Index: national id -> account id
    by_national_id: HashMap<String, String>,
    entries: HashMap<String, LedgerEntry>,
}

/// In-memory account and ledger store.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_account(&self, account: &Account) -> StorageResult<()> {
        let mut inner = self.inner.write().await;

        if inner.accounts.contains_key(&account.id) {
            return Err(StorageError::Duplicate(format!("account {}", account.id)));
        }
        if inner.by_national_id.contains_key(&account.national_id) {
            return Err(StorageError::Duplicate(format!(
                "national id {}",
                account.national_id
            )));
        }

        inner
            .by_national_id
            .insert(account.national_id.clone(), account.id.clone());
        inner.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn account(&self, id: &str) -> StorageResult<Option<Account>> {
        let inner = self.inner.read().await;
        Ok(inner.accounts.get(id).cloned())
    }

    async fn account_by_national_id(&self, national_id: &str) -> StorageResult<Option<Account>> {
        let inner = self.inner.read().await;
        let Some(id) = inner.by_national_id.get(national_id) else {
            return Ok(None);
        };
        Ok(inner.accounts.get(id).cloned())
    }

    async fn apply(
        &self,
        account_id: &str,
        expected_version: u64,
        delta: Decimal,
        entry: &LedgerEntry,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;

        if inner.entries.contains_key(&entry.id) {
            return Err(StorageError::Duplicate(format!("entry {}", entry.id)));
        }

        let account = inner
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| StorageError::NotFound(format!("account {}", account_id)))?;

        if account.version != expected_version {
            return Err(StorageError::Conflict(format!(
                "account {} at version {}, expected {}",
                account_id, account.version, expected_version
            )));
        }

        let new_balance = account.balance + delta;
        if new_balance < Decimal::ZERO {
            // Callers check the balance before committing; a negative
            // result here means a logic error upstream.
            return Err(StorageError::Database(format!(
                "balance underflow for account {}",
                account_id
            )));
        }

        account.balance = new_balance;
        account.version += 1;
        inner.entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn record(&self, entry: &LedgerEntry) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(&entry.id) {
            return Err(StorageError::Duplicate(format!("entry {}", entry.id)));
        }
        inner.entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn set_entry_status(
        &self,
        entry_id: &str,
        status: EntryStatus,
        txid: Option<&str>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| StorageError::NotFound(format!("entry {}", entry_id)))?;

        entry
            .transition(status)
            .map_err(|e| StorageError::Conflict(e.to_string()))?;
        if let Some(txid) = txid {
            entry.txid = Some(txid.to_string());
        }
        Ok(())
    }

    async fn entries(&self, account_id: &str) -> StorageResult<Vec<LedgerEntry>> {
        let inner = self.inner.read().await;
        let mut entries: Vec<LedgerEntry> = inner
            .entries
            .values()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.time);
        Ok(entries)
    }

    async fn entries_with_status(&self, status: EntryStatus) -> StorageResult<Vec<LedgerEntry>> {
        let inner = self.inner.read().await;
        let mut entries: Vec<LedgerEntry> = inner
            .entries
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.time);
        Ok(entries)
    }

    async fn deposit_exists(&self, key: &DepositKey) -> StorageResult<bool> {
        let inner = self.inner.read().await;
        Ok(inner.entries.values().any(|e| e.matches_deposit(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::types::BankTransaction;

    fn account(id: &str, national_id: &str, balance: Decimal) -> Account {
        let mut account = Account::new(id, national_id, 1);
        account.balance = balance;
        account
    }

    #[tokio::test]
    async fn test_apply_credits_and_bumps_version() {
        let store = MemoryLedgerStore::new();
        store
            .insert_account(&account("a1", "1234567890", dec!(0)))
            .await
            .unwrap();

        let entry = LedgerEntry::buy("a1", dec!(0));
        store.apply("a1", 0, dec!(500), &entry).await.unwrap();

        let loaded = store.account("a1").await.unwrap().unwrap();
        assert_eq!(loaded.balance, dec!(500));
        assert_eq!(loaded.version, 1);
        assert_eq!(store.entries("a1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_with_stale_version_conflicts() {
        let store = MemoryLedgerStore::new();
        store
            .insert_account(&account("a1", "1234567890", dec!(1000)))
            .await
            .unwrap();

        let first = LedgerEntry::buy("a1", dec!(1000));
        store.apply("a1", 0, dec!(-1000), &first).await.unwrap();

        // Second write against the same base version must lose.
        let second = LedgerEntry::buy("a1", dec!(1000));
        let result = store.apply("a1", 0, dec!(-1000), &second).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));

        // No partial effect from the loser.
        let loaded = store.account("a1").await.unwrap().unwrap();
        assert_eq!(loaded.balance, dec!(0));
        assert_eq!(store.entries("a1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_never_underflows_balance() {
        let store = MemoryLedgerStore::new();
        store
            .insert_account(&account("a1", "1234567890", dec!(100)))
            .await
            .unwrap();

        let entry = LedgerEntry::buy("a1", dec!(200));
        let result = store.apply("a1", 0, dec!(-200), &entry).await;
        assert!(result.is_err());

        let loaded = store.account("a1").await.unwrap().unwrap();
        assert_eq!(loaded.balance, dec!(100));
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn test_terminal_entry_is_immutable() {
        let store = MemoryLedgerStore::new();
        store
            .insert_account(&account("a1", "1234567890", dec!(1000)))
            .await
            .unwrap();

        let entry = LedgerEntry::buy("a1", dec!(100));
        store.apply("a1", 0, dec!(-100), &entry).await.unwrap();

        store
            .set_entry_status(&entry.id, EntryStatus::Completed, Some("txid1"))
            .await
            .unwrap();

        let result = store
            .set_entry_status(&entry.id, EntryStatus::Failed, None)
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_deposit_exists_matches_full_natural_key() {
        let store = MemoryLedgerStore::new();
        store
            .insert_account(&account("a1", "1234567890", dec!(0)))
            .await
            .unwrap();

        let tx = BankTransaction {
            payer_id: "1234567890".to_string(),
            booked_at: Utc::now(),
            channel: "01".to_string(),
            reference: "ref-1".to_string(),
            short_reference: "9".to_string(),
            payment_detail: "inn".to_string(),
            amount: dec!(2500),
        };

        let entry = LedgerEntry::deposit("a1", &tx);
        store.apply("a1", 0, tx.amount, &entry).await.unwrap();

        assert!(store.deposit_exists(&tx.deposit_key("a1")).await.unwrap());

        // Any differing component means a different deposit.
        let mut other = tx.clone();
        other.amount = dec!(2501);
        assert!(!store.deposit_exists(&other.deposit_key("a1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_account_lookup_by_national_id() {
        let store = MemoryLedgerStore::new();
        store
            .insert_account(&account("a1", "1234567890", dec!(0)))
            .await
            .unwrap();

        let found = store.account_by_national_id("1234567890").await.unwrap();
        assert_eq!(found.unwrap().id, "a1");
        assert!(store
            .account_by_national_id("0000000000")
            .await
            .unwrap()
            .is_none());
    }
}

//! SQLite Persistent Storage
//!
//! Durable account and ledger storage with connection pooling via r2d2.
//!
//! Optimistic concurrency maps to a `version` column: the balance update
//! runs `WHERE id = ? AND version = ?`, and zero affected rows means the
//! writer lost the race. The balance update and the ledger entry insert
//! share one SQLite transaction, so a balance change can never be
//! committed without its entry.
//!
//! Monetary amounts are stored as decimal strings, never as floats.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

use super::traits::{LedgerStore, StorageError, StorageResult};
use crate::types::{Account, DepositKey, EntryKind, EntryStatus, LedgerEntry};

/// SQLite-backed ledger store with connection pooling.
pub struct SqliteLedgerStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLedgerStore {
    /// Create a store at `db_path`, running migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                national_id TEXT NOT NULL UNIQUE,
                balance TEXT NOT NULL,
                derivation INTEGER NOT NULL UNIQUE,
                withdrawal_address TEXT,
                bank_account_number TEXT,
                fee_percent TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                time TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount TEXT NOT NULL,
                rate TEXT,
                fee TEXT NOT NULL,
                coins TEXT,
                txid TEXT,
                reference TEXT,
                short_reference TEXT,
                payment_detail TEXT,
                status TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_entries_status ON entries(status);
            CREATE INDEX IF NOT EXISTS idx_entries_dedup
                ON entries(account_id, time, reference);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
        Ok(Account {
            id: row.get("id")?,
            national_id: row.get("national_id")?,
            balance: parse_decimal(&row.get::<_, String>("balance")?)?,
            derivation: row.get::<_, i64>("derivation")? as u32,
            withdrawal_address: row.get("withdrawal_address")?,
            bank_account_number: row.get("bank_account_number")?,
            fee_percent: parse_decimal(&row.get::<_, String>("fee_percent")?)?,
            version: row.get::<_, i64>("version")? as u64,
            created_at: parse_time(&row.get::<_, String>("created_at")?)?,
        })
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LedgerEntry> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;

        Ok(LedgerEntry {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            time: parse_time(&row.get::<_, String>("time")?)?,
            kind: EntryKind::from_str(&kind)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            amount: parse_decimal(&row.get::<_, String>("amount")?)?,
            rate: row
                .get::<_, Option<String>>("rate")?
                .map(|s| parse_decimal(&s))
                .transpose()?,
            fee: parse_decimal(&row.get::<_, String>("fee")?)?,
            coins: row
                .get::<_, Option<String>>("coins")?
                .map(|s| parse_decimal(&s))
                .transpose()?,
            txid: row.get("txid")?,
            reference: row.get("reference")?,
            short_reference: row.get("short_reference")?,
            payment_detail: row.get("payment_detail")?,
            status: EntryStatus::from_str(&status)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
        })
    }

    fn insert_entry(tx: &Connection, entry: &LedgerEntry) -> StorageResult<()> {
        let rows = tx
            .execute(
                r#"INSERT OR IGNORE INTO entries
                   (id, account_id, time, kind, amount, rate, fee, coins,
                    txid, reference, short_reference, payment_detail, status)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
                params![
                    entry.id,
                    entry.account_id,
                    entry.time.to_rfc3339(),
                    entry.kind.to_string(),
                    entry.amount.to_string(),
                    entry.rate.map(|r| r.to_string()),
                    entry.fee.to_string(),
                    entry.coins.map(|c| c.to_string()),
                    entry.txid,
                    entry.reference,
                    entry.short_reference,
                    entry.payment_detail,
                    entry.status.to_string(),
                ],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::Duplicate(format!("entry {}", entry.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn insert_account(&self, account: &Account) -> StorageResult<()> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                r#"INSERT OR IGNORE INTO accounts
                   (id, national_id, balance, derivation, withdrawal_address,
                    bank_account_number, fee_percent, version, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
                params![
                    account.id,
                    account.national_id,
                    account.balance.to_string(),
                    account.derivation as i64,
                    account.withdrawal_address,
                    account.bank_account_number,
                    account.fee_percent.to_string(),
                    account.version as i64,
                    account.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::Duplicate(format!("account {}", account.id)));
        }
        Ok(())
    }

    async fn account(&self, id: &str) -> StorageResult<Option<Account>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM accounts WHERE id = ?1",
            params![id],
            Self::row_to_account,
        )
        .optional()
        .map_err(db_err)
    }

    async fn account_by_national_id(&self, national_id: &str) -> StorageResult<Option<Account>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM accounts WHERE national_id = ?1",
            params![national_id],
            Self::row_to_account,
        )
        .optional()
        .map_err(db_err)
    }

    async fn apply(
        &self,
        account_id: &str,
        expected_version: u64,
        delta: Decimal,
        entry: &LedgerEntry,
    ) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        let balance: Option<String> = tx
            .query_row(
                "SELECT balance FROM accounts WHERE id = ?1 AND version = ?2",
                params![account_id, expected_version as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let Some(balance) = balance else {
            // Missing row or version mismatch; disambiguate for the caller.
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM accounts WHERE id = ?1",
                    params![account_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            return Err(match exists {
                Some(_) => StorageError::Conflict(format!(
                    "account {} moved past version {}",
                    account_id, expected_version
                )),
                None => StorageError::NotFound(format!("account {}", account_id)),
            });
        };

        let balance = Decimal::from_str(&balance)
            .map_err(|e| StorageError::Database(format!("bad stored balance: {}", e)))?;
        let new_balance = balance + delta;
        if new_balance < Decimal::ZERO {
            return Err(StorageError::Database(format!(
                "balance underflow for account {}",
                account_id
            )));
        }

        let rows = tx
            .execute(
                "UPDATE accounts SET balance = ?1, version = version + 1
                 WHERE id = ?2 AND version = ?3",
                params![new_balance.to_string(), account_id, expected_version as i64],
            )
            .map_err(db_err)?;
        if rows == 0 {
            return Err(StorageError::Conflict(format!(
                "account {} moved past version {}",
                account_id, expected_version
            )));
        }

        Self::insert_entry(&tx, entry)?;
        tx.commit().map_err(db_err)
    }

    async fn record(&self, entry: &LedgerEntry) -> StorageResult<()> {
        let conn = self.conn()?;
        Self::insert_entry(&conn, entry)
    }

    async fn set_entry_status(
        &self,
        entry_id: &str,
        status: EntryStatus,
        txid: Option<&str>,
    ) -> StorageResult<()> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE entries SET status = ?1, txid = COALESCE(?2, txid)
                 WHERE id = ?3 AND status = 'pending'",
                params![status.to_string(), txid, entry_id],
            )
            .map_err(db_err)?;

        if rows == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM entries WHERE id = ?1",
                    params![entry_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            return Err(match exists {
                Some(_) => {
                    StorageError::Conflict(format!("entry {} is already terminal", entry_id))
                }
                None => StorageError::NotFound(format!("entry {}", entry_id)),
            });
        }
        Ok(())
    }

    async fn entries(&self, account_id: &str) -> StorageResult<Vec<LedgerEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM entries WHERE account_id = ?1 ORDER BY time")
            .map_err(db_err)?;
        let entries = stmt
            .query_map(params![account_id], Self::row_to_entry)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(entries)
    }

    async fn entries_with_status(&self, status: EntryStatus) -> StorageResult<Vec<LedgerEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM entries WHERE status = ?1 ORDER BY time")
            .map_err(db_err)?;
        let entries = stmt
            .query_map(params![status.to_string()], Self::row_to_entry)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(entries)
    }

    async fn deposit_exists(&self, key: &DepositKey) -> StorageResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                r#"SELECT 1 FROM entries
                   WHERE kind = 'deposit'
                     AND account_id = ?1
                     AND time = ?2
                     AND reference = ?3
                     AND short_reference = ?4
                     AND payment_detail = ?5
                     AND amount = ?6
                   LIMIT 1"#,
                params![
                    key.account_id,
                    key.booked_at.to_rfc3339(),
                    key.reference,
                    key.short_reference,
                    key.payment_detail,
                    key.amount.to_string(),
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn parse_decimal(s: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(s).map_err(|_| rusqlite::Error::InvalidQuery)
}

fn parse_time(s: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::types::BankTransaction;

    fn account(id: &str, national_id: &str, balance: Decimal) -> Account {
        let mut account = Account::new(id, national_id, 7);
        account.balance = balance;
        account
    }

    #[tokio::test]
    async fn test_account_round_trip() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        let mut original = account("a1", "1234567890", dec!(750.25));
        original.withdrawal_address = Some("tb1qexample".to_string());

        store.insert_account(&original).await.unwrap();

        let loaded = store.account("a1").await.unwrap().unwrap();
        assert_eq!(loaded.balance, dec!(750.25));
        assert_eq!(loaded.national_id, "1234567890");
        assert_eq!(loaded.withdrawal_address.as_deref(), Some("tb1qexample"));
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn test_apply_is_versioned() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store
            .insert_account(&account("a1", "1234567890", dec!(1000)))
            .await
            .unwrap();

        let first = LedgerEntry::buy("a1", dec!(400));
        store.apply("a1", 0, dec!(-400), &first).await.unwrap();

        let second = LedgerEntry::buy("a1", dec!(400));
        let result = store.apply("a1", 0, dec!(-400), &second).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));

        let loaded = store.account("a1").await.unwrap().unwrap();
        assert_eq!(loaded.balance, dec!(600));
        assert_eq!(loaded.version, 1);
        assert_eq!(store.entries("a1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_entry_round_trip_and_status_update() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store
            .insert_account(&account("a1", "1234567890", dec!(1000)))
            .await
            .unwrap();

        let mut entry = LedgerEntry::buy("a1", dec!(100));
        entry.rate = Some(dec!(5000000));
        entry.coins = Some(dec!(0.0000199));
        entry.fee = dec!(-0.5);
        store.apply("a1", 0, dec!(-100), &entry).await.unwrap();

        store
            .set_entry_status(&entry.id, EntryStatus::Completed, Some("txid1"))
            .await
            .unwrap();

        let entries = store.entries("a1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Completed);
        assert_eq!(entries[0].txid.as_deref(), Some("txid1"));
        assert_eq!(entries[0].rate, Some(dec!(5000000)));
        assert_eq!(entries[0].coins, Some(dec!(0.0000199)));

        // Terminal entries never move again.
        let result = store
            .set_entry_status(&entry.id, EntryStatus::Failed, None)
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_deposit_dedup_by_natural_key() {
        let store = SqliteLedgerStore::in_memory().unwrap();
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

        let key = tx.deposit_key("a1");
        assert!(!store.deposit_exists(&key).await.unwrap());

        let entry = LedgerEntry::deposit("a1", &tx);
        store.apply("a1", 0, tx.amount, &entry).await.unwrap();
        assert!(store.deposit_exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_entries_queue() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store
            .insert_account(&account("a1", "1234567890", dec!(1000)))
            .await
            .unwrap();

        let entry = LedgerEntry::buy("a1", dec!(100));
        store.apply("a1", 0, dec!(-100), &entry).await.unwrap();
        store
            .set_entry_status(&entry.id, EntryStatus::Failed, None)
            .await
            .unwrap();

        let failed = store.entries_with_status(EntryStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, entry.id);
    }
}

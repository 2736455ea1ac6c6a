//! In-process ledger store with row-level locking.
//!
//! Committed rows live behind one short-lived mutex. Each account row also
//! carries an async lock that a transaction takes on its first balance update
//! and keeps until commit or rollback, the same way a database holds the row
//! lock of an `UPDATE` until the transaction ends. Writes stay in the
//! transaction's private write-set and are published together on commit, so
//! no reader ever sees part of a transaction.

use crate::account::{Account, AccountId, NewAccount};
use crate::error::{LedgerError, Result};
use crate::store::{LedgerStore, LedgerTx};
use crate::transaction::{Entry, Transfer};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

/// A committed account row and its lock.
struct Row {
    account: Account,
    lock: Arc<RowLock<()>>,
}

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Row>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

struct Inner {
    tables: Mutex<Tables>,
    // Sequences are never rolled back, matching database sequence semantics.
    next_entry_id: AtomicI64,
    next_transfer_id: AtomicI64,
}

impl Inner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        // Writers never leave `Tables` half-updated, so a poisoned lock is still usable.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn committed_account(&self, id: AccountId) -> Result<Account> {
        self.tables()
            .accounts
            .get(&id)
            .map(|row| row.account.clone())
            .ok_or_else(|| LedgerError::account_not_found(id))
    }

    fn row_lock(&self, id: AccountId) -> Result<Arc<RowLock<()>>> {
        self.tables()
            .accounts
            .get(&id)
            .map(|row| Arc::clone(&row.lock))
            .ok_or_else(|| LedgerError::account_not_found(id))
    }

    fn ensure_account(&self, id: AccountId) -> Result<()> {
        if self.tables().accounts.contains_key(&id) {
            Ok(())
        } else {
            Err(LedgerError::account_not_found(id))
        }
    }
}

/// In-memory ledger store.
///
/// Cloning is cheap and yields a handle to the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                next_entry_id: AtomicI64::new(1),
                next_transfer_id: AtomicI64::new(1),
            }),
        }
    }

    /// Creates an account with the id after the highest one in use.
    ///
    /// Fails once an account holds `AccountId::MAX`.
    pub fn create_account(&self, params: NewAccount) -> Result<Account> {
        let mut tables = self.inner.tables();
        let id = match tables.accounts.keys().next_back() {
            Some(last) => last
                .checked_add(1)
                .ok_or_else(|| LedgerError::invalid("account id space exhausted"))?,
            None => 1,
        };
        Ok(Self::insert_row(&mut tables, id, params))
    }

    /// Creates an account with a caller-chosen id.
    ///
    /// Fails if the id is already taken.
    pub fn create_account_with_id(&self, id: AccountId, params: NewAccount) -> Result<Account> {
        let mut tables = self.inner.tables();
        if tables.accounts.contains_key(&id) {
            return Err(LedgerError::invalid(format!("account {} already exists", id)));
        }
        Ok(Self::insert_row(&mut tables, id, params))
    }

    fn insert_row(tables: &mut Tables, id: AccountId, params: NewAccount) -> Account {
        let account = Account {
            id,
            owner: params.owner,
            currency: params.currency,
            balance: params.balance,
            created_at: Utc::now(),
        };
        tables.accounts.insert(
            id,
            Row {
                account: account.clone(),
                lock: Arc::new(RowLock::new(())),
            },
        );
        debug!("Created account {} with balance {}", id, account.balance);
        account
    }

    /// Reads the latest committed state of an account.
    pub fn get_account(&self, id: AccountId) -> Result<Account> {
        self.inner.committed_account(id)
    }

    /// All committed accounts, ordered by id.
    pub fn list_accounts(&self) -> Vec<Account> {
        self.inner
            .tables()
            .accounts
            .values()
            .map(|row| row.account.clone())
            .collect()
    }

    /// Committed entries of one account, oldest first.
    pub fn list_entries(&self, account_id: AccountId) -> Vec<Entry> {
        self.inner
            .tables()
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    /// Committed transfers touching one account on either side, oldest first.
    pub fn list_transfers(&self, account_id: AccountId) -> Vec<Transfer> {
        self.inner
            .tables()
            .transfers
            .iter()
            .filter(|t| t.from_account_id == account_id || t.to_account_id == account_id)
            .cloned()
            .collect()
    }

    /// Number of committed transfers.
    pub fn transfer_count(&self) -> usize {
        self.inner.tables().transfers.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        Ok(MemoryTx {
            inner: Arc::clone(&self.inner),
            locks: HashMap::new(),
            balances: HashMap::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
        })
    }
}

/// Open transaction on a [`MemoryStore`].
///
/// Dropping it without `commit` discards the write-set and releases every
/// row lock it holds.
pub struct MemoryTx {
    inner: Arc<Inner>,
    locks: HashMap<AccountId, OwnedMutexGuard<()>>,
    /// New balances of the rows this transaction has locked.
    balances: HashMap<AccountId, i64>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

impl MemoryTx {
    /// Whether this transaction currently holds the row lock of `account_id`.
    pub fn holds_lock(&self, account_id: AccountId) -> bool {
        self.locks.contains_key(&account_id)
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn insert_transfer(
        &mut self,
        from: AccountId,
        to: AccountId,
        amount: i64,
    ) -> Result<Transfer> {
        if amount <= 0 {
            return Err(LedgerError::invalid(format!(
                "transfer amount must be positive, got {}",
                amount
            )));
        }
        if from == to {
            return Err(LedgerError::invalid(format!(
                "transfer accounts must differ, both are {}",
                from
            )));
        }
        self.inner.ensure_account(from)?;
        self.inner.ensure_account(to)?;

        let transfer = Transfer {
            id: self.inner.next_transfer_id.fetch_add(1, Ordering::Relaxed),
            from_account_id: from,
            to_account_id: to,
            amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn insert_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry> {
        self.inner.ensure_account(account_id)?;

        let entry = Entry {
            id: self.inner.next_entry_id.fetch_add(1, Ordering::Relaxed),
            account_id,
            amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn add_account_balance(&mut self, account_id: AccountId, delta: i64) -> Result<Account> {
        if !self.locks.contains_key(&account_id) {
            let lock = self.inner.row_lock(account_id)?;
            let guard = lock.lock_owned().await;
            self.locks.insert(account_id, guard);
        }

        // With the row lock held, the committed value is the latest one.
        let mut account = self.inner.committed_account(account_id)?;
        if let Some(pending) = self.balances.get(&account_id) {
            account.balance = *pending;
        }

        account.balance = account.checked_apply(delta).ok_or_else(|| {
            LedgerError::invalid(format!(
                "balance of account {} overflows when adding {}",
                account_id, delta
            ))
        })?;
        self.balances.insert(account_id, account.balance);
        Ok(account)
    }

    async fn get_account(&mut self, account_id: AccountId) -> Result<Account> {
        let mut account = self.inner.committed_account(account_id)?;
        if let Some(pending) = self.balances.get(&account_id) {
            account.balance = *pending;
        }
        Ok(account)
    }

    async fn commit(self) -> Result<()> {
        let MemoryTx {
            inner,
            locks,
            balances,
            entries,
            transfers,
        } = self;

        {
            let mut tables = inner.tables();
            for (id, balance) in balances {
                if let Some(row) = tables.accounts.get_mut(&id) {
                    row.account.balance = balance;
                }
            }
            tables.entries.extend(entries);
            tables.transfers.extend(transfers);
        }
        // Row locks are released only after the new balances are visible.
        drop(locks);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        debug!(
            "Discarding {} transfer(s) and {} entry(ies); releasing {} row lock(s)",
            self.transfers.len(),
            self.entries.len(),
            self.locks.len()
        );
        Ok(())
    }
}

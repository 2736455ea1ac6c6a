//! Postgres-backed ledger store.
//!
//! Enabled with the `postgres` cargo feature.
//!
//! ## Atomic balance updates
//!
//! `add_account_balance` is a single `UPDATE ... SET balance = balance + $1
//! ... RETURNING` statement. Postgres takes the row lock as part of the
//! update and holds it until the transaction ends, so concurrent updates to
//! one account are applied one after the other against the latest committed
//! value. Read-committed isolation is enough.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError |
//! |------------|----------------------|-------------|
//! | Database (foreign key violation) | `23503` | `NotFound` (account) |
//! | Database (check constraint violation) | `23514` | `InvalidArgument` |
//! | Database (numeric value out of range) | `22003` | `InvalidArgument` |
//! | Database (other) | Any other | `Transaction` |
//! | PoolTimedOut / PoolClosed | N/A | `Transaction` |
//! | Other | N/A | `Transaction` |

use crate::account::{Account, AccountId, NewAccount};
use crate::config::Config;
use crate::error::{LedgerError, Result};
use crate::store::{LedgerStore, LedgerTx};
use crate::transaction::{Entry, Transfer};
use async_trait::async_trait;
use log::debug;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

/// Schema statements, applied in order by [`PgLedgerStore::migrate`].
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id BIGSERIAL PRIMARY KEY,
        owner VARCHAR NOT NULL,
        currency VARCHAR NOT NULL,
        balance BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entries (
        id BIGSERIAL PRIMARY KEY,
        account_id BIGINT NOT NULL REFERENCES accounts (id),
        amount BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transfers (
        id BIGSERIAL PRIMARY KEY,
        from_account_id BIGINT NOT NULL REFERENCES accounts (id),
        to_account_id BIGINT NOT NULL REFERENCES accounts (id),
        amount BIGINT NOT NULL CHECK (amount > 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CHECK (from_account_id <> to_account_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS entries_account_id_idx ON entries (account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_from_account_id_idx ON transfers (from_account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_to_account_id_idx ON transfers (to_account_id)",
];

/// Default pool size when connecting from [`Config`].
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Ledger store on a Postgres connection pool.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects using `DATABASE_URL` from the configuration.
    pub async fn connect(config: &Config) -> Result<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| LedgerError::Config("DATABASE_URL is not set".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Creates the ledger tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    /// Creates an account. Account CRUD runs outside transfer transactions.
    pub async fn create_account(&self, params: NewAccount) -> Result<Account> {
        let row = sqlx::query(
            r#"
            INSERT INTO accounts (owner, currency, balance)
            VALUES ($1, $2, $3)
            RETURNING id, owner, currency, balance, created_at
            "#,
        )
        .bind(&params.owner)
        .bind(&params.currency)
        .bind(params.balance)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_account", e))?;

        account_from_row(&row)
    }

    /// Reads the latest committed state of an account.
    pub async fn get_account(&self, id: AccountId) -> Result<Account> {
        let row = sqlx::query(
            "SELECT id, owner, currency, balance, created_at FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_account", e))?
        .ok_or_else(|| LedgerError::account_not_found(id))?;

        account_from_row(&row)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Tx = PgLedgerTx;

    async fn begin(&self) -> Result<PgLedgerTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgLedgerTx { tx })
    }
}

/// Open Postgres transaction. sqlx rolls it back when dropped uncommitted.
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
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

        let row = sqlx::query(
            r#"
            INSERT INTO transfers (from_account_id, to_account_id, amount)
            VALUES ($1, $2, $3)
            RETURNING id, from_account_id, to_account_id, amount, created_at
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| {
            // The violated constraint names the missing side.
            let missing = match foreign_key_constraint(&e) {
                Some(name) if name.contains("to_account_id") => Some(to),
                Some(_) => Some(from),
                None => None,
            };
            match missing {
                Some(id) => LedgerError::account_not_found(id),
                None => map_sqlx_error("insert_transfer", e),
            }
        })?;

        Ok(Transfer {
            id: get(&row, "id")?,
            from_account_id: get(&row, "from_account_id")?,
            to_account_id: get(&row, "to_account_id")?,
            amount: get(&row, "amount")?,
            created_at: get(&row, "created_at")?,
        })
    }

    async fn insert_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry> {
        let row = sqlx::query(
            r#"
            INSERT INTO entries (account_id, amount)
            VALUES ($1, $2)
            RETURNING id, account_id, amount, created_at
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| {
            if foreign_key_constraint(&e).is_some() {
                LedgerError::account_not_found(account_id)
            } else {
                map_sqlx_error("insert_entry", e)
            }
        })?;

        Ok(Entry {
            id: get(&row, "id")?,
            account_id: get(&row, "account_id")?,
            amount: get(&row, "amount")?,
            created_at: get(&row, "created_at")?,
        })
    }

    async fn add_account_balance(&mut self, account_id: AccountId, delta: i64) -> Result<Account> {
        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + $1
            WHERE id = $2
            RETURNING id, owner, currency, balance, created_at
            "#,
        )
        .bind(delta)
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("add_account_balance", e))?
        .ok_or_else(|| LedgerError::account_not_found(account_id))?;

        account_from_row(&row)
    }

    async fn get_account(&mut self, account_id: AccountId) -> Result<Account> {
        let row = sqlx::query(
            "SELECT id, owner, currency, balance, created_at FROM accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_account", e))?
        .ok_or_else(|| LedgerError::account_not_found(account_id))?;

        account_from_row(&row)
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<()> {
        debug!("Rolling back Postgres transaction");
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| LedgerError::Transaction(format!("failed to read {}: {}", column, e)))
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: get(row, "id")?,
        owner: get(row, "owner")?,
        currency: get(row, "currency")?,
        balance: get(row, "balance")?,
        created_at: get(row, "created_at")?,
    })
}

/// Name of the violated foreign key, if `err` is a foreign key violation.
fn foreign_key_constraint(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23503") => {
            Some(db_err.constraint().unwrap_or_default())
        }
        _ => None,
    }
}

/// Map SQLx errors to LedgerError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            database_error(db_err.code().as_deref(), msg)
        }
        sqlx::Error::PoolTimedOut => {
            LedgerError::Transaction(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Transaction(format!("connection pool closed in {}", operation))
        }
        _ => LedgerError::Transaction(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Classifies a database error by SQLSTATE.
///
/// `22003` is raised when `balance + delta` leaves the BIGINT range; retrying
/// cannot help, so it is reported like the in-memory overflow check.
fn database_error(code: Option<&str>, msg: String) -> LedgerError {
    match code {
        Some("23514") | Some("22003") => LedgerError::InvalidArgument(msg),
        _ => LedgerError::Transaction(msg),
    }
}

//! Ledger store boundary.
//!
//! A store hands out transaction-scoped handles ([`LedgerTx`]) that expose the
//! four row primitives the transfer executor needs. [`run_in_transaction`]
//! scopes a [`UnitOfWork`] to one handle: commit on the single success path,
//! rollback on every other.
//!
//! ## Handle contract
//!
//! Implementations must:
//! - make `add_account_balance` one atomic read-modify-write that locks the
//!   row until the transaction ends
//! - keep every write invisible to other transactions until `commit`
//! - roll back when a handle is dropped without `commit` (this covers panics
//!   and cancelled futures)

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryStore, MemoryTx};
#[cfg(feature = "postgres")]
pub use postgres::{PgLedgerStore, PgLedgerTx};

use crate::account::{Account, AccountId};
use crate::error::{LedgerError, Result};
use crate::transaction::{Entry, Transfer};
use async_trait::async_trait;
use log::{debug, error};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A transactional store of accounts, entries and transfers.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Tx: LedgerTx;

    /// Starts a new transaction.
    ///
    /// May wait for a free connection; fails with `LedgerError::Transaction`
    /// if none can be obtained.
    async fn begin(&self) -> Result<Self::Tx>;
}

/// Transaction-scoped handle.
///
/// Handles own their connection or lock state and borrow nothing from the
/// store that created them.
#[async_trait]
pub trait LedgerTx: Send + 'static {
    /// Records a transfer. Fails if `amount <= 0` or `from == to`.
    async fn insert_transfer(
        &mut self,
        from: AccountId,
        to: AccountId,
        amount: i64,
    ) -> Result<Transfer>;

    /// Posts a signed entry against an account.
    async fn insert_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry>;

    /// Atomically adds `delta` to the balance and returns the updated row.
    ///
    /// Blocks while another open transaction holds the row.
    async fn add_account_balance(&mut self, account_id: AccountId, delta: i64) -> Result<Account>;

    /// Reads an account as seen by this transaction.
    async fn get_account(&mut self, account_id: AccountId) -> Result<Account>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx> {
        (**self).begin().await
    }
}

/// A routine run inside one transaction.
#[async_trait]
pub trait UnitOfWork<T: LedgerTx>: Send {
    type Output: Send;

    async fn run(self, tx: &mut T) -> Result<Self::Output>;
}

/// Deadline and cancellation bound to one unit of work.
///
/// The default context never fires.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl TxContext {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Returns `true` once the deadline passed or the token was cancelled.
    pub fn is_done(&self) -> bool {
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        let cancelled = self.cancel.as_ref().is_some_and(|t| t.is_cancelled());
        expired || cancelled
    }

    /// Resolves when the context fires. Pends forever for a background context.
    async fn done(&self) {
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = expired => {}
            _ = cancelled => {}
        }
    }
}

/// Runs `work` inside a fresh transaction of `store`.
///
/// Commits if `work` succeeds. Otherwise rolls back and returns the failure
/// unchanged; if the rollback fails too, returns
/// [`LedgerError::RollbackFailed`] carrying both errors. If `ctx` fires
/// before commit, the transaction is rolled back and
/// [`LedgerError::Cancelled`] is returned.
pub async fn run_in_transaction<S, W>(store: &S, ctx: &TxContext, work: W) -> Result<W::Output>
where
    S: LedgerStore + ?Sized,
    W: UnitOfWork<S::Tx>,
{
    if ctx.is_done() {
        return Err(LedgerError::Cancelled);
    }

    let mut tx = tokio::select! {
        biased;
        _ = ctx.done() => return Err(LedgerError::Cancelled),
        begun = store.begin() => begun?,
    };

    let outcome = tokio::select! {
        biased;
        _ = ctx.done() => Err(LedgerError::Cancelled),
        res = work.run(&mut tx) => res,
    };

    match outcome {
        Ok(_) if ctx.is_done() => Err(abort(tx, LedgerError::Cancelled).await),
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(cause) => Err(abort(tx, cause).await),
    }
}

/// Rolls back `tx` after `cause`, folding a rollback failure into the error.
async fn abort<T: LedgerTx>(tx: T, cause: LedgerError) -> LedgerError {
    match tx.rollback().await {
        Ok(()) => {
            debug!("Rolled back transaction: {}", cause);
            cause
        }
        Err(rollback) => {
            error!(
                "Rollback failed after error ({}): {}; transaction state needs operator attention",
                cause, rollback
            );
            LedgerError::RollbackFailed {
                cause: Box::new(cause),
                rollback: Box::new(rollback),
            }
        }
    }
}

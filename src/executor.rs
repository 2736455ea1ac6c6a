//! Transfer executor.
//!
//! Runs one money movement as a single unit of work: one transfer record,
//! two balanced entries, two balance updates. The two balance rows are always
//! touched in ascending account id order, whichever side is debited. Two
//! concurrent transfers over the same pair of accounts therefore lock the
//! rows in the same order and cannot wait on each other in a cycle.
//!
//! Per attempt the executor moves through
//! `Validated -> TransactionOpen -> RecordsInserted -> BalancesUpdated -> Committed`,
//! and from any non-terminal stage to `RolledBack` on error. There is no retry
//! inside the executor.

use crate::account::AccountId;
use crate::error::{LedgerError, Result};
use crate::store::{run_in_transaction, LedgerStore, LedgerTx, TxContext, UnitOfWork};
use crate::transaction::{TransferRequest, TransferResult};
use async_trait::async_trait;
use log::debug;
use std::fmt;
use std::sync::Arc;

/// Stage of a transfer attempt, used in log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validated,
    TransactionOpen,
    RecordsInserted,
    BalancesUpdated,
    Committed,
    RolledBack,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validated => "validated",
            Stage::TransactionOpen => "transaction open",
            Stage::RecordsInserted => "records inserted",
            Stage::BalancesUpdated => "balances updated",
            Stage::Committed => "committed",
            Stage::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// One balance change of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub account_id: AccountId,
    pub delta: i64,
}

/// Returns the debit and credit of `request` in the order their rows must be
/// locked: ascending account id, independent of direction.
///
/// Fails with `InvalidArgument` if the amount has no negation (`i64::MIN`).
pub fn lock_order(request: &TransferRequest) -> Result<[Posting; 2]> {
    let debit_delta = request.amount.checked_neg().ok_or_else(|| {
        LedgerError::invalid(format!("transfer amount {} cannot be debited", request.amount))
    })?;
    let debit = Posting {
        account_id: request.from_account_id,
        delta: debit_delta,
    };
    let credit = Posting {
        account_id: request.to_account_id,
        delta: request.amount,
    };

    if debit.account_id < credit.account_id {
        Ok([debit, credit])
    } else {
        Ok([credit, debit])
    }
}

/// Executes transfers against an injected store.
///
/// Cloning shares the store.
pub struct TransferExecutor<S> {
    store: Arc<S>,
}

impl<S> Clone for TransferExecutor<S> {
    fn clone(&self) -> Self {
        TransferExecutor {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> TransferExecutor<S> {
    pub fn new(store: Arc<S>) -> Self {
        TransferExecutor { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Moves `amount` from `from` to `to` with no deadline.
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: i64,
    ) -> Result<TransferResult> {
        self.transfer_with(&TxContext::background(), TransferRequest::new(from, to, amount))
            .await
    }

    /// Moves money as described by `request`, bound to `ctx`.
    ///
    /// Fails fast with `InvalidArgument`, before any transaction is opened,
    /// if the amount is not positive or both accounts are the same. Any later
    /// failure rolls the whole transfer back and is returned unchanged.
    pub async fn transfer_with(
        &self,
        ctx: &TxContext,
        request: TransferRequest,
    ) -> Result<TransferResult> {
        request.validate().map_err(LedgerError::InvalidArgument)?;
        debug!(
            "Transfer {} -> {} of {}: {}",
            request.from_account_id,
            request.to_account_id,
            request.amount,
            Stage::Validated
        );

        let outcome = run_in_transaction(self.store.as_ref(), ctx, TransferWork { request }).await;

        match &outcome {
            Ok(result) => debug!(
                "Transfer {} ({} -> {} of {}): {}",
                result.transfer.id,
                request.from_account_id,
                request.to_account_id,
                request.amount,
                Stage::Committed
            ),
            Err(e) => debug!(
                "Transfer {} -> {} of {}: {} ({})",
                request.from_account_id,
                request.to_account_id,
                request.amount,
                Stage::RolledBack,
                e
            ),
        }
        outcome
    }
}

/// The body of one transfer transaction.
struct TransferWork {
    request: TransferRequest,
}

#[async_trait]
impl<T: LedgerTx> UnitOfWork<T> for TransferWork {
    type Output = TransferResult;

    async fn run(self, tx: &mut T) -> Result<TransferResult> {
        let TransferRequest {
            from_account_id: from,
            to_account_id: to,
            amount,
        } = self.request;
        debug!("Transfer {} -> {}: {}", from, to, Stage::TransactionOpen);

        let [first, second] = lock_order(&self.request)?;
        let debit = if first.account_id == from { first } else { second };

        let transfer = tx.insert_transfer(from, to, amount).await?;
        let from_entry = tx.insert_entry(from, debit.delta).await?;
        let to_entry = tx.insert_entry(to, amount).await?;
        debug!("Transfer {}: {}", transfer.id, Stage::RecordsInserted);

        let first_account = tx.add_account_balance(first.account_id, first.delta).await?;
        let second_account = tx
            .add_account_balance(second.account_id, second.delta)
            .await?;
        debug!("Transfer {}: {}", transfer.id, Stage::BalancesUpdated);

        let (from_account, to_account) = if first.account_id == from {
            (first_account, second_account)
        } else {
            (second_account, first_account)
        };

        Ok(TransferResult {
            transfer,
            from_account,
            to_account,
            from_entry,
            to_entry,
        })
    }
}

//! Ledger records: transfers, entries, and the transfer request/result pair.

use crate::account::{Account, AccountId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable record of one money movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Always strictly positive.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Immutable signed posting against one account.
///
/// Negative amounts are debits, positive amounts are credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub account_id: AccountId,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Input of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

impl TransferRequest {
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Self {
        TransferRequest {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Checks the request shape without touching any store.
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.amount <= 0 {
            return Err(format!("amount must be positive, got {}", self.amount));
        }
        if self.from_account_id == self.to_account_id {
            return Err(format!(
                "source and destination must differ, both are {}",
                self.from_account_id
            ));
        }
        Ok(())
    }
}

/// Everything a committed transfer produced.
///
/// Account snapshots carry the balances as of the transfer's own updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// Raw transfer row as read from CSV.
///
/// Fields are kept as strings so malformed rows can be reported and skipped
/// instead of aborting the whole file.
#[derive(Debug, Deserialize)]
pub struct TransferRecord {
    pub from: String,
    pub to: String,
    pub amount: String,
}

impl TransferRecord {
    /// Parses the raw CSV record into a typed request.
    ///
    /// Returns `None` if any field is missing or not an integer. Semantic
    /// checks (positive amount, distinct accounts) are left to the executor.
    pub fn parse(&self) -> Option<TransferRequest> {
        let from = self.from.trim().parse().ok()?;
        let to = self.to.trim().parse().ok()?;
        let amount = self.amount.trim().parse().ok()?;
        Some(TransferRequest::new(from, to, amount))
    }
}

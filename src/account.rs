//! Account model.
//!
//! Balances are held in the smallest currency unit and are only ever changed
//! by adding a signed delta inside a store transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account identifier.
///
/// Ids are totally ordered; the transfer executor relies on that order to
/// decide which balance row it touches first.
pub type AccountId = i64;

/// A snapshot of an account row.
///
/// # Invariants
///
/// - `balance` equals the opening balance plus the sum of every committed
///   entry posted to the account
/// - `balance` is never overwritten, only adjusted by a delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,

    /// Owner label.
    pub owner: String,

    /// ISO currency code, e.g. `USD`.
    pub currency: String,

    /// Balance in the smallest currency unit.
    pub balance: i64,

    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Returns the balance after applying `delta`, or `None` on overflow.
    pub fn checked_apply(&self, delta: i64) -> Option<i64> {
        self.balance.checked_add(delta)
    }
}

/// Parameters for creating an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub owner: String,
    pub currency: String,
    /// Opening balance in the smallest currency unit.
    pub balance: i64,
}

impl NewAccount {
    pub fn new(owner: impl Into<String>, currency: impl Into<String>, balance: i64) -> Self {
        NewAccount {
            owner: owner.into(),
            currency: currency.into(),
            balance,
        }
    }
}

/// Account row as read from and written to CSV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    pub owner: String,
    pub currency: String,
    pub balance: i64,
}

impl AccountRecord {
    pub fn into_parts(self) -> (AccountId, NewAccount) {
        (
            self.id,
            NewAccount::new(self.owner, self.currency, self.balance),
        )
    }
}

impl From<&Account> for AccountRecord {
    fn from(account: &Account) -> Self {
        AccountRecord {
            id: account.id,
            owner: account.owner.clone(),
            currency: account.currency.clone(),
            balance: account.balance,
        }
    }
}

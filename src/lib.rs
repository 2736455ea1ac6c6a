//! # Ledger Engine
//!
//! A double-entry transfer engine. Each transfer atomically records the
//! transfer, posts a debit and a credit entry, and adjusts both account
//! balances, staying correct and deadlock-free when many transfers run
//! concurrently against the same accounts.
//!
//! ## Design Principles
//!
//! - **Integer money**: balances and amounts are `i64` in the smallest currency unit
//! - **Double entry**: every transfer of `a` posts `-a` and `+a`
//! - **All or nothing**: a failed transfer leaves no transfer, entry, or balance change
//! - **Lock ordering**: balance rows are updated in ascending account id order
//! - **Injected store**: the executor owns a store handle, never global state
//!
//! ## Example
//!
//! ```no_run
//! use ledger_engine::{MemoryStore, NewAccount, TransferExecutor};
//! use std::sync::Arc;
//!
//! # async fn demo() -> ledger_engine::Result<()> {
//! let store = MemoryStore::new();
//! let a = store.create_account(NewAccount::new("alice", "USD", 100))?;
//! let b = store.create_account(NewAccount::new("bob", "USD", 50))?;
//!
//! let executor = TransferExecutor::new(Arc::new(store));
//! let result = executor.transfer(a.id, b.id, 30).await?;
//! assert_eq!(result.from_account.balance, 70);
//! assert_eq!(result.to_account.balance, 80);
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod store;
pub mod transaction;

pub use account::{Account, AccountId, AccountRecord, NewAccount};
pub use config::Config;
pub use engine::{BatchSummary, LedgerEngine};
pub use error::{LedgerError, Result};
pub use executor::{lock_order, Posting, Stage, TransferExecutor};
pub use store::{
    run_in_transaction, LedgerStore, LedgerTx, MemoryStore, MemoryTx, TxContext, UnitOfWork,
};
pub use transaction::{Entry, Transfer, TransferRecord, TransferRequest, TransferResult};

//! Error types for the ledger engine.

use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur while moving money through the ledger.
///
/// The variants separate three outcomes a caller has to tell apart:
/// the input was bad and nothing happened (`InvalidArgument`, `NotFound`),
/// nothing happened and the whole attempt may be retried (`Transaction`,
/// `Cancelled`), and the store may be in an unknown state (`RollbackFailed`).
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Non-positive amount, identical accounts, or an overflowing balance.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced row does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// The unit of work could not be started or committed.
    #[error("transaction failure: {0}")]
    Transaction(String),

    /// Rolling back after a failure failed as well.
    ///
    /// Transaction state is not guaranteed to be consistent. Both causes are
    /// kept so an operator can diagnose what happened.
    #[error("rollback failed after error ({cause}): {rollback}")]
    RollbackFailed {
        cause: Box<LedgerError>,
        rollback: Box<LedgerError>,
    },

    /// The deadline or cancellation token fired before commit.
    #[error("transaction cancelled before commit")]
    Cancelled,

    /// Failed to open or read an input file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing error
    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    /// Invalid input record
    #[error("Invalid record at row {row}: {message}")]
    InvalidRecord { row: usize, message: String },

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing input file arguments
    #[error("Missing input file arguments. Usage: ledger-engine <accounts.csv> <transfers.csv>")]
    MissingArgument,
}

impl LedgerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn account_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "account",
            id,
        }
    }

    /// Whether a fresh attempt of the same operation may succeed.
    ///
    /// Only begin/commit failures qualify: nothing was applied, and the
    /// failure was not caused by the input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }

    /// Whether the error leaves the store in a possibly inconsistent state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }
}

//! Runtime configuration read from the environment.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `LEDGER_MAX_IN_FLIGHT` | 16 | Transfers a batch runs concurrently |
//! | `LEDGER_TX_TIMEOUT_MS` | unset | Deadline of each transfer transaction |
//! | `DATABASE_URL` | unset | Postgres connection string (`postgres` feature) |

use crate::error::{LedgerError, Result};
use std::env;
use std::time::Duration;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on concurrently running transfers in a batch.
    pub max_in_flight: usize,

    /// Per-transfer deadline; `None` means no deadline.
    pub tx_timeout: Option<Duration>,

    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            tx_timeout: None,
            database_url: None,
        }
    }
}

impl Config {
    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(raw) = lookup("LEDGER_MAX_IN_FLIGHT") {
            config.max_in_flight = match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(LedgerError::Config(format!(
                        "LEDGER_MAX_IN_FLIGHT must be a positive integer, got {:?}",
                        raw
                    )))
                }
            };
        }

        if let Some(raw) = lookup("LEDGER_TX_TIMEOUT_MS") {
            let millis = raw.trim().parse::<u64>().map_err(|_| {
                LedgerError::Config(format!(
                    "LEDGER_TX_TIMEOUT_MS must be a number of milliseconds, got {:?}",
                    raw
                ))
            })?;
            config.tx_timeout = Some(Duration::from_millis(millis));
        }

        config.database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        Ok(config)
    }
}

//! Ledger Engine CLI
//!
//! Seeds an in-memory ledger from an accounts CSV, applies a CSV of
//! transfers concurrently, and prints the final account states.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- accounts.csv transfers.csv > balances.csv
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Set to `debug` or `warn` to control logging verbosity
//! - `LEDGER_MAX_IN_FLIGHT`: Maximum concurrently running transfers (default 16)
//! - `LEDGER_TX_TIMEOUT_MS`: Deadline for each transfer transaction

use ledger_engine::{Config, LedgerEngine, LedgerError, Result};
use log::info;
use std::env;
use std::fs::File;
use std::io::{self, BufReader};
use std::process;

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        return Err(LedgerError::MissingArgument);
    }

    let config = Config::from_env()?;
    let engine = LedgerEngine::with_config(&config);

    let accounts = BufReader::new(File::open(&args[1])?);
    engine.load_accounts(accounts)?;

    let transfers = BufReader::new(File::open(&args[2])?);
    let summary = engine.process_csv(transfers).await?;
    info!(
        "{} transfer(s) committed, {} failed, {} row(s) skipped",
        summary.committed, summary.failed, summary.skipped
    );

    let stdout = io::stdout();
    let handle = stdout.lock();
    engine.write_output(handle)?;

    Ok(())
}

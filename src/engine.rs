//! Batch transfer engine.
//!
//! Seeds an in-memory ledger from an accounts CSV, runs a CSV of transfers
//! through the [`TransferExecutor`] with a bounded number of transfers in
//! flight, and writes the final account states back out as CSV.

use crate::account::AccountRecord;
use crate::config::Config;
use crate::error::{LedgerError, Result};
use crate::executor::TransferExecutor;
use crate::store::{MemoryStore, TxContext};
use crate::transaction::{TransferRecord, TransferResult};
use csv::{ReaderBuilder, Trim};
use log::{debug, error, warn};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};

/// A joined transfer task: its row number and result, or the join failure.
type TaskOutcome = std::result::Result<(usize, Result<TransferResult>), JoinError>;

/// Outcome counts of one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    /// Transfers that committed.
    pub committed: usize,

    /// Transfers that were rejected or rolled back.
    pub failed: usize,

    /// Rows that could not be parsed.
    pub skipped: usize,
}

impl BatchSummary {
    /// Counts one finished transfer task, logging its failure.
    fn record(&mut self, joined: TaskOutcome) {
        match joined {
            Ok((_, Ok(_))) => self.committed += 1,
            Ok((row, Err(e))) => {
                if e.is_fatal() {
                    error!("Row {}: {}", row, e);
                } else {
                    warn!("Row {}: Transfer failed: {}", row, e);
                }
                self.failed += 1;
            }
            Err(e) => {
                error!("Transfer task did not complete: {}", e);
                self.failed += 1;
            }
        }
    }
}

/// The batch engine.
///
/// Transfers within a batch run concurrently; they are not applied in file
/// order. Final balances do not depend on the interleaving since every
/// committed transfer adds the same deltas.
pub struct LedgerEngine {
    executor: TransferExecutor<MemoryStore>,
    max_in_flight: usize,
    tx_timeout: Option<Duration>,
}

impl LedgerEngine {
    /// Creates an engine over an empty store with default settings.
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Self {
        LedgerEngine {
            executor: TransferExecutor::new(Arc::new(MemoryStore::new())),
            max_in_flight: config.max_in_flight.max(1),
            tx_timeout: config.tx_timeout,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        self.executor.store()
    }

    pub fn executor(&self) -> &TransferExecutor<MemoryStore> {
        &self.executor
    }

    /// Creates the accounts listed in a CSV reader.
    ///
    /// Unlike transfers, a malformed or duplicate account row is fatal: every
    /// later transfer depends on the account set being exactly as given.
    pub fn load_accounts<R: Read>(&self, reader: R) -> Result<usize> {
        let mut csv_reader = ReaderBuilder::new().trim(Trim::All).from_reader(reader);
        let mut loaded = 0;

        for (row_idx, result) in csv_reader.deserialize::<AccountRecord>().enumerate() {
            let row_num = row_idx + 2; // 1-indexed, accounting for header row

            let record = result.map_err(|e| LedgerError::InvalidRecord {
                row: row_num,
                message: e.to_string(),
            })?;
            let (id, params) = record.into_parts();
            self.store()
                .create_account_with_id(id, params)
                .map_err(|e| LedgerError::InvalidRecord {
                    row: row_num,
                    message: e.to_string(),
                })?;
            loaded += 1;
        }

        debug!("Loaded {} account(s)", loaded);
        Ok(loaded)
    }

    /// Runs the transfers from a CSV reader.
    ///
    /// Rows are read one at a time; at most `max_in_flight` transfers are
    /// spawned and not yet tallied at once, so memory stays flat however long
    /// the file is. Unparseable rows and failed transfers are logged at warn
    /// level and counted, never fatal to the batch.
    ///
    /// The reader is read synchronously on the calling task. That suits local
    /// files and in-memory buffers; wrap slow readers (sockets, pipes) in a
    /// blocking task before handing them over.
    pub async fn process_csv<R: Read>(&self, reader: R) -> Result<BatchSummary> {
        let mut csv_reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut tasks = JoinSet::new();
        let mut summary = BatchSummary::default();

        for (row_idx, result) in csv_reader.deserialize::<TransferRecord>().enumerate() {
            let row_num = row_idx + 2; // 1-indexed, accounting for header row

            let request = match result {
                Ok(record) => match record.parse() {
                    Some(request) => request,
                    None => {
                        warn!("Row {}: Failed to parse transfer record", row_num);
                        summary.skipped += 1;
                        continue;
                    }
                },
                Err(e) => {
                    warn!("Row {}: CSV parse error: {}", row_num, e);
                    summary.skipped += 1;
                    continue;
                }
            };

            while tasks.len() >= self.max_in_flight {
                match tasks.join_next().await {
                    Some(joined) => summary.record(joined),
                    None => break,
                }
            }

            let executor = self.executor.clone();
            let timeout = self.tx_timeout;
            tasks.spawn(async move {
                let ctx = match timeout {
                    Some(timeout) => TxContext::background().with_timeout(timeout),
                    None => TxContext::background(),
                };
                (row_num, executor.transfer_with(&ctx, request).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            summary.record(joined);
        }

        debug!(
            "Batch done: {} committed, {} failed, {} skipped",
            summary.committed, summary.failed, summary.skipped
        );
        Ok(summary)
    }

    /// Writes final account states to CSV, sorted by account id.
    pub fn write_output<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        for account in self.store().list_accounts() {
            csv_writer.serialize(AccountRecord::from(&account))?;
        }

        csv_writer.flush()?;
        Ok(())
    }
}

impl Default for LedgerEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const ACCOUNTS: &str = r#"id,owner,currency,balance
1,alice,USD,100
2,bob,USD,50
3,carol,EUR,0"#;

    fn engine_with_accounts() -> LedgerEngine {
        let engine = LedgerEngine::new();
        engine.load_accounts(Cursor::new(ACCOUNTS)).unwrap();
        engine
    }

    fn balance(engine: &LedgerEngine, id: i64) -> i64 {
        engine.store().get_account(id).unwrap().balance
    }

    #[test]
    fn test_load_accounts() {
        let engine = engine_with_accounts();
        assert_eq!(engine.store().list_accounts().len(), 3);
        assert_eq!(balance(&engine, 1), 100);
        assert_eq!(engine.store().get_account(3).unwrap().currency, "EUR");
    }

    #[test]
    fn test_load_accounts_rejects_duplicate_id() {
        let engine = LedgerEngine::new();
        let csv = "id,owner,currency,balance\n1,alice,USD,10\n1,bob,USD,20";

        let err = engine.load_accounts(Cursor::new(csv)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRecord { row: 3, .. }));
    }

    #[test]
    fn test_load_accounts_rejects_malformed_balance() {
        let engine = LedgerEngine::new();
        let csv = "id,owner,currency,balance\n1,alice,USD,ten";

        let err = engine.load_accounts(Cursor::new(csv)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRecord { row: 2, .. }));
    }

    #[tokio::test]
    async fn test_simple_transfers() {
        let engine = engine_with_accounts();
        let csv = r#"from,to,amount
1,2,30
2,3,10"#;

        let summary = engine.process_csv(Cursor::new(csv)).await.unwrap();

        assert_eq!(summary.committed, 2);
        assert_eq!(balance(&engine, 1), 70);
        assert_eq!(balance(&engine, 2), 70);
        assert_eq!(balance(&engine, 3), 10);
    }

    #[tokio::test]
    async fn test_invalid_rows_are_skipped_or_failed() {
        let engine = engine_with_accounts();
        let csv = r#"from,to,amount
1,2,abc
1,1,10
1,2,0
1,9,5
1,2,5"#;

        let summary = engine.process_csv(Cursor::new(csv)).await.unwrap();

        assert_eq!(
            summary,
            BatchSummary {
                committed: 1,
                failed: 3,
                skipped: 1,
            }
        );
        assert_eq!(balance(&engine, 1), 95);
        assert_eq!(balance(&engine, 2), 55);
        assert_eq!(engine.store().transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_whitespace_handling() {
        let engine = engine_with_accounts();
        let csv = "from, to, amount\n 1, 2, 25 ";

        engine.process_csv(Cursor::new(csv)).await.unwrap();
        assert_eq!(balance(&engine, 1), 75);
    }

    #[tokio::test]
    async fn test_bounded_concurrency_completes() {
        let config = Config {
            max_in_flight: 1,
            ..Config::default()
        };
        let engine = LedgerEngine::with_config(&config);
        engine.load_accounts(Cursor::new(ACCOUNTS)).unwrap();

        let mut csv = String::from("from,to,amount\n");
        for i in 0..20 {
            if i % 2 == 0 {
                csv.push_str("1,2,5\n");
            } else {
                csv.push_str("2,1,5\n");
            }
        }

        let summary = engine.process_csv(Cursor::new(csv)).await.unwrap();
        assert_eq!(summary.committed, 20);
        assert_eq!(balance(&engine, 1), 100);
        assert_eq!(balance(&engine, 2), 50);
    }

    #[tokio::test]
    async fn test_long_batch_with_single_slot_tallies_every_row() {
        let config = Config {
            max_in_flight: 1,
            ..Config::default()
        };
        let engine = LedgerEngine::with_config(&config);
        engine.load_accounts(Cursor::new(ACCOUNTS)).unwrap();

        // 1000 rows: a commit, a missing account, and a garbage row in turn,
        // plus one trailing commit.
        let mut csv = String::from("from,to,amount\n");
        for i in 0..1000 {
            match i % 3 {
                0 => csv.push_str("1,3,1\n"),
                1 => csv.push_str("1,99,1\n"),
                _ => csv.push_str("1,x,1\n"),
            }
        }

        let summary = engine.process_csv(Cursor::new(csv)).await.unwrap();

        assert_eq!(
            summary,
            BatchSummary {
                committed: 334,
                failed: 333,
                skipped: 333,
            }
        );
        assert_eq!(balance(&engine, 1), 100 - 334);
        assert_eq!(balance(&engine, 3), 334);
        assert_eq!(engine.store().transfer_count(), 334);
    }

    #[tokio::test]
    async fn test_single_slot_applies_rows_in_file_order() {
        let config = Config {
            max_in_flight: 1,
            ..Config::default()
        };
        let engine = LedgerEngine::with_config(&config);
        let accounts = format!(
            "id,owner,currency,balance\n1,whale,USD,{}\n2,bob,USD,0",
            i64::MAX - 10
        );
        engine.load_accounts(Cursor::new(accounts)).unwrap();

        // Each credit to 1 only fits after the preceding debit has committed.
        let mut csv = String::from("from,to,amount\n");
        for _ in 0..50 {
            csv.push_str("1,2,10\n2,1,10\n");
        }

        let summary = engine.process_csv(Cursor::new(csv)).await.unwrap();

        assert_eq!(summary.committed, 100);
        assert_eq!(summary.failed, 0);
        assert_eq!(balance(&engine, 1), i64::MAX - 10);
    }

    #[tokio::test]
    async fn test_output_format() {
        let engine = engine_with_accounts();
        engine
            .process_csv(Cursor::new("from,to,amount\n1,3,40"))
            .await
            .unwrap();

        let mut output = Vec::new();
        engine.write_output(&mut output).unwrap();

        let output_str = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output_str.lines().collect();
        assert_eq!(
            lines,
            vec![
                "id,owner,currency,balance",
                "1,alice,USD,60",
                "2,bob,USD,50",
                "3,carol,EUR,40",
            ]
        );
    }
}

//! Concurrent transfer tests.
//!
//! These run on a multi-threaded runtime so transfers genuinely interleave
//! and contend for the same row locks. Every batch is wrapped in a timeout:
//! a deadlock shows up as a test failure instead of a hang.

use ledger_engine::{
    LedgerError, MemoryStore, NewAccount, TransferExecutor, TransferRequest, TransferResult,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Upper bound for any batch; a deadlock would exceed it.
const BATCH_TIMEOUT: Duration = Duration::from_secs(10);

fn store_with(balances: &[i64]) -> MemoryStore {
    let store = MemoryStore::new();
    for (i, balance) in balances.iter().enumerate() {
        store
            .create_account(NewAccount::new(format!("owner{}", i + 1), "USD", *balance))
            .unwrap();
    }
    store
}

/// Runs all requests concurrently and returns their outcomes.
async fn run_concurrently(
    executor: &TransferExecutor<MemoryStore>,
    requests: &[TransferRequest],
) -> Vec<Result<TransferResult, LedgerError>> {
    let mut tasks = JoinSet::new();
    for request in requests.iter().copied() {
        let executor = executor.clone();
        tasks.spawn(async move {
            executor
                .transfer(request.from_account_id, request.to_account_id, request.amount)
                .await
        });
    }

    let batch = async {
        let mut outcomes = Vec::with_capacity(requests.len());
        while let Some(joined) = tasks.join_next().await {
            outcomes.push(joined.expect("transfer task panicked"));
        }
        outcomes
    };

    tokio::time::timeout(BATCH_TIMEOUT, batch)
        .await
        .expect("transfers did not finish: possible deadlock")
}

/// Checks double entry for every account: opening balance plus the sum of
/// its entries equals the current balance.
fn assert_balances_match_entries(store: &MemoryStore, opening: &[i64]) {
    for (i, opening_balance) in opening.iter().enumerate() {
        let id = i as i64 + 1;
        let posted: i64 = store.list_entries(id).iter().map(|e| e.amount).sum();
        assert_eq!(
            store.get_account(id).unwrap().balance,
            opening_balance + posted,
            "account {} balance diverged from its entries",
            id
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_alternating_directions_do_not_deadlock() {
    let store = store_with(&[1000, 1000]);
    let executor = TransferExecutor::new(Arc::new(store.clone()));

    let n = 10;
    let amount = 10;
    let requests: Vec<_> = (0..n)
        .map(|i| {
            if i % 2 == 1 {
                TransferRequest::new(2, 1, amount)
            } else {
                TransferRequest::new(1, 2, amount)
            }
        })
        .collect();

    let outcomes = run_concurrently(&executor, &requests).await;

    assert_eq!(outcomes.len(), n);
    for outcome in &outcomes {
        assert!(outcome.is_ok(), "transfer failed: {:?}", outcome);
    }

    // Equal numbers of debits and credits of equal size cancel out.
    assert_eq!(store.get_account(1).unwrap().balance, 1000);
    assert_eq!(store.get_account(2).unwrap().balance, 1000);
    assert_eq!(store.transfer_count(), n);
    assert_eq!(store.list_entries(1).len(), n);
    assert_eq!(store.list_entries(2).len(), n);
    assert_balances_match_entries(&store, &[1000, 1000]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heavy_contention_on_one_pair() {
    let store = store_with(&[500, 500]);
    let executor = TransferExecutor::new(Arc::new(store.clone()));

    // 120 transfers, 2/3 of them 1 -> 2.
    let requests: Vec<_> = (0..120)
        .map(|i| {
            if i % 3 == 0 {
                TransferRequest::new(2, 1, 7)
            } else {
                TransferRequest::new(1, 2, 7)
            }
        })
        .collect();

    let outcomes = run_concurrently(&executor, &requests).await;
    assert!(outcomes.iter().all(|o| o.is_ok()));

    // Net 40 transfers of 7 moved from 1 to 2.
    assert_eq!(store.get_account(1).unwrap().balance, 500 - 40 * 7);
    assert_eq!(store.get_account(2).unwrap().balance, 500 + 40 * 7);
    assert_balances_match_entries(&store, &[500, 500]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disjoint_and_overlapping_pairs_keep_balances_exact() {
    let opening = [100, 200, 300, 400, 500, 600, 700, 800];
    let store = store_with(&opening);
    let executor = TransferExecutor::new(Arc::new(store.clone()));

    let mut requests = Vec::new();
    for round in 0..15i64 {
        // Disjoint pairs, both directions.
        requests.push(TransferRequest::new(1, 2, round + 1));
        requests.push(TransferRequest::new(4, 3, 2 * round + 1));
        requests.push(TransferRequest::new(5, 6, 3));
        requests.push(TransferRequest::new(8, 7, round % 4 + 1));
        // A ring over every account so pairs overlap as well.
        let from = round % 8 + 1;
        let to = (round + 3) % 8 + 1;
        requests.push(TransferRequest::new(from, to, 11));
        requests.push(TransferRequest::new(to, from, 5));
    }

    let mut expected: HashMap<i64, i64> = opening
        .iter()
        .enumerate()
        .map(|(i, b)| (i as i64 + 1, *b))
        .collect();
    for r in &requests {
        *expected.get_mut(&r.from_account_id).unwrap() -= r.amount;
        *expected.get_mut(&r.to_account_id).unwrap() += r.amount;
    }

    let outcomes = run_concurrently(&executor, &requests).await;
    assert!(outcomes.iter().all(|o| o.is_ok()));

    for (id, balance) in &expected {
        assert_eq!(
            store.get_account(*id).unwrap().balance,
            *balance,
            "account {} has wrong final balance",
            id
        );
    }
    assert_eq!(store.transfer_count(), requests.len());
    assert_balances_match_entries(&store, &opening);

    let total_before: i64 = opening.iter().sum();
    let total_after: i64 = store.list_accounts().iter().map(|a| a.balance).sum();
    assert_eq!(total_before, total_after);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_transfer_posts_balanced_entries() {
    let store = store_with(&[300, 300, 300]);
    let executor = TransferExecutor::new(Arc::new(store.clone()));

    let requests: Vec<_> = (0..30i64)
        .map(|i| {
            let from = i % 3 + 1;
            let to = (i + 1) % 3 + 1;
            TransferRequest::new(from, to, i + 1)
        })
        .collect();

    let outcomes = run_concurrently(&executor, &requests).await;

    for outcome in outcomes {
        let result = outcome.unwrap();
        let amount = result.transfer.amount;
        assert_eq!(result.from_entry.amount, -amount);
        assert_eq!(result.to_entry.amount, amount);
        assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
        assert_eq!(result.from_entry.account_id, result.transfer.from_account_id);
        assert_eq!(result.to_entry.account_id, result.transfer.to_account_id);
        assert_eq!(result.from_account.id, result.transfer.from_account_id);
        assert_eq!(result.to_account.id, result.transfer.to_account_id);
    }

    let all_entries: i64 = (1..=3)
        .flat_map(|id| store.list_entries(id))
        .map(|e| e.amount)
        .sum();
    assert_eq!(all_entries, 0);
    assert_balances_match_entries(&store, &[300, 300, 300]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failures_mixed_into_contention_leave_no_partial_state() {
    let store = store_with(&[1000, 1000]);
    let executor = TransferExecutor::new(Arc::new(store.clone()));

    // Every third transfer targets a missing account and must roll back
    // while the others keep committing against the same rows.
    let requests: Vec<_> = (0..30)
        .map(|i| match i % 3 {
            0 => TransferRequest::new(1, 99, 10),
            1 => TransferRequest::new(1, 2, 10),
            _ => TransferRequest::new(2, 1, 10),
        })
        .collect();

    let outcomes = run_concurrently(&executor, &requests).await;

    let not_found = outcomes
        .iter()
        .filter(|o| matches!(o, Err(LedgerError::NotFound { id: 99, .. })))
        .count();
    let committed = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(not_found, 10);
    assert_eq!(committed, 20);

    assert_eq!(store.transfer_count(), 20);
    assert_eq!(store.get_account(1).unwrap().balance, 1000);
    assert_eq!(store.get_account(2).unwrap().balance, 1000);
    assert_balances_match_entries(&store, &[1000, 1000]);
}

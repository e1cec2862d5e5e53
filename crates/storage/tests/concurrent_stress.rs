//! Concurrent access tests for `MemoryBackend`.
//!
//! Compare-and-set is the primitive the directory and key store rely on for
//! lost-update protection, so these tests focus on it.

#![allow(clippy::expect_used, clippy::panic)]

use std::collections::HashSet;

use bytes::Bytes;
use keyward_storage::{MemoryBackend, StorageBackend, StorageError};
use tokio::task::JoinSet;

const CONCURRENCY: usize = 16;
const CAS_ROUNDS: usize = 50;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_insert_if_absent_has_exactly_one_winner() {
    let backend = MemoryBackend::new();

    for round in 0..CAS_ROUNDS {
        let key = format!("round:{round:04}").into_bytes();
        let mut set = JoinSet::new();
        for task_id in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            set.spawn(async move {
                match backend.compare_and_set(&key, None, format!("task{task_id}").into_bytes()).await {
                    Ok(()) => Some(task_id),
                    Err(StorageError::Conflict) => None,
                    Err(other) => panic!("unexpected error: {other}"),
                }
            });
        }

        let mut winners = Vec::new();
        while let Some(result) = set.join_next().await {
            if let Some(winner) = result.expect("task should not panic") {
                winners.push(winner);
            }
        }
        assert_eq!(winners.len(), 1, "round {round}: exactly one insert must win");

        let stored = backend.get(&key).await.expect("get").expect("winner's value");
        assert_eq!(stored, Bytes::from(format!("task{}", winners[0])));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cas_increment_loses_no_updates() {
    let backend = MemoryBackend::new();
    backend.set(b"counter".to_vec(), b"0".to_vec()).await.expect("seed");

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let backend = backend.clone();
        set.spawn(async move {
            for _ in 0..10 {
                loop {
                    let current = backend.get(b"counter").await.expect("get").expect("present");
                    let n: u64 = std::str::from_utf8(&current)
                        .expect("utf8")
                        .parse()
                        .expect("number");
                    let next = (n + 1).to_string().into_bytes();
                    match backend.compare_and_set(b"counter", Some(&current), next).await {
                        Ok(()) => break,
                        Err(StorageError::Conflict) => continue,
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            }
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    let value = backend.get(b"counter").await.expect("get").expect("present");
    assert_eq!(value, Bytes::from((CONCURRENCY * 10).to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transactions_on_disjoint_keys_all_commit() {
    let backend = MemoryBackend::new();

    let mut set = JoinSet::new();
    for task_id in 0..CONCURRENCY {
        let backend = backend.clone();
        set.spawn(async move {
            let mut txn = backend.transaction().await.expect("txn");
            txn.set(format!("a:{task_id:03}").into_bytes(), b"1".to_vec());
            txn.set(format!("b:{task_id:03}").into_bytes(), b"1".to_vec());
            txn.commit().await.expect("commit");
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    let a: HashSet<Bytes> =
        backend.list_prefix(b"a:").await.expect("list").into_iter().map(|kv| kv.key).collect();
    let b = backend.list_prefix(b"b:").await.expect("list");
    assert_eq!(a.len(), CONCURRENCY);
    assert_eq!(b.len(), CONCURRENCY);
}

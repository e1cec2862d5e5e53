#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p keyward-storage --features failpoints --test failpoint_tests
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use keyward_storage::{
    BatchConfig, BatchWriter, MemoryBackend, RetryConfig, StorageBackend, StorageError, with_retry,
};

#[tokio::test]
async fn batch_commit_failpoint_returns_error() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("batch-before-commit", "return").expect("failed to configure fail point");

    let backend = Arc::new(MemoryBackend::new());
    let mut writer = BatchWriter::new(backend.clone(), BatchConfig::default());
    writer.put(b"key".to_vec(), b"value".to_vec());

    assert!(writer.flush().await.is_err(), "batch flush should fail when fail point is active");
    assert!(backend.get(b"key").await.expect("get").is_none());
    assert_eq!(writer.pending(), 1);

    scenario.teardown();
}

#[tokio::test]
async fn retry_before_sleep_failpoint_is_hit_on_transient_error() {
    let scenario = fail::FailScenario::setup();
    let hits = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&hits);
    fail::cfg_callback("retry-before-sleep", move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .expect("failed to configure fail point");

    let config = RetryConfig::builder()
        .max_retries(2)
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(2))
        .build()
        .expect("config");
    let result: Result<(), StorageError> =
        with_retry(&config, "load", || async { Err(StorageError::timeout()) }).await;

    assert!(result.is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    scenario.teardown();
}

//! Storage backend trait definition.
//!
//! [`StorageBackend`] is the single key-value abstraction behind every
//! collaborator store: the per-actor store each shard actor persists into,
//! the shared configuration store holding the region-shard directory, and the
//! audit store adapter.
//!
//! # Design
//!
//! - **Keys and values are bytes**: no assumptions about serialization format
//! - **Async by default**: all operations are async for non-blocking I/O
//! - **Object safe**: callers hold `Arc<dyn StorageBackend>` so one process can
//!   mix backends per collaborator
//! - **Prefix listing**: periodic sweeps enumerate an actor's keys by prefix
//! - **Transactional**: atomic multi-key writes via [`Transaction`]

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, transaction::Transaction, types::KeyValue};

/// Abstract storage backend for key-value operations.
///
/// Backends are expected to be thread-safe (`Send + Sync`) and support
/// concurrent operations.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a single value by key |
/// | [`set`](StorageBackend::set) | Store a key-value pair |
/// | [`set_with_ttl`](StorageBackend::set_with_ttl) | Store with automatic expiration |
/// | [`compare_and_set`](StorageBackend::compare_and_set) | Atomic compare-and-swap |
/// | [`delete`](StorageBackend::delete) | Remove a key |
/// | [`get_range`](StorageBackend::get_range) | Retrieve keys in `[start, end)` |
/// | [`list_prefix`](StorageBackend::list_prefix) | Retrieve keys sharing a prefix |
/// | [`clear_prefix`](StorageBackend::clear_prefix) | Delete keys sharing a prefix |
/// | [`transaction`](StorageBackend::transaction) | Begin an atomic transaction |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use keyward_storage::{MemoryBackend, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// let value = backend.get(b"key").await.unwrap();
/// assert_eq!(value, Some(Bytes::from("value")));
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// Returns `Ok(None)` if the key doesn't exist or its TTL has elapsed.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair, overwriting any previous value and clearing
    /// any TTL on the key.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Stores a key-value pair that expires after `ttl`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Atomically sets a key's value if it matches the expected current value.
    ///
    /// - **`expected: None`**: insert-if-absent. Fails with
    ///   [`Conflict`](crate::StorageError::Conflict) if any live value is present.
    /// - **`expected: Some(value)`**: update-if-unchanged. Succeeds only when the
    ///   current value is a byte-for-byte match.
    ///
    /// A key whose TTL has elapsed is treated as absent.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Deletes a key. Deleting a missing key is a no-op.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Retrieves all live key-value pairs with `start <= key < end`, in key
    /// order. An empty `end` means unbounded.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_range(&self, start: &[u8], end: &[u8]) -> StorageResult<Vec<KeyValue>>;

    /// Retrieves all live key-value pairs whose key starts with `prefix`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn list_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let end = prefix_end(prefix);
        self.get_range(prefix, &end).await
    }

    /// Deletes every key starting with `prefix`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()>;

    /// Begins a new transaction.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>>;
}

/// Computes the exclusive upper bound of all keys starting with `prefix`.
///
/// Returns an empty vector (unbounded) when the prefix is empty or consists
/// solely of `0xFF` bytes.
#[must_use]
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    Vec::new()
}

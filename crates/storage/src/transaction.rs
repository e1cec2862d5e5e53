//! Transaction trait for atomic multi-key writes.
//!
//! Shard actors use transactions when one security decision touches more than
//! one key, e.g. a token-family record plus its issued-id index entry. Either
//! every write lands or none does.
//!
//! # Example
//!
//! ```
//! use keyward_storage::{MemoryBackend, StorageBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = MemoryBackend::new();
//!
//! let mut txn = backend.transaction().await.unwrap();
//! txn.set(b"family:u1:c1".to_vec(), b"{...}".to_vec());
//! txn.set(b"index:rtf_abc".to_vec(), b"u1:c1".to_vec());
//! txn.commit().await.unwrap();
//!
//! assert!(backend.get(b"index:rtf_abc").await.unwrap().is_some());
//! # });
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// Transaction handle for atomic multi-operation commits.
///
/// Operations are buffered until [`commit`](Transaction::commit). A
/// [`get`](Transaction::get) sees the transaction's own pending writes.
///
/// If a buffered compare-and-set precondition fails at commit time the whole
/// transaction is rejected with
/// [`StorageError::Conflict`](crate::StorageError::Conflict).
#[async_trait]
pub trait Transaction: Send {
    /// Gets a value, checking pending writes before the underlying storage.
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Buffers a set operation.
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Buffers a set operation with an expiry.
    fn set_with_ttl(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Duration);

    /// Buffers a delete operation.
    fn delete(&mut self, key: Vec<u8>);

    /// Buffers a compare-and-set, evaluated at commit time.
    fn compare_and_set(&mut self, key: Vec<u8>, expected: Option<Vec<u8>>, new_value: Vec<u8>);

    /// Applies every buffered operation atomically.
    async fn commit(self: Box<Self>) -> StorageResult<()>;
}

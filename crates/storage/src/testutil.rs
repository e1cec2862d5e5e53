//! Shared test utilities for storage-backed code.
//!
//! Feature-gated behind `testutil` so nothing here leaks into production
//! builds. Downstream crates enable it from `[dev-dependencies]`:
//!
//! ```toml
//! [dev-dependencies]
//! keyward-storage = { workspace = true, features = ["testutil"] }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    StorageBackend,
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
    transaction::Transaction,
    types::KeyValue,
};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"`; zero-padding keeps lexicographic
/// order equal to numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// Assert that a [`StorageResult`] is a [`StorageError::Conflict`].
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "expected StorageError::Conflict, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is `Ok`, yielding the inner value.
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got StorageError: {e:?}", $msg),
        }
    };
}

/// A [`MemoryBackend`] wrapper whose failures can be switched on at runtime.
///
/// - `fail_writes`: every direct write and every commit fails with
///   [`StorageError::Internal`]
/// - `fail_commits`: only transaction commits fail
/// - `transient_read_failures(n)`: the next `n` reads fail with
///   [`StorageError::Connection`]
#[derive(Clone, Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    fail_writes: Arc<AtomicBool>,
    fail_commits: Arc<AtomicBool>,
    pending_read_failures: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl FlakyBackend {
    /// Creates a healthy backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles failure of every write path.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Toggles failure of transaction commits.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` reads fail with a transient error.
    pub fn transient_read_failures(&self, count: usize) {
        self.pending_read_failures.store(count, Ordering::SeqCst);
    }

    /// Number of read calls observed so far.
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// The wrapped backend, for assertions that bypass injected failures.
    #[must_use]
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn check_write(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::internal("injected write failure"));
        }
        Ok(())
    }

    fn check_read(&self) -> StorageResult<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let took = self
            .pending_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(StorageError::connection("injected transient read failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.check_read()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.check_write()?;
        self.inner.set(key, value).await
    }

    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.check_write()?;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.check_write()?;
        self.inner.compare_and_set(key, expected, new_value).await
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.check_write()?;
        self.inner.delete(key).await
    }

    async fn get_range(&self, start: &[u8], end: &[u8]) -> StorageResult<Vec<KeyValue>> {
        self.check_read()?;
        self.inner.get_range(start, end).await
    }

    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()> {
        self.check_write()?;
        self.inner.clear_prefix(prefix).await
    }

    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        let inner = self.inner.transaction().await?;
        Ok(Box::new(FlakyTransaction { inner: tokio::sync::Mutex::new(inner), backend: self.clone() }))
    }
}

struct FlakyTransaction {
    // Wrapped in a mutex so `&FlakyTransaction` is `Sync`, as required for
    // the `Send` future returned by `get(&self)`.
    inner: tokio::sync::Mutex<Box<dyn Transaction>>,
    backend: FlakyBackend,
}

#[async_trait]
impl Transaction for FlakyTransaction {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.inner.lock().await.get(key).await
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.inner.get_mut().set(key, value);
    }

    fn set_with_ttl(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) {
        self.inner.get_mut().set_with_ttl(key, value, ttl);
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.inner.get_mut().delete(key);
    }

    fn compare_and_set(&mut self, key: Vec<u8>, expected: Option<Vec<u8>>, new_value: Vec<u8>) {
        self.inner.get_mut().compare_and_set(key, expected, new_value);
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        self.backend.check_write()?;
        if self.backend.fail_commits.load(Ordering::SeqCst) {
            return Err(StorageError::internal("injected commit failure"));
        }
        self.inner.into_inner().commit().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_make_key_ordering() {
        assert!(make_key("k", 1) < make_key("k", 10));
        assert_eq!(make_key("test", 42), b"test:000042");
    }

    #[tokio::test]
    async fn test_flaky_backend_transient_reads_then_recovers() {
        let backend = FlakyBackend::new();
        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        backend.transient_read_failures(1);

        let first = backend.get(b"k").await;
        assert!(first.as_ref().is_err_and(StorageError::is_transient));
        assert_eq!(backend.get(b"k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(backend.read_count(), 2);
    }

    #[tokio::test]
    async fn test_flaky_backend_write_failure() {
        let backend = FlakyBackend::new();
        backend.fail_writes(true);
        assert!(backend.set(b"k".to_vec(), b"v".to_vec()).await.is_err());
        assert!(backend.inner().get(b"k").await.unwrap().is_none());
    }

    #[test]
    fn test_assert_macros() {
        let conflict: StorageResult<()> = Err(StorageError::Conflict);
        assert_conflict!(conflict);
        let ok: StorageResult<i32> = Ok(42);
        assert_eq!(assert_storage_ok!(ok), 42);
    }
}

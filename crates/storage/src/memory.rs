//! In-memory storage backend implementation.
//!
//! [`MemoryBackend`] is the reference [`StorageBackend`]: ordered keys in a
//! [`BTreeMap`], per-key TTL, and buffered transactions. It backs tests and
//! single-process deployments of every collaborator store.
//!
//! # Example
//!
//! ```
//! use keyward_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"greeting".to_vec(), b"hello".to_vec()).await.unwrap();
//!     let value = backend.get(b"greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - TTL cleanup runs every second; reads filter expired keys immediately

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{select, sync::watch, time::sleep};

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    transaction::Transaction,
    types::KeyValue,
};

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the cleanup task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// In-memory storage backend using [`BTreeMap`].
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data.
///
/// # Shutdown
///
/// The background TTL cleanup task stops when the last clone is dropped, or
/// explicitly via [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
    ttl_data: Arc<RwLock<BTreeMap<Vec<u8>, Instant>>>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").field("keys", &self.data.read().len()).finish()
    }
}

impl MemoryBackend {
    /// Creates a new in-memory backend.
    ///
    /// Spawns a background task that removes expired keys; must be called
    /// from within a Tokio runtime.
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let backend = Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            ttl_data: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        let weak_data = Arc::downgrade(&backend.data);
        let weak_ttl = Arc::downgrade(&backend.ttl_data);
        tokio::spawn(async move {
            cleanup_expired_keys(weak_data, weak_ttl, shutdown_rx).await;
        });

        backend
    }

    /// Explicitly signals the background TTL cleanup task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Returns the number of stored keys, including expired keys not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn is_expired(&self, key: &[u8]) -> bool {
        let ttl_guard = self.ttl_data.read();
        ttl_guard.get(key).is_some_and(|expiry| *expiry <= Instant::now())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task removing expired keys once per second.
///
/// Holds only weak references so that dropping every clone of the backend
/// frees the data even before the shutdown signal is observed.
async fn cleanup_expired_keys(
    data: std::sync::Weak<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
    ttl_data: std::sync::Weak<RwLock<BTreeMap<Vec<u8>, Instant>>>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(Duration::from_secs(1)) => {}
            _ = shutdown_rx.changed() => return,
        }

        let (Some(data), Some(ttl_data)) = (data.upgrade(), ttl_data.upgrade()) else {
            return;
        };

        let now = Instant::now();
        let expired: Vec<Vec<u8>> = ttl_data
            .read()
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(key, _)| key.clone())
            .collect();

        if !expired.is_empty() {
            let mut data_guard = data.write();
            let mut ttl_guard = ttl_data.write();
            for key in expired {
                data_guard.remove(&key);
                ttl_guard.remove(&key);
            }
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[tracing::instrument(skip_all, level = "trace")]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        if self.is_expired(key) {
            return Ok(None);
        }
        Ok(self.data.read().get(key).cloned())
    }

    #[tracing::instrument(skip_all, level = "trace")]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        let mut data = self.data.write();
        let mut ttl_guard = self.ttl_data.write();
        ttl_guard.remove(&key);
        data.insert(key, Bytes::from(value));
        Ok(())
    }

    #[tracing::instrument(skip_all, level = "trace")]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        let mut data = self.data.write();
        let mut ttl_data = self.ttl_data.write();
        ttl_data.insert(key.clone(), Instant::now() + ttl);
        data.insert(key, Bytes::from(value));
        Ok(())
    }

    #[tracing::instrument(skip_all, level = "trace")]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        let mut data = self.data.write();
        let current = if self.is_expired(key) { None } else { data.get(key).cloned() };

        let matches = match (expected, &current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur[..],
            _ => false,
        };
        if !matches {
            return Err(StorageError::Conflict);
        }

        data.insert(key.to_vec(), Bytes::from(new_value));
        self.ttl_data.write().remove(key);
        Ok(())
    }

    #[tracing::instrument(skip_all, level = "trace")]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        let mut ttl_guard = self.ttl_data.write();
        data.remove(key);
        ttl_guard.remove(key);
        Ok(())
    }

    #[tracing::instrument(skip_all, level = "trace")]
    async fn get_range(&self, start: &[u8], end: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let upper = if end.is_empty() { Bound::Unbounded } else { Bound::Excluded(end) };
        let data = self.data.read();
        let results = data
            .range::<[u8], _>((Bound::Included(start), upper))
            .filter(|(key, _)| !self.is_expired(key))
            .map(|(k, v)| KeyValue::new(Bytes::copy_from_slice(k), v.clone()))
            .collect();
        Ok(results)
    }

    #[tracing::instrument(skip_all, level = "trace")]
    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()> {
        let keys: Vec<Vec<u8>> = {
            let data = self.data.read();
            data.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
        };
        if keys.is_empty() {
            return Ok(());
        }

        let mut data = self.data.write();
        let mut ttl_guard = self.ttl_data.write();
        for key in &keys {
            data.remove(key);
            ttl_guard.remove(key);
        }
        Ok(())
    }

    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction::new(self.clone())))
    }
}

/// A buffered write awaiting commit.
#[derive(Debug, Clone)]
enum PendingWrite {
    Set { value: Vec<u8>, ttl: Option<Duration> },
    Delete,
}

/// A compare-and-set operation verified at commit time.
#[derive(Debug, Clone)]
struct CasOperation {
    key: Vec<u8>,
    expected: Option<Vec<u8>>,
    new_value: Vec<u8>,
}

/// In-memory transaction: buffers writes until commit, read-your-writes.
struct MemoryTransaction {
    backend: MemoryBackend,
    pending_writes: BTreeMap<Vec<u8>, PendingWrite>,
    pending_cas: Vec<CasOperation>,
}

impl MemoryTransaction {
    fn new(backend: MemoryBackend) -> Self {
        Self { backend, pending_writes: BTreeMap::new(), pending_cas: Vec::new() }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        match self.pending_writes.get(key) {
            Some(PendingWrite::Set { value, .. }) => Ok(Some(Bytes::copy_from_slice(value))),
            Some(PendingWrite::Delete) => Ok(None),
            None => self.backend.get(key).await,
        }
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending_writes.insert(key, PendingWrite::Set { value, ttl: None });
    }

    fn set_with_ttl(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) {
        self.pending_writes.insert(key, PendingWrite::Set { value, ttl: Some(ttl) });
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.pending_writes.insert(key, PendingWrite::Delete);
    }

    fn compare_and_set(&mut self, key: Vec<u8>, expected: Option<Vec<u8>>, new_value: Vec<u8>) {
        self.pending_cas.push(CasOperation { key, expected, new_value });
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let mut data = self.backend.data.write();

        for cas in &self.pending_cas {
            let current =
                if self.backend.is_expired(&cas.key) { None } else { data.get(&cas.key).cloned() };
            let matches = match (&cas.expected, &current) {
                (None, None) => true,
                (Some(expected), Some(current)) => expected.as_slice() == &current[..],
                _ => false,
            };
            if !matches {
                return Err(StorageError::Conflict);
            }
        }

        let mut ttl_guard = self.backend.ttl_data.write();
        let now = Instant::now();

        for cas in self.pending_cas {
            ttl_guard.remove(&cas.key);
            data.insert(cas.key, Bytes::from(cas.new_value));
        }

        for (key, write) in self.pending_writes {
            match write {
                PendingWrite::Set { value, ttl } => {
                    match ttl {
                        Some(ttl) => {
                            ttl_guard.insert(key.clone(), now + ttl);
                        },
                        None => {
                            ttl_guard.remove(&key);
                        },
                    }
                    data.insert(key, Bytes::from(value));
                },
                PendingWrite::Delete => {
                    data.remove(&key);
                    ttl_guard.remove(&key);
                },
            }
        }

        Ok(())
    }
}

//! Ordered, size-bounded batch writes.
//!
//! [`BatchWriter`] queues puts and deletes and commits them in chunks, one
//! transaction per chunk. Chunks commit in queue order and flushing stops at
//! the first failed chunk, so a reader never sees a later entry without the
//! earlier ones. The audit store drains buffered events through it.
//!
//! ```
//! use std::sync::Arc;
//!
//! use keyward_storage::{BatchConfig, BatchWriter, MemoryBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let mut writer = BatchWriter::new(Arc::new(MemoryBackend::new()), BatchConfig::default());
//! writer.put(b"audit/0001".to_vec(), b"{}".to_vec());
//! writer.put(b"audit/0002".to_vec(), b"{}".to_vec());
//!
//! let stats = writer.flush().await.unwrap();
//! assert_eq!(stats.entries, 2);
//! # });
//! ```

use std::{collections::VecDeque, sync::Arc, time::Duration};

use fail::fail_point;
use tracing::{debug, warn};

use crate::{ConfigError, StorageBackend, StorageError, StorageResult};

/// Default number of entries per chunk.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Default encoded bytes per chunk (4 MiB).
pub const DEFAULT_MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;

/// Per-entry allowance added to key and value length.
const ENTRY_OVERHEAD: usize = 50;

/// Chunk limits for [`BatchWriter`].
#[derive(Debug, Clone)]
pub struct BatchConfig {
    max_batch_size: usize,
    max_batch_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_batch_size: DEFAULT_MAX_BATCH_SIZE, max_batch_bytes: DEFAULT_MAX_BATCH_BYTES }
    }
}

#[bon::bon]
impl BatchConfig {
    /// Creates validated chunk limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if either limit is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_BATCH_SIZE)] max_batch_size: usize,
        #[builder(default = DEFAULT_MAX_BATCH_BYTES)] max_batch_bytes: usize,
    ) -> Result<Self, ConfigError> {
        for (field, value) in [("max_batch_size", max_batch_size), ("max_batch_bytes", max_batch_bytes)] {
            if value == 0 {
                return Err(ConfigError::BelowMinimum { field, min: "1".into(), value: "0".into() });
            }
        }
        Ok(Self { max_batch_size, max_batch_bytes })
    }

    /// Entries per chunk.
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Encoded bytes per chunk. An entry larger than this gets a chunk of
    /// its own.
    #[must_use]
    pub fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Put { key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration> },
    Delete { key: Vec<u8> },
}

impl Entry {
    fn size(&self) -> usize {
        ENTRY_OVERHEAD
            + match self {
                Entry::Put { key, value, .. } => key.len() + value.len(),
                Entry::Delete { key } => key.len(),
            }
    }
}

/// Totals for one successful [`BatchWriter::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchFlushStats {
    /// Entries committed.
    pub entries: usize,
    /// Transactions used.
    pub chunks: usize,
    /// Approximate bytes committed.
    pub bytes: usize,
}

/// Queues writes and commits them in ordered chunks.
pub struct BatchWriter {
    backend: Arc<dyn StorageBackend>,
    config: BatchConfig,
    pending: VecDeque<Entry>,
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("pending", &self.pending.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BatchWriter {
    /// Creates an empty writer over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, config: BatchConfig) -> Self {
        Self { backend, config, pending: VecDeque::new() }
    }

    /// Queues a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending.push_back(Entry::Put { key, value, ttl: None });
    }

    /// Queues an expiring put.
    pub fn put_with_ttl(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) {
        self.pending.push_back(Entry::Put { key, value, ttl: Some(ttl) });
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.pending.push_back(Entry::Delete { key });
    }

    /// Entries not yet committed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Length of the next chunk: as many queued entries as fit the limits,
    /// and never zero while entries are queued.
    fn next_chunk_len(&self) -> (usize, usize) {
        let mut len = 0;
        let mut bytes = 0;
        for entry in &self.pending {
            let size = entry.size();
            if len > 0 && (len >= self.config.max_batch_size || bytes + size > self.config.max_batch_bytes) {
                break;
            }
            len += 1;
            bytes += size;
        }
        (len, bytes)
    }

    async fn commit_chunk(&self, len: usize) -> StorageResult<()> {
        let mut txn = self.backend.transaction().await?;
        for entry in self.pending.iter().take(len) {
            match entry.clone() {
                Entry::Put { key, value, ttl: None } => txn.set(key, value),
                Entry::Put { key, value, ttl: Some(ttl) } => txn.set_with_ttl(key, value, ttl),
                Entry::Delete { key } => txn.delete(key),
            }
        }
        fail_point!("batch-before-commit", |_| {
            Err(StorageError::internal("injected failure before batch commit"))
        });
        txn.commit().await
    }

    /// Commits every queued entry, chunk by chunk.
    ///
    /// # Errors
    ///
    /// Returns the error of the first chunk that fails to commit. Entries
    /// from that chunk onwards stay queued; a later call retries them.
    #[must_use = "a failed flush leaves entries queued"]
    pub async fn flush(&mut self) -> StorageResult<BatchFlushStats> {
        let mut stats = BatchFlushStats::default();
        while !self.pending.is_empty() {
            let (len, bytes) = self.next_chunk_len();
            if let Err(err) = self.commit_chunk(len).await {
                warn!(error = %err, committed = stats.entries, queued = self.pending.len(), "Batch chunk failed");
                return Err(err);
            }
            self.pending.drain(..len);
            stats.entries += len;
            stats.chunks += 1;
            stats.bytes += bytes;
        }
        if stats.entries > 0 {
            debug!(entries = stats.entries, chunks = stats.chunks, bytes = stats.bytes, "Flushed batch");
        }
        Ok(stats)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{MemoryBackend, testutil::FlakyBackend};

    #[test]
    fn test_zero_limits_rejected() {
        let err = BatchConfig::builder().max_batch_size(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "max_batch_size", .. }));
        let err = BatchConfig::builder().max_batch_bytes(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "max_batch_bytes", .. }));
    }

    #[tokio::test]
    async fn test_flush_commits_everything() {
        let backend = Arc::new(MemoryBackend::new());
        let mut writer = BatchWriter::new(backend.clone(), BatchConfig::default());
        writer.put(b"a".to_vec(), b"1".to_vec());
        writer.put_with_ttl(b"b".to_vec(), b"2".to_vec(), Duration::from_secs(60));
        writer.delete(b"a".to_vec());

        let stats = writer.flush().await.unwrap();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.chunks, 1);
        assert_eq!(writer.pending(), 0);
        assert!(backend.get(b"a").await.unwrap().is_none());
        assert!(backend.get(b"b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_chunks_respect_count_and_bytes() {
        let backend = Arc::new(MemoryBackend::new());
        let config = BatchConfig::builder().max_batch_size(2).build().unwrap();
        let mut writer = BatchWriter::new(backend.clone(), config);
        for i in 0..5u8 {
            writer.put(vec![i], vec![i]);
        }
        assert_eq!(writer.flush().await.unwrap().chunks, 3);

        let config = BatchConfig::builder().max_batch_bytes(ENTRY_OVERHEAD + 10).build().unwrap();
        let mut writer = BatchWriter::new(backend, config);
        writer.put(b"big".to_vec(), vec![0; 64]);
        writer.put(b"s".to_vec(), b"1".to_vec());
        writer.put(b"t".to_vec(), b"2".to_vec());
        assert_eq!(writer.flush().await.unwrap().chunks, 3);
    }

    #[tokio::test]
    async fn test_failed_chunk_stays_queued() {
        let backend = FlakyBackend::new();
        let config = BatchConfig::builder().max_batch_size(1).build().unwrap();
        let mut writer = BatchWriter::new(Arc::new(backend.clone()), config);
        writer.put(b"x".to_vec(), b"1".to_vec());
        writer.put(b"y".to_vec(), b"2".to_vec());

        backend.fail_commits(true);
        assert!(writer.flush().await.is_err());
        assert_eq!(writer.pending(), 2);

        backend.fail_commits(false);
        assert_eq!(writer.flush().await.unwrap().entries, 2);
        assert!(backend.inner().get(b"y").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let mut writer = BatchWriter::new(Arc::new(MemoryBackend::new()), BatchConfig::default());
        assert_eq!(writer.flush().await.unwrap(), BatchFlushStats::default());
    }
}

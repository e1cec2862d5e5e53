//! Per-actor key-value view over a shared backend.
//!
//! Every shard actor owns a private namespace `actors/<instance>/` inside one
//! [`StorageBackend`]. [`ScopedStore`] hides the prefix and gives actors a
//! JSON-typed API plus atomic multi-key writes.
//!
//! ```
//! use std::sync::Arc;
//!
//! use keyward_storage::{MemoryBackend, ScopedStore};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = Arc::new(MemoryBackend::new());
//! let store = ScopedStore::new(backend, "acme:enam:rtf:2");
//!
//! store.put_json("counter/login", &7u32).await.unwrap();
//! assert_eq!(store.get_json::<u32>("counter/login").await.unwrap(), Some(7));
//! assert_eq!(store.prefix(), "actors/acme:enam:rtf:2/");
//! # });
//! ```

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{StorageBackend, StorageError, StorageResult};

/// Root prefix of all actor-owned keys.
pub const ACTORS_PREFIX: &str = "actors/";

/// One write in an atomic [`ScopedStore::write_batch`].
#[derive(Debug, Clone)]
pub enum ScopedWrite {
    /// Store `value` under `key`, optionally expiring.
    Put {
        /// Key relative to the actor prefix.
        key: String,
        /// Encoded value.
        value: Vec<u8>,
        /// Expiry, if any.
        ttl: Option<Duration>,
    },
    /// Remove `key`.
    Delete {
        /// Key relative to the actor prefix.
        key: String,
    },
}

impl ScopedWrite {
    /// JSON-encodes `value` into a non-expiring put.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if encoding fails.
    pub fn put_json<T: Serialize>(key: impl Into<String>, value: &T) -> StorageResult<Self> {
        Ok(Self::Put { key: key.into(), value: serde_json::to_vec(value)?, ttl: None })
    }

    /// JSON-encodes `value` into a put that expires after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if encoding fails.
    pub fn put_json_with_ttl<T: Serialize>(
        key: impl Into<String>,
        value: &T,
        ttl: Duration,
    ) -> StorageResult<Self> {
        Ok(Self::Put { key: key.into(), value: serde_json::to_vec(value)?, ttl: Some(ttl) })
    }

    /// Removes `key`.
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

fn escape_segment(segment: &str) -> std::borrow::Cow<'_, str> {
    if !segment.contains(['%', '/']) {
        return segment.into();
    }
    let mut escaped = String::with_capacity(segment.len() + 8);
    for ch in segment.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            _ => escaped.push(ch),
        }
    }
    escaped.into()
}

/// A [`StorageBackend`] view restricted to one actor's key prefix.
#[derive(Clone)]
pub struct ScopedStore {
    backend: Arc<dyn StorageBackend>,
    prefix: String,
}

impl std::fmt::Debug for ScopedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStore").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

impl ScopedStore {
    /// Creates a view over `actors/<instance>/`.
    ///
    /// `%` and `/` in `instance` are percent-encoded, so distinct instances
    /// always get disjoint namespaces and no view is nested in another.
    pub fn new(backend: Arc<dyn StorageBackend>, instance: impl AsRef<str>) -> Self {
        let prefix = format!("{ACTORS_PREFIX}{}/", escape_segment(instance.as_ref()));
        Self { backend, prefix }
    }

    /// Returns the absolute key prefix of this view.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(self.prefix.as_bytes());
        full.extend_from_slice(key.as_bytes());
        full
    }

    /// Reads the raw value under `key`.
    pub async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        self.backend.get(&self.full_key(key)).await
    }

    /// Reads and JSON-decodes the value under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if the stored bytes do not
    /// decode as `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// JSON-encodes and stores `value` under `key`.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        self.backend.set(self.full_key(key), serde_json::to_vec(value)?).await
    }

    /// JSON-encodes and stores `value` under `key`, expiring after `ttl`.
    pub async fn put_json_with_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.backend.set_with_ttl(self.full_key(key), serde_json::to_vec(value)?, ttl).await
    }

    /// Removes `key`.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        self.backend.delete(&self.full_key(key)).await
    }

    /// Lists live entries whose relative key starts with `prefix`, in key
    /// order. Returned keys are relative to the actor prefix.
    pub async fn list(&self, prefix: &str) -> StorageResult<Vec<(String, Bytes)>> {
        let entries = self.backend.list_prefix(&self.full_key(prefix)).await?;
        entries
            .into_iter()
            .map(|kv| {
                let relative = kv.key.get(self.prefix.len()..).unwrap_or_default();
                let relative = String::from_utf8(relative.to_vec())
                    .map_err(|e| StorageError::serialization_with_source("non-UTF-8 actor key", e))?;
                Ok((relative, kv.value))
            })
            .collect()
    }

    /// Lists and JSON-decodes entries whose relative key starts with `prefix`.
    pub async fn list_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> StorageResult<Vec<(String, T)>> {
        self.list(prefix)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                let value = decode(&key, &bytes)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Applies every write atomically: all land or none do.
    pub async fn write_batch(&self, writes: Vec<ScopedWrite>) -> StorageResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut txn = self.backend.transaction().await?;
        for write in writes {
            match write {
                ScopedWrite::Put { key, value, ttl: None } => txn.set(self.full_key(&key), value),
                ScopedWrite::Put { key, value, ttl: Some(ttl) } => {
                    txn.set_with_ttl(self.full_key(&key), value, ttl);
                },
                ScopedWrite::Delete { key } => txn.delete(self.full_key(&key)),
            }
        }
        txn.commit().await
    }

    /// Removes every key owned by this actor.
    pub async fn clear(&self) -> StorageResult<()> {
        self.backend.clear_prefix(self.prefix.as_bytes()).await
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StorageResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| StorageError::serialization_with_source(format!("corrupt record at {key}"), e))
}

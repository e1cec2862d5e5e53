//! Region-Shard Directory.
//!
//! Persists one [`RegionShardConfig`] JSON document per tenant at
//! `directory/<tenant>` in the shared configuration store and caches it
//! in-process for a short TTL.
//!
//! Writes always produce a new generation. They are validated against the
//! [`ResourceTypeTable`] before anything is persisted, then applied with a
//! compare-and-set against the document they were derived from, so two
//! concurrent writers can never both win. A reader holding a stale cached
//! document still routes new resources consistently within that older
//! generation; existing resources are unaffected because their generation
//! travels inside the identifier.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use keyward_storage::{StorageBackend, StorageError, TenantId, with_retry};
use moka::future::Cache;
use tracing::{debug, info, warn};

use crate::{
    config::DirectoryConfig,
    error::{Result, ShardingError},
    region::RegionKey,
    resource_type::ResourceTypeTable,
    topology::{ColocationGroup, RegionShardConfig},
};

/// Key prefix of topology documents in the configuration store.
pub const DIRECTORY_PREFIX: &str = "directory/";

/// Attempts at a compare-and-set write before giving up with a conflict.
const MAX_CAS_ATTEMPTS: usize = 5;

/// Cached, validated access to per-tenant topology.
pub struct RegionShardDirectory {
    store: Arc<dyn StorageBackend>,
    types: Arc<ResourceTypeTable>,
    config: DirectoryConfig,
    cache: Cache<TenantId, Arc<RegionShardConfig>>,
}

impl std::fmt::Debug for RegionShardDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionShardDirectory")
            .field("config", &self.config)
            .field("cached_tenants", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl RegionShardDirectory {
    /// Creates a directory over the shared configuration store.
    #[must_use]
    pub fn new(
        store: Arc<dyn StorageBackend>,
        types: Arc<ResourceTypeTable>,
        config: DirectoryConfig,
    ) -> Self {
        let cache = Cache::builder()
            .time_to_live(config.cache_ttl().max(std::time::Duration::from_millis(1)))
            .max_capacity(config.cache_capacity())
            .build();
        Self { store, types, config, cache }
    }

    /// The resource type table topology is validated against.
    #[must_use]
    pub fn types(&self) -> &Arc<ResourceTypeTable> {
        &self.types
    }

    fn key(tenant: &TenantId) -> Vec<u8> {
        format!("{DIRECTORY_PREFIX}{tenant}").into_bytes()
    }

    /// Returns the tenant's current topology.
    ///
    /// A tenant without a document is bootstrapped with a single-region
    /// generation 1 built from the configured defaults.
    ///
    /// # Errors
    ///
    /// - [`ShardingError::ConfigurationInvalid`] if strict mode is on and the
    ///   stored document violates an invariant (fail closed)
    /// - [`ShardingError::Storage`] if the store stays unavailable after retries
    #[tracing::instrument(skip(self), fields(tenant = %tenant))]
    pub async fn current(&self, tenant: &TenantId) -> Result<Arc<RegionShardConfig>> {
        if let Some(cached) = self.cache.get(tenant).await {
            return Ok(cached);
        }

        let config = match self.load(tenant).await? {
            Some((_, config)) => config,
            None => self.bootstrap(tenant).await?,
        };
        let config = Arc::new(config);
        self.remember(tenant, Arc::clone(&config)).await;
        Ok(config)
    }

    /// Writes a new generation with `total_shards` split across regions by
    /// percentage.
    ///
    /// # Errors
    ///
    /// - [`ShardingError::ConfigurationInvalid`] if the new topology is invalid;
    ///   nothing is persisted
    /// - [`ShardingError::Storage`] on store failure or persistent write contention
    #[tracing::instrument(skip(self, split), fields(tenant = %tenant))]
    pub async fn write_generation(
        &self,
        tenant: &TenantId,
        total_shards: u32,
        split: &[(RegionKey, u32)],
    ) -> Result<Arc<RegionShardConfig>> {
        let written = self
            .update(tenant, |current| match current {
                Some(current) => current.next_generation(total_shards, split, Utc::now()),
                None => RegionShardConfig::with_split(total_shards, split, Utc::now()),
            })
            .await?;
        info!(
            tenant = %tenant,
            generation = written.current_generation,
            total_shards,
            "Wrote new shard generation"
        );
        Ok(written)
    }

    /// Adds or replaces a colocation group, producing a new generation.
    ///
    /// # Errors
    ///
    /// Same as [`write_generation`](Self::write_generation). A group that
    /// would split colocated types across shard counts is rejected here, at
    /// write time.
    #[tracing::instrument(skip(self, group), fields(tenant = %tenant, group = %group.name))]
    pub async fn put_colocation_group(
        &self,
        tenant: &TenantId,
        group: ColocationGroup,
    ) -> Result<Arc<RegionShardConfig>> {
        let defaults = (self.config.default_total_shards(), self.config.default_region());
        self.update(tenant, |current| {
            let base = match current {
                Some(current) => current.clone(),
                None => RegionShardConfig::initial(defaults.0, defaults.1, Utc::now())?,
            };
            Ok(base.with_colocation_group(group.clone(), Utc::now()))
        })
        .await
    }

    /// Drops the cached document for `tenant`.
    pub async fn invalidate(&self, tenant: &TenantId) {
        self.cache.invalidate(tenant).await;
    }

    async fn remember(&self, tenant: &TenantId, config: Arc<RegionShardConfig>) {
        if !self.config.cache_ttl().is_zero() {
            self.cache.insert(tenant.clone(), config).await;
        }
    }

    /// Reads the stored document and, in strict mode, validates it.
    async fn load(&self, tenant: &TenantId) -> Result<Option<(Bytes, RegionShardConfig)>> {
        let stored = self.fetch(tenant).await?;
        if self.config.strict()
            && let Some((_, config)) = &stored
            && let Err(err) = config.validate(&self.types)
        {
            warn!(tenant = %tenant, error = %err, "Stored topology failed validation; refusing to route");
            return Err(err);
        }
        Ok(stored)
    }

    /// Reads and decodes the stored document, retrying transient failures.
    async fn fetch(&self, tenant: &TenantId) -> Result<Option<(Bytes, RegionShardConfig)>> {
        let key = Self::key(tenant);
        let raw = with_retry(self.config.retry(), "directory_load", || self.store.get(&key)).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let config: RegionShardConfig = serde_json::from_slice(&raw).map_err(|e| {
            StorageError::serialization_with_source(format!("corrupt directory document for {tenant}"), e)
        })?;
        Ok(Some((raw, config)))
    }

    async fn bootstrap(&self, tenant: &TenantId) -> Result<RegionShardConfig> {
        let initial = RegionShardConfig::initial(
            self.config.default_total_shards(),
            self.config.default_region(),
            Utc::now(),
        )?;
        initial.validate(&self.types)?;
        let encoded = serde_json::to_vec(&initial).map_err(StorageError::from)?;

        match self.store.compare_and_set(&Self::key(tenant), None, encoded).await {
            Ok(()) => {
                info!(tenant = %tenant, "Bootstrapped shard directory");
                Ok(initial)
            },
            // Another process bootstrapped first; use theirs.
            Err(StorageError::Conflict) => self
                .load(tenant)
                .await?
                .map(|(_, config)| config)
                .ok_or_else(|| ShardingError::Storage(StorageError::Conflict)),
            Err(other) => Err(other.into()),
        }
    }

    /// Derives a new document from the stored one and writes it with
    /// compare-and-set, retrying on contention.
    async fn update<F>(&self, tenant: &TenantId, derive: F) -> Result<Arc<RegionShardConfig>>
    where
        F: Fn(Option<&RegionShardConfig>) -> Result<RegionShardConfig>,
    {
        let key = Self::key(tenant);
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let stored = self.fetch(tenant).await?;
            let next = derive(stored.as_ref().map(|(_, config)| config))?;
            next.validate(&self.types)?;
            let encoded = serde_json::to_vec(&next).map_err(StorageError::from)?;

            let expected = stored.as_ref().map(|(raw, _)| raw.as_ref());
            match self.store.compare_and_set(&key, expected, encoded).await {
                Ok(()) => {
                    let next = Arc::new(next);
                    self.cache.invalidate(tenant).await;
                    self.remember(tenant, Arc::clone(&next)).await;
                    return Ok(next);
                },
                Err(StorageError::Conflict) => {
                    debug!(tenant = %tenant, attempt, "Directory write lost a race; re-reading");
                },
                Err(other) => return Err(other.into()),
            }
        }
        Err(ShardingError::Storage(StorageError::Conflict))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use keyward_storage::{MemoryBackend, testutil::FlakyBackend};

    use super::*;
    use crate::{resource_type::TypePrefix, topology::RegionRange};

    fn directory(store: Arc<dyn StorageBackend>, config: DirectoryConfig) -> RegionShardDirectory {
        RegionShardDirectory::new(store, Arc::new(ResourceTypeTable::default()), config)
    }

    fn no_cache() -> DirectoryConfig {
        DirectoryConfig::builder().cache_ttl(Duration::ZERO).build().unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_uses_defaults_and_persists() {
        let store: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let dir = directory(Arc::clone(&store), DirectoryConfig::default());
        let tenant = TenantId::parse("acme").unwrap();

        let config = dir.current(&tenant).await.unwrap();
        assert_eq!(config.current_generation, 1);
        assert_eq!(config.current_total_shards, 4);
        assert_eq!(config.region_for_shard(3, 4).unwrap(), RegionKey::Enam);
        assert!(store.get(b"directory/acme").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_write_generation_invalidates_cache() {
        let dir = directory(Arc::new(MemoryBackend::new()), DirectoryConfig::default());
        let tenant = TenantId::parse("acme").unwrap();
        assert_eq!(dir.current(&tenant).await.unwrap().current_generation, 1);

        dir.write_generation(&tenant, 8, &[(RegionKey::Apac, 50), (RegionKey::Enam, 50)])
            .await
            .unwrap();
        let current = dir.current(&tenant).await.unwrap();
        assert_eq!(current.current_generation, 2);
        assert_eq!(current.current_total_shards, 8);
    }

    #[tokio::test]
    async fn test_invalid_generation_is_not_persisted() {
        let dir = directory(Arc::new(MemoryBackend::new()), no_cache());
        let tenant = TenantId::parse("acme").unwrap();
        dir.current(&tenant).await.unwrap();

        let err = dir.write_generation(&tenant, 4, &[(RegionKey::Apac, 70)]).await.unwrap_err();
        assert!(matches!(err, ShardingError::ConfigurationInvalid { .. }));
        assert_eq!(dir.current(&tenant).await.unwrap().current_generation, 1);
    }

    #[tokio::test]
    async fn test_colocation_mismatch_rejected_at_write_time() {
        let dir = directory(Arc::new(MemoryBackend::new()), no_cache());
        let tenant = TenantId::parse("acme").unwrap();

        let partial = ColocationGroup {
            name: "partial".into(),
            resource_types: [TypePrefix::CHALLENGE].into(),
            total_shards: 16,
        };
        let err = dir.put_colocation_group(&tenant, partial).await.unwrap_err();
        assert!(matches!(err, ShardingError::ConfigurationInvalid { .. }));
    }

    #[tokio::test]
    async fn test_strict_read_fails_closed_on_corrupt_topology() {
        let store: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let tenant = TenantId::parse("acme").unwrap();
        let mut broken = RegionShardConfig::initial(4, RegionKey::Apac, Utc::now()).unwrap();
        broken.current_regions.insert(
            RegionKey::Apac,
            RegionRange { start_shard: 0, end_shard: 2, shard_count: 2 },
        );
        store.set(b"directory/acme".to_vec(), serde_json::to_vec(&broken).unwrap()).await.unwrap();

        let strict = directory(Arc::clone(&store), no_cache());
        assert!(matches!(
            strict.current(&tenant).await,
            Err(ShardingError::ConfigurationInvalid { .. })
        ));

        let lenient = directory(
            Arc::clone(&store),
            DirectoryConfig::builder().cache_ttl(Duration::ZERO).strict(false).build().unwrap(),
        );
        assert!(lenient.current(&tenant).await.is_ok());
    }

    #[tokio::test]
    async fn test_transient_load_failures_are_retried() {
        let flaky = Arc::new(FlakyBackend::new());
        let dir = directory(flaky.clone(), no_cache());
        flaky.transient_read_failures(2);

        let config = dir.current(&TenantId::parse("acme").unwrap()).await.unwrap();
        assert_eq!(config.current_generation, 1);
        assert!(flaky.read_count() >= 3);
    }

    #[tokio::test]
    async fn test_concurrent_writers_produce_distinct_generations() {
        let dir = Arc::new(directory(Arc::new(MemoryBackend::new()), no_cache()));
        let tenant = TenantId::parse("acme").unwrap();
        dir.current(&tenant).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for total in [4u32, 6, 8] {
            let dir = Arc::clone(&dir);
            let tenant = tenant.clone();
            tasks.spawn(async move {
                dir.write_generation(&tenant, total, &[(RegionKey::Oc, 100)]).await.map(|c| c.current_generation)
            });
        }
        let mut generations = Vec::new();
        while let Some(result) = tasks.join_next().await {
            generations.push(result.unwrap().unwrap());
        }
        generations.sort_unstable();
        assert_eq!(generations, vec![2, 3, 4]);
    }
}

//! Directory configuration.

use std::time::Duration;

use keyward_storage::{ConfigError, RetryConfig};
use serde::{Deserialize, Serialize};

use crate::region::RegionKey;

/// Default lifetime of a cached topology document.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10);

/// Default shard count of a tenant's bootstrap generation.
pub const DEFAULT_TOTAL_SHARDS: u32 = 4;

/// Default region of a tenant's bootstrap generation.
pub const DEFAULT_REGION: RegionKey = RegionKey::Enam;

/// Maximum number of cached tenant documents.
const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// Configuration for [`RegionShardDirectory`](crate::RegionShardDirectory).
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use keyward_sharding::{DirectoryConfig, RegionKey};
///
/// let config = DirectoryConfig::builder()
///     .cache_ttl(Duration::from_secs(2))
///     .default_region(RegionKey::Weur)
///     .build()
///     .unwrap();
/// assert!(config.strict());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    cache_ttl: Duration,

    #[serde(default = "default_cache_capacity")]
    cache_capacity: u64,

    #[serde(default = "default_strict")]
    strict: bool,

    #[serde(default = "default_total_shards")]
    default_total_shards: u32,

    #[serde(default = "default_region")]
    default_region: RegionKey,

    #[serde(default)]
    retry: RetryConfig,
}

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_cache_capacity() -> u64 {
    DEFAULT_CACHE_CAPACITY
}

fn default_strict() -> bool {
    true
}

fn default_total_shards() -> u32 {
    DEFAULT_TOTAL_SHARDS
}

fn default_region() -> RegionKey {
    DEFAULT_REGION
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            strict: true,
            default_total_shards: DEFAULT_TOTAL_SHARDS,
            default_region: DEFAULT_REGION,
            retry: RetryConfig::default(),
        }
    }
}

#[bon::bon]
impl DirectoryConfig {
    /// Creates a validated directory configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `cache_capacity` or `default_total_shards`
    /// is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CACHE_TTL)] cache_ttl: Duration,
        #[builder(default = DEFAULT_CACHE_CAPACITY)] cache_capacity: u64,
        #[builder(default = true)] strict: bool,
        #[builder(default = DEFAULT_TOTAL_SHARDS)] default_total_shards: u32,
        #[builder(default = DEFAULT_REGION)] default_region: RegionKey,
        #[builder(default)] retry: RetryConfig,
    ) -> Result<Self, ConfigError> {
        if cache_capacity == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "cache_capacity",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if default_total_shards == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "default_total_shards",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(Self { cache_ttl, cache_capacity, strict, default_total_shards, default_region, retry })
    }

    /// How long a topology document stays cached. Zero disables caching.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Maximum number of cached tenants.
    #[must_use]
    pub fn cache_capacity(&self) -> u64 {
        self.cache_capacity
    }

    /// Whether documents are re-validated when read from the store.
    #[must_use]
    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Shard count of a tenant's bootstrap generation.
    #[must_use]
    pub fn default_total_shards(&self) -> u32 {
        self.default_total_shards
    }

    /// Region of a tenant's bootstrap generation.
    #[must_use]
    pub fn default_region(&self) -> RegionKey {
        self.default_region
    }

    /// Retry policy for loads from the configuration store.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DirectoryConfig::default();
        assert_eq!(config.cache_ttl(), Duration::from_secs(10));
        assert!(config.strict());
        assert_eq!(config.default_total_shards(), 4);
        assert_eq!(config.default_region(), RegionKey::Enam);
    }

    #[test]
    fn test_zero_shards_rejected() {
        let err = DirectoryConfig::builder().default_total_shards(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "default_total_shards", .. }));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: DirectoryConfig =
            serde_json::from_str(r#"{"cache_ttl":"250ms","strict":false,"default_region":"apac"}"#)
                .unwrap();
        assert_eq!(config.cache_ttl(), Duration::from_millis(250));
        assert!(!config.strict());
        assert_eq!(config.default_region(), RegionKey::Apac);
        assert_eq!(config.default_total_shards(), DEFAULT_TOTAL_SHARDS);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_json::from_str::<DirectoryConfig>(r#"{"shards":3}"#).is_err());
    }
}

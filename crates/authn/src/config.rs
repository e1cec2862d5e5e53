//! Primitive configuration.
//!
//! Every struct deserialises from JSON/TOML with humantime durations and
//! per-field defaults, and has a validating builder.
//!
//! ```
//! use std::time::Duration;
//!
//! use keyward_authn::config::{PollingConfig, PrimitivesConfig};
//!
//! let config = PrimitivesConfig::builder()
//!     .polling(PollingConfig::builder().max_polls(30).build().unwrap())
//!     .sweep_interval(Duration::from_secs(10))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.polling().max_polls(), 30);
//! assert_eq!(config.replay().server_max_ttl(), Duration::from_secs(3600));
//! ```

use std::time::Duration;

use keyward_storage::ConfigError;
use serde::{Deserialize, Serialize};

/// Hard upper bound on any replay record lifetime.
pub const MAX_REPLAY_TTL: Duration = Duration::from_secs(3600);

const DEFAULT_CLOCK_SKEW_BUDGET: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_POLLS: u32 = 120;
const DEFAULT_OVERLAP_PERIOD: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_REVOKED_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);
const DEFAULT_AUDIT_MAX_BATCH: usize = 100;
const DEFAULT_AUDIT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_AUDIT_MAX_BUFFERED: usize = 10_000;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::BelowMinimum { field, min: "1ms".into(), value: "0s".into() });
    }
    Ok(())
}

fn non_zero_count(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::BelowMinimum { field, min: "1".into(), value: "0".into() });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Replay guard
// ---------------------------------------------------------------------------

/// Lifetimes of replay records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayConfig {
    #[serde(with = "humantime_serde", default = "default_server_max_ttl")]
    server_max_ttl: Duration,

    #[serde(with = "humantime_serde", default = "default_clock_skew_budget")]
    clock_skew_budget: Duration,
}

fn default_server_max_ttl() -> Duration {
    MAX_REPLAY_TTL
}

fn default_clock_skew_budget() -> Duration {
    DEFAULT_CLOCK_SKEW_BUDGET
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { server_max_ttl: MAX_REPLAY_TTL, clock_skew_budget: DEFAULT_CLOCK_SKEW_BUDGET }
    }
}

#[bon::bon]
impl ReplayConfig {
    /// Creates a validated replay configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `server_max_ttl` is zero or either value
    /// exceeds [`MAX_REPLAY_TTL`].
    #[builder]
    pub fn new(
        #[builder(default = MAX_REPLAY_TTL)] server_max_ttl: Duration,
        #[builder(default = DEFAULT_CLOCK_SKEW_BUDGET)] clock_skew_budget: Duration,
    ) -> Result<Self, ConfigError> {
        non_zero("server_max_ttl", server_max_ttl)?;
        for (field, value) in [("server_max_ttl", server_max_ttl), ("clock_skew_budget", clock_skew_budget)] {
            if value > MAX_REPLAY_TTL {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("must not exceed {MAX_REPLAY_TTL:?}, got {value:?}"),
                });
            }
        }
        Ok(Self { server_max_ttl, clock_skew_budget })
    }

    /// Longest lifetime the server grants a record before skew.
    #[must_use]
    pub fn server_max_ttl(&self) -> Duration {
        self.server_max_ttl
    }

    /// Extra lifetime covering clock differences between issuers and us.
    #[must_use]
    pub fn clock_skew_budget(&self) -> Duration {
        self.clock_skew_budget
    }
}

// ---------------------------------------------------------------------------
// Polling consumables
// ---------------------------------------------------------------------------

/// Device and backchannel polling policy.
///
/// A client polling faster than the current interval has the interval raised
/// by `slow_down_increment` (linearly). After `max_polls` polls the item
/// force-expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    default_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_slow_down_increment")]
    slow_down_increment: Duration,

    #[serde(default = "default_max_polls")]
    max_polls: u32,
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_slow_down_increment() -> Duration {
    DEFAULT_SLOW_DOWN_INCREMENT
}

fn default_max_polls() -> u32 {
    DEFAULT_MAX_POLLS
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval: DEFAULT_POLL_INTERVAL,
            slow_down_increment: DEFAULT_SLOW_DOWN_INCREMENT,
            max_polls: DEFAULT_MAX_POLLS,
        }
    }
}

#[bon::bon]
impl PollingConfig {
    /// Creates a validated polling policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any value is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_POLL_INTERVAL)] default_interval: Duration,
        #[builder(default = DEFAULT_SLOW_DOWN_INCREMENT)] slow_down_increment: Duration,
        #[builder(default = DEFAULT_MAX_POLLS)] max_polls: u32,
    ) -> Result<Self, ConfigError> {
        non_zero("default_interval", default_interval)?;
        non_zero("slow_down_increment", slow_down_increment)?;
        non_zero_count("max_polls", u64::from(max_polls))?;
        Ok(Self { default_interval, slow_down_increment, max_polls })
    }

    /// Interval advertised to a new polling client.
    #[must_use]
    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Amount the interval grows on each too-fast poll.
    #[must_use]
    pub fn slow_down_increment(&self) -> Duration {
        self.slow_down_increment
    }

    /// Polls allowed before the item force-expires.
    #[must_use]
    pub fn max_polls(&self) -> u32 {
        self.max_polls
    }
}

// ---------------------------------------------------------------------------
// Signing keys
// ---------------------------------------------------------------------------

/// Signing key retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    #[serde(with = "humantime_serde", default = "default_overlap_period")]
    overlap_period: Duration,

    #[serde(with = "humantime_serde", default = "default_revoked_retention")]
    revoked_retention: Duration,
}

fn default_overlap_period() -> Duration {
    DEFAULT_OVERLAP_PERIOD
}

fn default_revoked_retention() -> Duration {
    DEFAULT_REVOKED_RETENTION
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self { overlap_period: DEFAULT_OVERLAP_PERIOD, revoked_retention: DEFAULT_REVOKED_RETENTION }
    }
}

#[bon::bon]
impl KeyConfig {
    /// Creates a validated key retention policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if either period is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_OVERLAP_PERIOD)] overlap_period: Duration,
        #[builder(default = DEFAULT_REVOKED_RETENTION)] revoked_retention: Duration,
    ) -> Result<Self, ConfigError> {
        non_zero("overlap_period", overlap_period)?;
        non_zero("revoked_retention", revoked_retention)?;
        Ok(Self { overlap_period, revoked_retention })
    }

    /// How long a demoted key stays in the verification set. Must cover the
    /// longest lifetime of a token it signed.
    #[must_use]
    pub fn overlap_period(&self) -> Duration {
        self.overlap_period
    }

    /// How long a revoked key is kept for audit before it is purged.
    #[must_use]
    pub fn revoked_retention(&self) -> Duration {
        self.revoked_retention
    }
}

// ---------------------------------------------------------------------------
// Audit sidecar
// ---------------------------------------------------------------------------

/// Informational audit buffering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default = "default_audit_max_batch")]
    max_batch: usize,

    #[serde(with = "humantime_serde", default = "default_audit_flush_interval")]
    flush_interval: Duration,

    #[serde(default = "default_audit_max_buffered")]
    max_buffered: usize,
}

fn default_audit_max_batch() -> usize {
    DEFAULT_AUDIT_MAX_BATCH
}

fn default_audit_flush_interval() -> Duration {
    DEFAULT_AUDIT_FLUSH_INTERVAL
}

fn default_audit_max_buffered() -> usize {
    DEFAULT_AUDIT_MAX_BUFFERED
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_batch: DEFAULT_AUDIT_MAX_BATCH,
            flush_interval: DEFAULT_AUDIT_FLUSH_INTERVAL,
            max_buffered: DEFAULT_AUDIT_MAX_BUFFERED,
        }
    }
}

#[bon::bon]
impl AuditConfig {
    /// Creates a validated audit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_batch` or `flush_interval` is zero,
    /// or `max_buffered` is below `max_batch`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_AUDIT_MAX_BATCH)] max_batch: usize,
        #[builder(default = DEFAULT_AUDIT_FLUSH_INTERVAL)] flush_interval: Duration,
        #[builder(default = DEFAULT_AUDIT_MAX_BUFFERED)] max_buffered: usize,
    ) -> Result<Self, ConfigError> {
        non_zero_count("max_batch", max_batch as u64)?;
        non_zero("flush_interval", flush_interval)?;
        if max_buffered < max_batch {
            return Err(ConfigError::BelowMinimum {
                field: "max_buffered",
                min: max_batch.to_string(),
                value: max_buffered.to_string(),
            });
        }
        Ok(Self { max_batch, flush_interval, max_buffered })
    }

    /// Buffered events that trigger an early flush.
    #[must_use]
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Longest time an informational event waits in the buffer.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Most informational events held at once. Further events are dropped
    /// and counted.
    #[must_use]
    pub fn max_buffered(&self) -> usize {
        self.max_buffered
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Configuration for every security primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrimitivesConfig {
    #[serde(default)]
    replay: ReplayConfig,

    #[serde(default)]
    polling: PollingConfig,

    #[serde(default)]
    keys: KeyConfig,

    #[serde(default)]
    audit: AuditConfig,

    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    sweep_interval: Duration,
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

impl Default for PrimitivesConfig {
    fn default() -> Self {
        Self {
            replay: ReplayConfig::default(),
            polling: PollingConfig::default(),
            keys: KeyConfig::default(),
            audit: AuditConfig::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[bon::bon]
impl PrimitivesConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `sweep_interval` is zero.
    #[builder]
    pub fn new(
        #[builder(default)] replay: ReplayConfig,
        #[builder(default)] polling: PollingConfig,
        #[builder(default)] keys: KeyConfig,
        #[builder(default)] audit: AuditConfig,
        #[builder(default = DEFAULT_SWEEP_INTERVAL)] sweep_interval: Duration,
    ) -> Result<Self, ConfigError> {
        non_zero("sweep_interval", sweep_interval)?;
        Ok(Self { replay, polling, keys, audit, sweep_interval })
    }

    /// Replay guard settings.
    #[must_use]
    pub fn replay(&self) -> &ReplayConfig {
        &self.replay
    }

    /// Polling consumable settings.
    #[must_use]
    pub fn polling(&self) -> &PollingConfig {
        &self.polling
    }

    /// Signing key settings.
    #[must_use]
    pub fn keys(&self) -> &KeyConfig {
        &self.keys
    }

    /// Audit sidecar settings.
    #[must_use]
    pub fn audit(&self) -> &AuditConfig {
        &self.audit
    }

    /// Period of the background expiry sweep.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PrimitivesConfig::default();
        assert_eq!(config.replay().server_max_ttl(), Duration::from_secs(3600));
        assert_eq!(config.replay().clock_skew_budget(), Duration::from_secs(60));
        assert_eq!(config.polling().default_interval(), Duration::from_secs(5));
        assert_eq!(config.polling().max_polls(), 120);
        assert_eq!(config.keys().overlap_period(), Duration::from_secs(86_400));
        assert_eq!(config.audit().max_batch(), 100);
        assert_eq!(config.audit().max_buffered(), 10_000);
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_replay_ttl_above_hard_cap_rejected() {
        let err = ReplayConfig::builder().server_max_ttl(Duration::from_secs(7200)).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "server_max_ttl", .. }));
    }

    #[test]
    fn test_zero_max_polls_rejected() {
        let err = PollingConfig::builder().max_polls(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "max_polls", .. }));
    }

    #[test]
    fn test_audit_buffer_must_hold_a_batch() {
        let err = AuditConfig::builder().max_batch(50).max_buffered(10).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "max_buffered", .. }));
        assert!(AuditConfig::builder().max_batch(50).max_buffered(50).build().is_ok());
    }

    #[test]
    fn test_deserialize_nested_humantime() {
        let config: PrimitivesConfig = serde_json::from_str(
            r#"{
                "replay": {"clock_skew_budget": "30s"},
                "keys": {"overlap_period": "2h", "revoked_retention": "7days"},
                "sweep_interval": "15s"
            }"#,
        )
        .unwrap();
        assert_eq!(config.replay().clock_skew_budget(), Duration::from_secs(30));
        assert_eq!(config.replay().server_max_ttl(), MAX_REPLAY_TTL);
        assert_eq!(config.keys().overlap_period(), Duration::from_secs(7200));
        assert_eq!(config.keys().revoked_retention(), Duration::from_secs(7 * 86_400));
        assert_eq!(config.sweep_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_json::from_str::<PrimitivesConfig>(r#"{"replay": {"ttl": "1s"}}"#).is_err());
    }
}

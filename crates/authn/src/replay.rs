//! Replay guard for single-use identifiers.
//!
//! Tracks proof-of-possession JTIs and revoked access-token identifiers. A
//! live [`ReplayRecord`] forbids accepting its key again; records expire on
//! their own after a bounded TTL.
//!
//! The check and the insert happen inside one actor turn, so two concurrent
//! presentations of the same key can never both be accepted.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyward_storage::{ScopedStore, StorageResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    audit::AuditKind,
    clock::{after, remaining},
    config::{MAX_REPLAY_TTL, ReplayConfig},
    error::Result,
    runtime::{ShardActor, ShardState},
};

const RECORD_PREFIX: &str = "rep/";

/// Shortest lifetime a record is stored with.
const MIN_REPLAY_TTL: Duration = Duration::from_secs(1);

/// A remembered single-use key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRecord {
    /// The key as presented.
    pub key: String,
    /// When the key was first accepted.
    pub created_at: DateTime<Utc>,
    /// When the record stops guarding the key.
    pub expires_at: DateTime<Utc>,
    /// Caller-supplied context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Result of [`ShardActor::check_and_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOutcome {
    /// First presentation; the key is now recorded.
    Accepted,
    /// The key was already recorded and has not expired.
    Replay,
}

/// Computes replay-record lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayPolicy {
    server_max_ttl: Duration,
    clock_skew_budget: Duration,
}

impl From<&ReplayConfig> for ReplayPolicy {
    fn from(config: &ReplayConfig) -> Self {
        Self {
            server_max_ttl: config.server_max_ttl(),
            clock_skew_budget: config.clock_skew_budget(),
        }
    }
}

impl ReplayPolicy {
    /// `min(token_expires_at - now, server_max_ttl) + clock_skew_budget`,
    /// never more than [`MAX_REPLAY_TTL`].
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use chrono::{TimeDelta, Utc};
    /// use keyward_authn::{config::ReplayConfig, replay::ReplayPolicy};
    ///
    /// let policy = ReplayPolicy::from(&ReplayConfig::default());
    /// let now = Utc::now();
    /// let ttl = policy.ttl_for(now + TimeDelta::seconds(300), now);
    /// assert_eq!(ttl, Duration::from_secs(360));
    /// ```
    #[must_use]
    pub fn ttl_for(&self, token_expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let lifetime = remaining(token_expires_at, now).min(self.server_max_ttl);
        lifetime.saturating_add(self.clock_skew_budget).min(MAX_REPLAY_TTL)
    }
}

/// Replay records owned by one actor, keyed by presented key.
#[derive(Debug, Default)]
pub struct ReplayState {
    records: HashMap<String, ReplayRecord>,
}

impl ReplayState {
    fn live(&self, key: &str, now: DateTime<Utc>) -> Option<&ReplayRecord> {
        self.records.get(key).filter(|record| record.expires_at > now)
    }
}

fn storage_key(key: &str) -> String {
    format!("{RECORD_PREFIX}{key}")
}

#[async_trait]
impl ShardState for ReplayState {
    async fn load(store: &ScopedStore) -> StorageResult<Self> {
        let records = store
            .list_json::<ReplayRecord>(RECORD_PREFIX)
            .await?
            .into_iter()
            .map(|(_, record)| (record.key.clone(), record))
            .collect();
        Ok(Self { records })
    }

    fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        self.records
            .values()
            .filter(|record| record.expires_at <= now)
            .map(|record| storage_key(&record.key))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn forget(&mut self, keys: &[String]) {
        for key in keys {
            if let Some(presented) = key.strip_prefix(RECORD_PREFIX) {
                self.records.remove(presented);
            }
        }
    }
}

impl ShardActor<ReplayState> {
    /// Accepts `key` once within `ttl`.
    ///
    /// `ttl` is clamped to `[1s, MAX_REPLAY_TTL]`. An expired record for the
    /// same key is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`](crate::PrimitiveError::Storage) if
    /// the record cannot be persisted; the key is then not accepted.
    #[tracing::instrument(skip(self, metadata), fields(actor = %self.address()))]
    pub async fn check_and_record(
        &self,
        key: &str,
        ttl: Duration,
        metadata: Option<serde_json::Value>,
    ) -> Result<ReplayOutcome> {
        let mut turn = self.turn().await?;
        let now = turn.now();

        if turn.live(key, now).is_some() {
            debug!("Replay rejected");
            turn.audit(turn.event(AuditKind::ReplayRejected, key));
            return Ok(ReplayOutcome::Replay);
        }

        let ttl = ttl.clamp(MIN_REPLAY_TTL, MAX_REPLAY_TTL);
        let record = ReplayRecord {
            key: key.to_owned(),
            created_at: now,
            expires_at: after(now, ttl),
            metadata,
        };
        turn.persist(&storage_key(key), &record, Some(ttl)).await?;
        turn.records.insert(key.to_owned(), record);
        Ok(ReplayOutcome::Accepted)
    }

    /// Whether a live record exists for `key`. Never mutates.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`](crate::PrimitiveError::Storage) if
    /// the actor state cannot be loaded.
    pub async fn is_recorded(&self, key: &str) -> Result<bool> {
        let turn = self.turn().await?;
        Ok(turn.live(key, turn.now()).is_some())
    }

    /// The live record for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`](crate::PrimitiveError::Storage) if
    /// the actor state cannot be loaded.
    pub async fn record(&self, key: &str) -> Result<Option<ReplayRecord>> {
        let turn = self.turn().await?;
        Ok(turn.live(key, turn.now()).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;
    use keyward_sharding::{ActorAddress, RegionKey, TypePrefix};
    use keyward_storage::{MemoryBackend, RetryConfig, StorageBackend, testutil::FlakyBackend};
    use rstest::rstest;

    use super::*;
    use crate::{
        PrimitiveError,
        audit::{AuditSidecar, MemoryAuditSink},
        clock::ManualClock,
        config::PrimitivesConfig,
        runtime::ActorContext,
    };

    fn actor(backend: Arc<dyn StorageBackend>, clock: &ManualClock) -> ShardActor<ReplayState> {
        let ctx = Arc::new(ActorContext {
            clock: Arc::new(clock.clone()),
            audit: AuditSidecar::start(Arc::new(MemoryAuditSink::new()), Default::default()),
            config: Arc::new(PrimitivesConfig::default()),
            retry: RetryConfig::none(),
        });
        let address = ActorAddress {
            tenant: "acme".parse().unwrap(),
            region: RegionKey::Weur,
            type_prefix: TypePrefix::DPOP_JTI,
            shard: 0,
        };
        ShardActor::new(address, backend, ctx)
    }

    #[rstest]
    #[case(300, Duration::from_secs(360))]
    #[case(7200, Duration::from_secs(3600))]
    #[case(-30, Duration::from_secs(60))]
    fn test_ttl_for(#[case] expires_in: i64, #[case] expected: Duration) {
        let policy = ReplayPolicy::from(&ReplayConfig::default());
        let now = Utc::now();
        assert_eq!(policy.ttl_for(now + TimeDelta::seconds(expires_in), now), expected);
    }

    #[tokio::test]
    async fn test_second_presentation_is_replay() {
        let clock = ManualClock::default();
        let guard = actor(Arc::new(MemoryBackend::new()), &clock);

        let ttl = Duration::from_secs(60);
        assert_eq!(guard.check_and_record("jti-1", ttl, None).await.unwrap(), ReplayOutcome::Accepted);
        assert_eq!(guard.check_and_record("jti-1", ttl, None).await.unwrap(), ReplayOutcome::Replay);
        assert_eq!(guard.check_and_record("jti-2", ttl, None).await.unwrap(), ReplayOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_expired_record_is_overwritten() {
        let clock = ManualClock::default();
        let guard = actor(Arc::new(MemoryBackend::new()), &clock);

        guard.check_and_record("jti", Duration::from_secs(10), None).await.unwrap();
        clock.advance(Duration::from_secs(11));
        assert!(!guard.is_recorded("jti").await.unwrap());
        assert_eq!(
            guard.check_and_record("jti", Duration::from_secs(10), None).await.unwrap(),
            ReplayOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn test_ttl_is_capped_at_one_hour() {
        let clock = ManualClock::default();
        let guard = actor(Arc::new(MemoryBackend::new()), &clock);

        guard.check_and_record("long", Duration::from_secs(86_400), None).await.unwrap();
        let record = guard.record("long").await.unwrap().unwrap();
        assert_eq!(record.expires_at - record.created_at, TimeDelta::hours(1));
    }

    #[tokio::test]
    async fn test_records_survive_restart() {
        let clock = ManualClock::default();
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let metadata = serde_json::json!({ "htu": "https://api.example/token" });
        actor(Arc::clone(&backend), &clock)
            .check_and_record("jti", Duration::from_secs(60), Some(metadata.clone()))
            .await
            .unwrap();

        let restarted = actor(backend, &clock);
        assert_eq!(restarted.record("jti").await.unwrap().unwrap().metadata, Some(metadata));
        assert_eq!(
            restarted.check_and_record("jti", Duration::from_secs(60), None).await.unwrap(),
            ReplayOutcome::Replay
        );
    }

    #[tokio::test]
    async fn test_unpersisted_key_is_not_accepted() {
        let clock = ManualClock::default();
        let flaky = FlakyBackend::new();
        let guard = actor(Arc::new(flaky.clone()), &clock);
        guard.is_recorded("warm-up").await.unwrap();

        flaky.fail_commits(true);
        let err = guard.check_and_record("jti", Duration::from_secs(60), None).await.unwrap_err();
        assert!(matches!(err, PrimitiveError::Storage(_)));

        flaky.fail_commits(false);
        assert!(!guard.is_recorded("jti").await.unwrap());
    }
}

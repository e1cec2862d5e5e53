//! Fixed-window rate counters.
//!
//! Each increment runs inside one actor turn, so with a limit of `N` exactly
//! `N` of any number of concurrent increments in a window are allowed.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyward_storage::{ScopedStore, StorageResult};
use serde::{Deserialize, Serialize};

use crate::{
    audit::AuditKind,
    clock::{after, remaining},
    error::Result,
    runtime::{ShardActor, ShardState},
};

const WINDOW_PREFIX: &str = "win/";

/// One counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateWindow {
    /// Increments in this window, including denied ones.
    pub count: u64,
    /// When the window closes.
    pub window_reset_at: DateTime<Utc>,
    /// When the window opened.
    pub first_seen_at: DateTime<Utc>,
}

impl RateWindow {
    fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.window_reset_at > now
    }
}

/// Outcome of an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    /// Whether the request is within the limit.
    pub allowed: bool,
    /// Count after this increment.
    pub current: u64,
    /// The limit applied.
    pub limit: u64,
    /// When the window closes.
    pub reset_at: DateTime<Utc>,
    /// Whole seconds until the window closes; zero when allowed.
    pub retry_after: u64,
}

/// Windows owned by one actor, keyed by counter key.
#[derive(Debug, Default)]
pub struct CounterState {
    windows: HashMap<String, RateWindow>,
}

fn storage_key(key: &str) -> String {
    format!("{WINDOW_PREFIX}{key}")
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[async_trait]
impl ShardState for CounterState {
    async fn load(store: &ScopedStore) -> StorageResult<Self> {
        let windows = store
            .list_json::<RateWindow>(WINDOW_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(key, window)| Some((key.strip_prefix(WINDOW_PREFIX)?.to_owned(), window)))
            .collect();
        Ok(Self { windows })
    }

    fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        self.windows.iter().filter(|(_, w)| !w.is_open(now)).map(|(key, _)| storage_key(key)).collect()
    }

    fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn forget(&mut self, keys: &[String]) {
        for key in keys {
            if let Some(counter) = key.strip_prefix(WINDOW_PREFIX) {
                self.windows.remove(counter);
            }
        }
    }
}

impl ShardActor<CounterState> {
    /// Counts one request against `key`.
    ///
    /// An absent or closed window starts fresh at 1 and closes `window`
    /// later. Denied requests are still counted.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`](crate::PrimitiveError::Storage) if
    /// the count cannot be persisted.
    #[tracing::instrument(skip(self), fields(actor = %self.address()))]
    pub async fn increment(&self, key: &str, window: Duration, max_requests: u64) -> Result<RateDecision> {
        let mut turn = self.turn().await?;
        let now = turn.now();

        let mut current = match turn.windows.get(key) {
            Some(open) if open.is_open(now) => *open,
            _ => RateWindow { count: 0, window_reset_at: after(now, window), first_seen_at: now },
        };
        current.count = current.count.saturating_add(1);

        let left = remaining(current.window_reset_at, now);
        turn.persist(&storage_key(key), &current, Some(left.max(Duration::from_secs(1)))).await?;
        turn.windows.insert(key.to_owned(), current);

        let allowed = current.count <= max_requests;
        if !allowed {
            turn.audit(
                turn.event(AuditKind::RateLimited, key)
                    .with_detail("count", current.count)
                    .with_detail("limit", max_requests),
            );
        }
        Ok(RateDecision {
            allowed,
            current: current.count,
            limit: max_requests,
            reset_at: current.window_reset_at,
            retry_after: if allowed { 0 } else { ceil_secs(left) },
        })
    }

    /// The open window for `key`, if any. Never mutates.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`](crate::PrimitiveError::Storage) if
    /// the actor state cannot be loaded.
    pub async fn peek(&self, key: &str) -> Result<Option<RateWindow>> {
        let turn = self.turn().await?;
        let now = turn.now();
        Ok(turn.windows.get(key).filter(|w| w.is_open(now)).copied())
    }

    /// Discards the window for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`](crate::PrimitiveError::Storage) if
    /// the delete cannot be persisted.
    #[tracing::instrument(skip(self), fields(actor = %self.address()))]
    pub async fn reset(&self, key: &str) -> Result<()> {
        let mut turn = self.turn().await?;
        if turn.windows.contains_key(key) {
            turn.remove(&storage_key(key)).await?;
            turn.windows.remove(key);
        }
        Ok(())
    }
}

//! One-time consumables.
//!
//! Challenges, authorization codes, device codes and backchannel requests
//! are accepted at most once. The existence check, expiry check, payload
//! comparison and the consumed flip all run in one actor turn, which is what
//! stops a code from being redeemed twice under concurrency.
//!
//! Device and backchannel items are *polling* items: they start pending,
//! are decided with [`approve`](ShardActor::approve) or
//! [`deny`](ShardActor::deny), and are watched by the client through
//! [`poll`](ShardActor::poll). Polling faster than the advertised interval
//! widens the interval by a fixed increment; after `max_polls` polls the item
//! is force-expired.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyward_sharding::TypePrefix;
use keyward_storage::{ScopedStore, StorageResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    audit::AuditKind,
    clock::{after, remaining},
    error::{PrimitiveError, Result},
    runtime::{ShardActor, ShardState, Turn},
};

const ITEM_PREFIX: &str = "otc/";

/// Shortest lifetime an item is stored with.
const MIN_ITEM_TTL: Duration = Duration::from_secs(1);

/// Lifecycle of a consumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumableStatus {
    /// Awaiting consumption (or, for polling items, a decision).
    Pending,
    /// A polling item the user approved; consumable.
    Approved,
    /// Consumed. Terminal.
    Consumed,
    /// A polling item the user denied. Terminal.
    Denied,
}

/// Client polling bookkeeping for device and backchannel items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingState {
    /// Minimum time between polls currently advertised to the client.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Polls received so far.
    pub poll_count: u32,
    /// When the last poll arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<DateTime<Utc>>,
}

/// A single-use item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeConsumable {
    /// Sharded resource id.
    pub id: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub kind: TypePrefix,
    /// Opaque payload supplied at creation.
    pub payload: Value,
    /// Grant attached on approval of a polling item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant: Option<Value>,
    /// Current state.
    pub status: ConsumableStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// End of life.
    pub expires_at: DateTime<Utc>,
    /// Present on polling items only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling: Option<PollingState>,
}

impl OneTimeConsumable {
    /// Whether the item has been consumed.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.status == ConsumableStatus::Consumed
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What a polling client is told.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollOutcome {
    /// Not decided yet; poll again after `interval`.
    AuthorizationPending {
        /// Interval to honour.
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
    /// Polled too fast; the interval has been widened.
    SlowDown {
        /// The widened interval.
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
    /// Approved; the item can now be consumed.
    Approved {
        /// The attached grant.
        grant: Value,
    },
    /// Denied by the user.
    Denied,
    /// Expired, or polled too many times.
    Expired,
}

/// Items owned by one actor, keyed by id.
#[derive(Debug, Default)]
pub struct ConsumableState {
    items: HashMap<String, OneTimeConsumable>,
}

fn storage_key(id: &str) -> String {
    format!("{ITEM_PREFIX}{id}")
}

#[async_trait]
impl ShardState for ConsumableState {
    async fn load(store: &ScopedStore) -> StorageResult<Self> {
        let items = store
            .list_json::<OneTimeConsumable>(ITEM_PREFIX)
            .await?
            .into_iter()
            .map(|(_, item)| (item.id.clone(), item))
            .collect();
        Ok(Self { items })
    }

    fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        self.items.values().filter(|item| item.is_expired(now)).map(|item| storage_key(&item.id)).collect()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn forget(&mut self, keys: &[String]) {
        for key in keys {
            if let Some(id) = key.strip_prefix(ITEM_PREFIX) {
                self.items.remove(id);
            }
        }
    }
}

/// Persists `item` for the rest of its lifetime, then replaces the cached
/// copy.
async fn save(turn: &mut Turn<'_, ConsumableState>, item: OneTimeConsumable) -> Result<()> {
    let ttl = remaining(item.expires_at, turn.now()).max(MIN_ITEM_TTL);
    turn.persist(&storage_key(&item.id), &item, Some(ttl)).await?;
    turn.items.insert(item.id.clone(), item);
    Ok(())
}

/// A live item that still awaits a decision.
fn pending_polling_item(
    turn: &Turn<'_, ConsumableState>,
    id: &str,
) -> Result<OneTimeConsumable> {
    let item = turn.items.get(id).ok_or_else(|| PrimitiveError::not_found(id))?;
    if item.is_expired(turn.now()) {
        return Err(PrimitiveError::expired(id));
    }
    if item.polling.is_none() || item.status != ConsumableStatus::Pending {
        return Err(PrimitiveError::NotPending { id: id.to_owned() });
    }
    Ok(item.clone())
}

impl ShardActor<ConsumableState> {
    async fn insert(
        &self,
        id: &str,
        payload: Value,
        ttl: Duration,
        polling: Option<PollingState>,
    ) -> Result<OneTimeConsumable> {
        let mut turn = self.turn().await?;
        if turn.items.contains_key(id) {
            return Err(PrimitiveError::AlreadyExists { id: id.to_owned() });
        }
        let now = turn.now();
        let item = OneTimeConsumable {
            id: id.to_owned(),
            kind: turn.address().type_prefix,
            payload,
            grant: None,
            status: ConsumableStatus::Pending,
            created_at: now,
            expires_at: after(now, ttl),
            polling,
        };
        save(&mut turn, item.clone()).await?;
        Ok(item)
    }

    /// Stores a new item that lives for `ttl`.
    ///
    /// # Errors
    ///
    /// - [`PrimitiveError::AlreadyExists`] if any item with this id is still
    ///   held, whatever its state
    /// - [`PrimitiveError::Storage`] if the item cannot be persisted
    #[tracing::instrument(skip(self, payload), fields(actor = %self.address()))]
    pub async fn store(&self, id: &str, payload: Value, ttl: Duration) -> Result<OneTimeConsumable> {
        self.insert(id, payload, ttl, None).await
    }

    /// Stores a new polling item that advertises `interval` to its client.
    ///
    /// # Errors
    ///
    /// Same as [`store`](Self::store).
    #[tracing::instrument(skip(self, payload), fields(actor = %self.address()))]
    pub async fn store_polling(
        &self,
        id: &str,
        payload: Value,
        ttl: Duration,
        interval: Duration,
    ) -> Result<OneTimeConsumable> {
        let polling = PollingState { interval, poll_count: 0, last_poll_at: None };
        self.insert(id, payload, ttl, Some(polling)).await
    }

    /// Consumes the item, returning it as it was just before consumption.
    ///
    /// When `expected` is given it must equal the stored payload; a mismatch
    /// leaves the item unconsumed.
    ///
    /// # Errors
    ///
    /// Checked in this order: [`NotFound`](PrimitiveError::NotFound),
    /// [`AlreadyConsumed`](PrimitiveError::AlreadyConsumed),
    /// [`Expired`](PrimitiveError::Expired),
    /// [`Denied`](PrimitiveError::Denied),
    /// [`AuthorizationPending`](PrimitiveError::AuthorizationPending) for an
    /// undecided polling item, then
    /// [`PayloadMismatch`](PrimitiveError::PayloadMismatch).
    /// [`PrimitiveError::Storage`] if the flip cannot be persisted.
    #[tracing::instrument(skip(self, expected), fields(actor = %self.address()))]
    pub async fn consume(&self, id: &str, expected: Option<&Value>) -> Result<OneTimeConsumable> {
        let mut turn = self.turn().await?;
        let now = turn.now();
        let item = turn.items.get(id).ok_or_else(|| PrimitiveError::not_found(id))?;

        match item.status {
            ConsumableStatus::Consumed => return Err(PrimitiveError::already_consumed(id)),
            _ if item.is_expired(now) => return Err(PrimitiveError::expired(id)),
            ConsumableStatus::Denied => return Err(PrimitiveError::Denied { id: id.to_owned() }),
            ConsumableStatus::Pending if item.polling.is_some() => {
                return Err(PrimitiveError::AuthorizationPending { id: id.to_owned() });
            },
            ConsumableStatus::Pending | ConsumableStatus::Approved => {},
        }
        if let Some(expected) = expected
            && *expected != item.payload
        {
            debug!("Payload mismatch; item left unconsumed");
            return Err(PrimitiveError::PayloadMismatch { id: id.to_owned() });
        }

        let before = item.clone();
        let consumed = OneTimeConsumable { status: ConsumableStatus::Consumed, ..before.clone() };
        save(&mut turn, consumed).await?;
        turn.audit(turn.event(AuditKind::Consumed, id));
        Ok(before)
    }

    /// The live item, if any. Never mutates.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the actor state cannot be
    /// loaded.
    pub async fn peek(&self, id: &str) -> Result<Option<OneTimeConsumable>> {
        let turn = self.turn().await?;
        let now = turn.now();
        Ok(turn.items.get(id).filter(|item| !item.is_expired(now)).cloned())
    }

    /// Approves a pending polling item and attaches `grant`.
    ///
    /// # Errors
    ///
    /// [`NotFound`](PrimitiveError::NotFound),
    /// [`Expired`](PrimitiveError::Expired), or
    /// [`NotPending`](PrimitiveError::NotPending) if the item is not an
    /// undecided polling item.
    #[tracing::instrument(skip(self, grant), fields(actor = %self.address()))]
    pub async fn approve(&self, id: &str, grant: Value) -> Result<()> {
        let mut turn = self.turn().await?;
        let item = pending_polling_item(&turn, id)?;
        let approved = OneTimeConsumable { status: ConsumableStatus::Approved, grant: Some(grant), ..item };
        save(&mut turn, approved).await
    }

    /// Denies a pending polling item. Terminal.
    ///
    /// # Errors
    ///
    /// Same as [`approve`](Self::approve).
    #[tracing::instrument(skip(self), fields(actor = %self.address()))]
    pub async fn deny(&self, id: &str) -> Result<()> {
        let mut turn = self.turn().await?;
        let item = pending_polling_item(&turn, id)?;
        let denied = OneTimeConsumable { status: ConsumableStatus::Denied, ..item };
        save(&mut turn, denied).await?;
        turn.audit(turn.event(AuditKind::AuthorizationDenied, id));
        Ok(())
    }

    /// Records a client poll and tells the client what to do next.
    ///
    /// # Errors
    ///
    /// - [`NotFound`](PrimitiveError::NotFound) for an unknown id
    /// - [`NotPending`](PrimitiveError::NotPending) for an item that is not a
    ///   polling item
    /// - [`AlreadyConsumed`](PrimitiveError::AlreadyConsumed) once the grant
    ///   has been redeemed
    /// - [`PrimitiveError::Storage`] if the poll cannot be persisted
    #[tracing::instrument(skip(self), fields(actor = %self.address()))]
    pub async fn poll(&self, id: &str) -> Result<PollOutcome> {
        let mut turn = self.turn().await?;
        let now = turn.now();
        let item = turn.items.get(id).ok_or_else(|| PrimitiveError::not_found(id))?.clone();
        let Some(mut polling) = item.polling.clone() else {
            return Err(PrimitiveError::NotPending { id: id.to_owned() });
        };

        match item.status {
            ConsumableStatus::Consumed => return Err(PrimitiveError::already_consumed(id)),
            _ if item.is_expired(now) => return Ok(PollOutcome::Expired),
            ConsumableStatus::Denied => return Ok(PollOutcome::Denied),
            ConsumableStatus::Approved => {
                return Ok(PollOutcome::Approved { grant: item.grant.clone().unwrap_or(Value::Null) });
            },
            ConsumableStatus::Pending => {},
        }

        let max_polls = turn.config().polling().max_polls();
        let increment = turn.config().polling().slow_down_increment();

        polling.poll_count = polling.poll_count.saturating_add(1);
        if polling.poll_count > max_polls {
            debug!(polls = polling.poll_count, "Poll limit exceeded; force-expiring");
            let expired = OneTimeConsumable { expires_at: now, polling: Some(polling), ..item };
            save(&mut turn, expired).await?;
            return Ok(PollOutcome::Expired);
        }

        let too_fast = polling
            .last_poll_at
            .is_some_and(|last| remaining(after(last, polling.interval), now) > Duration::ZERO);
        if too_fast {
            polling.interval = polling.interval.saturating_add(increment);
        }
        polling.last_poll_at = Some(now);
        let interval = polling.interval;
        save(&mut turn, OneTimeConsumable { polling: Some(polling), ..item }).await?;

        Ok(if too_fast {
            PollOutcome::SlowDown { interval }
        } else {
            PollOutcome::AuthorizationPending { interval }
        })
    }
}

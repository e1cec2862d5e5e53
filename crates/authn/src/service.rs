//! Direct-call surface over every primitive.
//!
//! [`SecurityService`] owns the shard directory, the router, one actor
//! registry per primitive, the audit sidecar and the sweeper. Each method
//! finds the owning actor and runs one operation on it:
//!
//! - existing resources are located by decoding their id, so they stay
//!   reachable across topology changes without consulting the directory
//! - new resources are placed in the tenant's current generation
//! - state keyed by something other than an id (a user/client pair, a key
//!   set) is searched for in every generation, newest first
//!
//! The request/response adapter in [`crate::rpc`] drives the same methods.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use keyward_sharding::{
    ActorAddress, Placement, RegionShardConfig, RegionShardDirectory, ShardRouter, ShardedResourceId, TypePrefix,
};
use keyward_storage::{ClientId, RetryConfig, StorageBackend, TenantId, UserId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audit::{AuditSidecar, AuditSink},
    clock::{Clock, SystemClock},
    config::PrimitivesConfig,
    consumable::{ConsumableState, OneTimeConsumable, PollOutcome},
    counter::{CounterState, RateDecision, RateWindow},
    error::{PrimitiveError, Result},
    family::{FamilyState, IssuedToken, RotationRequest, TokenFamily, family_shard_key},
    keys::{KeyAlgorithm, KeyEntry, KeyState, PublicJwk},
    replay::{ReplayOutcome, ReplayPolicy, ReplayState},
    runtime::{ActorContext, ActorRegistry, ShardActor, Sweep, spawn_sweeper},
};

/// Types stored as one-time consumables.
pub const CONSUMABLE_TYPES: [TypePrefix; 4] = [
    TypePrefix::CHALLENGE,
    TypePrefix::AUTHORIZATION_CODE,
    TypePrefix::DEVICE_CODE,
    TypePrefix::BACKCHANNEL_REQUEST,
];

/// Consumable types driven by client polling.
pub const POLLING_TYPES: [TypePrefix; 2] = [TypePrefix::DEVICE_CODE, TypePrefix::BACKCHANNEL_REQUEST];

/// Revocation reason for a family replaced by a newer one in another
/// generation.
pub const SUPERSEDED_REASON: &str = "superseded";

/// Token lifetime assumed for a bulk revocation entry without an expiry.
const DEFAULT_REVOCATION_LIFETIME: Duration = Duration::from_secs(3600);

/// Entry point for security-state operations.
pub struct SecurityService {
    directory: Arc<RegionShardDirectory>,
    router: ShardRouter,
    ctx: Arc<ActorContext>,
    replay: Arc<ActorRegistry<ReplayState>>,
    consumables: Arc<ActorRegistry<ConsumableState>>,
    families: Arc<ActorRegistry<FamilyState>>,
    counters: Arc<ActorRegistry<CounterState>>,
    keys: Arc<ActorRegistry<KeyState>>,
    cancel_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SecurityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityService")
            .field("replay", &self.replay)
            .field("consumables", &self.consumables)
            .field("families", &self.families)
            .field("counters", &self.counters)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl SecurityService {
    /// Creates a service. Actor state persists to `backend`; topology is
    /// read through `directory`.
    ///
    /// Starts the audit sidecar's flush task but not the sweeper; call
    /// [`start_sweeper`](Self::start_sweeper) for that.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[builder]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        directory: Arc<RegionShardDirectory>,
        audit_sink: Arc<dyn AuditSink>,
        #[builder(default)] config: PrimitivesConfig,
        #[builder(default = Arc::new(SystemClock))] clock: Arc<dyn Clock>,
        #[builder(default)] retry: RetryConfig,
    ) -> Self {
        let audit = AuditSidecar::start(audit_sink, config.audit().clone());
        let ctx = Arc::new(ActorContext { clock, audit, config: Arc::new(config), retry });
        let replay = Arc::new(ActorRegistry::new("replay", Arc::clone(&backend), Arc::clone(&ctx)));
        let consumables = Arc::new(ActorRegistry::new("consumables", Arc::clone(&backend), Arc::clone(&ctx)));
        let families = Arc::new(ActorRegistry::new("families", Arc::clone(&backend), Arc::clone(&ctx)));
        let counters = Arc::new(ActorRegistry::new("counters", Arc::clone(&backend), Arc::clone(&ctx)));
        let keys = Arc::new(ActorRegistry::new("keys", backend, Arc::clone(&ctx)));

        Self {
            router: ShardRouter::new(Arc::clone(directory.types())),
            directory,
            ctx,
            replay,
            consumables,
            families,
            counters,
            keys,
            cancel_token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }
}

impl SecurityService {
    /// The shard directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<RegionShardDirectory> {
        &self.directory
    }

    /// The audit sidecar.
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditSidecar> {
        &self.ctx.audit
    }

    /// Primitive configuration.
    #[must_use]
    pub fn config(&self) -> &PrimitivesConfig {
        &self.ctx.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }

    async fn topology(&self, tenant: &TenantId) -> Result<Arc<RegionShardConfig>> {
        Ok(self.directory.current(tenant).await?)
    }

    /// Placement in every generation, newest (current) first.
    async fn placements(&self, tenant: &TenantId, prefix: TypePrefix, shard_key: &str) -> Result<Vec<Placement>> {
        let topology = self.topology(tenant).await?;
        Ok(self.router.resolve_all_generations(&topology, prefix, shard_key.as_bytes())?)
    }

    async fn current_placement(&self, tenant: &TenantId, prefix: TypePrefix, shard_key: &str) -> Result<Placement> {
        let topology = self.topology(tenant).await?;
        Ok(self.router.resolve_for_new_resource(&topology, prefix, shard_key.as_bytes())?)
    }

    fn decode(&self, id: &str, allowed: &[TypePrefix]) -> Result<ShardedResourceId> {
        let decoded = self.router.resolve_from_id(id)?;
        if !allowed.contains(&decoded.type_prefix()) {
            return Err(PrimitiveError::malformed(id, format!("unexpected type {}", decoded.type_prefix())));
        }
        Ok(decoded)
    }

    // -----------------------------------------------------------------------
    // Replay guard
    // -----------------------------------------------------------------------

    async fn check_and_record(
        &self,
        tenant: &TenantId,
        prefix: TypePrefix,
        key: &str,
        ttl: Duration,
        metadata: Option<Value>,
    ) -> Result<ReplayOutcome> {
        let placements = self.placements(tenant, prefix, key).await?;
        let Some((current, older)) = placements.split_first() else {
            return Err(PrimitiveError::invalid("no placement for replay key"));
        };
        for placement in older {
            let actor = self.replay.get(&ActorAddress::for_placement(tenant, placement));
            if actor.is_recorded(key).await? {
                debug!(generation = placement.generation, "Key recorded under an older generation");
                return Ok(ReplayOutcome::Replay);
            }
        }
        self.replay.get(&ActorAddress::for_placement(tenant, current)).check_and_record(key, ttl, metadata).await
    }

    async fn is_recorded(&self, tenant: &TenantId, prefix: TypePrefix, key: &str) -> Result<bool> {
        for placement in self.placements(tenant, prefix, key).await? {
            if self.replay.get(&ActorAddress::for_placement(tenant, &placement)).is_recorded(key).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Accepts a proof-of-possession JTI once for the life of its proof.
    ///
    /// # Errors
    ///
    /// [`PrimitiveError::Storage`] if the JTI cannot be remembered, or
    /// [`PrimitiveError::ConfigurationInvalid`] if the tenant's topology is
    /// unusable.
    #[tracing::instrument(skip(self, metadata), fields(tenant = %tenant))]
    pub async fn check_and_record_jti(
        &self,
        tenant: &TenantId,
        jti: &str,
        proof_expires_at: DateTime<Utc>,
        metadata: Option<Value>,
    ) -> Result<ReplayOutcome> {
        let ttl = ReplayPolicy::from(self.config().replay()).ttl_for(proof_expires_at, self.now());
        self.check_and_record(tenant, TypePrefix::DPOP_JTI, jti, ttl, metadata).await
    }

    /// Whether a JTI has been seen and not yet expired.
    ///
    /// # Errors
    ///
    /// As [`check_and_record_jti`](Self::check_and_record_jti).
    pub async fn is_jti_recorded(&self, tenant: &TenantId, jti: &str) -> Result<bool> {
        self.is_recorded(tenant, TypePrefix::DPOP_JTI, jti).await
    }

    /// Revokes an access token until it would have expired anyway.
    ///
    /// Returns [`ReplayOutcome::Replay`] if it was already revoked.
    ///
    /// # Errors
    ///
    /// As [`check_and_record_jti`](Self::check_and_record_jti).
    #[tracing::instrument(skip(self), fields(tenant = %tenant))]
    pub async fn revoke_token(
        &self,
        tenant: &TenantId,
        token_id: &str,
        token_expires_at: DateTime<Utc>,
    ) -> Result<ReplayOutcome> {
        let ttl = ReplayPolicy::from(self.config().replay()).ttl_for(token_expires_at, self.now());
        self.check_and_record(tenant, TypePrefix::REVOKED_TOKEN, token_id, ttl, None).await
    }

    /// Revokes several tokens as independent single-token revocations.
    ///
    /// Entries without an expiry are held for an hour. Stops at the first
    /// failure; earlier revocations stand.
    ///
    /// # Errors
    ///
    /// As [`revoke_token`](Self::revoke_token).
    #[tracing::instrument(skip(self, tokens), fields(tenant = %tenant, count = tokens.len()))]
    pub async fn revoke_tokens(
        &self,
        tenant: &TenantId,
        tokens: &[(String, Option<DateTime<Utc>>)],
    ) -> Result<Vec<ReplayOutcome>> {
        let mut outcomes = Vec::with_capacity(tokens.len());
        for (token_id, expires_at) in tokens {
            let expires_at = expires_at.unwrap_or_else(|| crate::clock::after(self.now(), DEFAULT_REVOCATION_LIFETIME));
            outcomes.push(self.revoke_token(tenant, token_id, expires_at).await?);
        }
        Ok(outcomes)
    }

    /// Whether an access token is revoked. Never mutates.
    ///
    /// # Errors
    ///
    /// As [`check_and_record_jti`](Self::check_and_record_jti).
    pub async fn is_revoked(&self, tenant: &TenantId, token_id: &str) -> Result<bool> {
        self.is_recorded(tenant, TypePrefix::REVOKED_TOKEN, token_id).await
    }

    // -----------------------------------------------------------------------
    // One-time consumables
    // -----------------------------------------------------------------------

    fn consumable_actor(&self, tenant: &TenantId, id: &str) -> Result<Arc<ShardActor<ConsumableState>>> {
        self.consumable_actor_of(tenant, id, &CONSUMABLE_TYPES)
    }

    fn consumable_actor_of(
        &self,
        tenant: &TenantId,
        id: &str,
        allowed: &[TypePrefix],
    ) -> Result<Arc<ShardActor<ConsumableState>>> {
        let decoded = self.decode(id, allowed)?;
        Ok(self.consumables.get(&ActorAddress::for_id(tenant, &decoded)))
    }

    /// Mints a fresh id for a one-time item placed by `shard_key`, without
    /// storing anything. Hand it to [`store_consumable_at`](Self::store_consumable_at)
    /// or [`store_polling_at`](Self::store_polling_at) once the payload is
    /// ready.
    ///
    /// # Errors
    ///
    /// [`PrimitiveError::ConfigurationInvalid`] if `prefix` is not a
    /// consumable type or the tenant's topology is unusable.
    pub async fn mint_consumable_id(&self, tenant: &TenantId, prefix: TypePrefix, shard_key: &str) -> Result<String> {
        if !CONSUMABLE_TYPES.contains(&prefix) {
            return Err(PrimitiveError::invalid(format!("{prefix} cannot be stored here")));
        }
        let placement = self.current_placement(tenant, prefix, shard_key).await?;
        Ok(ShardRouter::mint_at(&placement)?.to_string())
    }

    /// Stores a new one-time item under a freshly minted id placed by
    /// `shard_key`.
    ///
    /// # Errors
    ///
    /// [`PrimitiveError::ConfigurationInvalid`] if `prefix` is not a
    /// consumable type, otherwise as [`ShardActor::store`].
    #[tracing::instrument(skip(self, payload), fields(tenant = %tenant, %prefix))]
    pub async fn store_consumable(
        &self,
        tenant: &TenantId,
        prefix: TypePrefix,
        shard_key: &str,
        payload: Value,
        ttl: Duration,
    ) -> Result<OneTimeConsumable> {
        let id = self.mint_consumable_id(tenant, prefix, shard_key).await?;
        self.store_consumable_at(tenant, &id, payload, ttl).await
    }

    /// Stores a new one-time item under a caller-supplied id.
    ///
    /// # Errors
    ///
    /// [`PrimitiveError::MalformedId`] if `id` does not decode to a
    /// consumable type, [`PrimitiveError::AlreadyExists`] if the id is
    /// taken, otherwise as [`ShardActor::store`].
    #[tracing::instrument(skip(self, payload), fields(tenant = %tenant))]
    pub async fn store_consumable_at(
        &self,
        tenant: &TenantId,
        id: &str,
        payload: Value,
        ttl: Duration,
    ) -> Result<OneTimeConsumable> {
        self.consumable_actor(tenant, id)?.store(id, payload, ttl).await
    }

    /// Stores a new device or backchannel item. `interval` defaults to the
    /// configured polling interval.
    ///
    /// # Errors
    ///
    /// As [`store_consumable`](Self::store_consumable), for polling types
    /// only.
    #[tracing::instrument(skip(self, payload), fields(tenant = %tenant, %prefix))]
    pub async fn store_polling(
        &self,
        tenant: &TenantId,
        prefix: TypePrefix,
        shard_key: &str,
        payload: Value,
        ttl: Duration,
        interval: Option<Duration>,
    ) -> Result<OneTimeConsumable> {
        if !POLLING_TYPES.contains(&prefix) {
            return Err(PrimitiveError::invalid(format!("{prefix} cannot be stored here")));
        }
        let id = self.mint_consumable_id(tenant, prefix, shard_key).await?;
        self.store_polling_at(tenant, &id, payload, ttl, interval).await
    }

    /// Stores a new polling item under a caller-supplied id.
    ///
    /// # Errors
    ///
    /// As [`store_consumable_at`](Self::store_consumable_at), for polling
    /// types only.
    #[tracing::instrument(skip(self, payload), fields(tenant = %tenant))]
    pub async fn store_polling_at(
        &self,
        tenant: &TenantId,
        id: &str,
        payload: Value,
        ttl: Duration,
        interval: Option<Duration>,
    ) -> Result<OneTimeConsumable> {
        let actor = self.consumable_actor_of(tenant, id, &POLLING_TYPES)?;
        let interval = interval.unwrap_or_else(|| self.config().polling().default_interval());
        actor.store_polling(id, payload, ttl, interval).await
    }

    /// Consumes an item by id. See [`ShardActor::consume`].
    ///
    /// # Errors
    ///
    /// [`PrimitiveError::MalformedId`] for an id that does not decode to a
    /// consumable type, otherwise as [`ShardActor::consume`].
    #[tracing::instrument(skip(self, expected), fields(tenant = %tenant))]
    pub async fn consume(&self, tenant: &TenantId, id: &str, expected: Option<&Value>) -> Result<OneTimeConsumable> {
        self.consumable_actor(tenant, id)?.consume(id, expected).await
    }

    /// Reads an item without consuming it.
    ///
    /// # Errors
    ///
    /// As [`consume`](Self::consume).
    pub async fn peek(&self, tenant: &TenantId, id: &str) -> Result<Option<OneTimeConsumable>> {
        self.consumable_actor(tenant, id)?.peek(id).await
    }

    /// Approves a pending polling item.
    ///
    /// # Errors
    ///
    /// As [`ShardActor::approve`].
    #[tracing::instrument(skip(self, grant), fields(tenant = %tenant))]
    pub async fn approve(&self, tenant: &TenantId, id: &str, grant: Value) -> Result<()> {
        self.consumable_actor(tenant, id)?.approve(id, grant).await
    }

    /// Denies a pending polling item.
    ///
    /// # Errors
    ///
    /// As [`ShardActor::deny`].
    #[tracing::instrument(skip(self), fields(tenant = %tenant))]
    pub async fn deny(&self, tenant: &TenantId, id: &str) -> Result<()> {
        self.consumable_actor(tenant, id)?.deny(id).await
    }

    /// Records a client poll.
    ///
    /// # Errors
    ///
    /// As [`ShardActor::poll`].
    #[tracing::instrument(skip(self), fields(tenant = %tenant))]
    pub async fn poll(&self, tenant: &TenantId, id: &str) -> Result<PollOutcome> {
        self.consumable_actor(tenant, id)?.poll(id).await
    }

    // -----------------------------------------------------------------------
    // Token families
    // -----------------------------------------------------------------------

    /// Actors that may hold the pair's family, newest generation first.
    async fn family_actors(
        &self,
        tenant: &TenantId,
        user: &UserId,
        client: &ClientId,
    ) -> Result<Vec<(Placement, Arc<ShardActor<FamilyState>>)>> {
        let key = family_shard_key(user, client);
        Ok(self
            .placements(tenant, TypePrefix::REFRESH_TOKEN_FAMILY, &key)
            .await?
            .into_iter()
            .map(|placement| {
                let actor = self.families.get(&ActorAddress::for_placement(tenant, &placement));
                (placement, actor)
            })
            .collect())
    }

    /// The actor currently holding the pair's family, if any generation does.
    async fn locate_family(
        &self,
        tenant: &TenantId,
        user: &UserId,
        client: &ClientId,
    ) -> Result<Option<(Arc<ShardActor<FamilyState>>, TokenFamily)>> {
        for (_, actor) in self.family_actors(tenant, user, client).await? {
            if let Some(family) = actor.family_status(user, client).await? {
                return Ok(Some((actor, family)));
            }
        }
        Ok(None)
    }

    /// Starts a new family for the pair in the current generation.
    ///
    /// Active families for the pair left in older generations are revoked as
    /// superseded.
    ///
    /// # Errors
    ///
    /// As [`ShardActor::create_family`].
    #[tracing::instrument(skip(self, scope), fields(tenant = %tenant))]
    pub async fn create_family(
        &self,
        tenant: &TenantId,
        user: &UserId,
        client: &ClientId,
        ttl: Duration,
        scope: BTreeSet<String>,
    ) -> Result<IssuedToken> {
        let actors = self.family_actors(tenant, user, client).await?;
        let Some(((current, actor), older)) = actors.split_first() else {
            return Err(PrimitiveError::invalid("no placement for token family"));
        };
        let initial_id = ShardRouter::mint_at(current)?;
        let issued = actor.create_family(user, client, &initial_id.to_string(), ttl, scope).await?;

        for (placement, stale) in older {
            if let Some(family) = stale.family_status(user, client).await?
                && !family.is_revoked()
            {
                info!(generation = placement.generation, "Revoking family superseded by a newer generation");
                stale.revoke_family(user, client, SUPERSEDED_REASON).await?;
            }
        }
        Ok(issued)
    }

    /// Rotates the family that issued `request.presented_id`.
    ///
    /// The new id is minted at the same placement as the presented one, so
    /// a family never moves between actors.
    ///
    /// # Errors
    ///
    /// [`PrimitiveError::MalformedId`] for an id that is not a refresh token
    /// id, otherwise as the family actor's `rotate`.
    #[tracing::instrument(skip(self, request), fields(tenant = %tenant))]
    pub async fn rotate_family(
        &self,
        tenant: &TenantId,
        user: &UserId,
        client: &ClientId,
        request: &RotationRequest,
    ) -> Result<IssuedToken> {
        let presented = self.decode(&request.presented_id, &[TypePrefix::REFRESH_TOKEN_FAMILY])?;
        let actor = self.families.get(&ActorAddress::for_id(tenant, &presented));
        actor.rotate(user, client, request, &presented.sibling().to_string()).await
    }

    /// Checks the pair's family is active at `presented_version`. Never
    /// mutates.
    ///
    /// # Errors
    ///
    /// As [`ShardActor::validate`].
    pub async fn validate_family(
        &self,
        tenant: &TenantId,
        user: &UserId,
        client: &ClientId,
        presented_version: u64,
    ) -> Result<TokenFamily> {
        match self.locate_family(tenant, user, client).await? {
            Some((actor, _)) => actor.validate(user, client, presented_version).await,
            None => Err(PrimitiveError::not_found(family_shard_key(user, client))),
        }
    }

    /// The pair's family, revoked or not, if one exists.
    ///
    /// # Errors
    ///
    /// [`PrimitiveError::Storage`] if an actor cannot be loaded.
    pub async fn family_status(&self, tenant: &TenantId, user: &UserId, client: &ClientId) -> Result<Option<TokenFamily>> {
        Ok(self.locate_family(tenant, user, client).await?.map(|(_, family)| family))
    }

    /// Revokes the pair's family.
    ///
    /// # Errors
    ///
    /// As [`ShardActor::revoke_family`].
    #[tracing::instrument(skip(self), fields(tenant = %tenant))]
    pub async fn revoke_family(&self, tenant: &TenantId, user: &UserId, client: &ClientId, reason: &str) -> Result<()> {
        match self.locate_family(tenant, user, client).await? {
            Some((actor, _)) => actor.revoke_family(user, client, reason).await,
            None => Err(PrimitiveError::not_found(family_shard_key(user, client))),
        }
    }

    /// Revokes the family that issued `issued_id`, located from the id
    /// alone.
    ///
    /// # Errors
    ///
    /// As [`ShardActor::revoke_by_issued_id`].
    #[tracing::instrument(skip(self), fields(tenant = %tenant))]
    pub async fn revoke_by_issued_id(&self, tenant: &TenantId, issued_id: &str, reason: &str) -> Result<TokenFamily> {
        let decoded = self.decode(issued_id, &[TypePrefix::REFRESH_TOKEN_FAMILY])?;
        self.families.get(&ActorAddress::for_id(tenant, &decoded)).revoke_by_issued_id(issued_id, reason).await
    }

    // -----------------------------------------------------------------------
    // Rate counters
    // -----------------------------------------------------------------------

    async fn counter_actor(&self, tenant: &TenantId, key: &str) -> Result<Arc<ShardActor<CounterState>>> {
        let placement = self.current_placement(tenant, TypePrefix::RATE_LIMIT, key).await?;
        Ok(self.counters.get(&ActorAddress::for_placement(tenant, &placement)))
    }

    /// Counts one request against `key`.
    ///
    /// # Errors
    ///
    /// As [`ShardActor::increment`].
    #[tracing::instrument(skip(self), fields(tenant = %tenant))]
    pub async fn increment(
        &self,
        tenant: &TenantId,
        key: &str,
        window: Duration,
        max_requests: u64,
    ) -> Result<RateDecision> {
        self.counter_actor(tenant, key).await?.increment(key, window, max_requests).await
    }

    /// The open window for `key`, if any.
    ///
    /// # Errors
    ///
    /// [`PrimitiveError::Storage`] if the actor cannot be loaded.
    pub async fn peek_counter(&self, tenant: &TenantId, key: &str) -> Result<Option<RateWindow>> {
        self.counter_actor(tenant, key).await?.peek(key).await
    }

    /// Discards the window for `key`.
    ///
    /// # Errors
    ///
    /// [`PrimitiveError::Storage`] if the delete cannot be persisted.
    pub async fn reset_counter(&self, tenant: &TenantId, key: &str) -> Result<()> {
        self.counter_actor(tenant, key).await?.reset(key).await
    }

    // -----------------------------------------------------------------------
    // Signing keys
    // -----------------------------------------------------------------------

    /// The actor holding the tenant's key set for `algorithm`: the newest
    /// generation that already has keys, else the current one.
    async fn key_actor(&self, tenant: &TenantId, algorithm: KeyAlgorithm) -> Result<Arc<ShardActor<KeyState>>> {
        let shard_key = format!("keyset:{algorithm}");
        let placements = self.placements(tenant, TypePrefix::SIGNING_KEY, &shard_key).await?;
        let mut home = None;
        for placement in &placements {
            let actor = self.keys.get(&ActorAddress::for_placement(tenant, placement));
            if actor.has_keys(algorithm).await? {
                return Ok(actor);
            }
            home.get_or_insert(actor);
        }
        home.ok_or_else(|| PrimitiveError::invalid("no placement for key set"))
    }

    /// The active key for `algorithm`, generated on first use.
    ///
    /// # Errors
    ///
    /// As [`ShardActor::ensure_active`].
    #[tracing::instrument(skip(self), fields(tenant = %tenant))]
    pub async fn ensure_active_key(&self, tenant: &TenantId, algorithm: KeyAlgorithm) -> Result<KeyEntry> {
        self.key_actor(tenant, algorithm).await?.ensure_active(algorithm).await
    }

    /// The key to sign new tokens with, private material included.
    ///
    /// # Errors
    ///
    /// As [`ShardActor::signing_key`].
    pub async fn signing_key(&self, tenant: &TenantId, algorithm: KeyAlgorithm) -> Result<KeyEntry> {
        self.key_actor(tenant, algorithm).await?.signing_key(algorithm).await
    }

    /// Planned key rotation.
    ///
    /// # Errors
    ///
    /// As the key actor's `rotate`.
    #[tracing::instrument(skip(self), fields(tenant = %tenant))]
    pub async fn rotate_key(&self, tenant: &TenantId, algorithm: KeyAlgorithm) -> Result<KeyEntry> {
        self.key_actor(tenant, algorithm).await?.rotate(algorithm).await
    }

    /// Key rotation that revokes the previous key immediately.
    ///
    /// # Errors
    ///
    /// As [`ShardActor::emergency_rotate`].
    #[tracing::instrument(skip(self), fields(tenant = %tenant))]
    pub async fn emergency_rotate_key(
        &self,
        tenant: &TenantId,
        algorithm: KeyAlgorithm,
        reason: &str,
    ) -> Result<KeyEntry> {
        self.key_actor(tenant, algorithm).await?.emergency_rotate(algorithm, reason).await
    }

    /// Revokes one key.
    ///
    /// # Errors
    ///
    /// As the key actor's `revoke`.
    #[tracing::instrument(skip(self), fields(tenant = %tenant))]
    pub async fn revoke_key(&self, tenant: &TenantId, algorithm: KeyAlgorithm, kid: &str, reason: &str) -> Result<()> {
        self.key_actor(tenant, algorithm).await?.revoke(kid, reason).await
    }

    /// Public keys verifiers should accept, for one algorithm or all.
    ///
    /// # Errors
    ///
    /// [`PrimitiveError::Storage`] if an actor cannot be loaded.
    pub async fn verification_keys(&self, tenant: &TenantId, algorithm: Option<KeyAlgorithm>) -> Result<Vec<PublicJwk>> {
        let algorithms = match algorithm {
            Some(algorithm) => vec![algorithm],
            None => vec![KeyAlgorithm::EdDsa, KeyAlgorithm::Es256],
        };
        let mut keys = Vec::new();
        for algorithm in algorithms {
            let actor = self.key_actor(tenant, algorithm).await?;
            keys.extend(actor.verification_keys(Some(algorithm)).await?);
        }
        Ok(keys)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn sweep_targets(&self) -> Vec<Arc<dyn Sweep>> {
        vec![
            Arc::clone(&self.replay) as Arc<dyn Sweep>,
            Arc::clone(&self.consumables) as Arc<dyn Sweep>,
            Arc::clone(&self.families) as Arc<dyn Sweep>,
            Arc::clone(&self.counters) as Arc<dyn Sweep>,
            Arc::clone(&self.keys) as Arc<dyn Sweep>,
        ]
    }

    /// Starts the periodic sweeper. Calling it again is a no-op.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            let interval = self.config().sweep_interval();
            *sweeper = Some(spawn_sweeper(self.sweep_targets(), interval, self.cancel_token.child_token()));
            info!(?interval, "Started expiry sweeper");
        }
    }

    /// Runs one sweep over every live actor and flushes the audit buffer.
    /// Returns how many expired entries were removed.
    pub async fn sweep_once(&self) -> usize {
        let mut removed = 0;
        for target in self.sweep_targets() {
            removed += target.sweep_all().await;
        }
        self.ctx.audit.flush().await;
        removed
    }

    /// Stops the sweeper and flushes buffered audit events.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(error = %err, "Sweeper task panicked");
        }
        self.ctx.audit.shutdown().await;
    }
}

impl Drop for SecurityService {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

//! Rotating refresh-token families.
//!
//! One family per (user, client) pair tracks the rotation lineage of its
//! refresh tokens. Every rotation bumps the family version by exactly one
//! and issues a new id. Presenting an older version proves a token was
//! copied and replayed: the whole family is revoked on the spot and a
//! critical audit event is written before the caller hears back.
//!
//! ```text
//! NoFamily --create--> Active --rotate--> Active
//!                        |
//!                        +--revoke / stale version--> Revoked
//! ```
//!
//! Every id a family issues is indexed, so a family can be revoked by any of
//! its token ids without scanning.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use keyward_storage::{ClientId, ScopedStore, ScopedWrite, StorageResult, UserId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    audit::AuditKind,
    clock::{after, remaining},
    error::{PrimitiveError, Result},
    runtime::{ShardActor, ShardState, Turn},
};

const FAMILY_PREFIX: &str = "fam/";
const INDEX_PREFIX: &str = "idx/";

/// Revocation reason recorded when a stale version is presented.
pub const THEFT_REASON: &str = "refresh_token_reuse";

/// Shard key and storage key of the family for `(user, client)`.
///
/// Both parts are base64url-encoded so neither can smuggle a separator.
#[must_use]
pub fn family_shard_key(user: &UserId, client: &ClientId) -> String {
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(user.as_str()),
        URL_SAFE_NO_PAD.encode(client.as_str())
    )
}

/// Whether a family can still rotate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FamilyStatus {
    /// Rotations are accepted.
    Active,
    /// Terminal.
    Revoked {
        /// Why the family was revoked.
        reason: String,
        /// When.
        at: DateTime<Utc>,
    },
}

/// Rotation lineage for one (user, client) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenFamily {
    /// Owning user.
    pub user_id: UserId,
    /// Client the tokens were issued to.
    pub client_id: ClientId,
    /// Starts at 1; increases by exactly 1 per rotation.
    pub version: u64,
    /// The only id that may be presented with `version`.
    pub last_issued_id: String,
    /// Last successful rotation (or creation).
    pub last_used_at: DateTime<Utc>,
    /// End of life of the whole family.
    pub expires_at: DateTime<Utc>,
    /// Scope a rotation may request. Only ever narrows.
    pub allowed_scope: BTreeSet<String>,
    /// Active or revoked.
    pub status: FamilyStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl TokenFamily {
    /// Whether the family was revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        matches!(self.status, FamilyStatus::Revoked { .. })
    }

    fn key(&self) -> String {
        family_shard_key(&self.user_id, &self.client_id)
    }
}

/// What a successful create or rotate hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    /// Family version the new id is bound to.
    pub version: u64,
    /// The new refresh token id.
    pub issued_id: String,
    /// Scope granted to the new token.
    pub allowed_scope: BTreeSet<String>,
    /// When the family expires.
    pub expires_at: DateTime<Utc>,
}

impl From<&TokenFamily> for IssuedToken {
    fn from(family: &TokenFamily) -> Self {
        Self {
            version: family.version,
            issued_id: family.last_issued_id.clone(),
            allowed_scope: family.allowed_scope.clone(),
            expires_at: family.expires_at,
        }
    }
}

/// A rotation request as presented by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationRequest {
    /// Version the presented token was issued under.
    pub presented_version: u64,
    /// The presented token id.
    pub presented_id: String,
    /// Narrower scope for the next token, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_scope: Option<BTreeSet<String>>,
}

/// Families owned by one actor, plus the issued-id index in both
/// directions.
#[derive(Debug, Default)]
pub struct FamilyState {
    families: HashMap<String, TokenFamily>,
    /// Issued id → family key.
    index: HashMap<String, String>,
    /// Family key → ids it issued.
    issued: HashMap<String, Vec<String>>,
}

impl FamilyState {
    fn issued_ids_of(&self, family_key: &str) -> &[String] {
        self.issued.get(family_key).map(Vec::as_slice).unwrap_or_default()
    }

    fn link(&mut self, issued_id: String, family_key: String) {
        self.unlink(&issued_id);
        self.issued.entry(family_key.clone()).or_default().push(issued_id.clone());
        self.index.insert(issued_id, family_key);
    }

    fn unlink(&mut self, issued_id: &str) {
        let Some(owner) = self.index.remove(issued_id) else {
            return;
        };
        if let Some(ids) = self.issued.get_mut(&owner) {
            ids.retain(|id| id != issued_id);
            if ids.is_empty() {
                self.issued.remove(&owner);
            }
        }
    }
}

fn family_storage_key(family_key: &str) -> String {
    format!("{FAMILY_PREFIX}{family_key}")
}

fn index_storage_key(issued_id: &str) -> String {
    format!("{INDEX_PREFIX}{issued_id}")
}

#[async_trait]
impl ShardState for FamilyState {
    async fn load(store: &ScopedStore) -> StorageResult<Self> {
        let families = store
            .list_json::<TokenFamily>(FAMILY_PREFIX)
            .await?
            .into_iter()
            .map(|(_, family)| (family.key(), family))
            .collect();
        let mut state = Self { families, ..Self::default() };
        for (key, owner) in store.list_json::<String>(INDEX_PREFIX).await? {
            if let Some(issued_id) = key.strip_prefix(INDEX_PREFIX) {
                state.link(issued_id.to_owned(), owner);
            }
        }
        Ok(state)
    }

    fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut keys = Vec::new();
        for (family_key, family) in &self.families {
            if family.expires_at <= now {
                keys.push(family_storage_key(family_key));
                keys.extend(self.issued_ids_of(family_key).iter().map(|id| index_storage_key(id)));
            }
        }
        // Index entries whose family is gone entirely.
        keys.extend(
            self.issued
                .iter()
                .filter(|(owner, _)| !self.families.contains_key(*owner))
                .flat_map(|(_, ids)| ids.iter().map(|id| index_storage_key(id))),
        );
        keys
    }

    fn is_empty(&self) -> bool {
        self.families.is_empty() && self.index.is_empty()
    }

    fn forget(&mut self, keys: &[String]) {
        for key in keys {
            if let Some(family_key) = key.strip_prefix(FAMILY_PREFIX) {
                self.families.remove(family_key);
            } else if let Some(issued_id) = key.strip_prefix(INDEX_PREFIX) {
                self.unlink(issued_id);
            }
        }
    }
}

fn family_ttl(family: &TokenFamily, now: DateTime<Utc>) -> Duration {
    remaining(family.expires_at, now).max(Duration::from_secs(1))
}

/// Marks a family revoked, persists it and writes the critical audit event.
async fn revoke_in_turn(
    turn: &mut Turn<'_, FamilyState>,
    family_key: &str,
    reason: &str,
    kind: AuditKind,
) -> Result<()> {
    let now = turn.now();
    let Some(family) = turn.families.get(family_key) else {
        return Err(PrimitiveError::not_found(family_key));
    };
    if family.is_revoked() {
        return Ok(());
    }
    let revoked = TokenFamily {
        status: FamilyStatus::Revoked { reason: reason.to_owned(), at: now },
        ..family.clone()
    };
    turn.persist(&family_storage_key(family_key), &revoked, Some(family_ttl(&revoked, now))).await?;
    let version = revoked.version;
    turn.families.insert(family_key.to_owned(), revoked);

    let event = turn.event(kind, family_key).with_detail("reason", reason).with_detail("version", version);
    turn.audit_critical(event).await
}

fn active_family<'a>(turn: &'a Turn<'_, FamilyState>, family_key: &str) -> Result<&'a TokenFamily> {
    let family = turn.families.get(family_key).ok_or_else(|| PrimitiveError::not_found(family_key))?;
    if family.is_revoked() {
        return Err(PrimitiveError::FamilyRevoked);
    }
    if family.expires_at <= turn.now() {
        return Err(PrimitiveError::expired(family_key));
    }
    Ok(family)
}

fn scope_string(scope: &BTreeSet<String>) -> String {
    scope.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

impl ShardActor<FamilyState> {
    /// Starts a new family at version 1 with `initial_id` as its first token.
    ///
    /// Any existing family for the pair is replaced and its issued ids stop
    /// resolving.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the family cannot be persisted.
    #[tracing::instrument(skip(self, scope), fields(actor = %self.address()))]
    pub async fn create_family(
        &self,
        user: &UserId,
        client: &ClientId,
        initial_id: &str,
        ttl: Duration,
        scope: BTreeSet<String>,
    ) -> Result<IssuedToken> {
        let mut turn = self.turn().await?;
        let now = turn.now();
        let family_key = family_shard_key(user, client);
        let family = TokenFamily {
            user_id: user.clone(),
            client_id: client.clone(),
            version: 1,
            last_issued_id: initial_id.to_owned(),
            last_used_at: now,
            expires_at: after(now, ttl),
            allowed_scope: scope,
            status: FamilyStatus::Active,
            created_at: now,
        };
        let ttl = family_ttl(&family, now);

        let stale = turn.issued_ids_of(&family_key).to_vec();
        let mut writes: Vec<ScopedWrite> = stale.iter().map(|id| ScopedWrite::delete(index_storage_key(id))).collect();
        writes.push(ScopedWrite::put_json_with_ttl(family_storage_key(&family_key), &family, ttl)?);
        writes.push(ScopedWrite::put_json_with_ttl(index_storage_key(initial_id), &family_key, ttl)?);
        turn.commit(writes).await?;

        for id in &stale {
            turn.unlink(id);
        }
        turn.link(initial_id.to_owned(), family_key.clone());
        let issued = IssuedToken::from(&family);
        turn.families.insert(family_key.clone(), family);

        turn.audit(turn.event(AuditKind::FamilyCreated, &family_key).with_detail("client", client.as_str()));
        Ok(issued)
    }

    /// Rotates the family: checks the presented token, then issues `next_id`
    /// at the next version.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    ///
    /// - [`NotFound`](PrimitiveError::NotFound),
    ///   [`FamilyRevoked`](PrimitiveError::FamilyRevoked),
    ///   [`Expired`](PrimitiveError::Expired)
    /// - [`VersionMismatch`](PrimitiveError::VersionMismatch) for an older
    ///   version; the family is revoked first and a critical audit event is
    ///   written ([`AuditUnavailable`](PrimitiveError::AuditUnavailable) if
    ///   that write fails)
    /// - [`VersionMismatch`](PrimitiveError::VersionMismatch) for a newer
    ///   version, without revoking
    /// - [`IdMismatch`](PrimitiveError::IdMismatch) when the version matches
    ///   but the id does not, without revoking
    /// - [`ScopeEscalation`](PrimitiveError::ScopeEscalation) when the
    ///   requested scope is not within the allowed scope
    #[tracing::instrument(
        skip(self, request),
        fields(actor = %self.address(), presented_version = request.presented_version)
    )]
    pub async fn rotate(
        &self,
        user: &UserId,
        client: &ClientId,
        request: &RotationRequest,
        next_id: &str,
    ) -> Result<IssuedToken> {
        let mut turn = self.turn().await?;
        let now = turn.now();
        let family_key = family_shard_key(user, client);
        let family = active_family(&turn, &family_key)?;
        let stored = family.version;

        if request.presented_version < stored {
            warn!(
                family = %family_key,
                presented = request.presented_version,
                stored,
                "Stale refresh token presented; revoking family"
            );
            revoke_in_turn(&mut turn, &family_key, THEFT_REASON, AuditKind::TheftDetected).await?;
            return Err(PrimitiveError::VersionMismatch { presented: request.presented_version, stored });
        }
        if request.presented_version > stored {
            warn!(family = %family_key, presented = request.presented_version, stored, "Presented version is ahead of stored");
            return Err(PrimitiveError::VersionMismatch { presented: request.presented_version, stored });
        }
        if request.presented_id != family.last_issued_id {
            return Err(PrimitiveError::IdMismatch);
        }

        let allowed_scope = match &request.requested_scope {
            Some(requested) if !requested.is_subset(&family.allowed_scope) => {
                return Err(PrimitiveError::ScopeEscalation { requested: scope_string(requested) });
            },
            Some(requested) => requested.clone(),
            None => family.allowed_scope.clone(),
        };

        let rotated = TokenFamily {
            version: stored + 1,
            last_issued_id: next_id.to_owned(),
            last_used_at: now,
            allowed_scope,
            ..family.clone()
        };
        let ttl = family_ttl(&rotated, now);
        turn.commit(vec![
            ScopedWrite::put_json_with_ttl(family_storage_key(&family_key), &rotated, ttl)?,
            ScopedWrite::put_json_with_ttl(index_storage_key(next_id), &family_key, ttl)?,
        ])
        .await?;

        turn.link(next_id.to_owned(), family_key.clone());
        let issued = IssuedToken::from(&rotated);
        turn.families.insert(family_key.clone(), rotated);
        turn.audit(turn.event(AuditKind::FamilyRotated, &family_key).with_detail("version", issued.version));
        Ok(issued)
    }

    /// Checks that `presented_version` is the family's current version.
    /// Never mutates; a stale version here is rejected without revoking.
    ///
    /// # Errors
    ///
    /// [`NotFound`](PrimitiveError::NotFound),
    /// [`FamilyRevoked`](PrimitiveError::FamilyRevoked),
    /// [`Expired`](PrimitiveError::Expired) or
    /// [`VersionMismatch`](PrimitiveError::VersionMismatch).
    pub async fn validate(&self, user: &UserId, client: &ClientId, presented_version: u64) -> Result<TokenFamily> {
        let turn = self.turn().await?;
        let family = active_family(&turn, &family_shard_key(user, client))?;
        if family.version != presented_version {
            return Err(PrimitiveError::VersionMismatch { presented: presented_version, stored: family.version });
        }
        Ok(family.clone())
    }

    /// The family for the pair, revoked or not, if it has not expired.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the actor state cannot be
    /// loaded.
    pub async fn family_status(&self, user: &UserId, client: &ClientId) -> Result<Option<TokenFamily>> {
        let turn = self.turn().await?;
        let now = turn.now();
        Ok(turn.families.get(&family_shard_key(user, client)).filter(|f| f.expires_at > now).cloned())
    }

    /// Revokes the family for the pair. Revoking twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`NotFound`](PrimitiveError::NotFound),
    /// [`PrimitiveError::Storage`] or
    /// [`AuditUnavailable`](PrimitiveError::AuditUnavailable).
    #[tracing::instrument(skip(self), fields(actor = %self.address()))]
    pub async fn revoke_family(&self, user: &UserId, client: &ClientId, reason: &str) -> Result<()> {
        let mut turn = self.turn().await?;
        let family_key = family_shard_key(user, client);
        revoke_in_turn(&mut turn, &family_key, reason, AuditKind::FamilyRevoked).await?;
        info!(family = %family_key, reason, "Token family revoked");
        Ok(())
    }

    /// Revokes whichever family issued `issued_id`.
    ///
    /// # Errors
    ///
    /// [`NotFound`](PrimitiveError::NotFound) if no family here issued the
    /// id, otherwise as [`revoke_family`](Self::revoke_family).
    #[tracing::instrument(skip(self), fields(actor = %self.address()))]
    pub async fn revoke_by_issued_id(&self, issued_id: &str, reason: &str) -> Result<TokenFamily> {
        let mut turn = self.turn().await?;
        let family_key = turn.index.get(issued_id).cloned().ok_or_else(|| PrimitiveError::not_found(issued_id))?;
        revoke_in_turn(&mut turn, &family_key, reason, AuditKind::FamilyRevoked).await?;
        info!(family = %family_key, reason, "Token family revoked by issued id");
        turn.families.get(&family_key).cloned().ok_or_else(|| PrimitiveError::not_found(issued_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use keyward_sharding::{ActorAddress, RegionKey, TypePrefix};
    use keyward_storage::{MemoryBackend, RetryConfig, StorageBackend};

    use super::*;
    use crate::{
        audit::{AuditSidecar, MemoryAuditSink},
        clock::ManualClock,
        config::PrimitivesConfig,
        runtime::ActorContext,
    };

    const TTL: Duration = Duration::from_secs(30 * 24 * 3600);

    struct Fixture {
        clock: ManualClock,
        sink: MemoryAuditSink,
        backend: Arc<dyn StorageBackend>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                clock: ManualClock::default(),
                sink: MemoryAuditSink::new(),
                backend: Arc::new(MemoryBackend::new()),
            }
        }

        fn actor(&self) -> ShardActor<FamilyState> {
            let ctx = Arc::new(ActorContext {
                clock: Arc::new(self.clock.clone()),
                audit: AuditSidecar::start(Arc::new(self.sink.clone()), Default::default()),
                config: Arc::new(PrimitivesConfig::default()),
                retry: RetryConfig::none(),
            });
            let address = ActorAddress {
                tenant: "acme".parse().unwrap(),
                region: RegionKey::Wnam,
                type_prefix: TypePrefix::REFRESH_TOKEN_FAMILY,
                shard: 1,
            };
            ShardActor::new(address, Arc::clone(&self.backend), ctx)
        }
    }

    fn scope(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    fn presented(version: u64, id: &str) -> RotationRequest {
        RotationRequest { presented_version: version, presented_id: id.to_owned(), requested_scope: None }
    }

    fn pair() -> (UserId, ClientId) {
        (UserId::from("u1"), ClientId::from("c1"))
    }

    #[test]
    fn test_family_key_cannot_collide_through_separator() {
        let a = family_shard_key(&UserId::from("a.b"), &ClientId::from("c"));
        let b = family_shard_key(&UserId::from("a"), &ClientId::from("b.c"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_rotation_then_replay_revokes_family() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        let (user, client) = pair();

        let created = actor.create_family(&user, &client, "A", TTL, scope(&["openid"])).await.unwrap();
        assert_eq!(created.version, 1);

        let rotated = actor.rotate(&user, &client, &presented(1, "A"), "B").await.unwrap();
        assert_eq!((rotated.version, rotated.issued_id.as_str()), (2, "B"));

        let err = actor.rotate(&user, &client, &presented(1, "A"), "C").await.unwrap_err();
        assert!(matches!(err, PrimitiveError::VersionMismatch { presented: 1, stored: 2 }));
        assert!(fixture.sink.events_of(AuditKind::TheftDetected).len() == 1);

        assert!(matches!(actor.validate(&user, &client, 2).await.unwrap_err(), PrimitiveError::FamilyRevoked));
        assert!(matches!(
            actor.rotate(&user, &client, &presented(2, "B"), "D").await.unwrap_err(),
            PrimitiveError::FamilyRevoked
        ));

        let status = actor.family_status(&user, &client).await.unwrap().unwrap();
        assert!(matches!(status.status, FamilyStatus::Revoked { ref reason, .. } if reason == THEFT_REASON));
    }

    #[tokio::test]
    async fn test_id_mismatch_does_not_revoke() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        let (user, client) = pair();
        actor.create_family(&user, &client, "A", TTL, scope(&[])).await.unwrap();

        assert!(matches!(
            actor.rotate(&user, &client, &presented(1, "X"), "B").await.unwrap_err(),
            PrimitiveError::IdMismatch
        ));
        assert!(matches!(
            actor.rotate(&user, &client, &presented(5, "A"), "B").await.unwrap_err(),
            PrimitiveError::VersionMismatch { presented: 5, stored: 1 }
        ));
        assert!(actor.rotate(&user, &client, &presented(1, "A"), "B").await.is_ok());
        assert!(fixture.sink.events_of(AuditKind::TheftDetected).is_empty());
    }

    #[tokio::test]
    async fn test_scope_only_narrows() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        let (user, client) = pair();
        actor.create_family(&user, &client, "A", TTL, scope(&["openid", "email", "profile"])).await.unwrap();

        let mut request = presented(1, "A");
        request.requested_scope = Some(scope(&["openid", "email"]));
        let narrowed = actor.rotate(&user, &client, &request, "B").await.unwrap();
        assert_eq!(narrowed.allowed_scope, scope(&["email", "openid"]));

        let mut request = presented(2, "B");
        request.requested_scope = Some(scope(&["openid", "profile"]));
        let err = actor.rotate(&user, &client, &request, "C").await.unwrap_err();
        assert!(matches!(err, PrimitiveError::ScopeEscalation { ref requested } if requested == "openid profile"));
    }

    #[tokio::test]
    async fn test_revoke_by_issued_id_uses_index() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        let (user, client) = pair();
        actor.create_family(&user, &client, "A", TTL, scope(&[])).await.unwrap();
        actor.rotate(&user, &client, &presented(1, "A"), "B").await.unwrap();

        // Any id the family ever issued resolves to it, even after a restart.
        let restarted = fixture.actor();
        let family = restarted.revoke_by_issued_id("A", "user_logout").await.unwrap();
        assert!(family.is_revoked());
        assert_eq!(fixture.sink.events_of(AuditKind::FamilyRevoked).len(), 1);

        assert!(matches!(
            restarted.revoke_by_issued_id("unknown", "x").await.unwrap_err(),
            PrimitiveError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_recreate_replaces_family_and_index() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        let (user, client) = pair();
        actor.create_family(&user, &client, "A", TTL, scope(&[])).await.unwrap();
        actor.revoke_family(&user, &client, "admin").await.unwrap();

        actor.create_family(&user, &client, "N", TTL, scope(&[])).await.unwrap();
        assert!(actor.validate(&user, &client, 1).await.is_ok());
        assert!(actor.revoke_by_issued_id("A", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_recreate_drops_only_its_own_ids() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        let (user, client) = pair();
        let other_client = ClientId::from("c2");
        actor.create_family(&user, &client, "A", TTL, scope(&[])).await.unwrap();
        actor.rotate(&user, &client, &presented(1, "A"), "B").await.unwrap();
        actor.create_family(&user, &other_client, "X", TTL, scope(&[])).await.unwrap();

        actor.create_family(&user, &client, "N", TTL, scope(&[])).await.unwrap();
        {
            let turn = actor.turn().await.unwrap();
            let family_key = family_shard_key(&user, &client);
            assert_eq!(turn.issued_ids_of(&family_key), ["N".to_owned()]);
            assert_eq!(turn.issued_ids_of(&family_shard_key(&user, &other_client)), ["X".to_owned()]);
            assert!(!turn.index.contains_key("A") && !turn.index.contains_key("B"));
        }
        assert!(fixture.backend.get(b"actors/acme:wnam:rtf:1/idx/B").await.unwrap().is_none());

        // The reverse list is rebuilt on load.
        let restarted = fixture.actor();
        let turn = restarted.turn().await.unwrap();
        assert_eq!(turn.issued_ids_of(&family_shard_key(&user, &client)), ["N".to_owned()]);
        assert_eq!(turn.index.len(), 2);
    }

    #[tokio::test]
    async fn test_expired_family_and_sweep() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        let (user, client) = pair();
        actor.create_family(&user, &client, "A", Duration::from_secs(60), scope(&[])).await.unwrap();

        fixture.clock.advance(Duration::from_secs(61));
        assert!(matches!(
            actor.rotate(&user, &client, &presented(1, "A"), "B").await.unwrap_err(),
            PrimitiveError::Expired { .. }
        ));
        assert_eq!(actor.sweep().await.unwrap(), 2);
        assert!(actor.family_status(&user, &client).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_theft_reported_even_if_audit_fails() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        let (user, client) = pair();
        actor.create_family(&user, &client, "A", TTL, scope(&[])).await.unwrap();
        actor.rotate(&user, &client, &presented(1, "A"), "B").await.unwrap();

        fixture.sink.set_failing(true);
        let err = actor.rotate(&user, &client, &presented(1, "A"), "C").await.unwrap_err();
        assert!(matches!(err, PrimitiveError::AuditUnavailable(_)));
        assert_eq!(err.oauth_error_code(), "server_error");
        // The revocation itself was persisted.
        assert!(actor.family_status(&user, &client).await.unwrap().unwrap().is_revoked());
    }
}

//! Signing-key rotation.
//!
//! Keys are grouped per algorithm. At most one key per algorithm is
//! `active` (signs); keys replaced by a planned [`rotate`](ShardActor::rotate)
//! stay `overlap` (verify only) until their grace period ends, so tokens
//! signed just before the rotation keep verifying. An
//! [`emergency_rotate`](ShardActor::emergency_rotate) skips the grace
//! period: the replaced key is `revoked` at once and disappears from the
//! verification set.
//!
//! Revoked keys are kept for the audit retention window, then purged by the
//! sweep together with overlap keys past their grace period.

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use keyward_storage::{ScopedStore, ScopedWrite, StorageResult};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::{
    audit::AuditKind,
    clock::after,
    error::{PrimitiveError, Result},
    runtime::{ShardActor, ShardState, Turn},
};

const KEY_PREFIX: &str = "key/";

/// Signature algorithm of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// Ed25519.
    #[serde(rename = "EdDSA")]
    EdDsa,
    /// ECDSA over P-256 with SHA-256.
    #[serde(rename = "ES256")]
    Es256,
}

impl KeyAlgorithm {
    /// JOSE algorithm name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EdDsa => "EdDSA",
            Self::Es256 => "ES256",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Signs new tokens.
    Active,
    /// Verifies only, until `expires_at`.
    Overlap,
    /// Neither signs nor verifies. Kept until `expires_at` for audit.
    Revoked,
}

/// Public half of a key as a JWK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    /// `OKP` or `EC`.
    pub kty: String,
    /// `Ed25519` or `P-256`.
    pub crv: String,
    /// Public key, or the x coordinate for EC keys.
    pub x: String,
    /// y coordinate for EC keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    /// Key id.
    pub kid: String,
    /// JOSE algorithm.
    pub alg: String,
    /// Always `sig`.
    #[serde(rename = "use")]
    pub key_use: String,
}

/// One key in a key set.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEntry {
    /// Key id.
    pub kid: String,
    /// Algorithm family.
    pub algorithm: KeyAlgorithm,
    /// Public material.
    pub public_jwk: PublicJwk,
    /// Raw private key, base64url. Scrubbed from memory on drop.
    #[serde(with = "private_material")]
    pub private_material: Zeroizing<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Current status.
    pub status: KeyStatus,
    /// End of the overlap grace period, or end of audit retention once
    /// revoked. `None` while active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// When the key was revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Why the key was revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_reason: Option<String>,
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("private_material", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .field("status", &self.status)
            .field("expires_at", &self.expires_at)
            .field("revoked_at", &self.revoked_at)
            .finish_non_exhaustive()
    }
}

impl KeyEntry {
    /// Whether the key may verify signatures at `now`.
    #[must_use]
    pub fn verifies_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            KeyStatus::Active => true,
            KeyStatus::Overlap => self.expires_at.is_none_or(|end| end > now),
            KeyStatus::Revoked => false,
        }
    }

    fn purgeable_at(&self, now: DateTime<Utc>) -> bool {
        self.status != KeyStatus::Active && self.expires_at.is_some_and(|end| end <= now)
    }
}

mod private_material {
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub(super) fn serialize<S: Serializer>(value: &Zeroizing<String>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_str())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Zeroizing<String>, D::Error> {
        String::deserialize(deserializer).map(Zeroizing::new)
    }
}

fn new_kid(algorithm: KeyAlgorithm) -> String {
    let suffix: [u8; 12] = rand::random();
    format!("{}-{}", algorithm.as_str().to_ascii_lowercase(), URL_SAFE_NO_PAD.encode(suffix))
}

/// Generates fresh key material.
fn generate(algorithm: KeyAlgorithm, now: DateTime<Utc>) -> Result<KeyEntry> {
    let kid = new_kid(algorithm);
    let (public_jwk, private_material) = match algorithm {
        KeyAlgorithm::EdDsa => {
            let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
            let private: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
            let jwk = PublicJwk {
                kty: "OKP".into(),
                crv: "Ed25519".into(),
                x: URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes()),
                y: None,
                kid: kid.clone(),
                alg: algorithm.as_str().into(),
                key_use: "sig".into(),
            };
            (jwk, Zeroizing::new(URL_SAFE_NO_PAD.encode(*private)))
        },
        KeyAlgorithm::Es256 => {
            let signing_key = p256::ecdsa::SigningKey::random(&mut OsRng);
            let point = signing_key.verifying_key().to_encoded_point(false);
            let missing = || PrimitiveError::KeyMaterial { reason: "P-256 point has no affine coordinates".into() };
            let jwk = PublicJwk {
                kty: "EC".into(),
                crv: "P-256".into(),
                x: URL_SAFE_NO_PAD.encode(point.x().ok_or_else(missing)?),
                y: Some(URL_SAFE_NO_PAD.encode(point.y().ok_or_else(missing)?)),
                kid: kid.clone(),
                alg: algorithm.as_str().into(),
                key_use: "sig".into(),
            };
            let private: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes().into());
            (jwk, Zeroizing::new(URL_SAFE_NO_PAD.encode(*private)))
        },
    };
    Ok(KeyEntry {
        kid,
        algorithm,
        public_jwk,
        private_material,
        created_at: now,
        status: KeyStatus::Active,
        expires_at: None,
        revoked_at: None,
        revoked_reason: None,
    })
}

/// Keys owned by one actor, keyed by kid.
#[derive(Debug, Default)]
pub struct KeyState {
    keys: BTreeMap<String, KeyEntry>,
}

impl KeyState {
    fn active(&self, algorithm: KeyAlgorithm) -> Option<&KeyEntry> {
        self.keys.values().find(|key| key.algorithm == algorithm && key.status == KeyStatus::Active)
    }

    /// Whether this set holds any key for `algorithm`.
    #[must_use]
    pub fn has_keys(&self, algorithm: KeyAlgorithm) -> bool {
        self.keys.values().any(|key| key.algorithm == algorithm)
    }
}

fn storage_key(kid: &str) -> String {
    format!("{KEY_PREFIX}{kid}")
}

#[async_trait]
impl ShardState for KeyState {
    async fn load(store: &ScopedStore) -> StorageResult<Self> {
        let keys = store
            .list_json::<KeyEntry>(KEY_PREFIX)
            .await?
            .into_iter()
            .map(|(_, key)| (key.kid.clone(), key))
            .collect();
        Ok(Self { keys })
    }

    fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        self.keys.values().filter(|key| key.purgeable_at(now)).map(|key| storage_key(&key.kid)).collect()
    }

    fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn forget(&mut self, keys: &[String]) {
        for key in keys {
            if let Some(kid) = key.strip_prefix(KEY_PREFIX) {
                self.keys.remove(kid);
            }
        }
    }
}

/// How the replaced active key is retired.
#[derive(Debug, Clone, Copy)]
enum Retire {
    Overlap,
    Revoke,
}

/// Generates a new active key and retires the previous one in one commit.
async fn replace_active(
    turn: &mut Turn<'_, KeyState>,
    algorithm: KeyAlgorithm,
    retire: Retire,
    reason: Option<&str>,
) -> Result<(KeyEntry, Option<KeyEntry>)> {
    let now = turn.now();
    let fresh = generate(algorithm, now)?;
    let retired = turn.active(algorithm).cloned().map(|previous| match retire {
        Retire::Overlap => KeyEntry {
            status: KeyStatus::Overlap,
            expires_at: Some(after(now, turn.config().keys().overlap_period())),
            ..previous
        },
        Retire::Revoke => KeyEntry {
            status: KeyStatus::Revoked,
            expires_at: Some(after(now, turn.config().keys().revoked_retention())),
            revoked_at: Some(now),
            revoked_reason: reason.map(str::to_owned),
            ..previous
        },
    });

    let mut writes = vec![ScopedWrite::put_json(storage_key(&fresh.kid), &fresh)?];
    if let Some(retired) = &retired {
        writes.push(ScopedWrite::put_json(storage_key(&retired.kid), retired)?);
    }
    turn.commit(writes).await?;

    if let Some(retired) = &retired {
        turn.keys.insert(retired.kid.clone(), retired.clone());
    }
    turn.keys.insert(fresh.kid.clone(), fresh.clone());
    Ok((fresh, retired))
}

impl ShardActor<KeyState> {
    /// Returns the active key for `algorithm`, generating one if none
    /// exists.
    ///
    /// # Errors
    ///
    /// [`KeyMaterial`](PrimitiveError::KeyMaterial) or
    /// [`PrimitiveError::Storage`] if a new key cannot be made or persisted.
    #[tracing::instrument(skip(self), fields(actor = %self.address()))]
    pub async fn ensure_active(&self, algorithm: KeyAlgorithm) -> Result<KeyEntry> {
        let mut turn = self.turn().await?;
        if let Some(active) = turn.active(algorithm) {
            return Ok(active.clone());
        }
        let (fresh, _) = replace_active(&mut turn, algorithm, Retire::Overlap, None).await?;
        info!(kid = %fresh.kid, %algorithm, "Generated initial signing key");
        Ok(fresh)
    }

    /// The key new tokens should be signed with.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_active`](Self::ensure_active).
    pub async fn signing_key(&self, algorithm: KeyAlgorithm) -> Result<KeyEntry> {
        self.ensure_active(algorithm).await
    }

    /// Planned rotation: a new key becomes active and the previous active
    /// key moves to overlap for the configured grace period.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_active`](Self::ensure_active).
    #[tracing::instrument(skip(self), fields(actor = %self.address()))]
    pub async fn rotate(&self, algorithm: KeyAlgorithm) -> Result<KeyEntry> {
        let mut turn = self.turn().await?;
        let (fresh, retired) = replace_active(&mut turn, algorithm, Retire::Overlap, None).await?;
        let mut event = turn.event(AuditKind::KeyRotated, &fresh.kid).with_detail("algorithm", algorithm.as_str());
        if let Some(retired) = &retired {
            event = event.with_detail("previous", retired.kid.as_str());
        }
        turn.audit(event);
        info!(kid = %fresh.kid, %algorithm, "Rotated signing key");
        Ok(fresh)
    }

    /// Rotation without grace: the previous active key is revoked at once.
    ///
    /// # Errors
    ///
    /// As [`rotate`](Self::rotate), plus
    /// [`AuditUnavailable`](PrimitiveError::AuditUnavailable) if the critical
    /// audit event cannot be written. The rotation itself has been persisted
    /// by then.
    #[tracing::instrument(skip(self), fields(actor = %self.address()))]
    pub async fn emergency_rotate(&self, algorithm: KeyAlgorithm, reason: &str) -> Result<KeyEntry> {
        let mut turn = self.turn().await?;
        let (fresh, retired) = replace_active(&mut turn, algorithm, Retire::Revoke, Some(reason)).await?;
        warn!(kid = %fresh.kid, %algorithm, reason, "Emergency signing key rotation");
        let mut event = turn
            .event(AuditKind::EmergencyRotation, &fresh.kid)
            .with_detail("algorithm", algorithm.as_str())
            .with_detail("reason", reason);
        if let Some(retired) = &retired {
            event = event.with_detail("revoked", retired.kid.as_str());
        }
        turn.audit_critical(event).await?;
        Ok(fresh)
    }

    /// Revokes one key. Revoking a revoked key is a no-op.
    ///
    /// Revoking the active key leaves the algorithm without one until the
    /// next [`ensure_active`](Self::ensure_active).
    ///
    /// # Errors
    ///
    /// [`KeyNotFound`](PrimitiveError::KeyNotFound),
    /// [`PrimitiveError::Storage`] or
    /// [`AuditUnavailable`](PrimitiveError::AuditUnavailable).
    #[tracing::instrument(skip(self), fields(actor = %self.address()))]
    pub async fn revoke(&self, kid: &str, reason: &str) -> Result<()> {
        let mut turn = self.turn().await?;
        let now = turn.now();
        let key = turn.keys.get(kid).ok_or_else(|| PrimitiveError::KeyNotFound { kid: kid.to_owned() })?;
        if key.status == KeyStatus::Revoked {
            return Ok(());
        }
        let revoked = KeyEntry {
            status: KeyStatus::Revoked,
            expires_at: Some(after(now, turn.config().keys().revoked_retention())),
            revoked_at: Some(now),
            revoked_reason: Some(reason.to_owned()),
            ..key.clone()
        };
        turn.persist(&storage_key(kid), &revoked, None).await?;
        turn.keys.insert(kid.to_owned(), revoked);
        warn!(kid, reason, "Signing key revoked");
        turn.audit_critical(turn.event(AuditKind::KeyRevoked, kid).with_detail("reason", reason)).await
    }

    /// Public keys that may verify signatures now: the active key and every
    /// overlap key still in its grace period, newest first. Never revoked
    /// keys.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the actor state cannot be
    /// loaded.
    pub async fn verification_keys(&self, algorithm: Option<KeyAlgorithm>) -> Result<Vec<PublicJwk>> {
        let turn = self.turn().await?;
        let now = turn.now();
        let mut keys: Vec<&KeyEntry> = turn
            .keys
            .values()
            .filter(|key| algorithm.is_none_or(|alg| key.algorithm == alg) && key.verifies_at(now))
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys.into_iter().map(|key| key.public_jwk.clone()).collect())
    }

    /// A key by id, in any status.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the actor state cannot be
    /// loaded.
    pub async fn key(&self, kid: &str) -> Result<Option<KeyEntry>> {
        Ok(self.turn().await?.keys.get(kid).cloned())
    }

    /// Whether this set holds any key for `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the actor state cannot be
    /// loaded.
    pub async fn has_keys(&self, algorithm: KeyAlgorithm) -> Result<bool> {
        Ok(self.turn().await?.has_keys(algorithm))
    }

    /// Purges overlap keys past their grace period and revoked keys past
    /// retention.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the purge cannot be persisted.
    pub async fn cleanup(&self) -> Result<usize> {
        self.sweep().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use keyward_sharding::{ActorAddress, RegionKey, TypePrefix};
    use keyward_storage::{MemoryBackend, RetryConfig, StorageBackend};
    use rstest::rstest;

    use super::*;
    use crate::{
        audit::{AuditSidecar, MemoryAuditSink},
        clock::ManualClock,
        config::{KeyConfig, PrimitivesConfig},
        runtime::ActorContext,
    };

    struct Fixture {
        clock: ManualClock,
        sink: MemoryAuditSink,
        backend: Arc<dyn StorageBackend>,
    }

    impl Fixture {
        fn new() -> Self {
            Self { clock: ManualClock::default(), sink: MemoryAuditSink::new(), backend: Arc::new(MemoryBackend::new()) }
        }

        fn actor(&self) -> ShardActor<KeyState> {
            let keys = KeyConfig::builder()
                .overlap_period(Duration::from_secs(3600))
                .revoked_retention(Duration::from_secs(7 * 24 * 3600))
                .build()
                .unwrap();
            let ctx = Arc::new(ActorContext {
                clock: Arc::new(self.clock.clone()),
                audit: AuditSidecar::start(Arc::new(self.sink.clone()), Default::default()),
                config: Arc::new(PrimitivesConfig::builder().keys(keys).build().unwrap()),
                retry: RetryConfig::none(),
            });
            let address =
                ActorAddress { tenant: "acme".parse().unwrap(), region: RegionKey::Me, type_prefix: TypePrefix::SIGNING_KEY, shard: 0 };
            ShardActor::new(address, Arc::clone(&self.backend), ctx)
        }
    }

    fn kids(jwks: &[PublicJwk]) -> Vec<&str> {
        jwks.iter().map(|jwk| jwk.kid.as_str()).collect()
    }

    #[rstest]
    #[case(KeyAlgorithm::EdDsa, "OKP", 43, false)]
    #[case(KeyAlgorithm::Es256, "EC", 43, true)]
    fn test_generated_material(
        #[case] algorithm: KeyAlgorithm,
        #[case] kty: &str,
        #[case] x_len: usize,
        #[case] has_y: bool,
    ) {
        let key = generate(algorithm, Utc::now()).unwrap();
        assert_eq!(key.public_jwk.kty, kty);
        assert_eq!(key.public_jwk.x.len(), x_len);
        assert_eq!(key.public_jwk.y.is_some(), has_y);
        assert_eq!(key.private_material.len(), 43);
        assert!(key.kid.starts_with(&algorithm.as_str().to_ascii_lowercase()));
    }

    #[test]
    fn test_debug_redacts_private_material() {
        let key = generate(KeyAlgorithm::EdDsa, Utc::now()).unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(key.private_material.as_str()));
    }

    #[tokio::test]
    async fn test_rotate_keeps_previous_in_overlap() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        let first = actor.ensure_active(KeyAlgorithm::EdDsa).await.unwrap();
        let second = actor.rotate(KeyAlgorithm::EdDsa).await.unwrap();

        let verifying = actor.verification_keys(Some(KeyAlgorithm::EdDsa)).await.unwrap();
        assert_eq!(kids(&verifying), vec![second.kid.as_str(), first.kid.as_str()]);
        assert_eq!(actor.signing_key(KeyAlgorithm::EdDsa).await.unwrap().kid, second.kid);

        fixture.clock.advance(Duration::from_secs(3601));
        let verifying = actor.verification_keys(None).await.unwrap();
        assert_eq!(kids(&verifying), vec![second.kid.as_str()]);
        assert_eq!(actor.cleanup().await.unwrap(), 1);
        assert!(actor.key(&first.kid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_emergency_rotate_drops_previous() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        let first = actor.ensure_active(KeyAlgorithm::Es256).await.unwrap();
        let second = actor.emergency_rotate(KeyAlgorithm::Es256, "key compromise").await.unwrap();

        let verifying = actor.verification_keys(Some(KeyAlgorithm::Es256)).await.unwrap();
        assert_eq!(kids(&verifying), vec![second.kid.as_str()]);

        let revoked = actor.key(&first.kid).await.unwrap().unwrap();
        assert_eq!(revoked.status, KeyStatus::Revoked);
        assert_eq!(revoked.revoked_reason.as_deref(), Some("key compromise"));
        assert_eq!(fixture.sink.events_of(AuditKind::EmergencyRotation).len(), 1);

        // Kept for the audit window, then purged.
        fixture.clock.advance(Duration::from_secs(24 * 3600));
        assert_eq!(actor.cleanup().await.unwrap(), 0);
        fixture.clock.advance(Duration::from_secs(7 * 24 * 3600));
        assert_eq!(actor.cleanup().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_one_active_key_per_algorithm() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        actor.ensure_active(KeyAlgorithm::EdDsa).await.unwrap();
        actor.ensure_active(KeyAlgorithm::Es256).await.unwrap();
        for _ in 0..3 {
            actor.rotate(KeyAlgorithm::EdDsa).await.unwrap();
        }
        let turn = actor.turn().await.unwrap();
        let active = turn.keys.values().filter(|k| k.status == KeyStatus::Active).count();
        assert_eq!(active, 2);
    }

    #[tokio::test]
    async fn test_revoke_overlap_key() {
        let fixture = Fixture::new();
        let actor = fixture.actor();
        let first = actor.ensure_active(KeyAlgorithm::EdDsa).await.unwrap();
        actor.rotate(KeyAlgorithm::EdDsa).await.unwrap();

        actor.revoke(&first.kid, "retired early").await.unwrap();
        actor.revoke(&first.kid, "retired early").await.unwrap();
        assert_eq!(actor.verification_keys(None).await.unwrap().len(), 1);
        assert_eq!(fixture.sink.events_of(AuditKind::KeyRevoked).len(), 1);
        assert!(matches!(actor.revoke("missing", "x").await.unwrap_err(), PrimitiveError::KeyNotFound { .. }));
    }

    #[tokio::test]
    async fn test_private_material_survives_restart() {
        let fixture = Fixture::new();
        let key = fixture.actor().ensure_active(KeyAlgorithm::EdDsa).await.unwrap();
        let reloaded = fixture.actor().signing_key(KeyAlgorithm::EdDsa).await.unwrap();
        assert_eq!(reloaded.kid, key.kid);
        assert_eq!(*reloaded.private_material, *key.private_material);
    }
}

//! Request/response entry point.
//!
//! [`SecurityRequest`] and [`SecurityResponse`] are the JSON shapes of the
//! legacy transport. [`SecurityService::handle`] maps each request onto the
//! matching typed method, so both surfaces share one code path. Failures
//! come back as an OAuth error code with a generic description; internal
//! details such as theft detection never reach the presenter.
//!
//! ```
//! use keyward_authn::rpc::SecurityRequest;
//!
//! let request: SecurityRequest = serde_json::from_str(
//!     r#"{ "op": "increment", "key": "login:u1", "window": "1m", "max_requests": 5 }"#,
//! )
//! .unwrap();
//! assert!(matches!(request, SecurityRequest::Increment { max_requests: 5, .. }));
//! ```

use std::{collections::BTreeSet, time::Duration};

use chrono::{DateTime, Utc};
use keyward_sharding::TypePrefix;
use keyward_storage::{ClientId, TenantId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    consumable::{OneTimeConsumable, PollOutcome},
    counter::{RateDecision, RateWindow},
    error::{PrimitiveError, Result},
    family::{IssuedToken, RotationRequest, TokenFamily},
    keys::{KeyAlgorithm, PublicJwk},
    replay::ReplayOutcome,
    service::SecurityService,
};

/// A token to revoke in bulk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedToken {
    /// Token id.
    pub token_id: String,
    /// When the token expires; an hour from now if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// One operation, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
#[allow(missing_docs)]
pub enum SecurityRequest {
    CheckAndRecordJti {
        jti: String,
        proof_expires_at: DateTime<Utc>,
        #[serde(default)]
        metadata: Option<Value>,
    },
    IsJtiRecorded {
        jti: String,
    },
    RevokeToken {
        token_id: String,
        expires_at: DateTime<Utc>,
    },
    RevokeTokens {
        tokens: Vec<RevokedToken>,
    },
    IsRevoked {
        token_id: String,
    },
    StoreConsumable {
        #[serde(rename = "type")]
        kind: TypePrefix,
        shard_key: String,
        payload: Value,
        #[serde(with = "humantime_serde")]
        ttl: Duration,
    },
    StorePolling {
        #[serde(rename = "type")]
        kind: TypePrefix,
        shard_key: String,
        payload: Value,
        #[serde(with = "humantime_serde")]
        ttl: Duration,
        #[serde(default, with = "humantime_serde")]
        interval: Option<Duration>,
    },
    StoreConsumableAt {
        id: String,
        payload: Value,
        #[serde(with = "humantime_serde")]
        ttl: Duration,
    },
    StorePollingAt {
        id: String,
        payload: Value,
        #[serde(with = "humantime_serde")]
        ttl: Duration,
        #[serde(default, with = "humantime_serde")]
        interval: Option<Duration>,
    },
    Consume {
        id: String,
        #[serde(default)]
        expected_payload: Option<Value>,
    },
    Peek {
        id: String,
    },
    Approve {
        id: String,
        grant: Value,
    },
    Deny {
        id: String,
    },
    Poll {
        id: String,
    },
    CreateFamily {
        user_id: UserId,
        client_id: ClientId,
        #[serde(with = "humantime_serde")]
        ttl: Duration,
        #[serde(default)]
        scope: BTreeSet<String>,
    },
    RotateFamily {
        user_id: UserId,
        client_id: ClientId,
        presented_version: u64,
        presented_id: String,
        #[serde(default)]
        requested_scope: Option<BTreeSet<String>>,
    },
    ValidateFamily {
        user_id: UserId,
        client_id: ClientId,
        presented_version: u64,
    },
    FamilyStatus {
        user_id: UserId,
        client_id: ClientId,
    },
    RevokeFamily {
        user_id: UserId,
        client_id: ClientId,
        reason: String,
    },
    RevokeByIssuedId {
        issued_id: String,
        reason: String,
    },
    Increment {
        key: String,
        #[serde(with = "humantime_serde")]
        window: Duration,
        max_requests: u64,
    },
    PeekCounter {
        key: String,
    },
    ResetCounter {
        key: String,
    },
    EnsureActiveKey {
        algorithm: KeyAlgorithm,
    },
    RotateKey {
        algorithm: KeyAlgorithm,
    },
    EmergencyRotateKey {
        algorithm: KeyAlgorithm,
        reason: String,
    },
    RevokeKey {
        algorithm: KeyAlgorithm,
        kid: String,
        reason: String,
    },
    VerificationKeys {
        #[serde(default)]
        algorithm: Option<KeyAlgorithm>,
    },
}

impl SecurityRequest {
    /// The `op` tag, for logs.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::CheckAndRecordJti { .. } => "check_and_record_jti",
            Self::IsJtiRecorded { .. } => "is_jti_recorded",
            Self::RevokeToken { .. } => "revoke_token",
            Self::RevokeTokens { .. } => "revoke_tokens",
            Self::IsRevoked { .. } => "is_revoked",
            Self::StoreConsumable { .. } => "store_consumable",
            Self::StorePolling { .. } => "store_polling",
            Self::StoreConsumableAt { .. } => "store_consumable_at",
            Self::StorePollingAt { .. } => "store_polling_at",
            Self::Consume { .. } => "consume",
            Self::Peek { .. } => "peek",
            Self::Approve { .. } => "approve",
            Self::Deny { .. } => "deny",
            Self::Poll { .. } => "poll",
            Self::CreateFamily { .. } => "create_family",
            Self::RotateFamily { .. } => "rotate_family",
            Self::ValidateFamily { .. } => "validate_family",
            Self::FamilyStatus { .. } => "family_status",
            Self::RevokeFamily { .. } => "revoke_family",
            Self::RevokeByIssuedId { .. } => "revoke_by_issued_id",
            Self::Increment { .. } => "increment",
            Self::PeekCounter { .. } => "peek_counter",
            Self::ResetCounter { .. } => "reset_counter",
            Self::EnsureActiveKey { .. } => "ensure_active_key",
            Self::RotateKey { .. } => "rotate_key",
            Self::EmergencyRotateKey { .. } => "emergency_rotate_key",
            Self::RevokeKey { .. } => "revoke_key",
            Self::VerificationKeys { .. } => "verification_keys",
        }
    }
}

/// Result of one operation, tagged by `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum SecurityResponse {
    Ok,
    Replay { outcome: ReplayOutcome },
    Replays { outcomes: Vec<ReplayOutcome> },
    Flag { value: bool },
    Consumable { item: OneTimeConsumable },
    MaybeConsumable { item: Option<OneTimeConsumable> },
    Poll { outcome: PollOutcome },
    Issued { token: IssuedToken },
    Family { family: TokenFamily },
    MaybeFamily { family: Option<TokenFamily> },
    Rate { decision: RateDecision },
    MaybeWindow { window: Option<RateWindow> },
    Key { key: PublicJwk },
    Keys { keys: Vec<PublicJwk> },
    Error { error: String, error_description: String },
}

impl From<&PrimitiveError> for SecurityResponse {
    fn from(err: &PrimitiveError) -> Self {
        Self::Error {
            error: err.oauth_error_code().to_owned(),
            error_description: err.public_description().to_owned(),
        }
    }
}

impl SecurityService {
    /// Runs one legacy request against the same methods the direct-call
    /// surface uses.
    #[tracing::instrument(skip(self, request), fields(tenant = %tenant, op = request.op()))]
    pub async fn handle(&self, tenant: &TenantId, request: SecurityRequest) -> SecurityResponse {
        match self.dispatch(tenant, request).await {
            Ok(response) => response,
            Err(err) => {
                if err.is_infrastructure() {
                    warn!(error = %err, "Request failed");
                } else {
                    debug!(error = %err, "Request rejected");
                }
                SecurityResponse::from(&err)
            },
        }
    }

    /// Runs one request for a tenant named by an untrusted string.
    ///
    /// A tenant id that fails [`TenantId::parse`] is answered with
    /// `invalid_request` before any actor is touched.
    pub async fn handle_raw(&self, tenant: &str, request: SecurityRequest) -> SecurityResponse {
        match TenantId::parse(tenant) {
            Ok(tenant) => self.handle(&tenant, request).await,
            Err(err) => {
                warn!(error = %err, op = request.op(), "Rejected request for malformed tenant");
                SecurityResponse::from(&PrimitiveError::from(err))
            },
        }
    }

    async fn dispatch(&self, tenant: &TenantId, request: SecurityRequest) -> Result<SecurityResponse> {
        use SecurityRequest as R;
        use SecurityResponse as S;

        Ok(match request {
            R::CheckAndRecordJti { jti, proof_expires_at, metadata } => {
                S::Replay { outcome: self.check_and_record_jti(tenant, &jti, proof_expires_at, metadata).await? }
            },
            R::IsJtiRecorded { jti } => S::Flag { value: self.is_jti_recorded(tenant, &jti).await? },
            R::RevokeToken { token_id, expires_at } => {
                S::Replay { outcome: self.revoke_token(tenant, &token_id, expires_at).await? }
            },
            R::RevokeTokens { tokens } => {
                let tokens: Vec<_> = tokens.into_iter().map(|t| (t.token_id, t.expires_at)).collect();
                S::Replays { outcomes: self.revoke_tokens(tenant, &tokens).await? }
            },
            R::IsRevoked { token_id } => S::Flag { value: self.is_revoked(tenant, &token_id).await? },
            R::StoreConsumable { kind, shard_key, payload, ttl } => {
                S::Consumable { item: self.store_consumable(tenant, kind, &shard_key, payload, ttl).await? }
            },
            R::StorePolling { kind, shard_key, payload, ttl, interval } => S::Consumable {
                item: self.store_polling(tenant, kind, &shard_key, payload, ttl, interval).await?,
            },
            R::StoreConsumableAt { id, payload, ttl } => {
                S::Consumable { item: self.store_consumable_at(tenant, &id, payload, ttl).await? }
            },
            R::StorePollingAt { id, payload, ttl, interval } => {
                S::Consumable { item: self.store_polling_at(tenant, &id, payload, ttl, interval).await? }
            },
            R::Consume { id, expected_payload } => {
                S::Consumable { item: self.consume(tenant, &id, expected_payload.as_ref()).await? }
            },
            R::Peek { id } => S::MaybeConsumable { item: self.peek(tenant, &id).await? },
            R::Approve { id, grant } => {
                self.approve(tenant, &id, grant).await?;
                S::Ok
            },
            R::Deny { id } => {
                self.deny(tenant, &id).await?;
                S::Ok
            },
            R::Poll { id } => S::Poll { outcome: self.poll(tenant, &id).await? },
            R::CreateFamily { user_id, client_id, ttl, scope } => {
                S::Issued { token: self.create_family(tenant, &user_id, &client_id, ttl, scope).await? }
            },
            R::RotateFamily { user_id, client_id, presented_version, presented_id, requested_scope } => {
                let request = RotationRequest { presented_version, presented_id, requested_scope };
                S::Issued { token: self.rotate_family(tenant, &user_id, &client_id, &request).await? }
            },
            R::ValidateFamily { user_id, client_id, presented_version } => S::Family {
                family: self.validate_family(tenant, &user_id, &client_id, presented_version).await?,
            },
            R::FamilyStatus { user_id, client_id } => {
                S::MaybeFamily { family: self.family_status(tenant, &user_id, &client_id).await? }
            },
            R::RevokeFamily { user_id, client_id, reason } => {
                self.revoke_family(tenant, &user_id, &client_id, &reason).await?;
                S::Ok
            },
            R::RevokeByIssuedId { issued_id, reason } => {
                S::Family { family: self.revoke_by_issued_id(tenant, &issued_id, &reason).await? }
            },
            R::Increment { key, window, max_requests } => {
                S::Rate { decision: self.increment(tenant, &key, window, max_requests).await? }
            },
            R::PeekCounter { key } => S::MaybeWindow { window: self.peek_counter(tenant, &key).await? },
            R::ResetCounter { key } => {
                self.reset_counter(tenant, &key).await?;
                S::Ok
            },
            R::EnsureActiveKey { algorithm } => {
                S::Key { key: self.ensure_active_key(tenant, algorithm).await?.public_jwk }
            },
            R::RotateKey { algorithm } => S::Key { key: self.rotate_key(tenant, algorithm).await?.public_jwk },
            R::EmergencyRotateKey { algorithm, reason } => {
                S::Key { key: self.emergency_rotate_key(tenant, algorithm, &reason).await?.public_jwk }
            },
            R::RevokeKey { algorithm, kid, reason } => {
                self.revoke_key(tenant, algorithm, &kid, &reason).await?;
                S::Ok
            },
            R::VerificationKeys { algorithm } => S::Keys { keys: self.verification_keys(tenant, algorithm).await? },
        })
    }
}

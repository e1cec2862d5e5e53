//! Security primitive error types.
//!
//! Every primitive operation fails with a [`PrimitiveError`]. Callers turn
//! it into a protocol response with [`PrimitiveError::oauth_error_code`] and
//! [`PrimitiveError::public_description`], which never distinguish theft
//! detection from an ordinary invalid grant.

use keyward_sharding::ShardingError;
use keyward_storage::{InvalidTenantId, StorageError};
use thiserror::Error;

/// Errors raised by security primitives.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`. New variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PrimitiveError {
    /// No record exists under the given id or key.
    #[error("Not found: {id}")]
    NotFound {
        /// The id or key that was looked up.
        id: String,
    },

    /// The record exists but its lifetime has ended.
    #[error("Expired: {id}")]
    Expired {
        /// The expired id.
        id: String,
    },

    /// A one-time item was already consumed.
    #[error("Already consumed: {id}")]
    AlreadyConsumed {
        /// The consumed id.
        id: String,
    },

    /// A record with this id already exists.
    #[error("Already exists: {id}")]
    AlreadyExists {
        /// The colliding id.
        id: String,
    },

    /// The presented payload differs from the stored one.
    #[error("Payload mismatch for {id}")]
    PayloadMismatch {
        /// The item whose payload did not match.
        id: String,
    },

    /// The user denied the pending authorization.
    #[error("Denied: {id}")]
    Denied {
        /// The denied item.
        id: String,
    },

    /// The pending authorization has not been decided yet.
    #[error("Authorization pending: {id}")]
    AuthorizationPending {
        /// The pending item.
        id: String,
    },

    /// The item is not awaiting a decision (already decided, or not a
    /// polling item).
    #[error("Not pending: {id}")]
    NotPending {
        /// The item that could not be decided.
        id: String,
    },

    /// The presented family version differs from the stored one.
    ///
    /// A lower version is theft evidence and revokes the family before this
    /// error is returned.
    #[error("Family version mismatch: presented {presented}, stored {stored}")]
    VersionMismatch {
        /// Version presented by the caller.
        presented: u64,
        /// Version currently stored.
        stored: u64,
    },

    /// The presented id is not the family's most recently issued id.
    #[error("Issued id mismatch")]
    IdMismatch,

    /// The requested scope is not a subset of the family's allowed scope.
    #[error("Scope escalation: {requested}")]
    ScopeEscalation {
        /// Space-separated requested scope.
        requested: String,
    },

    /// The family was revoked.
    #[error("Token family revoked")]
    FamilyRevoked,

    /// No signing key with this id exists.
    #[error("Signing key not found: {kid}")]
    KeyNotFound {
        /// Key id or algorithm that was looked up.
        kid: String,
    },

    /// Key material could not be generated or encoded.
    #[error("Key material error: {reason}")]
    KeyMaterial {
        /// What failed.
        reason: String,
    },

    /// An identifier failed to decode or names the wrong resource type.
    #[error("Malformed id {id:?}: {reason}")]
    MalformedId {
        /// The offending id.
        id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The tenant id cannot name a tenant. Nothing was read or written.
    #[error(transparent)]
    InvalidTenant(#[from] InvalidTenantId),

    /// Topology or primitive configuration is invalid. Routing fails closed.
    #[error("Invalid configuration: {reason}")]
    ConfigurationInvalid {
        /// Which invariant was violated.
        reason: String,
    },

    /// A critical audit event could not be persisted.
    #[error("Audit store unavailable: {0}")]
    AuditUnavailable(#[source] StorageError),

    /// Persisting or loading actor state failed.
    ///
    /// Wraps the original [`StorageError`] to preserve the full error source
    /// chain.
    #[error("Storage error: {0}")]
    Storage(#[source] StorageError),
}

impl PrimitiveError {
    /// Creates a `NotFound` error.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates an `Expired` error.
    #[must_use]
    pub fn expired(id: impl Into<String>) -> Self {
        Self::Expired { id: id.into() }
    }

    /// Creates an `AlreadyConsumed` error.
    #[must_use]
    pub fn already_consumed(id: impl Into<String>) -> Self {
        Self::AlreadyConsumed { id: id.into() }
    }

    /// Creates a `MalformedId` error.
    #[must_use]
    pub fn malformed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedId { id: id.into(), reason: reason.into() }
    }

    /// Creates a `ConfigurationInvalid` error.
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::ConfigurationInvalid { reason: reason.into() }
    }

    /// OAuth 2.0 / OIDC error code a caller should return for this error.
    ///
    /// Every grant failure (including theft detection) maps to
    /// `invalid_grant`.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. }
            | Self::Expired { .. }
            | Self::AlreadyConsumed { .. }
            | Self::PayloadMismatch { .. }
            | Self::VersionMismatch { .. }
            | Self::IdMismatch
            | Self::ScopeEscalation { .. }
            | Self::FamilyRevoked
            | Self::MalformedId { .. } => "invalid_grant",
            Self::Denied { .. } => "access_denied",
            Self::AuthorizationPending { .. } => "authorization_pending",
            Self::AlreadyExists { .. } | Self::NotPending { .. } | Self::InvalidTenant(_) => "invalid_request",
            Self::KeyNotFound { .. }
            | Self::KeyMaterial { .. }
            | Self::ConfigurationInvalid { .. }
            | Self::AuditUnavailable(_)
            | Self::Storage(_) => "server_error",
        }
    }

    /// Description safe to show the presenter.
    ///
    /// Grant failures share one message so a presenter cannot tell a replayed
    /// refresh token from an expired one.
    #[must_use]
    pub fn public_description(&self) -> &'static str {
        if let Self::InvalidTenant(_) = self {
            return "The tenant identifier is malformed";
        }
        match self.oauth_error_code() {
            "invalid_grant" => "The provided grant is invalid, expired, or revoked",
            "access_denied" => "The authorization request was denied",
            "authorization_pending" => "The authorization request is still pending",
            "invalid_request" => "The request conflicts with the current state",
            _ => "The server could not complete the request",
        }
    }

    /// Returns `true` for infrastructure failures, as opposed to decisions.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::AuditUnavailable(_) | Self::ConfigurationInvalid { .. })
    }
}

impl From<StorageError> for PrimitiveError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<ShardingError> for PrimitiveError {
    fn from(err: ShardingError) -> Self {
        match err {
            ShardingError::MalformedId { id, reason } => Self::MalformedId { id, reason },
            ShardingError::Storage(storage) => Self::Storage(storage),
            other => Self::ConfigurationInvalid { reason: other.to_string() },
        }
    }
}

/// Result type alias for primitive operations.
pub type Result<T> = std::result::Result<T, PrimitiveError>;

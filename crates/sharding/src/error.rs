//! Sharding error types.

use keyward_storage::StorageError;
use thiserror::Error;

/// Result type alias for sharding operations.
pub type Result<T> = std::result::Result<T, ShardingError>;

/// Errors raised while decoding identifiers, validating topology, or routing.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShardingError {
    /// The identifier does not follow `g<gen>:<region>:<shard>:<type>_<random>`.
    ///
    /// Never retried: the same input always fails the same way.
    #[error("Malformed resource id {id:?}: {reason}")]
    MalformedId {
        /// The offending identifier.
        id: String,
        /// What part of the grammar failed.
        reason: String,
    },

    /// The topology violates an invariant. Routing fails closed.
    #[error("Invalid shard configuration: {reason}")]
    ConfigurationInvalid {
        /// Which invariant was violated.
        reason: String,
    },

    /// The resource type name is not registered in the type table.
    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),

    /// The shared configuration store failed.
    #[error("Directory storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ShardingError {
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
}

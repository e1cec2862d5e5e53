//! Common types used across storage operations.
//!
//! This module defines shared data structures used by storage backends and
//! the identity newtypes every other keyward crate keys its state by.

use bytes::Bytes;

/// Key-value pair returned from range queries.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use keyward_storage::KeyValue;
///
/// let kv = KeyValue {
///     key: Bytes::from("actors/t1:enam:rtf:0/family/u1:c1"),
///     value: Bytes::from(r#"{"version":3}"#),
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: Bytes,

    /// The value stored at this key.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new key-value pair.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Defines a newtype wrapper around `String` with standard trait
/// implementations.
///
/// Each generated type:
/// - Derives `Clone`, `Debug`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - Derives `Serialize` and `Deserialize` (transparent)
/// - Implements `From<String>`, `From<&str>` and `AsRef<str>`
///
/// Use it only for ids that never become part of a key prefix.
/// - Implements `Display` that outputs the inner value
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

/// Longest accepted tenant id, in bytes.
pub const MAX_TENANT_ID_LEN: usize = 128;

/// A string that cannot name a tenant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid tenant id {value:?}: {reason}")]
pub struct InvalidTenantId {
    /// The rejected input.
    pub value: String,
    /// Which rule it broke.
    pub reason: &'static str,
}

/// Tenant identifier.
///
/// Every piece of security state is partitioned by tenant; no actor ever
/// holds state for two tenants. Tenant ids are embedded in actor addresses
/// (`tenant:region:type:shard`), directory keys and audit keys, so only
/// ASCII letters, digits, `-`, `_` and `.` are accepted, at most
/// [`MAX_TENANT_ID_LEN`] bytes.
///
/// # Examples
///
/// ```
/// use keyward_storage::TenantId;
///
/// let tenant = TenantId::parse("acme").unwrap();
/// assert_eq!(tenant.to_string(), "acme");
///
/// assert!(TenantId::parse("acme:apac:jti:0/rep/x").is_err());
/// assert!(TenantId::parse("").is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validates `value` as a tenant id.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTenantId`] if `value` is empty, too long, or holds
    /// anything but ASCII letters, digits, `-`, `_` and `.`.
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidTenantId> {
        let value = value.into();
        let reason = if value.is_empty() {
            Some("must not be empty")
        } else if value.len() > MAX_TENANT_ID_LEN {
            Some("too long")
        } else if !value.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')) {
            Some("only ASCII letters, digits, '-', '_' and '.' are allowed")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(InvalidTenantId { value, reason }),
            None => Ok(Self(value)),
        }
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidTenantId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for TenantId {
    type Error = InvalidTenantId;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl std::str::FromStr for TenantId {
    type Err = InvalidTenantId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

define_id!(
    /// End-user identifier (the `sub` of issued tokens).
    UserId
);

define_id!(
    /// OAuth client identifier.
    ClientId
);

//! Resource type table: type prefixes and colocation groups.
//!
//! The table is an immutable value built once at startup and shared by `Arc`
//! between the directory (which validates topology against it) and the
//! router. There is no global registry.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardingError};

/// Three lowercase ASCII letters naming a resource type.
///
/// Doubles as the type segment of identifiers and as the type abbreviation
/// in actor instance names.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypePrefix([u8; 3]);

impl TypePrefix {
    /// Refresh-token families.
    pub const REFRESH_TOKEN_FAMILY: TypePrefix = TypePrefix(*b"rtf");
    /// PKCE and login challenges.
    pub const CHALLENGE: TypePrefix = TypePrefix(*b"chl");
    /// Authorization codes.
    pub const AUTHORIZATION_CODE: TypePrefix = TypePrefix(*b"acd");
    /// Device authorization codes.
    pub const DEVICE_CODE: TypePrefix = TypePrefix(*b"dvc");
    /// Client-initiated backchannel authentication requests.
    pub const BACKCHANNEL_REQUEST: TypePrefix = TypePrefix(*b"bcr");
    /// DPoP proof JTIs.
    pub const DPOP_JTI: TypePrefix = TypePrefix(*b"jti");
    /// Revoked access tokens.
    pub const REVOKED_TOKEN: TypePrefix = TypePrefix(*b"rvk");
    /// Rate-limit windows.
    pub const RATE_LIMIT: TypePrefix = TypePrefix(*b"rlm");
    /// Signing key sets.
    pub const SIGNING_KEY: TypePrefix = TypePrefix(*b"sgk");

    /// Parses a prefix, requiring exactly three lowercase ASCII letters.
    ///
    /// # Errors
    ///
    /// Returns [`ShardingError::ConfigurationInvalid`] for any other input.
    pub fn new(s: &str) -> Result<Self> {
        match s.as_bytes() {
            [a, b, c] if [a, b, c].iter().all(|ch| ch.is_ascii_lowercase()) => {
                Ok(Self([*a, *b, *c]))
            },
            _ => Err(ShardingError::invalid(format!(
                "type prefix must be three lowercase letters, got {s:?}"
            ))),
        }
    }

    /// Returns the prefix as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl fmt::Debug for TypePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypePrefix({})", self.as_str())
    }
}

impl fmt::Display for TypePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TypePrefix {
    type Err = ShardingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TypePrefix {
    type Error = ShardingError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<TypePrefix> for String {
    fn from(prefix: TypePrefix) -> Self {
        prefix.as_str().to_owned()
    }
}

/// Immutable mapping of resource type names to prefixes and colocation
/// groups.
///
/// # Example
///
/// ```
/// use keyward_sharding::{ResourceTypeTable, TypePrefix};
///
/// let table = ResourceTypeTable::default();
/// assert_eq!(table.prefix_of("refresh_token_family").unwrap(), TypePrefix::REFRESH_TOKEN_FAMILY);
/// assert_eq!(table.group_of(TypePrefix::AUTHORIZATION_CODE), Some("grant-lifecycle"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTypeTable {
    types: BTreeMap<String, TypePrefix>,
    groups: BTreeMap<String, BTreeSet<TypePrefix>>,
    group_of: BTreeMap<TypePrefix, String>,
}

#[bon::bon]
impl ResourceTypeTable {
    /// Builds a validated table.
    ///
    /// # Errors
    ///
    /// Returns [`ShardingError::ConfigurationInvalid`] when a prefix is
    /// registered twice, a group names an unregistered prefix, a group is
    /// empty, or a prefix belongs to more than one group.
    #[builder]
    pub fn new(
        types: Vec<(String, TypePrefix)>,
        #[builder(default)] colocation_groups: Vec<(String, Vec<TypePrefix>)>,
    ) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for (name, prefix) in types {
            if !seen.insert(prefix) {
                return Err(ShardingError::invalid(format!("type prefix {prefix} registered twice")));
            }
            by_name.insert(name, prefix);
        }

        let mut groups = BTreeMap::new();
        let mut group_of = BTreeMap::new();
        for (group, members) in colocation_groups {
            if members.is_empty() {
                return Err(ShardingError::invalid(format!("colocation group {group} is empty")));
            }
            for member in &members {
                if !seen.contains(member) {
                    return Err(ShardingError::invalid(format!(
                        "colocation group {group} names unregistered type {member}"
                    )));
                }
                if let Some(existing) = group_of.insert(*member, group.clone()) {
                    return Err(ShardingError::invalid(format!(
                        "type {member} is in colocation groups {existing} and {group}"
                    )));
                }
            }
            groups.insert(group, members.into_iter().collect());
        }

        Ok(Self { types: by_name, groups, group_of })
    }

    /// Resolves a resource type name to its prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ShardingError::UnknownResourceType`] for unregistered names.
    pub fn prefix_of(&self, name: &str) -> Result<TypePrefix> {
        self.types.get(name).copied().ok_or_else(|| ShardingError::UnknownResourceType(name.into()))
    }

    /// Returns `true` if `prefix` is registered.
    #[must_use]
    pub fn contains(&self, prefix: TypePrefix) -> bool {
        self.types.values().any(|p| *p == prefix)
    }

    /// Returns the colocation group `prefix` belongs to, if any.
    #[must_use]
    pub fn group_of(&self, prefix: TypePrefix) -> Option<&str> {
        self.group_of.get(&prefix).map(String::as_str)
    }

    /// Iterates declared colocation groups and their members.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &BTreeSet<TypePrefix>)> {
        self.groups.iter().map(|(name, members)| (name.as_str(), members))
    }
}

impl Default for ResourceTypeTable {
    fn default() -> Self {
        Self {
            types: [
                ("refresh_token_family", TypePrefix::REFRESH_TOKEN_FAMILY),
                ("challenge", TypePrefix::CHALLENGE),
                ("authorization_code", TypePrefix::AUTHORIZATION_CODE),
                ("device_code", TypePrefix::DEVICE_CODE),
                ("backchannel_request", TypePrefix::BACKCHANNEL_REQUEST),
                ("dpop_jti", TypePrefix::DPOP_JTI),
                ("revoked_token", TypePrefix::REVOKED_TOKEN),
                ("rate_limit", TypePrefix::RATE_LIMIT),
                ("signing_key", TypePrefix::SIGNING_KEY),
            ]
            .into_iter()
            .map(|(name, prefix)| (name.to_owned(), prefix))
            .collect(),
            groups: [(
                "grant-lifecycle".to_owned(),
                BTreeSet::from([
                    TypePrefix::CHALLENGE,
                    TypePrefix::AUTHORIZATION_CODE,
                    TypePrefix::REFRESH_TOKEN_FAMILY,
                ]),
            )]
            .into(),
            group_of: [
                (TypePrefix::CHALLENGE, "grant-lifecycle".to_owned()),
                (TypePrefix::AUTHORIZATION_CODE, "grant-lifecycle".to_owned()),
                (TypePrefix::REFRESH_TOKEN_FAMILY, "grant-lifecycle".to_owned()),
            ]
            .into(),
        }
    }
}

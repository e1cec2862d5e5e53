//! Identifier codec.
//!
//! A sharded resource id carries its own placement:
//!
//! ```text
//! g<generation>:<region>:<shard>:<type>_<random>
//! g3:enam:17:rtf_Qm9vZ2xlLWlzLWEtZ3JlYXQtY29tcGFueQ
//! ```
//!
//! Generation, region and shard never change after creation. Decoding is a
//! pure parse and never consults the directory.

use std::{fmt, str::FromStr};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, ShardingError},
    region::RegionKey,
    resource_type::TypePrefix,
};

/// Bytes of entropy in a freshly minted random part (192 bits).
pub const RANDOM_PART_BYTES: usize = 24;

/// Minimum accepted random-part length in base64url characters (128 bits).
pub const MIN_RANDOM_PART_LEN: usize = 22;

/// A decoded sharded resource identifier.
///
/// # Example
///
/// ```
/// use keyward_sharding::{RegionKey, ShardedResourceId, TypePrefix};
///
/// let id: ShardedResourceId = "g2:apac:5:acd_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap();
/// assert_eq!(id.generation(), 2);
/// assert_eq!(id.region(), RegionKey::Apac);
/// assert_eq!(id.shard(), 5);
/// assert_eq!(id.type_prefix(), TypePrefix::AUTHORIZATION_CODE);
/// assert_eq!(id.to_string(), "g2:apac:5:acd_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardedResourceId {
    generation: u32,
    region: RegionKey,
    shard: u32,
    type_prefix: TypePrefix,
    random: String,
}

impl ShardedResourceId {
    /// Assembles an id from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`ShardingError::MalformedId`] if `random` is shorter than
    /// [`MIN_RANDOM_PART_LEN`] or contains characters outside the base64url
    /// alphabet.
    pub fn encode(
        generation: u32,
        region: RegionKey,
        shard: u32,
        type_prefix: TypePrefix,
        random: impl Into<String>,
    ) -> Result<Self> {
        let random = random.into();
        check_random(&random).map_err(|reason| {
            ShardingError::malformed(format!("g{generation}:{region}:{shard}:{type_prefix}_{random}"), reason)
        })?;
        Ok(Self { generation, region, shard, type_prefix, random })
    }

    /// Parses an id string.
    ///
    /// # Errors
    ///
    /// Returns [`ShardingError::MalformedId`] describing the first grammar
    /// violation.
    pub fn decode(id: &str) -> Result<Self> {
        let malformed = |reason: &str| ShardingError::malformed(id, reason);

        let mut parts = id.splitn(4, ':');
        let (Some(generation), Some(region), Some(shard), Some(rest)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("expected four ':'-separated segments"));
        };

        let generation = generation
            .strip_prefix('g')
            .filter(|digits| is_canonical_uint(digits))
            .and_then(|digits| digits.parse::<u32>().ok())
            .ok_or_else(|| malformed("generation must be 'g' followed by an unsigned integer"))?;
        let region: RegionKey = region.parse().map_err(|_| malformed("unknown region key"))?;
        let shard = Some(shard)
            .filter(|digits| is_canonical_uint(digits))
            .and_then(|digits| digits.parse::<u32>().ok())
            .ok_or_else(|| malformed("shard must be an unsigned integer"))?;

        let (prefix, random) =
            rest.split_once('_').ok_or_else(|| malformed("missing '_' after type prefix"))?;
        let type_prefix = TypePrefix::new(prefix).map_err(|_| malformed("invalid type prefix"))?;
        check_random(random).map_err(malformed)?;

        Ok(Self { generation, region, shard, type_prefix, random: random.to_owned() })
    }

    /// Mints a fresh random part with [`RANDOM_PART_BYTES`] of entropy.
    #[must_use]
    pub fn random_part() -> String {
        let mut bytes = [0u8; RANDOM_PART_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Mints a new id with the same generation, region, shard and type, so
    /// it routes to the same actor.
    #[must_use]
    pub fn sibling(&self) -> Self {
        Self { random: Self::random_part(), ..self.clone() }
    }

    /// Topology generation the id was created under.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Region the owning actor lives in.
    #[must_use]
    pub fn region(&self) -> RegionKey {
        self.region
    }

    /// Shard index within the type's shard count at creation.
    #[must_use]
    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// Resource type segment.
    #[must_use]
    pub fn type_prefix(&self) -> TypePrefix {
        self.type_prefix
    }

    /// Opaque random segment.
    #[must_use]
    pub fn random(&self) -> &str {
        &self.random
    }
}

/// Rejects leading zeros and signs so each number has exactly one spelling.
fn is_canonical_uint(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && (s == "0" || !s.starts_with('0'))
}

fn check_random(random: &str) -> std::result::Result<(), &'static str> {
    if random.len() < MIN_RANDOM_PART_LEN {
        return Err("random part carries fewer than 128 bits");
    }
    if !random.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
        return Err("random part must be base64url");
    }
    Ok(())
}

impl fmt::Display for ShardedResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "g{}:{}:{}:{}_{}",
            self.generation, self.region, self.shard, self.type_prefix, self.random
        )
    }
}

impl FromStr for ShardedResourceId {
    type Err = ShardingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl TryFrom<String> for ShardedResourceId {
    type Error = ShardingError;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<ShardedResourceId> for String {
    fn from(id: ShardedResourceId) -> Self {
        id.to_string()
    }
}

//! Shard routing.
//!
//! New resources are placed by hashing a shard key with 32-bit FNV-1a and
//! reducing it modulo the type's shard count in the current generation.
//! Existing resources are never re-placed: their id already names the
//! generation, region and shard they live in.

use std::{collections::BTreeSet, fmt, sync::Arc};

use keyward_storage::TenantId;
use tracing::debug;

use crate::{
    error::{Result, ShardingError},
    id::ShardedResourceId,
    region::RegionKey,
    resource_type::{ResourceTypeTable, TypePrefix},
    topology::{GenerationSnapshot, RegionShardConfig},
};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
///
/// Stable across platforms and releases; shard placement of every
/// persisted resource depends on it.
///
/// ```
/// assert_eq!(keyward_sharding::fnv1a_32(b""), 0x811c_9dc5);
/// assert_eq!(keyward_sharding::fnv1a_32(b"a"), 0xe40c_292c);
/// ```
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME))
}

/// Where a resource lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Placement {
    /// Generation the placement was computed under.
    pub generation: u32,
    /// Region owning the shard.
    pub region: RegionKey,
    /// Shard index in `[0, total_shards)`.
    pub shard: u32,
    /// Shard count the index was reduced by.
    pub total_shards: u32,
    /// Resource type.
    pub type_prefix: TypePrefix,
}

/// Instance name of the actor owning a (tenant, region, type, shard)
/// namespace: `<tenant>:<region>:<type>:<shard>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorAddress {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Region the instance runs in.
    pub region: RegionKey,
    /// Resource type abbreviation.
    pub type_prefix: TypePrefix,
    /// Shard index.
    pub shard: u32,
}

impl ActorAddress {
    /// Address of the actor a placement lands on.
    #[must_use]
    pub fn for_placement(tenant: &TenantId, placement: &Placement) -> Self {
        Self {
            tenant: tenant.clone(),
            region: placement.region,
            type_prefix: placement.type_prefix,
            shard: placement.shard,
        }
    }

    /// Address of the actor owning an existing resource.
    #[must_use]
    pub fn for_id(tenant: &TenantId, id: &ShardedResourceId) -> Self {
        Self {
            tenant: tenant.clone(),
            region: id.region(),
            type_prefix: id.type_prefix(),
            shard: id.shard(),
        }
    }
}

impl fmt::Display for ActorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.tenant, self.region, self.type_prefix, self.shard)
    }
}

/// Resolves placements against a tenant's topology.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    types: Arc<ResourceTypeTable>,
}

impl ShardRouter {
    /// Creates a router over the shared resource type table.
    #[must_use]
    pub fn new(types: Arc<ResourceTypeTable>) -> Self {
        Self { types }
    }

    fn check_registered(&self, prefix: TypePrefix) -> Result<()> {
        if self.types.contains(prefix) {
            Ok(())
        } else {
            Err(ShardingError::UnknownResourceType(prefix.to_string()))
        }
    }

    /// Places a new resource of type `prefix` under the current generation.
    ///
    /// Colocated types are reduced by their group's shard count, so every
    /// member of a group sends the same key to the same shard index.
    ///
    /// # Errors
    ///
    /// - [`ShardingError::UnknownResourceType`] if `prefix` is not registered
    /// - [`ShardingError::ConfigurationInvalid`] if no region owns the shard
    pub fn resolve_for_new_resource(
        &self,
        config: &RegionShardConfig,
        prefix: TypePrefix,
        shard_key: &[u8],
    ) -> Result<Placement> {
        self.resolve_in(&config.current_snapshot(), prefix, shard_key)
    }

    /// Places `shard_key` within a specific generation.
    ///
    /// # Errors
    ///
    /// Same as [`resolve_for_new_resource`](Self::resolve_for_new_resource).
    pub fn resolve_in(
        &self,
        snapshot: &GenerationSnapshot,
        prefix: TypePrefix,
        shard_key: &[u8],
    ) -> Result<Placement> {
        self.check_registered(prefix)?;
        let total_shards = snapshot.total_shards_for(prefix);
        if total_shards == 0 {
            return Err(ShardingError::invalid(format!(
                "generation {} has no shards for {prefix}",
                snapshot.generation
            )));
        }
        let shard = fnv1a_32(shard_key) % total_shards;
        let region = snapshot.region_for_shard(shard, total_shards)?;
        debug!(generation = snapshot.generation, %region, shard, %prefix, "Resolved placement");
        Ok(Placement { generation: snapshot.generation, region, shard, total_shards, type_prefix: prefix })
    }

    /// Places `shard_key` in every known generation, newest first, skipping
    /// placements that land on an actor already listed.
    ///
    /// Used for state keyed by something other than an id (a user/client
    /// pair, for example), which may have been created under any generation.
    ///
    /// # Errors
    ///
    /// Same as [`resolve_for_new_resource`](Self::resolve_for_new_resource).
    pub fn resolve_all_generations(
        &self,
        config: &RegionShardConfig,
        prefix: TypePrefix,
        shard_key: &[u8],
    ) -> Result<Vec<Placement>> {
        let mut seen = BTreeSet::new();
        let mut placements = Vec::new();
        for snapshot in config.snapshots_newest_first() {
            let placement = self.resolve_in(&snapshot, prefix, shard_key)?;
            if seen.insert((placement.region, placement.shard)) {
                placements.push(placement);
            }
        }
        Ok(placements)
    }

    /// Decodes an existing resource's placement from its id. Never consults
    /// the directory.
    ///
    /// # Errors
    ///
    /// Returns [`ShardingError::MalformedId`] if `id` does not parse.
    pub fn resolve_from_id(&self, id: &str) -> Result<ShardedResourceId> {
        ShardedResourceId::decode(id)
    }

    /// Places a new resource and mints its id.
    ///
    /// # Errors
    ///
    /// Same as [`resolve_for_new_resource`](Self::resolve_for_new_resource).
    pub fn mint_id(
        &self,
        config: &RegionShardConfig,
        prefix: TypePrefix,
        shard_key: &[u8],
    ) -> Result<(Placement, ShardedResourceId)> {
        let placement = self.resolve_for_new_resource(config, prefix, shard_key)?;
        let id = Self::mint_at(&placement)?;
        Ok((placement, id))
    }

    /// Mints a fresh id bound to an existing placement.
    ///
    /// # Errors
    ///
    /// Returns [`ShardingError::MalformedId`] only if the minted random part
    /// were rejected, which cannot happen for [`ShardedResourceId::random_part`].
    pub fn mint_at(placement: &Placement) -> Result<ShardedResourceId> {
        ShardedResourceId::encode(
            placement.generation,
            placement.region,
            placement.shard,
            placement.type_prefix,
            ShardedResourceId::random_part(),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::Utc;
    use rstest::rstest;

    use super::*;

    fn router() -> ShardRouter {
        ShardRouter::new(Arc::new(ResourceTypeTable::default()))
    }

    #[rstest]
    #[case(b"", 0x811c_9dc5)]
    #[case(b"a", 0xe40c_292c)]
    #[case(b"foobar", 0xbf9c_f968)]
    fn test_fnv1a_reference_vectors(#[case] input: &[u8], #[case] expected: u32) {
        assert_eq!(fnv1a_32(input), expected);
    }

    #[test]
    fn test_placement_is_deterministic() {
        let config = RegionShardConfig::initial(16, RegionKey::Weur, Utc::now()).unwrap();
        let first = router().resolve_for_new_resource(&config, TypePrefix::RATE_LIMIT, b"client-1").unwrap();
        let second = router().resolve_for_new_resource(&config, TypePrefix::RATE_LIMIT, b"client-1").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.shard, fnv1a_32(b"client-1") % 16);
        assert_eq!(first.region, RegionKey::Weur);
    }

    #[test]
    fn test_unregistered_type_rejected() {
        let config = RegionShardConfig::initial(4, RegionKey::Oc, Utc::now()).unwrap();
        let err = router()
            .resolve_for_new_resource(&config, TypePrefix::new("zzz").unwrap(), b"k")
            .unwrap_err();
        assert!(matches!(err, ShardingError::UnknownResourceType(name) if name == "zzz"));
    }

    #[test]
    fn test_minted_id_matches_placement() {
        let config = RegionShardConfig::initial(4, RegionKey::Afr, Utc::now()).unwrap();
        let (placement, id) = router().mint_id(&config, TypePrefix::DEVICE_CODE, b"client").unwrap();
        let decoded = router().resolve_from_id(&id.to_string()).unwrap();
        assert_eq!(decoded.generation(), placement.generation);
        assert_eq!(decoded.region(), placement.region);
        assert_eq!(decoded.shard(), placement.shard);
        assert_eq!(
            ActorAddress::for_id(&"t".parse().unwrap(), &decoded),
            ActorAddress::for_placement(&"t".parse().unwrap(), &placement)
        );
    }

    #[test]
    fn test_all_generations_dedupes_same_actor() {
        let gen1 = RegionShardConfig::initial(4, RegionKey::Apac, Utc::now()).unwrap();
        let gen2 = gen1.next_generation(4, &[(RegionKey::Apac, 100)], Utc::now()).unwrap();
        let placements = router().resolve_all_generations(&gen2, TypePrefix::DPOP_JTI, b"k").unwrap();
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].generation, 2);
    }

    #[test]
    fn test_actor_address_display() {
        let address = ActorAddress {
            tenant: "acme".parse().unwrap(),
            region: RegionKey::Enam,
            type_prefix: TypePrefix::REFRESH_TOKEN_FAMILY,
            shard: 12,
        };
        assert_eq!(address.to_string(), "acme:enam:rtf:12");
    }
}

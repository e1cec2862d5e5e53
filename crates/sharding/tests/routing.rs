//! Routing across colocation groups and generation changes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use keyward_sharding::{
    ActorAddress, ColocationGroup, DirectoryConfig, RegionKey, RegionShardConfig, RegionShardDirectory,
    ResourceTypeTable, ShardRouter, TypePrefix,
};
use keyward_storage::{MemoryBackend, TenantId};
use proptest::prelude::*;

const GRANT_LIFECYCLE: [TypePrefix; 3] =
    [TypePrefix::CHALLENGE, TypePrefix::AUTHORIZATION_CODE, TypePrefix::REFRESH_TOKEN_FAMILY];

fn grant_group(total_shards: u32) -> ColocationGroup {
    ColocationGroup {
        name: "grant-lifecycle".into(),
        resource_types: GRANT_LIFECYCLE.into_iter().collect(),
        total_shards,
    }
}

fn router() -> ShardRouter {
    ShardRouter::new(Arc::new(ResourceTypeTable::default()))
}

proptest! {
    #[test]
    fn colocated_types_share_shard_index(
        key in proptest::collection::vec(any::<u8>(), 0..64),
        group_total in 1u32..64,
    ) {
        let config = RegionShardConfig::with_split(8, &[(RegionKey::Weur, 50), (RegionKey::Wnam, 50)], Utc::now())
            .unwrap()
            .with_colocation_group(grant_group(group_total), Utc::now());
        config.validate(&ResourceTypeTable::default()).unwrap();

        let router = router();
        let placements: Vec<_> = GRANT_LIFECYCLE
            .iter()
            .map(|prefix| router.resolve_for_new_resource(&config, *prefix, &key).unwrap())
            .collect();

        let shards: BTreeSet<_> = placements.iter().map(|p| (p.shard, p.total_shards, p.region)).collect();
        prop_assert_eq!(shards.len(), 1);
        prop_assert_eq!(placements[0].total_shards, group_total);
    }
}

#[test]
fn test_ungrouped_type_uses_generation_default() {
    let config = RegionShardConfig::initial(8, RegionKey::Me, Utc::now())
        .unwrap()
        .with_colocation_group(grant_group(32), Utc::now());
    let placement = router().resolve_for_new_resource(&config, TypePrefix::DPOP_JTI, b"client").unwrap();
    assert_eq!(placement.total_shards, 8);
}

#[tokio::test]
async fn test_generation_change_keeps_old_ids_reachable() {
    let tenant = TenantId::parse("acme").unwrap();
    let types = Arc::new(ResourceTypeTable::default());
    let directory = RegionShardDirectory::new(
        Arc::new(MemoryBackend::new()),
        Arc::clone(&types),
        DirectoryConfig::builder().default_total_shards(4).default_region(RegionKey::Apac).build().unwrap(),
    );
    let router = ShardRouter::new(types);

    let gen1 = directory.current(&tenant).await.unwrap();
    assert_eq!(gen1.current_generation, 1);
    let (old_placement, old_id) = router.mint_id(&gen1, TypePrefix::DEVICE_CODE, b"client-7").unwrap();
    assert_eq!(old_placement.region, RegionKey::Apac);

    directory
        .write_generation(&tenant, 8, &[(RegionKey::Apac, 50), (RegionKey::Enam, 50)])
        .await
        .unwrap();
    let gen2 = directory.current(&tenant).await.unwrap();
    assert_eq!(gen2.current_generation, 2);

    // The old id still decodes to its original placement.
    let decoded = router.resolve_from_id(&old_id.to_string()).unwrap();
    assert_eq!(decoded.generation(), 1);
    assert_eq!(decoded.region(), RegionKey::Apac);
    assert_eq!(ActorAddress::for_id(&tenant, &decoded), ActorAddress::for_placement(&tenant, &old_placement));

    // New ids spread over both regions of generation 2.
    let regions: BTreeSet<_> = (0..256)
        .map(|i| {
            let (placement, id) =
                router.mint_id(&gen2, TypePrefix::DEVICE_CODE, format!("client-{i}").as_bytes()).unwrap();
            assert_eq!(id.generation(), 2);
            assert!(placement.shard < 8);
            placement.region
        })
        .collect();
    assert_eq!(regions, BTreeSet::from([RegionKey::Apac, RegionKey::Enam]));
}

#[tokio::test]
async fn test_state_keyed_by_pair_is_found_in_older_generation() {
    let gen1 = RegionShardConfig::initial(4, RegionKey::Apac, Utc::now()).unwrap();
    let gen2 = gen1.next_generation(8, &[(RegionKey::Apac, 50), (RegionKey::Enam, 50)], Utc::now()).unwrap();
    let router = router();
    let key = b"user-1\0client-1";

    let created_under_gen1 = router.resolve_for_new_resource(&gen1, TypePrefix::REFRESH_TOKEN_FAMILY, key).unwrap();
    let candidates = router.resolve_all_generations(&gen2, TypePrefix::REFRESH_TOKEN_FAMILY, key).unwrap();

    assert_eq!(candidates[0].generation, 2);
    assert!(
        candidates
            .iter()
            .any(|p| p.region == created_under_gen1.region && p.shard == created_under_gen1.shard)
    );
}

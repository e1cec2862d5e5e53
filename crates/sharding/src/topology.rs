//! Versioned region-shard topology.
//!
//! A [`RegionShardConfig`] is the per-tenant document persisted by the
//! directory. It holds the current generation's shard count and region
//! ranges, every previous generation, and the colocation groups whose member
//! types share one shard count. Every change produces a new generation; the
//! current one is never edited in place.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, ShardingError},
    region::RegionKey,
    resource_type::{ResourceTypeTable, TypePrefix},
};

/// A contiguous shard range `[start_shard, end_shard)` owned by one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionRange {
    /// First shard index (inclusive).
    pub start_shard: u32,
    /// One past the last shard index.
    pub end_shard: u32,
    /// `end_shard - start_shard`.
    pub shard_count: u32,
}

impl RegionRange {
    fn contains(&self, shard: u32) -> bool {
        (self.start_shard..self.end_shard).contains(&shard)
    }
}

/// Resource types that must route any shard key to the same shard index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColocationGroup {
    /// Group name; matches the key it is stored under.
    pub name: String,
    /// Member type prefixes.
    pub resource_types: BTreeSet<TypePrefix>,
    /// Shard count shared by every member.
    pub total_shards: u32,
}

/// One generation's complete routing view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSnapshot {
    /// Generation number.
    pub generation: u32,
    /// Default shard count for types outside any colocation group.
    pub total_shards: u32,
    /// Region ranges partitioning `[0, total_shards)`.
    pub regions: BTreeMap<RegionKey, RegionRange>,
    /// Colocation groups in force during this generation.
    #[serde(default)]
    pub colocation_groups: BTreeMap<String, ColocationGroup>,
    /// When the generation was written.
    pub created_at: DateTime<Utc>,
}

impl GenerationSnapshot {
    /// Shard count for `prefix`: its colocation group's, else the default.
    #[must_use]
    pub fn total_shards_for(&self, prefix: TypePrefix) -> u32 {
        total_shards_for(&self.colocation_groups, self.total_shards, prefix)
    }

    /// Maps `shard` (out of `total`) to the region owning it.
    ///
    /// When `total` differs from the generation's shard count the shard is
    /// scaled proportionally onto the region ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ShardingError::ConfigurationInvalid`] if `shard >= total` or
    /// no range covers the scaled shard.
    pub fn region_for_shard(&self, shard: u32, total: u32) -> Result<RegionKey> {
        region_for_shard(&self.regions, self.total_shards, shard, total)
    }
}

/// Per-tenant topology document.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use keyward_sharding::{RegionKey, RegionShardConfig, ResourceTypeTable};
///
/// let gen1 = RegionShardConfig::initial(4, RegionKey::Apac, Utc::now()).unwrap();
/// let gen2 = gen1
///     .next_generation(8, &[(RegionKey::Apac, 50), (RegionKey::Enam, 50)], Utc::now())
///     .unwrap();
/// gen2.validate(&ResourceTypeTable::default()).unwrap();
///
/// assert_eq!(gen2.current_generation, 2);
/// assert_eq!(gen2.region_for_shard(5, 8).unwrap(), RegionKey::Enam);
/// assert_eq!(gen2.snapshot(1).unwrap().total_shards, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionShardConfig {
    /// Generation new resources are created under.
    pub current_generation: u32,
    /// Default shard count of the current generation.
    pub current_total_shards: u32,
    /// Region ranges of the current generation.
    pub current_regions: BTreeMap<RegionKey, RegionRange>,
    /// Superseded generations, oldest first.
    #[serde(default)]
    pub previous_generations: Vec<GenerationSnapshot>,
    /// Colocation groups of the current generation.
    #[serde(default)]
    pub colocation_groups: BTreeMap<String, ColocationGroup>,
    /// When the current generation was written.
    pub updated_at: DateTime<Utc>,
}

impl RegionShardConfig {
    /// Creates generation 1 with every shard in `region`.
    ///
    /// # Errors
    ///
    /// Returns [`ShardingError::ConfigurationInvalid`] if `total_shards` is zero.
    pub fn initial(total_shards: u32, region: RegionKey, now: DateTime<Utc>) -> Result<Self> {
        Self::with_split(total_shards, &[(region, 100)], now)
    }

    /// Creates generation 1 splitting `total_shards` by percentage.
    ///
    /// # Errors
    ///
    /// See [`ranges_from_percentages`].
    pub fn with_split(
        total_shards: u32,
        split: &[(RegionKey, u32)],
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            current_generation: 1,
            current_total_shards: total_shards,
            current_regions: ranges_from_percentages(total_shards, split)?,
            previous_generations: Vec::new(),
            colocation_groups: BTreeMap::new(),
            updated_at: now,
        })
    }

    /// Returns a copy advanced to a new generation with a new shard count
    /// and region split. The current generation moves to the history;
    /// colocation groups carry over.
    ///
    /// # Errors
    ///
    /// See [`ranges_from_percentages`].
    pub fn next_generation(
        &self,
        total_shards: u32,
        split: &[(RegionKey, u32)],
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let regions = ranges_from_percentages(total_shards, split)?;
        Ok(self.advance(total_shards, regions, self.colocation_groups.clone(), now))
    }

    /// Returns a copy advanced to a new generation with `group` added or
    /// replaced. Topology is unchanged.
    #[must_use]
    pub fn with_colocation_group(&self, group: ColocationGroup, now: DateTime<Utc>) -> Self {
        let mut groups = self.colocation_groups.clone();
        groups.insert(group.name.clone(), group);
        self.advance(self.current_total_shards, self.current_regions.clone(), groups, now)
    }

    fn advance(
        &self,
        total_shards: u32,
        regions: BTreeMap<RegionKey, RegionRange>,
        colocation_groups: BTreeMap<String, ColocationGroup>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut previous_generations = self.previous_generations.clone();
        previous_generations.push(self.current_snapshot());
        Self {
            current_generation: self.current_generation + 1,
            current_total_shards: total_shards,
            current_regions: regions,
            previous_generations,
            colocation_groups,
            updated_at: now,
        }
    }

    /// The current generation as a snapshot.
    #[must_use]
    pub fn current_snapshot(&self) -> GenerationSnapshot {
        GenerationSnapshot {
            generation: self.current_generation,
            total_shards: self.current_total_shards,
            regions: self.current_regions.clone(),
            colocation_groups: self.colocation_groups.clone(),
            created_at: self.updated_at,
        }
    }

    /// Looks up any generation, current or previous.
    #[must_use]
    pub fn snapshot(&self, generation: u32) -> Option<GenerationSnapshot> {
        if generation == self.current_generation {
            return Some(self.current_snapshot());
        }
        self.previous_generations.iter().find(|s| s.generation == generation).cloned()
    }

    /// Every generation, newest first.
    #[must_use]
    pub fn snapshots_newest_first(&self) -> Vec<GenerationSnapshot> {
        std::iter::once(self.current_snapshot())
            .chain(self.previous_generations.iter().rev().cloned())
            .collect()
    }

    /// Current shard count for `prefix`.
    #[must_use]
    pub fn total_shards_for(&self, prefix: TypePrefix) -> u32 {
        total_shards_for(&self.colocation_groups, self.current_total_shards, prefix)
    }

    /// Maps `shard` (out of `total`) to its region in the current generation.
    ///
    /// # Errors
    ///
    /// See [`GenerationSnapshot::region_for_shard`].
    pub fn region_for_shard(&self, shard: u32, total: u32) -> Result<RegionKey> {
        region_for_shard(&self.current_regions, self.current_total_shards, shard, total)
    }

    /// Checks every invariant against the resource type table.
    ///
    /// - region ranges partition `[0, total)` without gaps or overlaps, in
    ///   the current and every previous generation
    /// - previous generation numbers strictly increase and precede the current
    /// - colocation groups are non-empty, have at least one shard, name only
    ///   registered types, and never share a member
    /// - every colocation group declared in the table is kept whole: its
    ///   members are either all in one configured group or in none
    ///
    /// The group rules apply to every previous generation as well.
    ///
    /// # Errors
    ///
    /// Returns [`ShardingError::ConfigurationInvalid`] naming the first
    /// violated invariant.
    pub fn validate(&self, table: &ResourceTypeTable) -> Result<()> {
        validate_partition(self.current_generation, self.current_total_shards, &self.current_regions)?;

        let mut last = 0u32;
        for snapshot in &self.previous_generations {
            if snapshot.generation <= last || snapshot.generation >= self.current_generation {
                return Err(ShardingError::invalid(format!(
                    "generation {} is out of order",
                    snapshot.generation
                )));
            }
            last = snapshot.generation;
            validate_partition(snapshot.generation, snapshot.total_shards, &snapshot.regions)?;
        }

        for snapshot in &self.previous_generations {
            validate_groups(snapshot.generation, &snapshot.colocation_groups, table)?;
        }
        validate_groups(self.current_generation, &self.colocation_groups, table)
    }
}

/// Checks one generation's colocation groups. Old generations still route
/// ids minted under them, so they are held to the same rules as the current
/// one.
fn validate_groups(
    generation: u32,
    groups: &BTreeMap<String, ColocationGroup>,
    table: &ResourceTypeTable,
) -> Result<()> {
    let mut configured_group_of: BTreeMap<TypePrefix, &str> = BTreeMap::new();
    for (name, group) in groups {
        if *name != group.name {
            return Err(ShardingError::invalid(format!(
                "generation {generation}: colocation group stored as {name} is named {}",
                group.name
            )));
        }
        if group.total_shards == 0 {
            return Err(ShardingError::invalid(format!(
                "generation {generation}: colocation group {name} has no shards"
            )));
        }
        if group.resource_types.is_empty() {
            return Err(ShardingError::invalid(format!("generation {generation}: colocation group {name} is empty")));
        }
        for member in &group.resource_types {
            if !table.contains(*member) {
                return Err(ShardingError::invalid(format!(
                    "generation {generation}: colocation group {name} names unregistered type {member}"
                )));
            }
            if let Some(other) = configured_group_of.insert(*member, name.as_str()) {
                return Err(ShardingError::invalid(format!(
                    "generation {generation}: type {member} is in colocation groups {other} and {name}"
                )));
            }
        }
    }

    for (declared, members) in table.groups() {
        let placements: BTreeSet<Option<&str>> =
            members.iter().map(|m| configured_group_of.get(m).copied()).collect();
        if placements.len() > 1 {
            return Err(ShardingError::invalid(format!(
                "generation {generation}: colocated types of {declared} would not share one shard count"
            )));
        }
    }
    Ok(())
}

/// Splits `total_shards` into contiguous region ranges by percentage.
///
/// Regions are laid out in the order given. Each region receives the floor of
/// its share; leftover shards go to the regions with the largest fractional
/// remainders, ties broken by order.
///
/// # Errors
///
/// Returns [`ShardingError::ConfigurationInvalid`] if `total_shards` is zero,
/// percentages do not sum to 100, a region repeats or has a zero share, or a
/// region would end up with no shard.
pub fn ranges_from_percentages(
    total_shards: u32,
    split: &[(RegionKey, u32)],
) -> Result<BTreeMap<RegionKey, RegionRange>> {
    if total_shards == 0 {
        return Err(ShardingError::invalid("total shards must be at least 1"));
    }
    let sum: u32 = split.iter().map(|(_, pct)| *pct).sum();
    if sum != 100 {
        return Err(ShardingError::invalid(format!("region percentages sum to {sum}, not 100")));
    }
    let mut seen = BTreeSet::new();
    for (region, pct) in split {
        if !seen.insert(*region) {
            return Err(ShardingError::invalid(format!("region {region} listed twice")));
        }
        if *pct == 0 {
            return Err(ShardingError::invalid(format!("region {region} has a zero share")));
        }
    }

    let total = u64::from(total_shards);
    let mut counts: Vec<u64> = split.iter().map(|(_, pct)| total * u64::from(*pct) / 100).collect();
    let mut leftover = total - counts.iter().sum::<u64>();

    let mut by_remainder: Vec<usize> = (0..split.len()).collect();
    by_remainder.sort_by_key(|&i| std::cmp::Reverse((total * u64::from(split[i].1)) % 100));
    for i in by_remainder {
        if leftover == 0 {
            break;
        }
        counts[i] += 1;
        leftover -= 1;
    }

    let mut ranges = BTreeMap::new();
    let mut start = 0u32;
    for ((region, _), count) in split.iter().zip(counts) {
        if count == 0 {
            return Err(ShardingError::invalid(format!(
                "region {region} gets no shard out of {total_shards}"
            )));
        }
        let count = u32::try_from(count)
            .map_err(|_| ShardingError::invalid("shard count overflow"))?;
        ranges.insert(
            *region,
            RegionRange { start_shard: start, end_shard: start + count, shard_count: count },
        );
        start += count;
    }
    Ok(ranges)
}

fn total_shards_for(
    groups: &BTreeMap<String, ColocationGroup>,
    default_total: u32,
    prefix: TypePrefix,
) -> u32 {
    groups
        .values()
        .find(|g| g.resource_types.contains(&prefix))
        .map_or(default_total, |g| g.total_shards)
}

fn region_for_shard(
    regions: &BTreeMap<RegionKey, RegionRange>,
    generation_total: u32,
    shard: u32,
    total: u32,
) -> Result<RegionKey> {
    if shard >= total {
        return Err(ShardingError::invalid(format!("shard {shard} out of range 0..{total}")));
    }
    let scaled = if total == generation_total {
        shard
    } else {
        let scaled = u64::from(shard) * u64::from(generation_total) / u64::from(total);
        u32::try_from(scaled).map_err(|_| ShardingError::invalid("shard scaling overflow"))?
    };
    regions
        .iter()
        .find(|(_, range)| range.contains(scaled))
        .map(|(region, _)| *region)
        .ok_or_else(|| ShardingError::invalid(format!("no region owns shard {scaled}")))
}

fn validate_partition(
    generation: u32,
    total: u32,
    regions: &BTreeMap<RegionKey, RegionRange>,
) -> Result<()> {
    if total == 0 {
        return Err(ShardingError::invalid(format!("generation {generation} has no shards")));
    }
    let mut ranges: Vec<(&RegionKey, &RegionRange)> = regions.iter().collect();
    ranges.sort_by_key(|(_, r)| r.start_shard);

    let mut expected_start = 0u32;
    for (region, range) in ranges {
        if range.start_shard != expected_start {
            return Err(ShardingError::invalid(format!(
                "generation {generation}: region {region} starts at {} but {expected_start} is next",
                range.start_shard
            )));
        }
        if range.end_shard <= range.start_shard
            || range.shard_count != range.end_shard - range.start_shard
        {
            return Err(ShardingError::invalid(format!(
                "generation {generation}: region {region} has an inconsistent range"
            )));
        }
        expected_start = range.end_shard;
    }
    if expected_start != total {
        return Err(ShardingError::invalid(format!(
            "generation {generation}: regions cover {expected_start} of {total} shards"
        )));
    }
    Ok(())
}

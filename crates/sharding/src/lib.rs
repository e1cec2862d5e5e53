//! # keyward sharding
//!
//! Identifier codec, versioned region-shard topology and shard routing.
//!
//! This crate provides:
//! - **Identifier codec**: `g<gen>:<region>:<shard>:<type>_<random>` ids that
//!   carry their own placement
//! - **Region-Shard Directory**: per-tenant topology generations persisted in
//!   the shared configuration store, cached briefly, validated eagerly
//! - **Shard router**: FNV-1a placement of new resources, pure decoding for
//!   existing ones, and the actor instance address for either
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use keyward_sharding::{
//!     ActorAddress, DirectoryConfig, RegionShardDirectory, ResourceTypeTable, ShardRouter, TypePrefix,
//! };
//! use keyward_storage::{MemoryBackend, TenantId};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let types = Arc::new(ResourceTypeTable::default());
//! let directory =
//!     RegionShardDirectory::new(Arc::new(MemoryBackend::new()), Arc::clone(&types), DirectoryConfig::default());
//! let router = ShardRouter::new(types);
//!
//! let tenant = TenantId::parse("acme")?;
//! let topology = directory.current(&tenant).await?;
//! let (placement, id) = router.mint_id(&topology, TypePrefix::AUTHORIZATION_CODE, b"client-1")?;
//!
//! // Later requests route by the id alone.
//! let decoded = router.resolve_from_id(&id.to_string())?;
//! assert_eq!(ActorAddress::for_id(&tenant, &decoded), ActorAddress::for_placement(&tenant, &placement));
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Directory configuration.
pub mod config;
/// Region-Shard Directory.
pub mod directory;
/// Sharding errors.
pub mod error;
/// Identifier codec.
pub mod id;
/// Region enumeration.
pub mod region;
/// Resource type table.
pub mod resource_type;
/// Shard routing and actor addressing.
pub mod router;
/// Versioned topology documents.
pub mod topology;

pub use config::DirectoryConfig;
pub use directory::{DIRECTORY_PREFIX, RegionShardDirectory};
pub use error::{Result, ShardingError};
pub use id::{MIN_RANDOM_PART_LEN, RANDOM_PART_BYTES, ShardedResourceId};
pub use region::RegionKey;
pub use resource_type::{ResourceTypeTable, TypePrefix};
pub use router::{ActorAddress, Placement, ShardRouter, fnv1a_32};
pub use topology::{
    ColocationGroup, GenerationSnapshot, RegionRange, RegionShardConfig, ranges_from_percentages,
};

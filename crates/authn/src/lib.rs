//! # Keyward security primitives
//!
//! Exactly-once and monotonic state for an OAuth2/OIDC provider, kept in
//! single-writer shard actors:
//!
//! - **Replay guard**: proof-of-possession JTIs and revoked access tokens
//! - **One-time consumables**: challenges, authorization codes, device codes
//!   and backchannel requests, including the polling flow
//! - **Rotating token families**: refresh-token rotation with theft detection
//! - **Rate counters**: exact fixed-window limits
//! - **Signing keys**: planned and emergency rotation with an overlap window
//! - **Audit sidecar**: critical events written before the call returns,
//!   informational events batched
//!
//! ## Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use keyward_authn::{SecurityService, audit::TracingAuditSink};
//! use keyward_sharding::{DirectoryConfig, RegionShardDirectory, ResourceTypeTable};
//! use keyward_storage::{ClientId, MemoryBackend, TenantId, UserId};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let directory = Arc::new(RegionShardDirectory::new(
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(ResourceTypeTable::default()),
//!     DirectoryConfig::default(),
//! ));
//! let service = SecurityService::builder()
//!     .backend(Arc::new(MemoryBackend::new()))
//!     .directory(directory)
//!     .audit_sink(Arc::new(TracingAuditSink))
//!     .build();
//!
//! let tenant = TenantId::parse("acme")?;
//! let issued = service
//!     .create_family(&tenant, &UserId::from("u1"), &ClientId::from("c1"), Duration::from_secs(86_400), Default::default())
//!     .await?;
//! println!("first refresh token: {}", issued.issued_id);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Audit events, sinks and the sidecar.
pub mod audit;
/// Time source.
pub mod clock;
/// Primitive configuration.
pub mod config;
/// One-time consumables.
pub mod consumable;
/// Fixed-window rate counters.
pub mod counter;
/// Error types.
pub mod error;
/// Rotating refresh-token families.
pub mod family;
/// Signing-key rotation.
pub mod keys;
/// Replay guard.
pub mod replay;
/// Request/response adapter.
pub mod rpc;
/// Shard actor runtime.
pub mod runtime;
/// Service facade.
pub mod service;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;

pub use audit::{AuditEvent, AuditKind, AuditSeverity, AuditSidecar, AuditSink, MemoryAuditSink, StoreAuditSink, TracingAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuditConfig, KeyConfig, PollingConfig, PrimitivesConfig, ReplayConfig};
pub use consumable::{ConsumableStatus, OneTimeConsumable, PollOutcome};
pub use counter::{RateDecision, RateWindow};
pub use error::{PrimitiveError, Result};
pub use family::{FamilyStatus, IssuedToken, RotationRequest, TokenFamily, family_shard_key};
pub use keys::{KeyAlgorithm, KeyEntry, KeyStatus, PublicJwk};
pub use replay::{ReplayOutcome, ReplayPolicy, ReplayRecord};
pub use rpc::{SecurityRequest, SecurityResponse};
pub use runtime::{ActorContext, ActorRegistry, ShardActor, ShardState, Turn};
pub use service::SecurityService;

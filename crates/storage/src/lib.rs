//! Storage collaborators for the keyward security-state layer.
//!
//! This crate provides the [`StorageBackend`] trait and the pieces built on
//! it that every other keyward crate persists through.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  keyward-authn primitives                   │
//! │   replay guard │ consumables │ families │ counters │ keys   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScopedStore (actors/<instance>/...) │ BatchWriter (audit)  │
//! │  with_retry (loads only)             │ directory documents  │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 StorageBackend trait                        │
//! │  (get, set, set_with_ttl, compare_and_set, get_range, txn)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 MemoryBackend (reference)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use keyward_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"directory/acme".to_vec(), b"{}".to_vec()).await?;
//!     let value = backend.get(b"directory/acme").await?;
//!     assert_eq!(value.map(|b| b.to_vec()), Some(b"{}".to_vec()));
//!
//!     let mut txn = backend.transaction().await?;
//!     txn.set(b"a".to_vec(), b"1".to_vec());
//!     txn.set(b"b".to_vec(), b"2".to_vec());
//!     txn.commit().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module ([`FlakyBackend`](testutil::FlakyBackend),
//!   key generators, assertion macros). Enable this in `[dev-dependencies]`.
//! - **`failpoints`**: Activates `fail` crate injection points (`batch-before-commit`,
//!   `retry-before-sleep`).

#![deny(unsafe_code)]

pub mod backend;
pub mod batch;
pub mod error;
pub mod memory;
pub mod retry;
pub mod scoped;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod transaction;
pub mod types;

pub use backend::{StorageBackend, prefix_end};
pub use batch::{BatchConfig, BatchFlushStats, BatchWriter};
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use retry::{RetryConfig, with_retry};
pub use scoped::{ScopedStore, ScopedWrite};
pub use transaction::Transaction;
pub use types::{ClientId, InvalidTenantId, KeyValue, TenantId, UserId};

//! Shared test utilities for security primitive testing.
//!
//! Feature-gated behind `testutil` so none of this leaks into production
//! builds.
//!
//! ```toml
//! [dev-dependencies]
//! keyward-authn = { path = "../authn", features = ["testutil"] }
//! ```

use std::sync::Arc;

use keyward_sharding::{DirectoryConfig, RegionShardDirectory, ResourceTypeTable};
use keyward_storage::{MemoryBackend, RetryConfig, TenantId, testutil::FlakyBackend};

use crate::{
    audit::MemoryAuditSink,
    clock::ManualClock,
    config::PrimitivesConfig,
    service::SecurityService,
};

/// Assert that a primitive result is an error matching `pattern`.
///
/// ```ignore
/// assert_primitive_error!(service.consume(&tenant, &id, None).await, PrimitiveError::AlreadyConsumed { .. });
/// ```
#[macro_export]
macro_rules! assert_primitive_error {
    ($result:expr, $pattern:pat) => {
        match $result {
            Err(ref err) if matches!(err, $pattern) => {},
            other => panic!("expected {}, got: {:?}", stringify!($pattern), other),
        }
    };
}

/// A service over in-memory storage with a manual clock and a recording
/// audit sink.
///
/// Actor state goes to a [`FlakyBackend`] so tests can inject storage
/// failures; the directory has its own backend and stays healthy.
pub struct TestHarness {
    /// The service under test.
    pub service: Arc<SecurityService>,
    /// Drives every expiry decision.
    pub clock: ManualClock,
    /// Receives audit events.
    pub audit: MemoryAuditSink,
    /// Actor state storage.
    pub backend: FlakyBackend,
    /// Tenant used by the helpers.
    pub tenant: TenantId,
}

impl TestHarness {
    /// A harness with default configuration.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PrimitivesConfig::default())
    }

    /// A harness with custom primitive configuration.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn with_config(config: PrimitivesConfig) -> Self {
        let clock = ManualClock::default();
        let audit = MemoryAuditSink::new();
        let backend = FlakyBackend::new();
        let directory = Arc::new(RegionShardDirectory::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(ResourceTypeTable::default()),
            DirectoryConfig::default(),
        ));
        let service = SecurityService::builder()
            .backend(Arc::new(backend.clone()))
            .directory(directory)
            .audit_sink(Arc::new(audit.clone()))
            .config(config)
            .clock(Arc::new(clock.clone()))
            .retry(RetryConfig::none())
            .build();
        let tenant = TenantId::parse("acme").expect("valid tenant");
        Self { service: Arc::new(service), clock, audit, backend, tenant }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

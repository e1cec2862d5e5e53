//! Audit sidecar.
//!
//! Two paths with different guarantees:
//!
//! - **Critical** events (theft detection, family revocation, emergency key
//!   rotation, key revocation) are written to the sink before the triggering
//!   operation returns. A failed write fails the operation.
//! - **Informational** events are buffered in memory and flushed when the
//!   buffer reaches `max_batch` events or `flush_interval` elapses, whichever
//!   comes first, and unconditionally on [`AuditSidecar::shutdown`]. The
//!   buffer holds at most `max_buffered` events; beyond that new events are
//!   dropped and counted in [`AuditSidecar::dropped`]. A failed flush puts
//!   its events back for the next attempt, as far as the cap allows. Neither
//!   ever reaches the primitive that produced the events.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fail::fail_point;
use keyward_storage::{BatchConfig, BatchWriter, StorageBackend, StorageError, StorageResult, TenantId};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::AuditConfig,
    error::{PrimitiveError, Result},
};

/// Key prefix of audit records in the audit store.
pub const AUDIT_PREFIX: &str = "audit/";

/// Delivery class of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    /// Written synchronously; failure fails the operation.
    Critical,
    /// Buffered; failure is logged and dropped.
    Info,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// An out-of-order refresh token was presented; the family was revoked.
    TheftDetected,
    /// A token family was revoked explicitly.
    FamilyRevoked,
    /// A signing key was replaced and revoked without a grace period.
    EmergencyRotation,
    /// A signing key was revoked.
    KeyRevoked,
    /// A token family was created.
    FamilyCreated,
    /// A token family rotated to a new version.
    FamilyRotated,
    /// A signing key was rotated with a grace period.
    KeyRotated,
    /// A replayed JTI or revoked token was rejected.
    ReplayRejected,
    /// A one-time item was consumed.
    Consumed,
    /// A pending authorization was denied.
    AuthorizationDenied,
    /// A rate limit rejected a request.
    RateLimited,
}

impl AuditKind {
    /// Delivery class of this kind.
    #[must_use]
    pub fn severity(self) -> AuditSeverity {
        match self {
            Self::TheftDetected | Self::FamilyRevoked | Self::EmergencyRotation | Self::KeyRevoked => {
                AuditSeverity::Critical
            },
            _ => AuditSeverity::Info,
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// What happened.
    pub kind: AuditKind,
    /// Delivery class, derived from `kind`.
    pub severity: AuditSeverity,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Instance name of the actor that produced the event.
    pub actor: String,
    /// What the event is about: a family key, key id or resource id.
    pub subject: String,
    /// Free-form details.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub detail: serde_json::Map<String, serde_json::Value>,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    /// Creates an event with no details.
    #[must_use]
    pub fn new(
        kind: AuditKind,
        tenant: TenantId,
        actor: impl Into<String>,
        subject: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            tenant,
            actor: actor.into(),
            subject: subject.into(),
            detail: serde_json::Map::new(),
            at,
        }
    }

    /// Adds a detail field.
    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.detail.insert(key.to_owned(), value.into());
        self
    }
}

/// Destination of audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persists `events` as one write.
    async fn write(&self, events: &[AuditEvent]) -> StorageResult<()>;
}

/// Writes events to a key-value audit store through a [`BatchWriter`].
pub struct StoreAuditSink {
    backend: Arc<dyn StorageBackend>,
    batch: BatchConfig,
}

impl StoreAuditSink {
    /// Creates a sink over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, batch: BatchConfig) -> Self {
        Self { backend, batch }
    }

    fn key(event: &AuditEvent) -> Vec<u8> {
        let nanos = event.at.timestamp_nanos_opt().unwrap_or_default();
        let suffix: u64 = rand::rng().random();
        format!("{AUDIT_PREFIX}{}/{nanos:020}-{suffix:016x}", event.tenant).into_bytes()
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn write(&self, events: &[AuditEvent]) -> StorageResult<()> {
        let mut writer = BatchWriter::new(Arc::clone(&self.backend), self.batch.clone());
        for event in events {
            writer.put(Self::key(event), serde_json::to_vec(event)?);
        }
        writer.flush().await.map(|_| ())
    }
}

/// Emits every event as a structured `tracing` record at INFO.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, events: &[AuditEvent]) -> StorageResult<()> {
        for event in events {
            info!(
                audit.kind = ?event.kind,
                audit.severity = ?event.severity,
                audit.tenant = %event.tenant,
                audit.actor = %event.actor,
                audit.subject = %event.subject,
                audit.at = %event.at,
                "Audit event"
            );
        }
        Ok(())
    }
}

/// Keeps events in memory. Can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event written so far.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind.
    #[must_use]
    pub fn events_of(&self, kind: AuditKind) -> Vec<AuditEvent> {
        self.events.lock().iter().filter(|e| e.kind == kind).cloned().collect()
    }

    /// Makes subsequent writes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, events: &[AuditEvent]) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::connection("audit store unreachable"));
        }
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}

/// Buffers informational events and writes critical ones synchronously.
pub struct AuditSidecar {
    sink: Arc<dyn AuditSink>,
    config: AuditConfig,
    buffer: Mutex<VecDeque<AuditEvent>>,
    dropped: AtomicU64,
    notify: Arc<Notify>,
    cancel_token: CancellationToken,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for AuditSidecar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditSidecar")
            .field("config", &self.config)
            .field("buffered", &self.buffer.lock().len())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AuditSidecar {
    /// Creates a sidecar and starts its background flush task.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn start(sink: Arc<dyn AuditSink>, config: AuditConfig) -> Arc<Self> {
        let sidecar = Arc::new(Self {
            sink,
            config,
            buffer: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            notify: Arc::new(Notify::new()),
            cancel_token: CancellationToken::new(),
            flush_handle: Mutex::new(None),
        });

        let weak = Arc::downgrade(&sidecar);
        let token = sidecar.cancel_token.clone();
        let interval = sidecar.config.flush_interval();
        let notify = Arc::clone(&sidecar.notify);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = notify.notified() => {},
                    _ = tokio::time::sleep(interval) => {},
                }
                let Some(sidecar) = Weak::upgrade(&weak) else { break };
                sidecar.flush().await;
            }
            debug!("Audit flush task stopped");
        });
        *sidecar.flush_handle.lock() = Some(handle);
        sidecar
    }

    /// Writes a critical event before returning.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::AuditUnavailable`] if the sink rejects the
    /// write.
    pub async fn record_critical(&self, event: AuditEvent) -> Result<()> {
        fail_point!("audit-critical-write", |_| {
            Err(PrimitiveError::AuditUnavailable(StorageError::internal("injected audit failure")))
        });
        self.sink.write(std::slice::from_ref(&event)).await.map_err(|err| {
            error!(
                kind = ?event.kind,
                tenant = %event.tenant,
                subject = %event.subject,
                error = %err,
                "Critical audit write failed"
            );
            PrimitiveError::AuditUnavailable(err)
        })
    }

    /// Buffers an informational event. Never waits on the sink.
    ///
    /// A full buffer drops the event and counts it.
    pub fn record(&self, event: AuditEvent) {
        let len = {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.config.max_buffered() {
                drop(buffer);
                self.count_dropped(1);
                return;
            }
            buffer.push_back(event);
            buffer.len()
        };
        if len >= self.config.max_batch() {
            self.notify.notify_one();
        }
    }

    fn count_dropped(&self, count: u64) {
        let before = self.dropped.fetch_add(count, Ordering::Relaxed);
        // One warning per thousand drops.
        if before / 1000 != (before + count) / 1000 || before == 0 {
            warn!(dropped_total = before + count, "Audit buffer full; informational events dropped");
        }
    }

    /// Writes every buffered event now. Returns how many were written.
    ///
    /// Events of a failed write go back to the front of the buffer, up to
    /// its capacity; the rest are dropped and counted.
    pub async fn flush(&self) -> usize {
        let mut events = Vec::from(std::mem::take(&mut *self.buffer.lock()));
        if events.is_empty() {
            return 0;
        }
        match self.sink.write(&events).await {
            Ok(()) => {
                debug!(count = events.len(), "Flushed audit events");
                events.len()
            },
            Err(err) => {
                let mut buffer = self.buffer.lock();
                let room = self.config.max_buffered().saturating_sub(buffer.len());
                let lost = events.len().saturating_sub(room);
                events.truncate(room);
                let kept = events.len();
                for event in events.into_iter().rev() {
                    buffer.push_front(event);
                }
                drop(buffer);
                warn!(kept, lost, error = %err, "Informational audit flush failed");
                if lost > 0 {
                    self.count_dropped(lost as u64);
                }
                0
            },
        }
    }

    /// Informational events dropped so far because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of events waiting to be flushed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Stops the background task and flushes what is left.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.flush_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(error = %err, "Audit flush task panicked");
        }
        self.flush().await;
    }
}

impl Drop for AuditSidecar {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use keyward_storage::MemoryBackend;

    use super::*;

    fn event(kind: AuditKind) -> AuditEvent {
        AuditEvent::new(kind, TenantId::parse("acme").unwrap(), "acme:enam:rtf:0", "subject", Utc::now())
    }

    fn config(max_batch: usize, flush_interval: Duration) -> AuditConfig {
        AuditConfig::builder().max_batch(max_batch).flush_interval(flush_interval).build().unwrap()
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(AuditKind::TheftDetected.severity(), AuditSeverity::Critical);
        assert_eq!(AuditKind::EmergencyRotation.severity(), AuditSeverity::Critical);
        assert_eq!(AuditKind::FamilyRotated.severity(), AuditSeverity::Info);
    }

    #[tokio::test]
    async fn test_critical_is_written_immediately() {
        let sink = MemoryAuditSink::new();
        let sidecar = AuditSidecar::start(Arc::new(sink.clone()), AuditConfig::default());

        sidecar.record_critical(event(AuditKind::TheftDetected)).await.unwrap();
        assert_eq!(sink.events_of(AuditKind::TheftDetected).len(), 1);
        sidecar.shutdown().await;
    }

    #[tokio::test]
    async fn test_critical_failure_propagates() {
        let sink = MemoryAuditSink::new();
        sink.set_failing(true);
        let sidecar = AuditSidecar::start(Arc::new(sink.clone()), AuditConfig::default());

        let err = sidecar.record_critical(event(AuditKind::FamilyRevoked)).await.unwrap_err();
        assert!(matches!(err, PrimitiveError::AuditUnavailable(_)));
        sidecar.shutdown().await;
    }

    #[tokio::test]
    async fn test_info_buffers_until_threshold() {
        let sink = MemoryAuditSink::new();
        let sidecar = AuditSidecar::start(Arc::new(sink.clone()), config(3, Duration::from_secs(3600)));

        sidecar.record(event(AuditKind::Consumed));
        sidecar.record(event(AuditKind::Consumed));
        tokio::task::yield_now().await;
        assert!(sink.events().is_empty());
        assert_eq!(sidecar.buffered(), 2);

        sidecar.record(event(AuditKind::Consumed));
        for _ in 0..50 {
            if sink.events().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.events().len(), 3);
        sidecar.shutdown().await;
    }

    #[tokio::test]
    async fn test_info_flushes_on_timer() {
        let sink = MemoryAuditSink::new();
        let sidecar = AuditSidecar::start(Arc::new(sink.clone()), config(100, Duration::from_millis(20)));

        sidecar.record(event(AuditKind::RateLimited));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.events().len(), 1);
        sidecar.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_info_flush_is_retried() {
        let sink = MemoryAuditSink::new();
        sink.set_failing(true);
        let sidecar = AuditSidecar::start(Arc::new(sink.clone()), config(100, Duration::from_secs(3600)));

        sidecar.record(event(AuditKind::Consumed));
        assert_eq!(sidecar.flush().await, 0);
        assert_eq!(sidecar.buffered(), 1);

        sink.set_failing(false);
        assert_eq!(sidecar.flush().await, 1);
        assert_eq!(sink.events_of(AuditKind::Consumed).len(), 1);
        assert_eq!(sidecar.dropped(), 0);
        sidecar.shutdown().await;
    }

    #[tokio::test]
    async fn test_buffer_is_capped_while_sink_is_down() {
        let sink = MemoryAuditSink::new();
        sink.set_failing(true);
        let capped = AuditConfig::builder()
            .max_batch(2)
            .max_buffered(4)
            .flush_interval(Duration::from_secs(3600))
            .build()
            .unwrap();
        let sidecar = AuditSidecar::start(Arc::new(sink.clone()), capped);

        for _ in 0..6 {
            sidecar.record(event(AuditKind::RateLimited));
        }
        assert_eq!(sidecar.buffered(), 4);
        assert_eq!(sidecar.dropped(), 2);

        // A failed flush keeps the backlog; newer events still queue behind it.
        assert_eq!(sidecar.flush().await, 0);
        assert_eq!(sidecar.buffered(), 4);
        sidecar.record(event(AuditKind::KeyRotated));
        assert_eq!(sidecar.dropped(), 3);

        sink.set_failing(false);
        assert_eq!(sidecar.flush().await, 4);
        assert_eq!(sink.events_of(AuditKind::RateLimited).len(), 4);
        sidecar.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remaining() {
        let sink = MemoryAuditSink::new();
        let sidecar = AuditSidecar::start(Arc::new(sink.clone()), config(100, Duration::from_secs(3600)));
        sidecar.record(event(AuditKind::KeyRotated));
        sidecar.shutdown().await;
        assert_eq!(sink.events_of(AuditKind::KeyRotated).len(), 1);
    }

    #[tokio::test]
    async fn test_store_sink_writes_json_records() {
        let backend = Arc::new(MemoryBackend::new());
        let sink = StoreAuditSink::new(backend.clone(), BatchConfig::default());
        sink.write(&[event(AuditKind::TheftDetected), event(AuditKind::KeyRevoked)]).await.unwrap();

        let records = backend.list_prefix(b"audit/acme/").await.unwrap();
        assert_eq!(records.len(), 2);
        let decoded: AuditEvent = serde_json::from_slice(&records[0].value).unwrap();
        assert_eq!(decoded.tenant.as_str(), "acme");
        assert_eq!(decoded.severity, AuditSeverity::Critical);
    }
}

//! Partitioned actor runtime.
//!
//! Every (tenant, region, type, shard) namespace is owned by exactly one
//! [`ShardActor`] per process. An actor:
//!
//! - loads its state from its [`ScopedStore`] once, on first use; every
//!   caller that arrives during the load waits for it, so nobody ever sees an
//!   empty or partial state
//! - runs operations one at a time, in arrival order, through a [`Turn`]
//! - persists the defining mutation of an operation before the in-memory
//!   state changes and before the caller is told it succeeded
//!
//! Expired entries are removed by a periodic sweep that takes an ordinary
//! turn, so it interleaves safely with live traffic and can run any number
//! of times.

use std::{collections::HashMap, fmt, ops::Deref, ops::DerefMut, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fail::fail_point;
use keyward_sharding::ActorAddress;
use keyward_storage::{RetryConfig, ScopedStore, ScopedWrite, StorageBackend, StorageError, StorageResult, with_retry};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::{
    sync::{Mutex, MutexGuard, OnceCell},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audit::{AuditEvent, AuditKind, AuditSidecar},
    clock::Clock,
    config::PrimitivesConfig,
    error::{PrimitiveError, Result},
};

/// In-memory state of one actor.
#[async_trait]
pub trait ShardState: Send + Sync + Sized + 'static {
    /// Rebuilds the state from the actor's namespace.
    async fn load(store: &ScopedStore) -> StorageResult<Self>;

    /// Storage keys of entries that have expired at `now`.
    fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String>;

    /// Drops entries whose storage keys were just deleted.
    fn forget(&mut self, keys: &[String]);

    /// Whether nothing is held. An empty actor may be dropped and rebuilt
    /// from storage later.
    fn is_empty(&self) -> bool;
}

/// Collaborators every actor shares.
#[derive(Debug, Clone)]
pub struct ActorContext {
    /// Time source for every expiry decision.
    pub clock: Arc<dyn Clock>,
    /// Audit sidecar.
    pub audit: Arc<AuditSidecar>,
    /// Primitive configuration.
    pub config: Arc<PrimitivesConfig>,
    /// Retry policy for state loads.
    pub retry: RetryConfig,
}

/// Single-writer owner of one shard namespace.
pub struct ShardActor<S> {
    address: ActorAddress,
    store: ScopedStore,
    ctx: Arc<ActorContext>,
    state: OnceCell<Mutex<S>>,
}

impl<S> fmt::Debug for ShardActor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardActor")
            .field("address", &self.address.to_string())
            .field("initialized", &self.state.initialized())
            .finish_non_exhaustive()
    }
}

impl<S: ShardState> ShardActor<S> {
    /// Creates an actor. Nothing is loaded until the first turn.
    #[must_use]
    pub fn new(address: ActorAddress, backend: Arc<dyn StorageBackend>, ctx: Arc<ActorContext>) -> Self {
        let store = ScopedStore::new(backend, address.to_string());
        Self { address, store, ctx, state: OnceCell::new() }
    }

    /// The namespace this actor owns.
    #[must_use]
    pub fn address(&self) -> &ActorAddress {
        &self.address
    }

    /// Whether the state has been loaded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.initialized()
    }

    /// Waits for initialisation and then for this caller's turn.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the state cannot be loaded
    /// after retries. The next caller tries the load again.
    pub async fn turn(&self) -> Result<Turn<'_, S>> {
        let cell = self
            .state
            .get_or_try_init(|| async {
                let state =
                    with_retry(&self.ctx.retry, "actor_load", || S::load(&self.store)).await?;
                debug!(actor = %self.address, "Actor state loaded");
                Ok::<_, StorageError>(Mutex::new(state))
            })
            .await?;
        Ok(Turn { state: cell.lock().await, actor: self })
    }

    /// Removes expired entries. Returns how many storage keys were deleted.
    ///
    /// An actor that was never used has nothing in memory and is skipped;
    /// its persisted entries carry their own storage TTL.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the deletion cannot be
    /// persisted; memory is left untouched so the next sweep retries.
    pub async fn sweep(&self) -> Result<usize> {
        if !self.is_initialized() {
            return Ok(0);
        }
        let mut turn = self.turn().await?;
        let keys = turn.expired_keys(turn.now());
        if keys.is_empty() {
            return Ok(0);
        }
        turn.commit(keys.iter().map(ScopedWrite::delete).collect()).await?;
        turn.forget(&keys);
        debug!(actor = %self.address, removed = keys.len(), "Swept expired entries");
        Ok(keys.len())
    }

    /// Never loaded, or loaded and now empty. An actor mid-turn is never
    /// idle.
    fn is_idle(&self) -> bool {
        match self.state.get() {
            None => true,
            Some(state) => state.try_lock().is_ok_and(|state| state.is_empty()),
        }
    }
}

/// Exclusive access to an actor's state for one operation.
///
/// Dereferences to the state. Persist through the turn first, then mutate.
pub struct Turn<'a, S> {
    state: MutexGuard<'a, S>,
    actor: &'a ShardActor<S>,
}

impl<S> Deref for Turn<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.state
    }
}

impl<S> DerefMut for Turn<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.state
    }
}

impl<S> Turn<'_, S> {
    /// The current time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.actor.ctx.clock.now()
    }

    /// The owning actor's address.
    #[must_use]
    pub fn address(&self) -> &ActorAddress {
        &self.actor.address
    }

    /// Primitive configuration.
    #[must_use]
    pub fn config(&self) -> &PrimitivesConfig {
        &self.actor.ctx.config
    }

    /// An audit event attributed to this actor.
    #[must_use]
    pub fn event(&self, kind: AuditKind, subject: impl Into<String>) -> AuditEvent {
        AuditEvent::new(
            kind,
            self.actor.address.tenant.clone(),
            self.actor.address.to_string(),
            subject,
            self.now(),
        )
    }

    /// Writes a critical audit event before the operation returns.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::AuditUnavailable`] if the write fails.
    pub async fn audit_critical(&self, event: AuditEvent) -> Result<()> {
        self.actor.ctx.audit.record_critical(event).await
    }

    /// Buffers an informational audit event.
    pub fn audit(&self, event: AuditEvent) {
        self.actor.ctx.audit.record(event);
    }

    /// Persists one JSON value, optionally expiring.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the write fails.
    pub async fn persist<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let write = match ttl {
            Some(ttl) => ScopedWrite::put_json_with_ttl(key, value, ttl)?,
            None => ScopedWrite::put_json(key, value)?,
        };
        self.commit(vec![write]).await
    }

    /// Deletes one key.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the delete fails.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.commit(vec![ScopedWrite::delete(key)]).await
    }

    /// Applies several writes atomically.
    ///
    /// # Errors
    ///
    /// Returns [`PrimitiveError::Storage`] if the commit fails; nothing was
    /// written.
    pub async fn commit(&self, writes: Vec<ScopedWrite>) -> Result<()> {
        fail_point!("actor-persist", |_| {
            Err(PrimitiveError::Storage(StorageError::internal("injected persist failure")))
        });
        self.actor.store.write_batch(writes).await.map_err(|err| {
            warn!(actor = %self.actor.address, error = %err, "Persist failed; operation aborted");
            PrimitiveError::Storage(err)
        })
    }
}

/// Something the background sweeper can clean.
#[async_trait]
pub trait Sweep: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &'static str;

    /// Sweeps every live actor. Returns how many entries were removed.
    async fn sweep_all(&self) -> usize;
}

/// Lazily creates and caches one actor per address.
pub struct ActorRegistry<S> {
    name: &'static str,
    backend: Arc<dyn StorageBackend>,
    ctx: Arc<ActorContext>,
    actors: RwLock<HashMap<ActorAddress, Arc<ShardActor<S>>>>,
}

impl<S> fmt::Debug for ActorRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRegistry")
            .field("name", &self.name)
            .field("actors", &self.actors.read().len())
            .finish_non_exhaustive()
    }
}

impl<S: ShardState> ActorRegistry<S> {
    /// Creates an empty registry whose actors persist to `backend`.
    #[must_use]
    pub fn new(name: &'static str, backend: Arc<dyn StorageBackend>, ctx: Arc<ActorContext>) -> Self {
        Self { name, backend, ctx, actors: RwLock::new(HashMap::new()) }
    }

    /// Returns the actor for `address`, creating it on first use.
    #[must_use]
    pub fn get(&self, address: &ActorAddress) -> Arc<ShardActor<S>> {
        if let Some(actor) = self.actors.read().get(address) {
            return Arc::clone(actor);
        }
        let mut actors = self.actors.write();
        Arc::clone(actors.entry(address.clone()).or_insert_with(|| {
            Arc::new(ShardActor::new(address.clone(), Arc::clone(&self.backend), Arc::clone(&self.ctx)))
        }))
    }

    /// Drops actors that hold no state and that no caller is using, so the
    /// registry only grows with live state. Returns how many were dropped.
    ///
    /// A dropped actor is rebuilt on its next use; since its namespace was
    /// empty it starts out empty again.
    pub fn evict_idle(&self) -> usize {
        let mut actors = self.actors.write();
        let before = actors.len();
        // The map's own reference is the only one once no caller holds the actor.
        actors.retain(|_, actor| Arc::strong_count(actor) > 1 || !actor.is_idle());
        before - actors.len()
    }

    /// Number of live actors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actors.read().len()
    }

    /// Whether no actor is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actors.read().is_empty()
    }
}

#[async_trait]
impl<S: ShardState> Sweep for ActorRegistry<S> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn sweep_all(&self) -> usize {
        let actors: Vec<_> = self.actors.read().values().cloned().collect();
        let mut removed = 0;
        for actor in actors {
            match actor.sweep().await {
                Ok(count) => removed += count,
                Err(err) => {
                    warn!(registry = self.name, actor = %actor.address(), error = %err, "Sweep failed");
                },
            }
        }
        let evicted = self.evict_idle();
        if evicted > 0 {
            debug!(registry = self.name, evicted, live = self.len(), "Evicted idle actors");
        }
        removed
    }
}

/// Spawns a task that sweeps `targets` every `interval` until `token` is
/// cancelled.
///
/// # Panics
///
/// Must be called within a Tokio runtime context.
pub fn spawn_sweeper(
    targets: Vec<Arc<dyn Sweep>>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; start with a full wait.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    for target in &targets {
                        let removed = target.sweep_all().await;
                        if removed > 0 {
                            debug!(registry = target.name(), removed, "Sweep cycle complete");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use keyward_sharding::{RegionKey, TypePrefix};
    use keyward_storage::{MemoryBackend, testutil::FlakyBackend};
    use serde::Deserialize;

    use super::*;
    use crate::{
        audit::MemoryAuditSink,
        clock::{ManualClock, after},
    };

    static LOADS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Entry {
        value: u64,
        expires_at: DateTime<Utc>,
    }

    #[derive(Debug, Default)]
    struct Entries(HashMap<String, Entry>);

    #[async_trait]
    impl ShardState for Entries {
        async fn load(store: &ScopedStore) -> StorageResult<Self> {
            LOADS.fetch_add(1, Ordering::SeqCst);
            // Slow load so concurrent callers pile up behind it.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Self(store.list_json("e/").await?.into_iter().collect()))
        }

        fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
            self.0.iter().filter(|(_, e)| e.expires_at <= now).map(|(k, _)| k.clone()).collect()
        }

        fn forget(&mut self, keys: &[String]) {
            for key in keys {
                self.0.remove(key);
            }
        }

        fn is_empty(&self) -> bool {
            self.0.is_empty()
        }
    }

    fn address(shard: u32) -> ActorAddress {
        ActorAddress {
            tenant: "acme".parse().unwrap(),
            region: RegionKey::Oc,
            type_prefix: TypePrefix::RATE_LIMIT,
            shard,
        }
    }

    fn context(clock: ManualClock) -> Arc<ActorContext> {
        Arc::new(ActorContext {
            clock: Arc::new(clock),
            audit: AuditSidecar::start(Arc::new(MemoryAuditSink::new()), Default::default()),
            config: Arc::new(PrimitivesConfig::default()),
            retry: RetryConfig::builder().initial_backoff(Duration::from_millis(1)).build().unwrap(),
        })
    }

    async fn put(turn: &mut Turn<'_, Entries>, key: &str, value: u64, ttl: Duration) {
        let entry = Entry { value, expires_at: after(turn.now(), ttl) };
        turn.persist(key, &entry, Some(ttl)).await.unwrap();
        turn.0.insert(key.to_owned(), entry);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_loads_once() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let registry = Arc::new(ActorRegistry::<Entries>::new("test", backend, context(ManualClock::default())));
        let before = LOADS.load(Ordering::SeqCst);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.spawn(async move {
                let actor = registry.get(&address(99));
                let turn = actor.turn().await.unwrap();
                turn.0.len()
            });
        }
        while let Some(len) = tasks.join_next().await {
            assert_eq!(len.unwrap(), 0);
        }
        assert_eq!(LOADS.load(Ordering::SeqCst) - before, 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let clock = ManualClock::default();
        let ctx = context(clock.clone());
        {
            let actor = ShardActor::<Entries>::new(address(1), Arc::clone(&backend), Arc::clone(&ctx));
            let mut turn = actor.turn().await.unwrap();
            put(&mut turn, "e/a", 7, Duration::from_secs(60)).await;
        }
        let fresh = ShardActor::<Entries>::new(address(1), backend, ctx);
        let turn = fresh.turn().await.unwrap();
        assert_eq!(turn.0["e/a"].value, 7);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_memory_untouched() {
        let flaky = FlakyBackend::new();
        let actor = ShardActor::<Entries>::new(address(2), Arc::new(flaky.clone()), context(ManualClock::default()));
        flaky.fail_writes(true);

        let turn = actor.turn().await.unwrap();
        let entry = Entry { value: 1, expires_at: Utc::now() };
        assert!(matches!(turn.persist("e/x", &entry, None).await, Err(PrimitiveError::Storage(_))));
        assert!(turn.0.is_empty());
    }

    #[tokio::test]
    async fn test_load_retries_transient_failures() {
        let flaky = FlakyBackend::new();
        flaky.transient_read_failures(2);
        let actor = ShardActor::<Entries>::new(address(3), Arc::new(flaky.clone()), context(ManualClock::default()));
        assert!(actor.turn().await.is_ok());
        assert!(actor.is_initialized());
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let clock = ManualClock::default();
        let actor = ShardActor::<Entries>::new(address(4), Arc::clone(&backend), context(clock.clone()));
        {
            let mut turn = actor.turn().await.unwrap();
            put(&mut turn, "e/short", 1, Duration::from_secs(10)).await;
            put(&mut turn, "e/long", 2, Duration::from_secs(600)).await;
        }

        clock.advance(Duration::from_secs(11));
        assert_eq!(actor.sweep().await.unwrap(), 1);
        assert_eq!(actor.sweep().await.unwrap(), 0);

        let turn = actor.turn().await.unwrap();
        assert!(turn.0.contains_key("e/long"));
        assert!(!turn.0.contains_key("e/short"));
        assert!(backend.get(b"actors/acme:oc:rlm:4/e/short").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_idle_unheld_actors() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let clock = ManualClock::default();
        let registry = ActorRegistry::<Entries>::new("test", Arc::clone(&backend), context(clock.clone()));

        // Looked up but never used.
        drop(registry.get(&address(10)));
        {
            let actor = registry.get(&address(11));
            let mut turn = actor.turn().await.unwrap();
            put(&mut turn, "e/short", 1, Duration::from_secs(10)).await;
        }
        {
            let actor = registry.get(&address(12));
            let mut turn = actor.turn().await.unwrap();
            put(&mut turn, "e/long", 2, Duration::from_secs(600)).await;
        }
        let held = registry.get(&address(13));
        assert_eq!(registry.len(), 4);

        clock.advance(Duration::from_secs(11));
        assert_eq!(registry.sweep_all().await, 1);

        // 10 was never loaded, 11 emptied by the sweep; 12 holds state, 13 is in use.
        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&held, &registry.get(&address(13))));
        assert_eq!(registry.get(&address(12)).turn().await.unwrap().0["e/long"].value, 2);

        drop(held);
        assert_eq!(registry.evict_idle(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_on_cancel() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let registry: Arc<dyn Sweep> =
            Arc::new(ActorRegistry::<Entries>::new("test", backend, context(ManualClock::default())));
        let token = CancellationToken::new();
        let handle = spawn_sweeper(vec![registry], Duration::from_millis(5), token.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        handle.await.unwrap();
    }
}

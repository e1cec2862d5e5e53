//! Races on a single actor: every primitive must stay exactly-once under
//! concurrent callers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use keyward_authn::{
    Clock, ManualClock, MemoryAuditSink, PrimitiveError, ReplayOutcome, RotationRequest, SecurityService,
};
use keyward_sharding::{DirectoryConfig, RegionShardDirectory, ResourceTypeTable, TypePrefix};
use keyward_storage::{ClientId, MemoryBackend, TenantId, UserId};
use rstest::rstest;
use serde_json::json;
use tokio::task::JoinSet;

const TTL: Duration = Duration::from_secs(600);

fn service(clock: &ManualClock) -> Arc<SecurityService> {
    let directory = Arc::new(RegionShardDirectory::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(ResourceTypeTable::default()),
        DirectoryConfig::default(),
    ));
    Arc::new(
        SecurityService::builder()
            .backend(Arc::new(MemoryBackend::new()))
            .directory(directory)
            .audit_sink(Arc::new(MemoryAuditSink::new()))
            .clock(Arc::new(clock.clone()))
            .build(),
    )
}

fn tenant() -> TenantId {
    TenantId::parse("acme").unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consume_has_one_winner() {
    let clock = ManualClock::default();
    let service = service(&clock);
    let item = service
        .store_consumable(&tenant(), TypePrefix::AUTHORIZATION_CODE, "c1", json!("code"), TTL)
        .await
        .unwrap();

    let mut tasks = JoinSet::new();
    for _ in 0..32 {
        let service = Arc::clone(&service);
        let id = item.id.clone();
        tasks.spawn(async move { service.consume(&tenant(), &id, None).await });
    }

    let results = tasks.join_all().await;
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|err| matches!(err, PrimitiveError::AlreadyConsumed { .. }))
    );
}

#[rstest]
#[case(1, 8)]
#[case(20, 50)]
#[case(64, 64)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_admit_exactly_the_limit(#[case] limit: u64, #[case] callers: u64) {
    let clock = ManualClock::default();
    let service = service(&clock);

    let mut tasks = JoinSet::new();
    for _ in 0..callers {
        let service = Arc::clone(&service);
        tasks.spawn(async move { service.increment(&tenant(), "login:u1", Duration::from_secs(60), limit).await });
    }

    let mut decisions: Vec<_> = tasks.join_all().await.into_iter().map(Result::unwrap).collect();
    assert_eq!(decisions.iter().filter(|d| d.allowed).count() as u64, limit.min(callers));

    decisions.sort_by_key(|d| d.current);
    let counts: Vec<_> = decisions.iter().map(|d| d.current).collect();
    assert_eq!(counts, (1..=callers).collect::<Vec<_>>());
    assert!(decisions.iter().all(|d| d.allowed == (d.current <= limit)));
    assert!(decisions.iter().all(|d| d.reset_at == decisions[0].reset_at));

    let denied: Vec<_> = decisions.iter().filter(|d| !d.allowed).map(|d| d.retry_after).collect();
    assert!(denied.iter().all(|secs| *secs > 0));
    assert!(denied.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rotation_with_one_token_succeeds_once() {
    let clock = ManualClock::default();
    let service = service(&clock);
    let (user, client) = (UserId::from("u1"), ClientId::from("c1"));
    let first = service.create_family(&tenant(), &user, &client, TTL, BTreeSet::new()).await.unwrap();

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let service = Arc::clone(&service);
        let (user, client) = (user.clone(), client.clone());
        let request = RotationRequest { presented_version: 1, presented_id: first.issued_id.clone(), requested_scope: None };
        tasks.spawn(async move { service.rotate_family(&tenant(), &user, &client, &request).await });
    }

    let results = tasks.join_all().await;
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

    // Losing the race looks exactly like replaying a used token.
    let family = service.family_status(&tenant(), &user, &client).await.unwrap().unwrap();
    assert!(family.is_revoked());
    assert_eq!(family.version, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_jti_presentations_accept_once() {
    let clock = ManualClock::default();
    let service = service(&clock);
    let expires_at = clock.now() + chrono::Duration::seconds(60);

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let service = Arc::clone(&service);
        tasks.spawn(async move { service.check_and_record_jti(&tenant(), "proof-1", expires_at, None).await });
    }

    let outcomes: Vec<_> = tasks.join_all().await.into_iter().map(Result::unwrap).collect();
    assert_eq!(outcomes.iter().filter(|o| **o == ReplayOutcome::Accepted).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == ReplayOutcome::Replay).count(), 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ensure_active_key_creates_one_key() {
    let clock = ManualClock::default();
    let service = service(&clock);

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let service = Arc::clone(&service);
        tasks.spawn(async move { service.ensure_active_key(&tenant(), keyward_authn::KeyAlgorithm::EdDsa).await });
    }

    let kids: BTreeSet<_> = tasks.join_all().await.into_iter().map(|entry| entry.unwrap().kid).collect();
    assert_eq!(kids.len(), 1);
    assert_eq!(service.verification_keys(&tenant(), None).await.unwrap().len(), 1);
}

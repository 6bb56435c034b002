//! Routing table and idle lifecycle properties

mod common;

use common::{router, router_with, FakeBackend};
use idlegate::error::{RequestError, RouteError};
use idlegate::router::RouterSettings;
use idlegate::storage::{MemoryStorage, SqliteStorage, Storage};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn memory() -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::new())
}

fn sweep_now() -> RouterSettings {
    RouterSettings {
        idle_timeout: Duration::ZERO,
        ..RouterSettings::default()
    }
}

// ============================================================================
// Routing table
// ============================================================================

#[tokio::test]
async fn test_target_add_is_idempotent() {
    let router = router(memory(), Arc::new(FakeBackend::new()));

    router.target_add("app.example.com", "http://10.0.0.1:80", true).await.unwrap();
    router.target_add("app.example.com", "http://10.0.0.1:80", true).await.unwrap();

    assert_eq!(
        router.target_list("app.example.com").await.unwrap(),
        vec!["http://10.0.0.1:80"]
    );
}

#[tokio::test]
async fn test_balanced_removal_drops_host() {
    let storage = memory();
    let router = router(storage.clone(), Arc::new(FakeBackend::new()));

    router.target_add("App.Example.com.", "http://10.0.0.1:80", true).await.unwrap();
    router.target_remove("app.example.com", "http://10.0.0.1:80").await.unwrap();

    assert!(router.target_list("app.example.com").await.unwrap().is_empty());
    assert!(storage.host_list().await.unwrap().is_empty());
    assert!(matches!(router.route("app.example.com").await, Err(RouteError::NoBackends)));
}

#[tokio::test]
async fn test_exact_host_beats_wildcard() {
    let router = router(memory(), Arc::new(FakeBackend::new()));
    router.target_add("*.example.com", "http://wildcard:80", true).await.unwrap();
    router.target_add("app.example.com", "http://exact:80", true).await.unwrap();

    for _ in 0..20 {
        assert_eq!(router.route("app.example.com").await.unwrap(), "http://exact:80");
    }
}

#[tokio::test]
async fn test_wildcard_fallback() {
    let router = router(memory(), Arc::new(FakeBackend::new()));
    router.target_add("*.example.com", "http://wildcard:80", true).await.unwrap();
    router.target_add("*.b.example.com", "http://narrow:80", true).await.unwrap();

    assert_eq!(router.route("other.example.com").await.unwrap(), "http://wildcard:80");
    assert_eq!(router.route("a.b.example.com").await.unwrap(), "http://narrow:80");
    assert_eq!(router.route("A.B.EXAMPLE.COM.").await.unwrap(), "http://narrow:80");

    // A wildcard never covers its own apex
    assert!(matches!(router.route("example.com").await, Err(RouteError::NoBackends)));
}

#[tokio::test]
async fn test_unknown_host_has_no_backends() {
    let router = router(memory(), Arc::new(FakeBackend::new()));
    router.target_add("app.example.com", "http://10.0.0.1:80", true).await.unwrap();

    let err = router.route("unknown.test").await.unwrap_err();
    assert!(matches!(err, RouteError::NoBackends));
    assert_eq!(err.to_string(), "no backends available");
}

#[tokio::test]
async fn test_route_picks_among_all_targets() {
    let router = router(memory(), Arc::new(FakeBackend::new()));
    router.target_add("app.example.com", "http://a:80", true).await.unwrap();
    router.target_add("app.example.com", "http://b:80", true).await.unwrap();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..200 {
        seen.insert(router.route("app.example.com").await.unwrap());
    }
    assert_eq!(seen.len(), 2);
}

#[tokio::test]
async fn test_ip_literal_routes_only_to_itself() {
    let router = router(memory(), Arc::new(FakeBackend::new()));
    router.target_add("*.1.2.3", "http://wrong:80", true).await.unwrap();

    assert!(matches!(router.route("10.1.2.3").await, Err(RouteError::NoBackends)));

    router.target_add("10.1.2.3", "http://right:80", true).await.unwrap();
    assert_eq!(router.route("10.1.2.3").await.unwrap(), "http://right:80");
}

// ============================================================================
// Activity and idling
// ============================================================================

#[tokio::test]
async fn test_in_flight_target_is_not_idled() {
    let backend = Arc::new(FakeBackend::new());
    let router = router_with(memory(), backend.clone(), sweep_now());
    let target = "http://web.prod.svc.cluster.local:80";
    router.target_add("app.example.com", target, true).await.unwrap();

    router.request_begin(target).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(router.idle_tick().await.unwrap(), 0);
    assert!(backend.idle_calls().is_empty());

    router.request_end(target).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(router.idle_tick().await.unwrap(), 1);
    assert_eq!(backend.idle_calls(), vec![(target.to_string(), true)]);
    assert!(backend.is_idle(target));
}

#[tokio::test]
async fn test_idle_respects_idles_flag() {
    let backend = Arc::new(FakeBackend::new());
    let router = router_with(memory(), backend.clone(), sweep_now());
    let pinned = "http://db.prod.svc.cluster.local:80";
    router.target_add("db.example.com", pinned, false).await.unwrap();

    router.request_begin(pinned).await.unwrap();
    router.request_end(pinned).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(router.idle_tick().await.unwrap(), 0);
    assert!(backend.idle_calls().is_empty());
}

#[tokio::test]
async fn test_idle_tick_skips_already_idle_targets() {
    let backend = Arc::new(FakeBackend::new());
    let router = router_with(memory(), backend.clone(), sweep_now());
    let target = "http://web.prod.svc.cluster.local:80";
    router.target_add("app.example.com", target, true).await.unwrap();

    router.request_begin(target).await.unwrap();
    router.request_end(target).await.unwrap();
    backend.set_idle(target, true);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(router.idle_tick().await.unwrap(), 0);
    assert!(backend.idle_calls().is_empty());
}

#[tokio::test]
async fn test_recent_activity_is_not_idled() {
    let backend = Arc::new(FakeBackend::new());
    let router = router(memory(), backend.clone());
    let target = "http://web.prod.svc.cluster.local:80";
    router.target_add("app.example.com", target, true).await.unwrap();

    router.request_begin(target).await.unwrap();
    router.request_end(target).await.unwrap();

    assert_eq!(router.idle_tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_request_begin_unidles_once_under_concurrency() {
    let backend = Arc::new(FakeBackend::new().with_unidle_delay(Duration::from_millis(100)));
    let router = router(memory(), backend.clone());
    let target = "http://web.prod.svc.cluster.local:80";
    router.target_add("app.example.com", target, true).await.unwrap();
    backend.set_idle(target, true);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let router = router.clone();
        handles.push(tokio::spawn(async move { router.request_begin(target).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(backend.idle_calls(), vec![(target.to_string(), false)]);
    assert!(!backend.is_idle(target));
}

#[tokio::test]
async fn test_different_targets_unidle_in_parallel() {
    let backend = Arc::new(FakeBackend::new().with_unidle_delay(Duration::from_millis(300)));
    let router = router(memory(), backend.clone());
    let a = "http://a.prod.svc.cluster.local:80";
    let b = "http://b.prod.svc.cluster.local:80";
    backend.set_idle(a, true);
    backend.set_idle(b, true);

    let started = Instant::now();
    let (ra, rb) = tokio::join!(router.request_begin(a), router.request_begin(b));
    ra.unwrap();
    rb.unwrap();

    assert!(started.elapsed() < Duration::from_millis(550));
    assert_eq!(backend.idle_calls().len(), 2);
}

#[tokio::test]
async fn test_failed_unidle_releases_activity() {
    let backend = Arc::new(FakeBackend::new());
    let storage = memory();
    let router = router(storage.clone(), backend.clone());
    let target = "http://web.prod.svc.cluster.local:80";
    router.target_add("app.example.com", target, true).await.unwrap();
    backend.set_idle(target, true);
    backend.fail_unidle.store(true, std::sync::atomic::Ordering::SeqCst);

    let err = router.request_begin(target).await.unwrap_err();
    assert!(matches!(err, RequestError::Unidle(_)));

    // Nothing is left in flight, so the target is stale immediately
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stale = storage.stale(chrono::Utc::now()).await.unwrap();
    assert_eq!(stale, vec![target.to_string()]);
}

#[tokio::test]
async fn test_request_guard_ends_request_on_drop() {
    let backend = Arc::new(FakeBackend::new());
    let storage = memory();
    let router = router(storage.clone(), backend);
    let target = "http://web.prod.svc.cluster.local:80";
    router.target_add("app.example.com", target, true).await.unwrap();

    let guard = router.begin_request(target).await.unwrap();
    assert_eq!(guard.target(), target);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(storage.stale(chrono::Utc::now()).await.unwrap().is_empty());

    drop(guard);
    let mut released = false;
    for _ in 0..100 {
        let cutoff = chrono::Utc::now() + chrono::Duration::seconds(1);
        if storage.stale(cutoff).await.unwrap() == vec![target.to_string()] {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released);
}

#[tokio::test]
async fn test_request_during_idle_sweep_keeps_target_awake() {
    let backend = Arc::new(FakeBackend::new().with_idle_get_delay(Duration::from_millis(100)));
    let storage = memory();
    let router = router_with(storage.clone(), backend.clone(), sweep_now());
    let target = "http://web.prod.svc.cluster.local:80";
    router.target_add("app.example.com", target, true).await.unwrap();
    router.request_begin(target).await.unwrap();
    router.request_end(target).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The sweep has already listed the target as stale when the request arrives
    let sweep = {
        let router = router.clone();
        tokio::spawn(async move { router.idle_tick().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    router.request_begin(target).await.unwrap();

    assert_eq!(sweep.await.unwrap().unwrap(), 0);
    assert!(backend.idle_calls().is_empty());
    assert!(!backend.is_idle(target));
    assert_eq!(storage.in_flight(target).await.unwrap(), 1);
}

#[tokio::test]
async fn test_request_during_stop_wakes_target_again() {
    let backend = Arc::new(FakeBackend::new().with_stop_delay(Duration::from_millis(150)));
    let router = router_with(memory(), backend.clone(), sweep_now());
    let target = "http://web.prod.svc.cluster.local:80";
    router.target_add("app.example.com", target, true).await.unwrap();
    router.request_begin(target).await.unwrap();
    router.request_end(target).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sweep = {
        let router = router.clone();
        tokio::spawn(async move { router.idle_tick().await })
    };
    // Lands while the container is being stopped
    tokio::time::sleep(Duration::from_millis(50)).await;
    router.request_begin(target).await.unwrap();

    assert_eq!(sweep.await.unwrap().unwrap(), 1);
    assert_eq!(
        backend.idle_calls(),
        vec![(target.to_string(), true), (target.to_string(), false)]
    );
    assert!(!backend.is_idle(target));
}

#[tokio::test]
async fn test_sqlite_storage_behaves_like_memory() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(dir.path().join("routes.db")).unwrap());
    let backend = Arc::new(FakeBackend::new());
    let router = router_with(storage, backend.clone(), sweep_now());
    let target = "http://web.prod.svc.cluster.local:80";

    router.target_add("*.example.com", target, true).await.unwrap();
    router.target_add("*.example.com", target, true).await.unwrap();
    assert_eq!(router.route("app.example.com").await.unwrap(), target);

    router.request_begin(target).await.unwrap();
    router.request_end(target).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(router.idle_tick().await.unwrap(), 1);
    assert!(backend.is_idle(target));
}

// ============================================================================
// Health probes
// ============================================================================

#[tokio::test]
async fn test_health_tick_skips_internal_wildcard_and_ip_hosts() {
    let router = router(memory(), Arc::new(FakeBackend::new()));
    router.target_add("web.prod.svc.cluster.local", "http://t:80", true).await.unwrap();
    router.target_add("*.example.com", "http://t:80", true).await.unwrap();
    router.target_add("10.0.0.1", "http://t:80", true).await.unwrap();
    router.target_add("app.invalid", "http://t:80", true).await.unwrap();

    // Probes are fire-and-forget; the tick returns without waiting on them
    let started = Instant::now();
    assert_eq!(router.health_tick().await.unwrap(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
}

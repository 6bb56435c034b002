//! HTTP frontend: routing, unidling and activity accounting end to end

mod common;

use common::{closed_port, http_get_with_host, http_request, router, spawn_target, CountingStorage, FakeBackend};
use idlegate::pool::{ConnectionPool, PoolConfig};
use idlegate::proxy::ProxyServer;
use idlegate::router::Router;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const HOST: &str = "app.example.com";

struct Harness {
    addr: SocketAddr,
    storage: Arc<CountingStorage>,
    backend: Arc<FakeBackend>,
    router: Arc<Router>,
    _shutdown: watch::Sender<bool>,
}

async fn harness(backend: FakeBackend, configure: impl FnOnce(ProxyServer) -> ProxyServer) -> Harness {
    let storage = Arc::new(CountingStorage::default());
    let backend = Arc::new(backend);
    let router = router(storage.clone(), backend.clone());
    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()).unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = configure(
        ProxyServer::new(listener, router.clone(), pool, shutdown_rx)
            .with_health_path("/idlegate/health")
            .with_request_timeout(Duration::from_secs(5)),
    );
    let addr = proxy.local_addr().unwrap();
    tokio::spawn(proxy.run());

    Harness {
        addr,
        storage,
        backend,
        router,
        _shutdown: shutdown_tx,
    }
}

async fn settle(storage: &CountingStorage, ends: usize) {
    for _ in 0..100 {
        if storage.ends() >= ends {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Give a second, erroneous end the chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ============================================================================
// Proxying
// ============================================================================

#[tokio::test]
async fn test_proxies_to_target_with_forwarded_headers() {
    let (target_addr, hits) = spawn_target().await;
    let h = harness(FakeBackend::new(), |p| p).await;
    let target = format!("http://{}", target_addr);
    h.router.target_add(HOST, &target, true).await.unwrap();

    let response = http_get_with_host(h.addr, "/hello?x=1", HOST).await;

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("target:/hello forwarded:app.example.com"), "{}", response);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    settle(&h.storage, 1).await;
    assert_eq!(h.storage.begins(), 1);
    assert_eq!(h.storage.ends(), 1);
}

#[tokio::test]
async fn test_idle_target_is_woken_before_forwarding() {
    let (target_addr, hits) = spawn_target().await;
    let h = harness(FakeBackend::new().with_unidle_delay(Duration::from_millis(100)), |p| p).await;
    let target = format!("http://{}", target_addr);
    h.router.target_add(HOST, &target, true).await.unwrap();
    h.backend.set_idle(&target, true);

    let response = http_get_with_host(h.addr, "/", HOST).await;

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert_eq!(h.backend.idle_calls(), vec![(target.clone(), false)]);
    assert!(!h.backend.is_idle(&target));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_unidle_never_reaches_target() {
    let (target_addr, hits) = spawn_target().await;
    let h = harness(FakeBackend::new(), |p| p).await;
    let target = format!("http://{}", target_addr);
    h.router.target_add(HOST, &target, true).await.unwrap();
    h.backend.set_idle(&target, true);
    h.backend.fail_unidle.store(true, Ordering::SeqCst);

    let response = http_get_with_host(h.addr, "/", HOST).await;

    assert!(response.starts_with("HTTP/1.1 503"), "{}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: backend_unavailable"));
    assert!(!response.contains("container failed to start"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    settle(&h.storage, 1).await;
    assert_eq!(h.storage.begins(), 1);
    assert_eq!(h.storage.ends(), 1);
}

#[tokio::test]
async fn test_connection_failure_ends_request_exactly_once() {
    let dead = closed_port().await;
    let h = harness(FakeBackend::new(), |p| p).await;
    h.router.target_add(HOST, &format!("http://{}", dead), true).await.unwrap();

    let response = http_get_with_host(h.addr, "/", HOST).await;

    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: connection_failed"));

    settle(&h.storage, 1).await;
    assert_eq!(h.storage.begins(), 1);
    assert_eq!(h.storage.ends(), 1);
}

#[tokio::test]
async fn test_unknown_host_is_404() {
    let h = harness(FakeBackend::new(), |p| p).await;

    let response = http_get_with_host(h.addr, "/", "nobody.example.com").await;

    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: unknown_host"));
    assert_eq!(h.storage.begins(), 0);
}

#[tokio::test]
async fn test_wildcard_host_is_proxied() {
    let (target_addr, hits) = spawn_target().await;
    let h = harness(FakeBackend::new(), |p| p).await;
    h.router
        .target_add("*.example.com", &format!("http://{}", target_addr), true)
        .await
        .unwrap();

    let response = http_get_with_host(h.addr, "/", "tenant.example.com").await;

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_host_is_400() {
    let h = harness(FakeBackend::new(), |p| p).await;

    let response = http_request(h.addr, "GET / HTTP/1.0\r\n\r\n").await;

    assert!(response.contains(" 400 "), "{}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: missing_host_header"));
}

#[tokio::test]
async fn test_health_path_skips_routing() {
    let h = harness(FakeBackend::new(), |p| p).await;

    let response = http_get_with_host(h.addr, "/idlegate/health", "nobody.example.com").await;

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("ok"));
    assert_eq!(h.storage.begins(), 0);
}

// ============================================================================
// Plain HTTP listener
// ============================================================================

#[tokio::test]
async fn test_plain_http_redirects_to_https() {
    let h = harness(FakeBackend::new(), |p| p.with_https_redirect(443)).await;

    let response = http_get_with_host(h.addr, "/a/b?c=d", "App.Example.com").await;

    assert!(response.starts_with("HTTP/1.1 301"), "{}", response);
    assert!(response.to_lowercase().contains("location: https://app.example.com/a/b?c=d"), "{}", response);
    assert_eq!(h.storage.begins(), 0);
}

#[tokio::test]
async fn test_forwarded_https_is_proxied_not_redirected() {
    let (target_addr, hits) = spawn_target().await;
    let h = harness(FakeBackend::new(), |p| p.with_https_redirect(443)).await;
    h.router.target_add(HOST, &format!("http://{}", target_addr), true).await.unwrap();

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nX-Forwarded-Proto: https\r\nConnection: close\r\n\r\n",
        HOST
    );
    let response = http_request(h.addr, &request).await;

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_acme_http01_token_served_before_redirect() {
    let challenges = idlegate::certs::Http01Challenges::new();
    challenges.set("tok123".to_string(), "tok123.thumbprint".to_string());
    let h = harness(FakeBackend::new(), |p| {
        p.with_https_redirect(443).with_acme_challenges(challenges.clone())
    })
    .await;

    let response = http_get_with_host(h.addr, "/.well-known/acme-challenge/tok123", HOST).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("tok123.thumbprint"));

    let response = http_get_with_host(h.addr, "/.well-known/acme-challenge/other", HOST).await;
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
}

// ============================================================================
// Upgrades
// ============================================================================

/// Target that accepts any upgrade and echoes bytes afterwards
async fn spawn_echo_upgrade_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if stream.read(&mut byte).await.unwrap_or(0) == 0 {
                        return;
                    }
                    head.push(byte[0]);
                }
                stream
                    .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
                    .await
                    .unwrap();
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_upgrade_is_spliced_and_ends_once() {
    let target_addr = spawn_echo_upgrade_target().await;
    let h = harness(FakeBackend::new(), |p| p).await;
    h.router.target_add(HOST, &format!("http://{}", target_addr), true).await.unwrap();

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
        HOST
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        assert_eq!(stream.read(&mut byte).await.unwrap(), 1);
        head.push(byte[0]);
    }
    assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 101"));

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");

    // Activity stays open while the tunnel is up
    assert_eq!(h.storage.ends(), 0);

    drop(stream);
    settle(&h.storage, 1).await;
    assert_eq!(h.storage.begins(), 1);
    assert_eq!(h.storage.ends(), 1);
}

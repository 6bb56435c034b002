//! Shared fakes and helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use idlegate::backend::{Backend, CertificateAuthority};
use chrono::{DateTime, Utc};
use idlegate::error::StorageError;
use idlegate::router::{Router, RouterSettings};
use idlegate::storage::{MemoryStorage, Storage};
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// In-process backend recording every idle transition
pub struct FakeBackend {
    idle: Mutex<HashMap<String, bool>>,
    idle_calls: Mutex<Vec<(String, bool)>>,
    pub ca_calls: AtomicUsize,
    pub fail_unidle: AtomicBool,
    unidle_delay: Duration,
    stop_delay: Duration,
    idle_get_delay: Duration,
    ca: CertificateAuthority,
    external_ip: IpAddr,
    internal_ip: IpAddr,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            idle_calls: Mutex::new(Vec::new()),
            ca_calls: AtomicUsize::new(0),
            fail_unidle: AtomicBool::new(false),
            unidle_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            idle_get_delay: Duration::ZERO,
            ca: test_ca(),
            external_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            internal_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10)),
        }
    }

    pub fn with_unidle_delay(mut self, delay: Duration) -> Self {
        self.unidle_delay = delay;
        self
    }

    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Slow idle lookups, as when the container runtime has to be asked
    pub fn with_idle_get_delay(mut self, delay: Duration) -> Self {
        self.idle_get_delay = delay;
        self
    }

    pub fn with_ips(mut self, external: IpAddr, internal: IpAddr) -> Self {
        self.external_ip = external;
        self.internal_ip = internal;
        self
    }

    pub fn set_idle(&self, target: &str, idle: bool) {
        self.idle.lock().insert(target.to_string(), idle);
    }

    pub fn is_idle(&self, target: &str) -> bool {
        self.idle.lock().get(target).copied().unwrap_or(false)
    }

    /// Every `idle_set` call that reached the backend, in order
    pub fn idle_calls(&self) -> Vec<(String, bool)> {
        self.idle_calls.lock().clone()
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca.cert_pem
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn ca(&self) -> anyhow::Result<CertificateAuthority> {
        self.ca_calls.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which concurrent handshakes could double-sign
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(self.ca.clone())
    }

    async fn idle_get(&self, target: &str) -> anyhow::Result<bool> {
        tokio::time::sleep(self.idle_get_delay).await;
        Ok(self.is_idle(target))
    }

    async fn idle_set(&self, target: &str, idle: bool) -> anyhow::Result<()> {
        if !idle {
            tokio::time::sleep(self.unidle_delay).await;
            if self.fail_unidle.load(Ordering::SeqCst) {
                anyhow::bail!("container failed to start");
            }
        } else {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.idle_calls.lock().push((target.to_string(), idle));
        self.set_idle(target, idle);
        Ok(())
    }

    async fn idle_update(&self, _namespace: &str, _service: &str, _idle: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn external_ip(&self) -> IpAddr {
        self.external_ip
    }

    fn internal_ip(&self) -> IpAddr {
        self.internal_ip
    }
}

/// Memory storage counting activity calls
#[derive(Default)]
pub struct CountingStorage {
    inner: MemoryStorage,
    pub begins: AtomicUsize,
    pub ends: AtomicUsize,
}

impl CountingStorage {
    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for CountingStorage {
    async fn target_add(&self, host: &str, target: &str, idles: bool) -> Result<(), StorageError> {
        self.inner.target_add(host, target, idles).await
    }

    async fn target_remove(&self, host: &str, target: &str) -> Result<(), StorageError> {
        self.inner.target_remove(host, target).await
    }

    async fn target_list(&self, host: &str) -> Result<Vec<String>, StorageError> {
        self.inner.target_list(host).await
    }

    async fn host_list(&self) -> Result<Vec<String>, StorageError> {
        self.inner.host_list().await
    }

    async fn request_begin(&self, target: &str) -> Result<(), StorageError> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        self.inner.request_begin(target).await
    }

    async fn request_end(&self, target: &str) -> Result<(), StorageError> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        self.inner.request_end(target).await
    }

    async fn in_flight(&self, target: &str) -> Result<usize, StorageError> {
        self.inner.in_flight(target).await
    }

    async fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        self.inner.stale(cutoff).await
    }
}

pub fn test_ca() -> CertificateAuthority {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, "idlegate test CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
    let cert = params.self_signed(&key).unwrap();
    CertificateAuthority {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    }
}

pub fn router(storage: Arc<dyn Storage>, backend: Arc<FakeBackend>) -> Arc<Router> {
    router_with(storage, backend, RouterSettings::default())
}

pub fn router_with(storage: Arc<dyn Storage>, backend: Arc<FakeBackend>, settings: RouterSettings) -> Arc<Router> {
    Router::new(storage, backend, settings).unwrap()
}

/// Plain HTTP target answering `target:<path>` and counting requests
pub async fn spawn_target() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let forwarded = req
                            .headers()
                            .get("x-forwarded-host")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-")
                            .to_string();
                        let body = format!("target:{} forwarded:{}", req.uri().path(), forwarded);
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, hits)
}

/// An address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Send a raw HTTP/1.1 request and read the whole response
pub async fn http_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Send a GET with a custom Host header
pub async fn http_get_with_host(addr: SocketAddr, path: &str, host: &str) -> String {
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, host);
    http_request(addr, &request).await
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

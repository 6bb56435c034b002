//! HTTP and HTTPS frontends
//!
//! The HTTPS listener picks a certificate per handshake from the configured
//! [`CertificateManager`]. The plain listener answers ACME HTTP-01 tokens and
//! redirects everything else to HTTPS, unless an upstream load balancer has
//! already terminated TLS (`X-Forwarded-Proto: https`).

use crate::certs::{server_config, CertificateManager, ClientHelloInfo, Http01Challenges};
use crate::error::{json_error_response, ProxyErrorCode, RouteError};
use crate::pool::{is_upgrade_request, ConnectionPool};
use crate::router::{RequestGuard, Router};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Response headers that must not be relayed to the client
const RESPONSE_HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Per-listener settings shared by every connection
struct ProxyContext {
    router: Arc<Router>,
    pool: Arc<ConnectionPool>,
    is_tls: bool,
    https_redirect_port: Option<u16>,
    acme_challenges: Option<Http01Challenges>,
    health_path: Option<String>,
    request_timeout: Duration,
}

pub struct ProxyServer {
    listener: TcpListener,
    router: Arc<Router>,
    pool: Arc<ConnectionPool>,
    shutdown_rx: watch::Receiver<bool>,
    certs: Option<Arc<dyn CertificateManager>>,
    /// If set, redirect plain HTTP requests to HTTPS on this port
    https_redirect_port: Option<u16>,
    acme_challenges: Option<Http01Challenges>,
    health_path: Option<String>,
    request_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        listener: TcpListener,
        router: Arc<Router>,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            router,
            pool,
            shutdown_rx,
            certs: None,
            https_redirect_port: None,
            acme_challenges: None,
            health_path: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    /// Terminate TLS with certificates chosen per handshake
    pub fn with_tls(mut self, certs: Arc<dyn CertificateManager>) -> Self {
        self.certs = Some(certs);
        self
    }

    /// Redirect plain HTTP requests to HTTPS on the given port
    pub fn with_https_redirect(mut self, port: u16) -> Self {
        self.https_redirect_port = Some(port);
        self
    }

    /// Set ACME HTTP-01 challenge handler
    pub fn with_acme_challenges(mut self, challenges: Http01Challenges) -> Self {
        self.acme_challenges = Some(challenges);
        self
    }

    /// Answer `path` with 200 on every host without routing
    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = Some(path.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tls_enabled(&self) -> bool {
        self.certs.is_some()
    }

    /// Accept connections until shutdown, then wait for open connections to finish
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        let protocol = if self.certs.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let ctx = Arc::new(ProxyContext {
            router: self.router,
            pool: self.pool,
            is_tls: self.certs.is_some(),
            https_redirect_port: self.https_redirect_port,
            acme_challenges: self.acme_challenges,
            health_path: self.health_path,
            request_timeout: self.request_timeout,
        });

        let mut shutdown_rx = self.shutdown_rx;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            connections.spawn(accept_connection(
                                stream,
                                peer,
                                ctx.clone(),
                                self.certs.clone(),
                                shutdown_rx.clone(),
                            ));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!(protocol, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        drop(self.listener);
        let open = connections.len();
        if open > 0 {
            info!(protocol, open, "Draining connections");
        }
        while connections.join_next().await.is_some() {}

        Ok(())
    }
}

async fn accept_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ProxyContext>,
    certs: Option<Arc<dyn CertificateManager>>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let Some(certs) = certs else {
        serve_connection(stream, peer, ctx, shutdown_rx).await;
        return;
    };

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(stream, &*certs)).await {
        Ok(Ok(Some(tls))) => serve_connection(tls, peer, ctx, shutdown_rx).await,
        Ok(Ok(None)) => debug!(peer = %peer, "Answered TLS-ALPN-01 challenge"),
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
        Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
    }
}

/// Run the handshake with a certificate chosen from the ClientHello
///
/// Returns `None` for ACME TLS-ALPN-01 validation connections, which end
/// right after the handshake.
async fn handshake(
    stream: TcpStream,
    certs: &dyn CertificateManager,
) -> anyhow::Result<Option<TlsStream<TcpStream>>> {
    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;
    let hello = ClientHelloInfo::from_hello(&start.client_hello());

    let key = certs.certificate(&hello).await?;
    let config = server_config(key, &hello)?;
    let mut tls = start.into_stream(config).await?;

    if hello.is_acme_challenge() {
        let _ = tls.shutdown().await;
        return Ok(None);
    }

    Ok(Some(tls))
}

async fn serve_connection<S>(stream: S, peer: SocketAddr, ctx: Arc<ProxyContext>, mut shutdown_rx: watch::Receiver<bool>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, peer).await }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!(peer = %peer, error = %e, "Connection error");
            }
            return;
        }
        _ = wait_for_shutdown(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
        }
    }

    if let Err(e) = conn.await {
        debug!(peer = %peer, error = %e, "Connection error during shutdown");
    }
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    peer: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // ACME HTTP-01 challenges come first, before the HTTPS redirect
    if let Some(ref challenges) = ctx.acme_challenges {
        if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
            return Ok(match challenges.get(token) {
                Some(key_auth) => {
                    debug!(token, "Responding to ACME HTTP-01 challenge");
                    text_response(StatusCode::OK, key_auth)
                }
                None => text_response(StatusCode::NOT_FOUND, "Unknown ACME challenge"),
            });
        }
    }

    let forwarded_https = header_str(&req, X_FORWARDED_PROTO).is_some_and(|p| p.eq_ignore_ascii_case("https"));

    if let Some(port) = ctx.https_redirect_port {
        if !ctx.is_tls && !forwarded_https {
            return Ok(build_https_redirect(&req, port));
        }
    }

    if ctx.health_path.as_deref() == Some(req.uri().path()) {
        return Ok(text_response(StatusCode::OK, "ok"));
    }

    let request_id = header_str(&req, X_REQUEST_ID)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    // We overwrite X-Forwarded-* rather than append; this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(&hostname) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    let proto = if ctx.is_tls || forwarded_https { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    debug!(hostname = %hostname, method = %req.method(), uri = %req.uri(), request_id = %request_id, "Incoming request");

    let target = match ctx.router.route(&hostname).await {
        Ok(target) => target,
        Err(RouteError::NoBackends) => {
            debug!(hostname = %hostname, "No targets for host");
            return Ok(json_error_response(
                ProxyErrorCode::UnknownHost,
                "Unknown or unconfigured host",
            ));
        }
        Err(e @ RouteError::Unreachable(_)) => {
            error!(hostname = %hostname, error = %e, "Routing table unavailable");
            return Ok(json_error_response(
                ProxyErrorCode::RoutingUnavailable,
                "Service temporarily unavailable",
            ));
        }
    };

    let guard = match ctx.router.begin_request(&target).await {
        Ok(guard) => guard,
        Err(e) => {
            // Log detailed error internally, return generic message externally
            error!(hostname = %hostname, backend = %target, error = %e, "Failed to begin request");
            return Ok(json_error_response(
                ProxyErrorCode::BackendUnavailable,
                "Backend unavailable",
            ));
        }
    };

    if is_upgrade_request(&req) {
        return Ok(proxy_upgrade(req, &ctx, guard, hostname, request_id).await);
    }

    let result = tokio::time::timeout(ctx.request_timeout, ctx.pool.send_request(req, &target)).await;

    match result {
        Ok(Ok(response)) => Ok(guarded_response(response, guard)),
        Ok(Err(e)) => {
            guard.finish().await;
            error!(hostname = %hostname, backend = %target, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            guard.finish().await;
            warn!(
                hostname = %hostname,
                backend = %target,
                timeout_secs = ctx.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", ctx.request_timeout.as_secs()),
            ))
        }
    }
}

/// Forward an upgrade request and, on 101, splice client and target together
async fn proxy_upgrade(
    mut req: Request<Incoming>,
    ctx: &ProxyContext,
    guard: RequestGuard,
    hostname: String,
    request_id: String,
) -> Response<ProxyBody> {
    let target = guard.target().to_string();
    let client_upgrade = hyper::upgrade::on(&mut req);

    let mut response = match tokio::time::timeout(ctx.request_timeout, ctx.pool.send_request(req, &target)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            guard.finish().await;
            error!(hostname = %hostname, backend = %target, error = %e, "Failed to forward upgrade request");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend");
        }
        Err(_) => {
            guard.finish().await;
            warn!(hostname = %hostname, backend = %target, "Upgrade request timed out");
            return json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        warn!(hostname = %hostname, status = %response.status(), "Backend rejected upgrade request");
        return guarded_response(response, guard);
    }

    let target_upgrade = hyper::upgrade::on(&mut response);

    let mut client_response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in response.headers() {
        client_response = client_response.header(name, value);
    }

    // The guard lives as long as the spliced connection
    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, target_upgrade) {
            Ok((client, upstream)) => {
                let mut client_io = TokioIo::new(client);
                let mut upstream_io = TokioIo::new(upstream);
                match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                    Ok((client_to_backend, backend_to_client)) => debug!(
                        hostname = %hostname,
                        request_id = %request_id,
                        client_to_backend,
                        backend_to_client,
                        "Upgraded connection closed"
                    ),
                    Err(e) => debug!(hostname = %hostname, request_id = %request_id, error = %e, "Upgraded connection closed with error"),
                }
            }
            Err(e) => error!(hostname = %hostname, request_id = %request_id, error = %e, "Failed to upgrade connection"),
        }
        guard.finish().await;
    });

    client_response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Relay a target response; the request ends when its body does
fn guarded_response(response: Response<Incoming>, guard: RequestGuard) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    for name in RESPONSE_HOP_BY_HOP {
        parts.headers.remove(*name);
    }

    let body = GuardedBody {
        inner: body,
        guard: Some(guard),
    };
    Response::from_parts(parts, body.boxed())
}

/// Response body that releases its [`RequestGuard`] at end of stream, on error, or when dropped
struct GuardedBody {
    inner: Incoming,
    guard: Option<RequestGuard>,
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(poll, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.guard.take();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = header_str(req, hyper::header::HOST.as_str()).or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    // Bracketed IPv6 literal, with or without a port
    if let Some(rest) = raw.strip_prefix('[') {
        let addr = rest.split(']').next()?;
        return addr.parse::<Ipv6Addr>().ok().map(|ip| ip.to_string());
    }

    let hostname = raw.split(':').next()?.trim_end_matches('.');
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen, underscore and dot only; keeps logs clean
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

fn header_str<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Build an HTTPS redirect response (301 Moved Permanently)
fn build_https_redirect<B>(req: &Request<B>, https_port: u16) -> Response<ProxyBody> {
    let host = extract_hostname(req).unwrap_or_else(|| "localhost".to_string());
    let host = if host.contains(':') { format!("[{}]", host) } else { host };
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to HTTPS"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

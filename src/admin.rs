//! Admin API through which the orchestration layer mutates the routing table
//! and reports service scale events

use crate::pool::PoolStats;
use crate::router::Router;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the router
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

#[derive(Debug, Deserialize)]
struct TargetRequest {
    host: String,
    target: String,
    #[serde(default = "default_idles")]
    idles: bool,
}

fn default_idles() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct IdleRequest {
    namespace: String,
    service: String,
    idle: bool,
}

struct AdminState {
    router: Arc<Router>,
    pool_stats: Arc<PoolStats>,
    auth_token: String,
}

pub struct AdminServer {
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        listener: TcpListener,
        router: Arc<Router>,
        pool_stats: Arc<PoolStats>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            listener,
            state: Arc::new(AdminState {
                router,
                pool_stats,
                auth_token,
            }),
            shutdown_rx,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { handle_admin_request(req, state).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(peer = %peer, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, Response<Full<Bytes>>> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| response(StatusCode::BAD_REQUEST, format!("unreadable body: {}", e)))?
        .to_bytes();

    serde_json::from_slice(&body).map_err(|e| response(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)))
}

fn query_param<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.uri()
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

async fn handle_admin_request(
    req: Request<Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    match (&method, path.as_str()) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, &state.auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let router = &state.router;
    let response = match (&method, path.as_str()) {
        (&Method::GET, "/hosts") => match router.storage().host_list().await {
            Ok(hosts) => json_response(
                StatusCode::OK,
                serde_json::json!({ "count": hosts.len(), "hosts": hosts }).to_string(),
            ),
            Err(e) => {
                error!(error = %e, "Failed to list hosts");
                response(StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
            }
        },

        (&Method::GET, "/targets") => {
            let Some(host) = query_param(&req, "host").filter(|h| !h.is_empty()) else {
                return Ok(response(StatusCode::BAD_REQUEST, "missing host"));
            };
            match router.target_list(host).await {
                Ok(targets) => json_response(
                    StatusCode::OK,
                    serde_json::json!({ "host": host, "targets": targets }).to_string(),
                ),
                Err(e) => {
                    error!(host, error = %e, "Failed to list targets");
                    response(StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
                }
            }
        }

        (&Method::POST, "/targets") => {
            let body: TargetRequest = match read_json(req).await {
                Ok(body) => body,
                Err(resp) => return Ok(resp),
            };
            match router.target_add(&body.host, &body.target, body.idles).await {
                Ok(()) => response(StatusCode::OK, "ok"),
                Err(e) => {
                    error!(host = %body.host, error = %e, "Failed to add target");
                    response(StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
                }
            }
        }

        (&Method::DELETE, "/targets") => {
            let body: TargetRequest = match read_json(req).await {
                Ok(body) => body,
                Err(resp) => return Ok(resp),
            };
            match router.target_remove(&body.host, &body.target).await {
                Ok(()) => response(StatusCode::OK, "ok"),
                Err(e) => {
                    error!(host = %body.host, error = %e, "Failed to remove target");
                    response(StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
                }
            }
        }

        (&Method::POST, "/idle") => {
            let body: IdleRequest = match read_json(req).await {
                Ok(body) => body,
                Err(resp) => return Ok(resp),
            };
            match router.idle_update(&body.namespace, &body.service, body.idle).await {
                Ok(()) => {
                    info!(namespace = %body.namespace, service = %body.service, idle = body.idle, "Idle state updated");
                    response(StatusCode::OK, "ok")
                }
                Err(e) => {
                    error!(namespace = %body.namespace, service = %body.service, error = %e, "Failed to update idle state");
                    response(StatusCode::SERVICE_UNAVAILABLE, "backend unavailable")
                }
            }
        }

        (&Method::GET, "/stats") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "total_requests": state.pool_stats.get_total_requests(),
                "upgrades": state.pool_stats.get_upgrades(),
            })
            .to_string(),
        ),

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

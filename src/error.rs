//! Error types and JSON error responses for the frontends

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors from a routing table implementation
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors from a certificate/account cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key is not present; callers treat this as "not yet issued"
    #[error("cache miss")]
    Miss,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("cache task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Why a hostname could not be resolved to a target
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no backends available")]
    NoBackends,

    #[error("error reaching backend")]
    Unreachable(#[source] StorageError),
}

/// Why a request could not be admitted to its target
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("could not record activity: {0}")]
    Activity(#[from] StorageError),

    #[error("could not fetch idle status: {0:#}")]
    IdleStatus(anyhow::Error),

    #[error("could not unidle: {0:#}")]
    Unidle(anyhow::Error),
}

/// Certificate lookup/issuance failures; each one fails a single handshake
#[derive(Debug, Error)]
pub enum CertError {
    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("certificate authority unavailable: {0}")]
    Authority(String),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid key material: {0}")]
    Key(String),

    #[error("acme error: {0}")]
    Acme(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No target registered for the host or any wildcard above it
    UnknownHost,
    /// The routing table could not be read
    RoutingUnavailable,
    /// The target could not be woken up
    BackendUnavailable,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::RoutingUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::RoutingUnavailable => "ROUTING_UNAVAILABLE",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

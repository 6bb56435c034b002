//! The cluster-side collaborator that owns idle state
//!
//! The router never scales workloads itself. It asks a [`Backend`] whether a
//! target is idle, tells it to idle or wake one, and fetches the cluster CA
//! for CA-mode certificates.

mod docker;

pub use docker::DockerBackend;

use crate::config::{BackendConfig, BackendKind};
use async_trait::async_trait;
use hyper::Uri;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::watch;

const CLUSTER_SUFFIX: &str = ".svc.cluster.local";

/// PEM-encoded cluster certificate authority
#[derive(Clone)]
pub struct CertificateAuthority {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_pem", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Start background work such as event watchers
    async fn start(&self) -> anyhow::Result<()>;

    async fn ca(&self) -> anyhow::Result<CertificateAuthority>;

    async fn idle_get(&self, target: &str) -> anyhow::Result<bool>;

    /// Scale the target's workload to zero (`true`) or wake it and wait until it serves (`false`)
    async fn idle_set(&self, target: &str, idle: bool) -> anyhow::Result<()>;

    /// Push-based update of the cached idle state, from watch events
    async fn idle_update(&self, namespace: &str, service: &str, idle: bool) -> anyhow::Result<()>;

    fn external_ip(&self) -> IpAddr;

    fn internal_ip(&self) -> IpAddr;
}

/// The workload a target URL points at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub namespace: String,
    pub service: String,
}

impl ServiceRef {
    pub fn new(namespace: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
        }
    }

    /// Idle cache key
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.service)
    }
}

/// Extract `(service, namespace)` from `scheme://service.namespace.svc.cluster.local:port`
pub fn parse_target(target: &str) -> Option<ServiceRef> {
    let uri: Uri = target.parse().ok()?;
    let host = uri.host()?.to_ascii_lowercase();
    let name = host.strip_suffix(CLUSTER_SUFFIX)?;
    let (service, namespace) = name.split_once('.')?;

    if service.is_empty() || namespace.is_empty() || namespace.contains('.') {
        return None;
    }

    Some(ServiceRef::new(namespace, service))
}

/// Build the configured backend
pub async fn connect(
    config: &BackendConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<Arc<dyn Backend>> {
    match config.kind {
        BackendKind::Docker => Ok(Arc::new(DockerBackend::new(config, shutdown_rx).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("http://web.prod.svc.cluster.local:8080"),
            Some(ServiceRef::new("prod", "web"))
        );
        assert_eq!(
            parse_target("https://API.Staging.svc.cluster.local"),
            Some(ServiceRef::new("staging", "api"))
        );
    }

    #[test]
    fn test_parse_target_rejects_other_hosts() {
        assert_eq!(parse_target("http://127.0.0.1:8080"), None);
        assert_eq!(parse_target("http://web.example.com"), None);
        assert_eq!(parse_target("http://web.a.b.svc.cluster.local"), None);
        assert_eq!(parse_target("http://.prod.svc.cluster.local"), None);
        assert_eq!(parse_target("not a url"), None);
    }

    #[test]
    fn test_service_key() {
        assert_eq!(ServiceRef::new("prod", "web").key(), "prod/web");
    }
}

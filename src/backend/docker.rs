//! Docker-backed idle state: one container per `(namespace, service)`

use super::{parse_target, Backend, CertificateAuthority, ServiceRef};
use crate::config::BackendConfig;
use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{StartContainerOptions, StopContainerOptions};
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerState, EventMessage, HealthStatusEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Cached idle state keyed by `namespace/service`, plus the container names seen so far
#[derive(Default)]
struct IdleCache {
    states: DashMap<String, bool>,
    names: DashMap<String, ServiceRef>,
}

impl IdleCache {
    fn set(&self, service: &ServiceRef, idle: bool) {
        self.states.insert(service.key(), idle);
    }

    fn get(&self, service: &ServiceRef) -> Option<bool> {
        self.states.get(&service.key()).map(|v| *v)
    }
}

pub struct DockerBackend {
    client: Docker,
    cache: Arc<IdleCache>,
    container_name: String,
    ca_cert: String,
    ca_key: String,
    external_ip: IpAddr,
    internal_ip: IpAddr,
    startup_timeout: Duration,
    stop_timeout: Duration,
    watch_events: bool,
    shutdown_rx: watch::Receiver<bool>,
}

impl DockerBackend {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit `docker_host`
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn new(config: &BackendConfig, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let client = if let Some(host) = &config.docker_host {
            connect_to_host(host)
                .with_context(|| format!("Failed to connect to Docker at '{}'", host))?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            connect_to_host(&host)
                .with_context(|| format!("Failed to connect to Docker via DOCKER_HOST='{}'", host))?
        } else {
            connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");

        Ok(Self {
            client,
            cache: Arc::new(IdleCache::default()),
            container_name: config.container_name.clone(),
            ca_cert: config.ca_cert.clone(),
            ca_key: config.ca_key.clone(),
            external_ip: config.external_ip.parse().context("invalid backend.external_ip")?,
            internal_ip: config.internal_ip.parse().context("invalid backend.internal_ip")?,
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            watch_events: config.watch_events,
            shutdown_rx,
        })
    }

    fn container_for(&self, service: &ServiceRef) -> String {
        let name = container_name(&self.container_name, service);
        self.cache.names.insert(name.clone(), service.clone());
        name
    }

    async fn inspect(&self, container: &str) -> Result<Option<ContainerState>, DockerError> {
        match self.client.inspect_container(container, None).await {
            Ok(info) => Ok(Some(info.state.unwrap_or_default())),
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn stop(&self, container: &str) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout.as_secs() as i64,
        };

        match self.client.stop_container(container, Some(options)).await {
            Ok(_) => {
                info!(container, "Stopped idle container");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(container, "Container was already stopped");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(container, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container '{}': {}", container, e)),
        }
    }

    async fn wake(&self, container: &str) -> anyhow::Result<()> {
        match self
            .client
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => info!(container, "Started container"),
            Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(container, "Container was already running");
            }
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {
                anyhow::bail!("Container '{}' does not exist", container);
            }
            Err(e) => anyhow::bail!("Failed to start container '{}': {}", container, e),
        }

        self.wait_ready(container).await
    }

    /// Poll until the container runs and, if it has a healthcheck, reports healthy
    async fn wait_ready(&self, container: &str) -> anyhow::Result<()> {
        let poll = async {
            loop {
                match self.inspect(container).await {
                    Ok(Some(state)) if is_ready(&state) => return Ok(()),
                    Ok(Some(_)) => {}
                    Ok(None) => anyhow::bail!("Container '{}' disappeared while starting", container),
                    Err(e) => debug!(container, error = %e, "Inspect failed while waiting for container"),
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(self.startup_timeout, poll)
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Container '{}' not ready after {:?}",
                    container,
                    self.startup_timeout
                )
            })?
    }
}

#[async_trait]
impl Backend for DockerBackend {
    async fn start(&self) -> anyhow::Result<()> {
        if !self.watch_events {
            return Ok(());
        }

        let client = self.client.clone();
        let cache = self.cache.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(watch_events(client, cache, shutdown_rx));

        info!("Watching Docker container events");
        Ok(())
    }

    async fn ca(&self) -> anyhow::Result<CertificateAuthority> {
        let cert_pem = tokio::fs::read_to_string(&self.ca_cert)
            .await
            .with_context(|| format!("Failed to read CA certificate '{}'", self.ca_cert))?;
        let key_pem = tokio::fs::read_to_string(&self.ca_key)
            .await
            .with_context(|| format!("Failed to read CA key '{}'", self.ca_key))?;

        Ok(CertificateAuthority { cert_pem, key_pem })
    }

    async fn idle_get(&self, target: &str) -> anyhow::Result<bool> {
        let Some(service) = parse_target(target) else {
            return Ok(false);
        };

        if let Some(idle) = self.cache.get(&service) {
            return Ok(idle);
        }

        let container = self.container_for(&service);
        let idle = match self.inspect(&container).await? {
            Some(state) => !state.running.unwrap_or(false),
            // Nothing to wake
            None => false,
        };

        self.cache.set(&service, idle);
        Ok(idle)
    }

    async fn idle_set(&self, target: &str, idle: bool) -> anyhow::Result<()> {
        let Some(service) = parse_target(target) else {
            debug!(backend = target, "Target is not a cluster service, ignoring idle change");
            return Ok(());
        };

        let container = self.container_for(&service);
        if idle {
            self.stop(&container).await?;
        } else {
            self.wake(&container).await?;
        }

        self.cache.set(&service, idle);
        Ok(())
    }

    async fn idle_update(&self, namespace: &str, service: &str, idle: bool) -> anyhow::Result<()> {
        let service = ServiceRef::new(namespace, service);
        self.container_for(&service);
        self.cache.set(&service, idle);
        debug!(service = %service.key(), idle, "Idle state updated");
        Ok(())
    }

    fn external_ip(&self) -> IpAddr {
        self.external_ip
    }

    fn internal_ip(&self) -> IpAddr {
        self.internal_ip
    }
}

/// Follow container lifecycle events and refresh the idle cache
async fn watch_events(client: Docker, cache: Arc<IdleCache>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);

    loop {
        let options = EventsOptions::<String> {
            filters: filters.clone(),
            ..Default::default()
        };
        let mut events = client.events(Some(options));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!("Docker event watcher stopped");
                    return;
                }
                event = events.next() => match event {
                    Some(Ok(event)) => apply_event(&cache, &event),
                    Some(Err(e)) => {
                        warn!(error = %e, "Docker event stream failed");
                        break;
                    }
                    None => {
                        debug!("Docker event stream ended");
                        break;
                    }
                }
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
        }
    }
}

fn apply_event(cache: &IdleCache, event: &EventMessage) {
    let Some(idle) = event.action.as_deref().and_then(event_idle) else {
        return;
    };

    let Some(name) = event
        .actor
        .as_ref()
        .and_then(|a| a.attributes.as_ref())
        .and_then(|attrs| attrs.get("name"))
    else {
        return;
    };

    // Only containers the router has looked up are tracked
    if let Some(service) = cache.names.get(name) {
        debug!(container = %name, idle, "Container state changed");
        cache.set(service.value(), idle);
    }
}

/// Idle state implied by a container event action
fn event_idle(action: &str) -> Option<bool> {
    match action {
        "start" | "unpause" => Some(false),
        "die" | "stop" | "pause" | "destroy" => Some(true),
        _ => None,
    }
}

fn container_name(template: &str, service: &ServiceRef) -> String {
    template
        .replace("{namespace}", &service.namespace)
        .replace("{service}", &service.service)
}

fn is_ready(state: &ContainerState) -> bool {
    if !state.running.unwrap_or(false) {
        return false;
    }

    match state.health.as_ref().and_then(|h| h.status) {
        None | Some(HealthStatusEnum::EMPTY) | Some(HealthStatusEnum::NONE) => true,
        Some(status) => status == HealthStatusEnum::HEALTHY,
    }
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

async fn connect_with_defaults() -> anyhow::Result<Docker> {
    let home = std::env::var("HOME").unwrap_or_default();
    let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    let socket_paths: Vec<(&str, String)> = vec![
        ("Linux default", "/var/run/docker.sock".to_string()),
        ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
        ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
        ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
    ];

    let mut tried = Vec::new();

    for (name, path) in &socket_paths {
        if path.starts_with('/') && !path.starts_with("//") && std::path::Path::new(path).exists() {
            debug!(path = %path, name, "Found Docker socket");
            match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                Ok(client) if client.ping().await.is_ok() => return Ok(client),
                Ok(_) => tried.push(format!("{} ({}) - daemon not responding", path, name)),
                Err(e) => tried.push(format!("{} ({}) - {}", path, name, e)),
            }
        }
    }

    Docker::connect_with_socket_defaults().map_err(|e| {
        let tried_info = if tried.is_empty() {
            "No Docker socket found at common locations".to_string()
        } else {
            format!("Tried:\n  - {}", tried.join("\n  - "))
        };
        anyhow::anyhow!(
            "Cannot connect to Docker daemon. {}\n\
             Set DOCKER_HOST or backend.docker_host. Underlying error: {}",
            tried_info,
            e
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{EventActor, Health};

    #[test]
    fn test_container_name() {
        let service = ServiceRef::new("prod", "web");
        assert_eq!(container_name("{namespace}-{service}", &service), "prod-web");
        assert_eq!(container_name("app_{service}", &service), "app_web");
    }

    #[test]
    fn test_event_idle() {
        assert_eq!(event_idle("start"), Some(false));
        assert_eq!(event_idle("die"), Some(true));
        assert_eq!(event_idle("stop"), Some(true));
        assert_eq!(event_idle("exec_start"), None);
    }

    #[test]
    fn test_is_ready() {
        let stopped = ContainerState {
            running: Some(false),
            ..Default::default()
        };
        assert!(!is_ready(&stopped));

        let running = ContainerState {
            running: Some(true),
            ..Default::default()
        };
        assert!(is_ready(&running));

        let starting = ContainerState {
            running: Some(true),
            health: Some(Health {
                status: Some(HealthStatusEnum::STARTING),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!is_ready(&starting));

        let healthy = ContainerState {
            running: Some(true),
            health: Some(Health {
                status: Some(HealthStatusEnum::HEALTHY),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(is_ready(&healthy));
    }

    #[test]
    fn test_apply_event_updates_known_containers() {
        let cache = IdleCache::default();
        let service = ServiceRef::new("prod", "web");
        cache.names.insert("prod-web".to_string(), service.clone());
        cache.set(&service, false);

        let event = |action: &str, name: &str| EventMessage {
            action: Some(action.to_string()),
            actor: Some(EventActor {
                id: Some("abc".to_string()),
                attributes: Some(HashMap::from([("name".to_string(), name.to_string())])),
            }),
            ..Default::default()
        };

        apply_event(&cache, &event("die", "prod-web"));
        assert_eq!(cache.get(&service), Some(true));

        apply_event(&cache, &event("start", "prod-web"));
        assert_eq!(cache.get(&service), Some(false));

        apply_event(&cache, &event("die", "unrelated"));
        assert_eq!(cache.states.len(), 1);
    }

    #[test]
    fn test_connect_rejects_unknown_scheme() {
        assert!(connect_to_host("ftp://docker").is_err());
    }
}

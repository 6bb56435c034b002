//! Routing decisions and the idle/unidle lifecycle
//!
//! The [`Router`] is shared by every frontend. It resolves hostnames to
//! targets, accounts for in-flight requests, wakes idle targets before the
//! first request reaches them and runs the two background tickers (idle
//! sweep and health probes).

use crate::backend::Backend;
use crate::config::RouterConfig;
use crate::error::{RequestError, RouteError};
use crate::storage::Storage;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use rand::seq::SliceRandom;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Timing and probe settings for the router
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub idle_timeout: Duration,
    pub idle_interval: Duration,
    pub health_interval: Duration,
    pub health_delay: Duration,
    pub health_path: String,
    pub probe_timeout: Duration,
    pub probe_port: u16,
    pub idle_call_timeout: Duration,
}

impl RouterSettings {
    pub fn from_config(config: &RouterConfig, https_port: u16) -> Self {
        Self {
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            idle_interval: Duration::from_secs(config.idle_interval_secs),
            health_interval: Duration::from_secs(config.health_interval_secs),
            health_delay: Duration::from_secs(config.health_delay_secs),
            health_path: config.health_path.clone(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            probe_port: https_port,
            idle_call_timeout: Duration::from_secs(config.idle_call_timeout_secs),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default(), 443)
    }
}

pub struct Router {
    storage: Arc<dyn Storage>,
    backend: Arc<dyn Backend>,
    settings: RouterSettings,
    /// Per-target serialization of idle transitions; entries exist only while someone waits
    transitions: DashMap<String, Arc<Mutex<()>>>,
    /// Targets the sweep is stopping right now; requests for them take the slow path
    idling: DashSet<String>,
    probe_client: reqwest::Client,
}

impl Router {
    pub fn new(
        storage: Arc<dyn Storage>,
        backend: Arc<dyn Backend>,
        settings: RouterSettings,
    ) -> anyhow::Result<Arc<Self>> {
        // Probes go to hosts whose certificates may still be self-signed
        let probe_client = reqwest::Client::builder()
            .timeout(settings.probe_timeout)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Arc::new(Self {
            storage,
            backend,
            settings,
            transitions: DashMap::new(),
            idling: DashSet::new(),
            probe_client,
        }))
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub async fn target_add(&self, host: &str, target: &str, idles: bool) -> anyhow::Result<()> {
        let host = normalize_host(host);
        self.storage.target_add(&host, target, idles).await?;
        info!(host = %host, backend = %target, idles, "Target added");
        Ok(())
    }

    pub async fn target_remove(&self, host: &str, target: &str) -> anyhow::Result<()> {
        let host = normalize_host(host);
        self.storage.target_remove(&host, target).await?;
        info!(host = %host, backend = %target, "Target removed");
        Ok(())
    }

    pub async fn target_list(&self, host: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.storage.target_list(&normalize_host(host)).await?)
    }

    /// Forwarded from the orchestration layer's watch events
    pub async fn idle_update(&self, namespace: &str, service: &str, idle: bool) -> anyhow::Result<()> {
        self.backend.idle_update(namespace, service, idle).await
    }

    /// Pick a target for `host`: the exact name wins over any wildcard, and
    /// narrower wildcards win over broader ones
    pub async fn route(&self, host: &str) -> Result<String, RouteError> {
        for candidate in valid_routes(host) {
            let targets = self
                .storage
                .target_list(&candidate)
                .await
                .map_err(RouteError::Unreachable)?;

            let choice = targets.choose(&mut rand::thread_rng()).cloned();
            if let Some(target) = choice {
                debug!(host, candidate = %candidate, backend = %target, "Routed");
                return Ok(target);
            }
        }

        Err(RouteError::NoBackends)
    }

    /// Record activity for `target` and wake it if it is idle
    ///
    /// May block for as long as the backend takes to start. When waking fails
    /// the activity is released again, so callers only pair a successful call
    /// with [`Router::request_end`].
    pub async fn request_begin(&self, target: &str) -> Result<(), RequestError> {
        self.storage.request_begin(target).await?;

        if let Err(e) = self.wake(target).await {
            release(&*self.storage, target).await;
            return Err(e);
        }

        Ok(())
    }

    pub async fn request_end(&self, target: &str) -> Result<(), RequestError> {
        Ok(self.storage.request_end(target).await?)
    }

    /// [`Router::request_begin`] returning a guard that ends the request on every exit path
    pub async fn begin_request(&self, target: &str) -> Result<RequestGuard, RequestError> {
        self.request_begin(target).await?;
        Ok(RequestGuard {
            storage: self.storage.clone(),
            target: Some(target.to_string()),
        })
    }

    async fn wake(&self, target: &str) -> Result<(), RequestError> {
        if !self.idling.contains(target) && !self.backend.idle_get(target).await.map_err(RequestError::IdleStatus)? {
            return Ok(());
        }

        let result = self
            .with_transition_lock(target, async {
                // A concurrent request may have finished waking it while we waited
                if !self.backend.idle_get(target).await.map_err(RequestError::IdleStatus)? {
                    return Ok(());
                }

                info!(backend = %target, "Unidling target");
                let started = Instant::now();
                self.backend
                    .idle_set(target, false)
                    .await
                    .map_err(RequestError::Unidle)?;
                info!(
                    backend = %target,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Target unidled"
                );
                Ok::<(), RequestError>(())
            })
            .await;

        if let Err(e) = &result {
            warn!(backend = %target, error = %e, "Failed to wake target");
        }
        result
    }

    /// Idle `target` unless a request reached it after the stale scan
    ///
    /// Returns whether the target was idled. The target is marked before its
    /// in-flight count is read, so a request that begins after the read finds
    /// the mark and waits for the stop to finish, then wakes it again.
    async fn idle_target(&self, target: &str) -> anyhow::Result<bool> {
        self.with_transition_lock(target, self.idle_target_locked(target)).await
    }

    async fn idle_target_locked(&self, target: &str) -> anyhow::Result<bool> {
        if self.backend.idle_get(target).await? {
            return Ok(false);
        }

        let _mark = IdlingMark::new(&self.idling, target);
        self.stop_if_unused(target).await
    }

    async fn stop_if_unused(&self, target: &str) -> anyhow::Result<bool> {
        let in_flight = self.storage.in_flight(target).await?;
        if in_flight > 0 {
            debug!(backend = %target, in_flight, "Request arrived during idle sweep, keeping target");
            return Ok(false);
        }
        self.backend.idle_set(target, true).await?;
        Ok(true)
    }

    async fn with_transition_lock<T>(&self, target: &str, work: impl Future<Output = T>) -> T {
        let lock = self.transitions.entry(target.to_string()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            work.await
        };

        drop(lock);
        self.transitions.remove_if(target, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// One idle sweep: idle every stale target that is still awake
    ///
    /// Returns how many targets were idled.
    pub async fn idle_tick(self: &Arc<Self>) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.settings.idle_timeout)?;
        let stale = self.storage.stale(cutoff).await?;

        let mut tasks = JoinSet::new();
        for target in stale {
            let router = Arc::clone(self);
            let timeout = self.settings.idle_call_timeout;
            tasks.spawn(async move {
                let result = tokio::time::timeout(timeout, router.idle_target(&target)).await;
                (target, result)
            });
        }

        let mut idled = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, Ok(Ok(true)))) => {
                    info!(backend = %target, "Idled inactive target");
                    idled += 1;
                }
                Ok((_, Ok(Ok(false)))) => {}
                Ok((target, Ok(Err(e)))) => warn!(backend = %target, error = %e, "Failed to idle target"),
                Ok((target, Err(_))) => warn!(backend = %target, "Idle call timed out"),
                Err(e) => warn!(error = %e, "Idle task failed"),
            }
        }

        Ok(idled)
    }

    /// One health round: fire a probe at every public host without waiting for answers
    ///
    /// Returns how many probes were started.
    pub async fn health_tick(&self) -> anyhow::Result<usize> {
        let hosts = self.storage.host_list().await?;

        let mut probed = 0;
        for host in hosts.into_iter().filter(|h| probe_eligible(h)) {
            let url = self.probe_url(&host);
            let client = self.probe_client.clone();
            tokio::spawn(async move {
                match client.get(&url).send().await {
                    Ok(resp) => debug!(host = %host, status = resp.status().as_u16(), "Health probe"),
                    Err(e) => debug!(host = %host, error = %e, "Health probe failed"),
                }
            });
            probed += 1;
        }

        Ok(probed)
    }

    fn probe_url(&self, host: &str) -> String {
        match self.settings.probe_port {
            443 | 0 => format!("https://{}{}", host, self.settings.health_path),
            port => format!("https://{}:{}{}", host, port, self.settings.health_path),
        }
    }

    pub async fn idle_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let period = self.settings.idle_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.idle_tick().await {
                    Ok(0) => debug!("Idle sweep found nothing to idle"),
                    Ok(idled) => info!(idled, "Idle sweep finished"),
                    Err(e) => warn!(error = %e, "Idle sweep failed"),
                },
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        debug!("Idle sweep stopped");
                        break;
                    }
                }
            }
        }
    }

    pub async fn health_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + self.settings.health_delay;
        let mut ticker = tokio::time::interval_at(start, self.settings.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.health_tick().await {
                        warn!(error = %e, "Health tick failed");
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        debug!("Health probes stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Address DNS answers with, depending on which listener was asked
    pub fn router_ip(&self, internal: bool) -> IpAddr {
        if internal {
            self.backend.internal_ip()
        } else {
            self.backend.external_ip()
        }
    }
}

/// Ends the request it was created for, exactly once
///
/// Prefer [`RequestGuard::finish`]; dropping the guard records the end on a
/// spawned task instead.
pub struct RequestGuard {
    storage: Arc<dyn Storage>,
    target: Option<String>,
}

impl RequestGuard {
    pub fn target(&self) -> &str {
        self.target.as_deref().unwrap_or_default()
    }

    pub async fn finish(mut self) {
        if let Some(target) = self.target.take() {
            release(&*self.storage, &target).await;
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let Some(target) = self.target.take() else {
            return;
        };

        let storage = self.storage.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { release(&*storage, &target).await });
            }
            Err(_) => warn!(backend = %target, "No runtime to record request end"),
        }
    }
}

/// Marks a target as being stopped for as long as it lives
struct IdlingMark<'a> {
    set: &'a DashSet<String>,
    target: &'a str,
}

impl<'a> IdlingMark<'a> {
    fn new(set: &'a DashSet<String>, target: &'a str) -> Self {
        set.insert(target.to_string());
        Self { set, target }
    }
}

impl Drop for IdlingMark<'_> {
    fn drop(&mut self) {
        self.set.remove(self.target);
    }
}

async fn release(storage: &dyn Storage, target: &str) {
    if let Err(e) = storage.request_end(target).await {
        warn!(backend = %target, error = %e, "Failed to record request end");
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Lookup keys for `host`, most specific first
///
/// `a.b.example.com` yields `a.b.example.com`, `*.b.example.com`,
/// `*.example.com`, `*.com`. An IP literal yields only itself.
pub fn valid_routes(host: &str) -> Vec<String> {
    let host = normalize_host(host);
    if host.parse::<IpAddr>().is_ok() {
        return vec![host];
    }

    let parts: Vec<&str> = host.split('.').collect();
    let mut routes = Vec::with_capacity(parts.len());
    routes.push(host.clone());
    for i in 1..parts.len() {
        routes.push(format!("*.{}", parts[i..].join(".")));
    }
    routes
}

fn probe_eligible(host: &str) -> bool {
    !host.ends_with(".local") && !host.starts_with("*.") && host.parse::<IpAddr>().is_err()
}

//! Composition root: builds every component from [`Config`] and runs the listeners

use crate::admin::AdminServer;
use crate::backend::{self, Backend};
use crate::cache::{self, Cache};
use crate::certs::{AutocertManager, CaCertificates, CertificateManager};
use crate::config::{AcmeChallengeType, Config, TlsMode};
use crate::dns::{system_upstream, DnsResolver, DnsServer};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy::ProxyServer;
use crate::router::{Router, RouterSettings};
use crate::storage::{self, Storage};
use anyhow::Context;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// A fully constructed router with every listener bound but nothing running yet
///
/// All startup failures surface from [`Server::new`]; once [`Server::start`]
/// returns, errors are only logged.
pub struct Server {
    config: Config,
    router: Arc<Router>,
    certs: Arc<dyn CertificateManager>,
    autocert: Option<Arc<AutocertManager>>,
    pool: Arc<ConnectionPool>,
    http: TcpListener,
    https: TcpListener,
    admin: TcpListener,
    dns_external: UdpSocket,
    dns_internal: UdpSocket,
    dns_upstream: SocketAddr,
    admin_token: String,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Build storage, cache and backend from `config`, then everything on top of them
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let storage = storage::open(&config.storage).context("failed to open routing table storage")?;
        let cache = cache::open(&config.cache).context("failed to open certificate cache")?;
        let backend = backend::connect(&config.backend, shutdown_rx)
            .await
            .context("failed to connect to backend")?;

        Self::build(config, storage, cache, backend, shutdown_tx).await
    }

    /// Build around caller-supplied collaborators
    pub async fn with_components(
        config: Config,
        storage: Arc<dyn Storage>,
        cache: Arc<dyn Cache>,
        backend: Arc<dyn Backend>,
    ) -> anyhow::Result<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Self::build(config, storage, cache, backend, shutdown_tx).await
    }

    async fn build(
        config: Config,
        storage: Arc<dyn Storage>,
        cache: Arc<dyn Cache>,
        backend: Arc<dyn Backend>,
        shutdown_tx: watch::Sender<bool>,
    ) -> anyhow::Result<Self> {
        backend.start().await.context("failed to start backend")?;

        let (certs, autocert) = match config.tls.mode {
            TlsMode::Ca => {
                info!("Issuing certificates from the cluster CA");
                let certs: Arc<dyn CertificateManager> = Arc::new(CaCertificates::new(backend.clone())?);
                (certs, None)
            }
            TlsMode::Autocert => {
                info!(
                    email = ?config.tls.acme.email,
                    challenge_type = ?config.tls.acme.challenge_type,
                    "Issuing certificates via ACME"
                );
                let manager = Arc::new(AutocertManager::new(config.tls.acme.clone(), storage.clone(), cache)?);
                let certs: Arc<dyn CertificateManager> = manager.clone();
                (certs, Some(manager))
            }
        };

        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        };
        let pool = Arc::new(ConnectionPool::new(pool_config)?);

        let bind: IpAddr = config
            .server
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;

        let http = bind_tcp(SocketAddr::new(bind, config.server.http_port), "HTTP").await?;
        let https = bind_tcp(SocketAddr::new(bind, config.server.https_port), "HTTPS").await?;
        let admin = bind_tcp(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.server.admin_port),
            "admin",
        )
        .await?;
        let dns_external = bind_udp(SocketAddr::new(bind, config.server.dns_external_port), "external DNS").await?;
        let dns_internal = bind_udp(SocketAddr::new(bind, config.server.dns_internal_port), "internal DNS").await?;

        let dns_upstream = match config.server.dns_upstream_addr()? {
            Some(addr) => addr,
            None => system_upstream(),
        };

        // Probes go to the port the HTTPS listener actually got
        let settings = RouterSettings::from_config(&config.router, https.local_addr()?.port());
        let router = Router::new(storage, backend, settings)?;

        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        Ok(Self {
            config,
            router,
            certs,
            autocert,
            pool,
            http,
            https,
            admin,
            dns_external,
            dns_internal,
            dns_upstream,
            admin_token,
            shutdown_tx,
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }

    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn https_addr(&self) -> std::io::Result<SocketAddr> {
        self.https.local_addr()
    }

    pub fn admin_addr(&self) -> std::io::Result<SocketAddr> {
        self.admin.local_addr()
    }

    pub fn dns_external_addr(&self) -> std::io::Result<SocketAddr> {
        self.dns_external.local_addr()
    }

    pub fn dns_internal_addr(&self) -> std::io::Result<SocketAddr> {
        self.dns_internal.local_addr()
    }

    /// Spawn every listener and background loop
    pub fn start(self) -> anyhow::Result<RunningServer> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let health_path = self.config.router.health_path.clone();
        let request_timeout = self.config.server.request_timeout();
        let https_port = self.https.local_addr()?.port();
        let mut tasks = JoinSet::new();

        let mut http_proxy = ProxyServer::new(self.http, self.router.clone(), self.pool.clone(), shutdown_rx.clone())
            .with_https_redirect(https_port)
            .with_health_path(health_path.clone())
            .with_request_timeout(request_timeout);
        if let Some(ref manager) = self.autocert {
            if self.config.tls.acme.challenge_type == AcmeChallengeType::Http01 {
                http_proxy = http_proxy.with_acme_challenges(manager.http01_challenges());
                info!("ACME HTTP-01 challenge handler enabled on HTTP port");
            }
        }
        spawn_task(&mut tasks, "http", http_proxy.run());

        let https_proxy = ProxyServer::new(self.https, self.router.clone(), self.pool.clone(), shutdown_rx.clone())
            .with_tls(self.certs)
            .with_health_path(health_path)
            .with_request_timeout(request_timeout);
        let https = tokio::spawn(async move {
            if let Err(e) = https_proxy.run().await {
                error!(error = %e, "HTTPS proxy server error");
            }
        });

        let external = DnsResolver::new(self.router.clone(), false, self.dns_upstream);
        let internal = DnsResolver::new(self.router.clone(), true, self.dns_upstream);
        info!(upstream = %self.dns_upstream, "DNS forwarding unknown names");
        spawn_task(
            &mut tasks,
            "dns-external",
            DnsServer::new(self.dns_external, external, shutdown_rx.clone()).run(),
        );
        spawn_task(
            &mut tasks,
            "dns-internal",
            DnsServer::new(self.dns_internal, internal, shutdown_rx.clone()).run(),
        );

        let admin = AdminServer::new(
            self.admin,
            self.router.clone(),
            self.pool.stats(),
            shutdown_rx.clone(),
            self.admin_token,
        );
        spawn_task(&mut tasks, "admin", admin.run());

        let router = self.router.clone();
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { router.idle_loop(rx).await });
        let router = self.router.clone();
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { router.health_loop(rx).await });

        if let Some(manager) = self.autocert {
            let rx = shutdown_rx.clone();
            tasks.spawn(async move { manager.renewal_loop(rx).await });
        }

        Ok(RunningServer {
            shutdown_tx: self.shutdown_tx,
            https,
            tasks,
            shutdown_timeout: self.config.server.shutdown_timeout(),
        })
    }
}

pub struct RunningServer {
    shutdown_tx: watch::Sender<bool>,
    https: JoinHandle<()>,
    tasks: JoinSet<()>,
    shutdown_timeout: Duration,
}

impl RunningServer {
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Stop accepting, give open HTTPS connections until `deadline` to finish,
    /// then abort whatever is left
    pub async fn shutdown(mut self, deadline: Duration) {
        let _ = self.shutdown_tx.send(true);

        let mut https = self.https;
        if tokio::time::timeout(deadline, &mut https).await.is_err() {
            warn!(deadline_secs = deadline.as_secs(), "HTTPS connections still open at deadline, aborting");
            https.abort();
        }

        // Everything else stops on the signal or is abandoned
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            self.tasks.abort_all();
        }

        info!("Server stopped");
    }
}

fn spawn_task<F>(tasks: &mut JoinSet<()>, name: &'static str, task: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tasks.spawn(async move {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Server task failed");
        }
    });
}

async fn bind_tcp(addr: SocketAddr, what: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {} listener on {}", what, addr))
}

async fn bind_udp(addr: SocketAddr, what: &str) -> anyhow::Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind {} socket on {}", what, addr))
}

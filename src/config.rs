use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and admin API configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Idle sweep and health probe timing
    #[serde(default)]
    pub router: RouterConfig,

    /// Certificate issuance mode
    #[serde(default)]
    pub tls: TlsConfig,

    /// Routing table backing store
    #[serde(default)]
    pub storage: StoreConfig,

    /// ACME account and certificate cache
    #[serde(default)]
    pub cache: StoreConfig,

    /// Cluster backend that owns idle state
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the public listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Plain HTTP port; redirects to HTTPS and answers ACME HTTP-01 (default: 80, 0 picks a free port)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port (default: 443, 0 picks a free port)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// UDP port answering external resolvers (default: 5453)
    #[serde(default = "default_dns_external_port")]
    pub dns_external_port: u16,

    /// UDP port answering in-cluster resolvers (default: 5454)
    #[serde(default = "default_dns_internal_port")]
    pub dns_internal_port: u16,

    /// Upstream resolver for names with no targets, e.g. "10.0.0.2:53".
    /// Falls back to the system resolver configuration, then 1.1.1.1:53.
    pub dns_upstream: Option<String>,

    /// Port for the admin API, bound to 127.0.0.1
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API mutations.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per target (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Upper bound for a proxied request, not counting unidling (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Deadline for draining HTTPS connections at shutdown (default: 10)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Parsed upstream resolver override, if any
    pub fn dns_upstream_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        match &self.dns_upstream {
            None => Ok(None),
            Some(s) => {
                let addr = s
                    .parse::<SocketAddr>()
                    .or_else(|_| s.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, 53)))
                    .map_err(|_| anyhow::anyhow!("invalid dns_upstream '{}'", s))?;
                Ok(Some(addr))
            }
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            dns_external_port: default_dns_external_port(),
            dns_internal_port: default_dns_internal_port(),
            dns_upstream: None,
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// Inactivity after which a target is scaled to zero (default: 3600)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often the idle sweep runs (default: 60)
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,

    /// How often every known host is probed (default: 10)
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Delay before the first health probe round (default: 60)
    #[serde(default = "default_health_delay")]
    pub health_delay_secs: u64,

    /// Path answered by the router itself and used by health probes
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Timeout for a single health probe (default: 5)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Timeout for a single idle call made by the sweep (default: 30)
    #[serde(default = "default_idle_call_timeout")]
    pub idle_call_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            idle_interval_secs: default_idle_interval(),
            health_interval_secs: default_health_interval(),
            health_delay_secs: default_health_delay(),
            health_path: default_health_path(),
            probe_timeout_secs: default_probe_timeout(),
            idle_call_timeout_secs: default_idle_call_timeout(),
        }
    }
}

/// How certificates are produced for incoming SNI names
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Leaf certificates signed by the cluster CA
    #[default]
    Ca,
    /// Publicly trusted certificates issued on demand via ACME
    Autocert,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,

    #[serde(default)]
    pub acme: AcmeConfig,
}

/// Challenge type for ACME domain validation
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
pub enum AcmeChallengeType {
    /// HTTP-01: Serves challenge response on port 80 at /.well-known/acme-challenge/
    #[default]
    #[serde(alias = "http01", alias = "HTTP-01")]
    #[serde(rename = "http-01")]
    Http01,
    /// TLS-ALPN-01: Serves challenge via TLS on port 443 with special ALPN protocol
    #[serde(alias = "tls-alpn01", alias = "TLS-ALPN-01")]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// Contact email for the ACME account (required in autocert mode)
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    /// Challenge type for domain validation (default: http-01)
    #[serde(default)]
    pub challenge_type: AcmeChallengeType,

    /// Renew when fewer than this many days remain (default: 30)
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: None,
            directory_url: None,
            challenge_type: AcmeChallengeType::default(),
            renew_before_days: default_renew_before_days(),
        }
    }
}

/// Backing store selection shared by `[storage]` and `[cache]`
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local maps
    #[default]
    Memory,
    /// SQLite file, shareable by router processes on the same host
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: String,
    },
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(rename = "type", default)]
    pub kind: BackendKind,

    /// Docker daemon address (unix:// or tcp://); DOCKER_HOST or common sockets when unset
    pub docker_host: Option<String>,

    /// Container name template; `{namespace}` and `{service}` are substituted
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// PEM file holding the cluster CA certificate
    #[serde(default = "default_ca_cert")]
    pub ca_cert: String,

    /// PEM file holding the cluster CA private key
    #[serde(default = "default_ca_key")]
    pub ca_key: String,

    /// Address handed to external resolvers
    #[serde(default = "default_router_ip")]
    pub external_ip: String,

    /// Address handed to in-cluster resolvers
    #[serde(default = "default_router_ip")]
    pub internal_ip: String,

    /// How long an unidle may take before the request fails (default: 120)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period passed to `docker stop` when idling (default: 10)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Follow daemon events to keep the idle cache current (default: true)
    #[serde(default = "default_true")]
    pub watch_events: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            docker_host: None,
            container_name: default_container_name(),
            ca_cert: default_ca_cert(),
            ca_key: default_ca_key(),
            external_ip: default_router_ip(),
            internal_ip: default_router_ip(),
            startup_timeout_secs: default_startup_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            watch_events: true,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_dns_external_port() -> u16 {
    5453
}

fn default_dns_internal_port() -> u16 {
    5454
}

fn default_admin_port() -> u16 {
    9999
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    60 * 60
}

fn default_idle_interval() -> u64 {
    60
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_delay() -> u64 {
    60
}

fn default_health_path() -> String {
    "/idlegate/health".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_idle_call_timeout() -> u64 {
    30
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_sqlite_path() -> String {
    "./idlegate.db".to_string()
}

fn default_container_name() -> String {
    "{namespace}-{service}".to_string()
}

fn default_ca_cert() -> String {
    "./ca/tls.crt".to_string()
}

fn default_ca_key() -> String {
    "./ca/tls.key".to_string()
}

fn default_router_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let server = &self.server;
        if server.http_port != 0 && server.http_port == server.https_port {
            errors.push("http_port and https_port must differ".to_string());
        }
        if server.dns_external_port != 0 && server.dns_external_port == server.dns_internal_port {
            errors.push("dns_external_port and dns_internal_port must differ".to_string());
        }
        if let Err(e) = server.dns_upstream_addr() {
            errors.push(e.to_string());
        }
        if server.shutdown_timeout_secs == 0 {
            errors.push("shutdown_timeout_secs must be greater than 0".to_string());
        }

        let router = &self.router;
        if !router.health_path.starts_with('/') {
            errors.push(format!("health_path '{}' must start with '/'", router.health_path));
        }
        for (name, value) in [
            ("idle_timeout_secs", router.idle_timeout_secs),
            ("idle_interval_secs", router.idle_interval_secs),
            ("health_interval_secs", router.health_interval_secs),
            ("probe_timeout_secs", router.probe_timeout_secs),
            ("idle_call_timeout_secs", router.idle_call_timeout_secs),
        ] {
            if value == 0 {
                errors.push(format!("{} must be greater than 0", name));
            }
        }

        if self.tls.mode == TlsMode::Autocert && self.tls.acme.email.is_none() {
            errors.push("tls.acme.email is required when tls.mode = \"autocert\"".to_string());
        }

        for (name, store) in [("storage", &self.storage), ("cache", &self.cache)] {
            if let StoreConfig::Sqlite { path } = store {
                if path.trim().is_empty() {
                    errors.push(format!("{}.path must not be empty", name));
                }
            }
        }

        let backend = &self.backend;
        if !backend.container_name.contains("{service}") {
            errors.push("backend.container_name must contain '{service}'".to_string());
        }
        for (name, value) in [
            ("external_ip", &backend.external_ip),
            ("internal_ip", &backend.internal_ip),
        ] {
            if value.parse::<IpAddr>().is_err() {
                errors.push(format!("backend.{} '{}' is not an IP address", name, value));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

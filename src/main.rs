use idlegate::admin::{PKG_NAME, VERSION};
use idlegate::config::{Config, StoreConfig};
use idlegate::server::Server;
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idlegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let server = Server::new(config).await.map_err(|e| {
        error!(error = %format!("{:#}", e), "Startup failed");
        e
    })?;
    let running = server.start()?;

    wait_for_signal().await?;

    let deadline = running.shutdown_timeout();
    running.shutdown(deadline).await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn describe_store(store: &StoreConfig) -> String {
    match store {
        StoreConfig::Memory => "memory".to_string(),
        StoreConfig::Sqlite { path } => format!("sqlite:{}", path),
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting edge router");
    info!(
        bind = %config.server.bind,
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        dns_external_port = config.server.dns_external_port,
        dns_internal_port = config.server.dns_internal_port,
        admin_port = config.server.admin_port,
        tls_mode = ?config.tls.mode,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Connection pool settings"
    );
    info!(
        idle_timeout_secs = config.router.idle_timeout_secs,
        idle_interval_secs = config.router.idle_interval_secs,
        health_interval_secs = config.router.health_interval_secs,
        health_path = %config.router.health_path,
        "Idle and health settings"
    );
    info!(
        storage = %describe_store(&config.storage),
        cache = %describe_store(&config.cache),
        backend = ?config.backend.kind,
        "Collaborators"
    );
}

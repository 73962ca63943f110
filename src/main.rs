use learngate::config::Config;
use learngate::proxy::{Gateway, GatewayServer};
use learngate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "gateway.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("learngate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config()?;

    print_startup_banner(&config);

    let gateway = Gateway::new(&config)?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bind before anything is launched; this is the only fatal startup step
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let server = GatewayServer::bind(addr, gateway.clone(), shutdown_rx).await?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Initial launch runs in the background like any other restart
    let initial = gateway.restarts().trigger();
    info!(generation = initial.generation(), "Launching workers");

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or restart request (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup())
            .expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    let ticket = gateway.restarts().trigger();
                    info!(generation = ticket.generation(), "Received SIGHUP, restarting workers...");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Queued restarts must not respawn anything behind this
    info!("Stopping all workers...");
    gateway.restarts().shutdown().await;

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Config from the path given as the first argument, else `gateway.toml` if
/// present, else the built-in service layout
fn load_config() -> anyhow::Result<Config> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if explicit.is_none() && !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file, using built-in defaults");
        return Ok(Config::default());
    }

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    Ok(config)
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting gateway"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        allowed_origin = %config.server.allowed_origin,
        static_dir = %config.server.static_dir,
        dataset_dir = %config.server.dataset_dir,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        request_timeout_secs = config.gateway.request_timeout_secs,
        status_probe_timeout_ms = config.gateway.status_probe_timeout_ms,
        probe_before_forward = config.gateway.probe_before_forward,
        "Request handling settings"
    );
    info!(
        health_path = %config.health.health_path,
        max_attempts = config.health.max_attempts,
        interval_ms = config.health.interval_ms,
        probe_timeout_ms = config.health.probe_timeout_ms,
        "Health check settings"
    );
    info!(
        shutdown_grace_period_secs = config.supervisor.shutdown_grace_period_secs,
        "Shutdown settings"
    );
    for service in &config.services {
        info!(
            service = %service.id,
            port = service.port,
            launched = service.command.is_some(),
            "Configured service"
        );
    }
}

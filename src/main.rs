use sleepgate::config::Config;
use sleepgate::docker::DockerOrchestrator;
use sleepgate::gateway::{Gateway, GatewayOptions, PKG_NAME, VERSION};
use sleepgate::monitor::IdleMonitor;
use sleepgate::orchestrator::{ServiceGroup, SharedOrchestrator};
use sleepgate::pool::{ConnectionPool, PoolConfig};
use sleepgate::proxy::ProxyServer;
use sleepgate::state::GatewayState;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sleepgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // A TOML path on the command line wins over the environment
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => {
            let config = Config::from_env().map_err(|e| {
                error!(error = %e, "Invalid environment configuration");
                e
            })?;
            info!("Configuration loaded from environment");
            config
        }
    };

    print_startup_banner(&config);

    let host_identity = host_identity()?;
    let docker = DockerOrchestrator::connect(config.docker_host.as_deref())
        .await?
        .with_self_id(host_identity.clone());
    let orchestrator: SharedOrchestrator = Arc::new(docker);

    let project = match config.project_name.clone() {
        Some(name) => name,
        None => orchestrator.inspect_self(&host_identity).await.map_err(|e| {
            anyhow::anyhow!(
                "Cannot determine compose project from container '{}': {}. Set PROJECT_NAME explicitly.",
                host_identity, e
            )
        })?,
    };

    let group = ServiceGroup::new(
        Arc::clone(&orchestrator),
        project.clone(),
        config.exclusion_label.clone(),
        config.stop_grace_period(),
    );

    let initially_up = match group.all_running().await {
        Ok(up) => up,
        Err(e) => {
            warn!(error = %e, "Failed to list project containers, assuming down");
            false
        }
    };
    info!(project = %project, up = initially_up, "Managing compose project");

    let state = GatewayState::new(initially_up);

    let pool_config = PoolConfig {
        max_idle_per_host: config.pool_max_idle_per_host,
        idle_timeout: config.pool_idle_timeout(),
    };
    let pool = Arc::new(ConnectionPool::new(config.target_authority(), pool_config));

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&state),
        group.clone(),
        pool,
        GatewayOptions::from_config(&config),
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = IdleMonitor::new(
        Arc::clone(&state),
        group,
        config.sleep_timeout(),
        config.check_interval(),
    );
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let bind_ip: IpAddr = config
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.bind, e))?;
    let bind_addr = SocketAddr::new(bind_ip, config.proxy_port);
    let server = ProxyServer::new(bind_addr, gateway, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // The project keeps running; only the proxy exits
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = monitor_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Name docker gave our container: the HOSTNAME variable, or the kernel's
fn host_identity() -> anyhow::Result<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return Ok(name.trim().to_string());
        }
    }

    let name = hostname::get()?
        .into_string()
        .map_err(|raw| anyhow::anyhow!("Hostname is not valid UTF-8: {:?}", raw))?;
    Ok(name)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting sleep proxy");
    info!(
        bind = %config.bind,
        port = config.proxy_port,
        upstream = %config.target_authority(),
        endpoint_prefix = %config.endpoint_prefix,
        "Server configuration"
    );
    info!(
        sleep_timeout_secs = config.sleep_timeout_secs,
        check_interval_secs = config.check_interval_secs,
        exclusion_label = %config.exclusion_label,
        probe_path = %config.probe_path,
        probe_timeout_ms = config.probe_timeout_ms,
        stop_grace_period_secs = config.stop_grace_period_secs,
        "Lifecycle configuration"
    );
    info!(
        pool_max_idle = config.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.pool_idle_timeout_secs,
        "Connection pool configuration"
    );
}

use shoal::autoscaler;
use shoal::client::ProxyClient;
use shoal::cluster::Cluster;
use shoal::config::Config;
use shoal::docker::{ContainerRuntime, DockerRuntime};
use shoal::healthcheck::HealthMonitor;
use shoal::proxy::ProxyServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shoal=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("shoal.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let listen_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let pool_max_idle = config.server.pool_max_idle_per_host;
    let pool_idle_timeout = Duration::from_secs(config.server.pool_idle_timeout_secs);

    // Connect to the container runtime
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect().await?);

    let (cluster, trigger_rx) = Cluster::new(config, runtime);

    // Provision networks, the database singleton and the initial replicas.
    // Failures here are fatal; nothing has started serving yet.
    cluster.provision().await?;

    let client = Arc::new(ProxyClient::new(pool_max_idle, pool_idle_timeout));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn the health monitor
    let monitor = HealthMonitor::new(
        Arc::clone(&cluster),
        Arc::clone(&client),
        trigger_rx,
        shutdown_rx.clone(),
    );
    tokio::spawn(monitor.run());

    // Spawn both autoscalers
    tokio::spawn(autoscaler::run_rate_scaler(
        Arc::clone(&cluster),
        shutdown_rx.clone(),
    ));
    tokio::spawn(autoscaler::run_pressure_scaler(
        Arc::clone(&cluster),
        shutdown_rx.clone(),
    ));

    // Spawn the proxy front
    let proxy = ProxyServer::new(
        listen_addr,
        Arc::clone(&cluster),
        Arc::clone(&client),
        shutdown_rx.clone(),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown to every worker
    let _ = shutdown_tx.send(true);

    // Tear down the backend containers
    info!("Stopping backend containers...");
    cluster.teardown_all().await;

    // Wait for the front to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting balancer"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        initial_replicas = config.scaling.initial_replicas,
        min_replicas = config.scaling.min_replicas,
        max_replicas = config.scaling.max_replicas,
        scale_up_threshold = config.scaling.scale_up_threshold,
        scale_down_threshold = config.scaling.scale_down_threshold,
        scale_interval_secs = config.scaling.scale_interval_secs,
        pressure_interval_secs = config.scaling.pressure_interval_secs,
        "Scaling settings"
    );
    info!(
        cpu_high = config.pressure.cpu_high,
        mem_high = config.pressure.mem_high,
        cpu_low = config.pressure.cpu_low,
        mem_low = config.pressure.mem_low,
        up_ratio = config.pressure.up_ratio,
        down_ratio = config.pressure.down_ratio,
        "Pressure thresholds"
    );
    info!(
        probe_path = %config.health.probe_path,
        probe_timeout_ms = config.health.probe_timeout_ms,
        startup_grace_secs = config.health.startup_grace_secs,
        "Health check settings"
    );
    info!(
        project = %config.stack.project,
        replica_service = %config.stack.replica_service,
        database_service = %config.stack.database_service,
        services = ?config.stack.services.keys().collect::<Vec<_>>(),
        networks = ?config.stack.networks.keys().collect::<Vec<_>>(),
        "Stack manifest"
    );
}

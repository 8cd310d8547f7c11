use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tenantgate::api::ManagementApi;
use tenantgate::clock::{SharedClock, SystemClock};
use tenantgate::config::Config;
use tenantgate::db::Database;
use tenantgate::health::{HttpHealthProbe, SharedHealthProbe};
use tenantgate::lifecycle::LifecycleManager;
use tenantgate::pool::{ConnectionPool, PoolConfig};
use tenantgate::proxy::InstanceProxy;
use tenantgate::reconciler::Reconciler;
use tenantgate::registry::SharedRegistry;
use tenantgate::runtime;
use tenantgate::server::GatewayServer;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenantgate=debug".parse().expect("valid log directive")),
        )
        .init();

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

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let registry: SharedRegistry = Arc::new(Database::open(&config.database.path)?);
    info!(path = %config.database.path, "Instance database opened");

    let runtime = runtime::from_config(&config.runtime)?;
    let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.proxy)));
    let health: SharedHealthProbe = Arc::new(HttpHealthProbe::new(
        Arc::clone(&pool),
        config.proxy.upstream_host.clone(),
        &config.health,
    ));
    let clock: SharedClock = Arc::new(SystemClock);

    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&registry),
        Arc::clone(&runtime),
        Arc::clone(&health),
        config.runtime.clone(),
        config.proxy.upstream_host.clone(),
    ));

    let environment = lifecycle.environment_status().await;
    if environment.docker_running {
        info!(
            image = %environment.image,
            image_available = environment.image_available,
            port_range = %environment.port_range,
            "Container runtime ready"
        );
    } else {
        warn!("Container runtime is not reachable; instances cannot be created until it is");
    }

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&registry),
        Arc::clone(&runtime),
        Arc::clone(&health),
        &config.reconciler,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler_handle = if config.reconciler.enabled {
        let reconciler = Arc::clone(&reconciler);
        let reconciler_shutdown_rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            reconciler.run(reconciler_shutdown_rx).await;
        }))
    } else {
        info!("Status reconciler disabled");
        None
    };

    let api = Arc::new(ManagementApi::new(Arc::clone(&lifecycle), reconciler));
    let proxy = Arc::new(InstanceProxy::new(
        Arc::clone(&registry),
        pool,
        clock,
        &config.proxy,
    ));

    let server = GatewayServer::new(api, proxy, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(bind_addr).await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        if let Some(handle) = reconciler_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
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
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting tenant gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        database = %config.database.path,
        "Server configuration"
    );
    info!(
        driver = ?config.runtime.driver,
        image = %config.runtime.image,
        port_range = %config.runtime.port_range_label(),
        container_prefix = %config.runtime.container_prefix,
        "Runtime settings"
    );
    info!(
        request_timeout_secs = config.proxy.request_timeout_secs,
        upstream_host = %config.proxy.upstream_host,
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        "Proxy settings"
    );
    info!(
        enabled = config.reconciler.enabled,
        interval_secs = config.reconciler.interval_secs,
        health_path = %config.health.path,
        "Reconciler settings"
    );
}

use sessiongate::config::Config;
use sessiongate::lifecycle::{run_sweeper, LifecycleEvent, LifecycleManager};
use sessiongate::registry::SessionRegistry;
use sessiongate::router::{GatewayServer, RouterContext, PKG_NAME, VERSION};
use std::net::SocketAddr;
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
                .add_directive("sessiongate=debug".parse().expect("valid log directive")),
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

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Wire up the registry, lifecycle manager, and router
    let lifecycle = LifecycleManager::new(config.instance.clone());
    let registry = SessionRegistry::new(Arc::clone(&lifecycle));
    let context = RouterContext::new(&config, Arc::clone(&registry));

    // Lifecycle events are observability only; log them as they happen
    let mut events = lifecycle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::Started { key, endpoint }) => {
                    info!(key = %key, endpoint = %endpoint, "lifecycle event: instance started");
                }
                Ok(LifecycleEvent::Stopped { key, reason }) => {
                    info!(key = %key, reason = %reason, "lifecycle event: instance stopped");
                }
                Ok(LifecycleEvent::Errored { key, error }) => {
                    warn!(key = %key, error = %error, "lifecycle event: instance errored");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "lifecycle event log fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Spawn the idle sweep loop
    let sweeper = tokio::spawn(run_sweeper(
        Arc::clone(&lifecycle),
        Arc::clone(&registry),
        config.gateway.sweep_interval(),
        shutdown_rx.clone(),
    ));

    // Spawn the gateway server
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::new(bind_addr, context, shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all instances
    info!("Stopping all instances...");
    lifecycle.stop_all(&registry).await;

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = sweeper.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        api_prefix = %config.gateway.api_prefix,
        session_key = %config.gateway.session_key,
        session_key_header = ?config.gateway.session_key_header,
        environment = %config.gateway.environment,
        sweep_interval_secs = config.gateway.sweep_interval_secs,
        "Gateway configuration"
    );
    info!(
        command = ?config.instance.command,
        port_range_start = config.instance.port_range_start,
        port_range_end = config.instance.port_range_end,
        idle_timeout_secs = config.instance.idle_timeout_secs,
        startup_timeout_secs = config.instance.startup_timeout_secs,
        request_timeout_secs = config.instance.request_timeout_secs,
        "Instance profile"
    );
}

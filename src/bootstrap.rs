//! Application startup wiring: configuration, logging, relay construction,
//! router, and the listening socket.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tracing_appender::non_blocking::WorkerGuard;

use crate::api::{create_router, AppState};
use crate::config::Config;
use crate::logging;
use crate::relay::Relay;

pub struct Application {
    pub router: Router,
    pub listener: TcpListener,
    pub bind_address: String,
    pub relay: Arc<Relay>,
    // Keeps the non-blocking file writer alive for the process lifetime
    _log_guard: Option<WorkerGuard>,
}

pub async fn setup() -> Result<Application> {
    // Determine config directory (defaults to the working directory)
    let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
    let config_base = format!("{}/config", config_dir);

    let mut config = match Config::from_file(&config_base) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}, using defaults", e);
            Config::default()
        }
    };

    // PORT environment variable wins over the configured port
    if let Ok(port) = std::env::var("PORT") {
        match port.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => eprintln!("Ignoring invalid PORT value: {}", port),
        }
    }

    let log_guard = logging::init(&config.logging);

    tracing::info!("Starting POS relay server...");
    tracing::info!("Server Version: {}", env!("BUILD_INFO"));

    if config.logging.enabled {
        tracing::info!(
            "File logging enabled: directory={}, prefix={}, rotation={}",
            config.logging.directory,
            config.logging.file_prefix,
            config.logging.rotation
        );
    }

    tracing::info!(
        "Relay limits: max_connections={}, broadcast_capacity={}, send_timeout={}s",
        config.relay.max_connections,
        config.relay.broadcast_capacity,
        config.relay.send_timeout_secs
    );

    let relay = Arc::new(Relay::new(&config.relay));

    let app_state = AppState {
        relay: relay.clone(),
        send_timeout: Duration::from_secs(config.relay.send_timeout_secs),
    };
    let router = create_router(app_state);

    let bind_address = config.server_address();
    tracing::info!("Server will listen on: {}", bind_address);

    let listener = match tokio::time::timeout(
        Duration::from_secs(5),
        TcpListener::bind(&bind_address),
    )
    .await
    {
        Ok(Ok(listener)) => listener,
        Ok(Err(e)) => {
            tracing::error!("Failed to bind to {}: {}", bind_address, e);
            return Err(e.into());
        }
        Err(_) => {
            tracing::error!("Bind operation timed out after 5 seconds");
            anyhow::bail!("Failed to bind to {}: timeout", bind_address);
        }
    };

    Ok(Application {
        router,
        listener,
        bind_address,
        relay,
        _log_guard: log_guard,
    })
}

/// Resolves when the process receives ctrl-c or SIGTERM. Before resolving,
/// every open connection is told to close, so shutdown leaves no dangling
/// sockets behind.
pub async fn shutdown_signal(relay: Arc<Relay>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!(
        "Shutdown signal received, closing {} connection(s)",
        relay.connection_count().await
    );
    relay.shutdown().await;
}

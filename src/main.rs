//! fabricrpc - demo server
//!
//! Serves an echo service over TCP with the reactor server.

use fabricrpc_protocol::{Json, Status};
use fabricrpc_server::{run_metrics_server, Config, Metrics, MethodService, Server, Service};
use fabricrpc_transport::TcpTransport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct HelloRequest {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloReply {
    message: String,
}

fn echo_service() -> Arc<dyn Service> {
    Arc::new(
        MethodService::new("fabricrpc.Echo")
            .with_method("Say", |text: String| async move { Ok::<_, Status>(text) })
            .with_method("Hello", |Json(req): Json<HelloRequest>| async move {
                if req.name.is_empty() {
                    return Err(Status::invalid_argument("name is empty"));
                }
                Ok(Json(HelloReply {
                    message: format!("hello {}", req.name),
                }))
            }),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if FABRICRPC_CONFIG is set, then env overrides)
    let config_path = std::env::var("FABRICRPC_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!("Starting fabricrpc server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Operation timeout: {}s",
        config.transport.operation_timeout_secs
    );

    let mut server_config = config.server_config();
    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        let shutdown_rx = metrics_shutdown.subscribe();
        let addr = config.metrics.bind_addr;
        tracing::info!("  Metrics: enabled ({})", addr);
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::with_services(server_config, vec![echo_service()]));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    let transport = TcpTransport::current()?;
    server.run(&transport).await?;

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    let stats = server.stats();
    tracing::info!(
        "Server stopped ({} connections, {} requests served)",
        stats.connections_total.load(std::sync::atomic::Ordering::Relaxed),
        stats.requests_total.load(std::sync::atomic::Ordering::Relaxed)
    );
    Ok(())
}

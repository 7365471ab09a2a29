//! Reactor server.
//!
//! Accepts connections from an [`Acceptor`], runs one task per connection
//! that pulls requests off its queue, and one task per request that runs the
//! [`ServiceMiddleware`] and answers the transport call.

use crate::connection::{Acceptor, ServerConnection};
use crate::error::ServerError;
use crate::handler::QueueingHandler;
use crate::manager::ConnectionManager;
use crate::metrics::Metrics;
use crate::middleware::{Service, ServiceMiddleware};
use crate::request::Request;
use bytes::Bytes;
use fabricrpc_protocol::Status;
use fabricrpc_transport::{Transport, TransportSettings};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Transport address to listen on.
    pub bind_addr: String,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Settings handed to the transport listener.
    pub transport: TransportSettings,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("transport", &self.transport)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7501".to_string(),
            max_connections: 1000,
            transport: TransportSettings::default(),
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_transport(mut self, settings: TransportSettings) -> Self {
        self.transport = settings;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// RPC server for fabricrpc services.
pub struct Server {
    config: ServerConfig,
    middleware: Arc<ServiceMiddleware>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server running the services registered on `middleware`.
    pub fn new(config: ServerConfig, middleware: ServiceMiddleware) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let middleware = match config.metrics {
            Some(ref metrics) => middleware.with_metrics(Some(metrics.clone())),
            None => middleware,
        };
        Self {
            config,
            middleware: Arc::new(middleware),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Creates a server for a list of services.
    pub fn with_services(config: ServerConfig, services: Vec<Arc<dyn Service>>) -> Self {
        let middleware = services
            .into_iter()
            .fold(ServiceMiddleware::new(), |middleware, service| {
                middleware.with_service(service)
            });
        Self::new(config, middleware)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Opens the listener. Connections are queued from this point on and
    /// served once [`serve`](Server::serve) runs.
    pub async fn bind(&self, transport: &dyn Transport) -> Result<Acceptor, ServerError> {
        if self.middleware.service_count() == 0 {
            return Err(ServerError::NoServices);
        }
        let manager = Arc::new(ConnectionManager::new());
        let handler = QueueingHandler::new(manager.clone(), self.config.max_connections)
            .with_stats(self.stats.clone())
            .with_metrics(self.config.metrics.clone());
        Acceptor::bind(
            transport,
            &self.config.bind_addr,
            &self.config.transport,
            handler,
            manager,
        )
        .await
    }

    /// Binds and serves until shutdown.
    pub async fn run(&self, transport: &dyn Transport) -> Result<(), ServerError> {
        let acceptor = self.bind(transport).await?;
        self.serve(acceptor).await
    }

    /// Serves connections from `acceptor` until shutdown, then closes it.
    pub async fn serve(&self, acceptor: Acceptor) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        tracing::info!(
            "Server listening on {} ({} service(s))",
            acceptor.local_address(),
            self.middleware.service_count()
        );

        loop {
            tokio::select! {
                result = acceptor.accept() => {
                    match result {
                        Ok(connection) => {
                            let middleware = self.middleware.clone();
                            let stats = self.stats.clone();
                            let conn_shutdown = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                Self::handle_connection(connection, middleware, stats, conn_shutdown).await;
                            });
                        }
                        Err(ServerError::ShuttingDown) => break,
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        let closed = acceptor.close().await;
        self.running.store(false, Ordering::SeqCst);
        closed
    }

    /// Pulls requests off one connection until it closes.
    async fn handle_connection(
        connection: ServerConnection,
        middleware: Arc<ServiceMiddleware>,
        stats: Arc<ServerStats>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let addr = connection.remote_address().to_string();
        tracing::info!("Client connected: {} ({})", addr, connection.client_id());

        loop {
            tokio::select! {
                result = connection.accept_request() => {
                    match result {
                        Ok(request) => {
                            stats.requests_total.fetch_add(1, Ordering::Relaxed);
                            let middleware = middleware.clone();
                            let stats = stats.clone();
                            tokio::spawn(async move {
                                Self::handle_request(request, middleware, stats).await;
                            });
                        }
                        Err(_) => break,
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    break;
                }
            }
        }

        tracing::info!("Client disconnected: {}", addr);
    }

    async fn handle_request(
        request: Request,
        middleware: Arc<ServiceMiddleware>,
        stats: Arc<ServerStats>,
    ) {
        let client_id = request.client_id();
        let remaining = request.remaining();
        if remaining.is_zero() {
            tracing::debug!("[{}] Request expired before dispatch", client_id);
            stats.errors_total.fetch_add(1, Ordering::Relaxed);
            let reply = middleware.reply(&Status::deadline_exceeded("deadline exceeded"), Bytes::new());
            request.reply(reply);
            return;
        }

        let reply = match tokio::time::timeout(remaining, middleware.execute(request.message())).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::debug!("[{}] Request timed out after {:?}", client_id, request.timeout());
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
                middleware.reply(&Status::deadline_exceeded("deadline exceeded"), Bytes::new())
            }
        };
        if !request.reply(reply) {
            tracing::debug!("[{}] Reply discarded, caller is gone", client_id);
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

//! Connection management.

use crate::error::ClientError;
use fabricrpc_protocol::Envelope;
use fabricrpc_transport::{complete_two_phase, Transport, TransportClient, TransportSettings};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address, in the transport's address format.
    pub address: String,
    /// Transport tunables.
    pub settings: TransportSettings,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            settings: TransportSettings::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A connection to a fabricrpc server.
///
/// Every operation starts a transport call and awaits its completion
/// callback; the callback may fire on any thread.
pub struct ClientConnection {
    config: ConnectionConfig,
    client: Arc<dyn TransportClient>,
    connected: AtomicBool,
}

impl ClientConnection {
    /// Creates a new connection (not yet open).
    pub fn new(transport: &dyn Transport, config: ConnectionConfig) -> Result<Self, ClientError> {
        let client = transport.create_client(&config.address, &config.settings)?;
        Ok(Self {
            config,
            client,
            connected: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Opens the connection.
    pub async fn open(&self) -> Result<(), ClientError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }
        tracing::debug!("Connecting to {}...", self.config.address);

        let timeout = self.config.connect_timeout;
        complete_two_phase(
            |callback| self.client.begin_open(timeout, callback),
            |context| self.client.end_open(context),
        )
        .await
        .map_err(|e| {
            tracing::debug!("Connection to {} failed: {}", self.config.address, e);
            ClientError::Transport(e)
        })?;

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("Connected to {}", self.config.address);
        Ok(())
    }

    /// Returns whether the connection is open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Sends a request and waits for its reply.
    ///
    /// A zero `timeout` uses the configured request timeout.
    pub async fn send(&self, message: &Envelope, timeout: Duration) -> Result<Envelope, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let timeout = if timeout.is_zero() {
            self.config.request_timeout
        } else {
            timeout
        };

        let reply = complete_two_phase(
            |callback| self.client.begin_request(message, timeout, callback),
            |context| self.client.end_request(context),
        )
        .await?;
        tracing::debug!(
            "Reply from {}: {} header bytes, {} body bytes",
            self.config.address,
            reply.header().len(),
            reply.body().len()
        );
        Ok(reply)
    }

    /// Sends a message that gets no reply.
    pub fn send_one_way(&self, message: &Envelope) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.client.send_one_way(message)?;
        Ok(())
    }

    /// Closes the connection. Closing a connection that is not open is a
    /// no-op.
    pub async fn close(&self) -> Result<(), ClientError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let timeout = self.config.connect_timeout;
        complete_two_phase(
            |callback| self.client.begin_close(timeout, callback),
            |context| self.client.end_close(context),
        )
        .await?;
        tracing::info!("Disconnected from {}", self.config.address);
        Ok(())
    }
}

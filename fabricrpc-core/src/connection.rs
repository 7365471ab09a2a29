//! Connection handler for listeners served by a [`RequestDispatcher`].
//!
//! [`RequestDispatcher`]: crate::RequestDispatcher

use fabricrpc_transport::{
    CallbackRef, ClientId, ConnectionHandler, Context, OperationContext, PeerConnection,
    TransportError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Admits every client and keeps count.
#[derive(Debug, Default)]
pub struct AcceptAllConnections {
    connected: AtomicU64,
    disconnected: AtomicU64,
}

impl AcceptAllConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clients currently connected.
    pub fn active(&self) -> u64 {
        self.connected
            .load(Ordering::Relaxed)
            .saturating_sub(self.disconnected.load(Ordering::Relaxed))
    }
}

impl ConnectionHandler for AcceptAllConnections {
    fn begin_process_connect(
        &self,
        connection: Arc<dyn PeerConnection>,
        _timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        self.connected.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "[{}] Client connected: {}",
            connection.client_id(),
            connection.remote_address()
        );
        Ok(OperationContext::completed_with::<()>(Ok(()), callback))
    }

    fn end_process_connect(&self, context: &Context) -> Result<(), TransportError> {
        context.take_result::<()>()
    }

    fn begin_process_disconnect(
        &self,
        client_id: ClientId,
        _timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        self.disconnected.fetch_add(1, Ordering::Relaxed);
        tracing::info!("[{}] Client disconnected", client_id);
        Ok(OperationContext::completed_with::<()>(Ok(()), callback))
    }

    fn end_process_disconnect(&self, context: &Context) -> Result<(), TransportError> {
        context.take_result::<()>()
    }
}

//! Transport handlers that feed the connection manager.

use crate::error::ServerError;
use crate::manager::ConnectionManager;
use crate::metrics::Metrics;
use crate::request::Request;
use crate::server::ServerStats;
use fabricrpc_protocol::{Envelope, TransportMessage};
use fabricrpc_transport::{
    CallbackRef, ClientId, ConnectionHandler, Context, ContextPayload, OperationContext,
    PeerConnection, RequestHandler, RequestSlot, TransportError,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Registers connections and queues their requests.
///
/// Every request becomes a [`Request`] on its connection's queue; the
/// transport call completes when that request is answered.
pub struct QueueingHandler {
    manager: Arc<ConnectionManager>,
    max_connections: usize,
    stats: Arc<ServerStats>,
    metrics: Option<Arc<Metrics>>,
}

impl QueueingHandler {
    pub fn new(manager: Arc<ConnectionManager>, max_connections: usize) -> Self {
        Self {
            manager,
            max_connections,
            stats: Arc::new(ServerStats::default()),
            metrics: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<ServerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    fn admit(&self, client_id: ClientId, remote_address: String) -> Result<(), ServerError> {
        if let Err(e) = self
            .manager
            .add_conn_bounded(client_id, remote_address, self.max_connections)
        {
            if let ServerError::ConnectionLimit(max) = e {
                tracing::warn!("Connection limit ({}) reached, rejecting {}", max, client_id);
            }
            return Err(e);
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }
        Ok(())
    }
}

impl RequestHandler for QueueingHandler {
    fn begin_process_request(
        &self,
        client_id: ClientId,
        message: &dyn TransportMessage,
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        let context = OperationContext::pending(
            ContextPayload::Request(RequestSlot::new(client_id)),
            Some(callback),
        );
        let request = Request::new(
            client_id,
            Envelope::copy_from(message),
            timeout,
            context.clone(),
        );

        if let Err(request) = self.manager.post_request(request) {
            // The callback must not fire for a request the transport sees fail.
            request.detach();
            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::Closed);
        }
        Ok(context)
    }

    fn end_process_request(&self, context: &Context) -> Result<Envelope, TransportError> {
        let slot = context
            .request_slot()
            .ok_or(TransportError::InvalidContext("not a queued request"))?;
        slot.take_reply()
            .ok_or(TransportError::InvalidContext("request has not been answered"))?
    }

    fn handle_one_way(
        &self,
        client_id: ClientId,
        message: &dyn TransportMessage,
    ) -> Result<(), TransportError> {
        tracing::debug!(
            "[{}] Ignoring one-way message ({} header bytes)",
            client_id,
            message.header().len()
        );
        Ok(())
    }
}

impl ConnectionHandler for QueueingHandler {
    fn begin_process_connect(
        &self,
        connection: Arc<dyn PeerConnection>,
        _timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        let client_id = connection.client_id();
        let result = self
            .admit(client_id, connection.remote_address())
            .map_err(|e| e.to_transport_error());
        Ok(OperationContext::completed_with(result, callback))
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
        if self.manager.disconnect(client_id) {
            self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = self.metrics {
                metrics.connections_active.dec();
            }
        }
        Ok(OperationContext::completed_with::<()>(Ok(()), callback))
    }

    fn end_process_disconnect(&self, context: &Context) -> Result<(), TransportError> {
        context.take_result::<()>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabricrpc_transport::await_two_phase;

    const TIMEOUT: Duration = Duration::from_secs(1);

    struct Peer(ClientId);

    impl PeerConnection for Peer {
        fn client_id(&self) -> ClientId {
            self.0
        }

        fn remote_address(&self) -> String {
            "peer".to_string()
        }
    }

    fn connect(handler: &QueueingHandler, id: ClientId) -> Result<(), TransportError> {
        await_two_phase(
            TIMEOUT,
            |cb| handler.begin_process_connect(Arc::new(Peer(id)), TIMEOUT, cb),
            |ctx| handler.end_process_connect(ctx),
        )
    }

    fn disconnect(handler: &QueueingHandler, id: ClientId) {
        await_two_phase(
            TIMEOUT,
            |cb| handler.begin_process_disconnect(id, TIMEOUT, cb),
            |ctx| handler.end_process_disconnect(ctx),
        )
        .unwrap();
    }

    #[test]
    fn test_connection_limit() {
        let manager = Arc::new(ConnectionManager::new());
        let handler = QueueingHandler::new(manager.clone(), 2);

        let first = ClientId::new_v4();
        connect(&handler, first).unwrap();
        connect(&handler, ClientId::new_v4()).unwrap();
        assert!(matches!(
            connect(&handler, ClientId::new_v4()),
            Err(TransportError::ConnectionRefused(_))
        ));
        assert_eq!(manager.connection_count(), 2);

        disconnect(&handler, first);
        connect(&handler, ClientId::new_v4()).unwrap();
        assert_eq!(handler.stats.connections_active.load(Ordering::Relaxed), 2);
        assert_eq!(handler.stats.connections_total.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_connection_limit_holds_for_concurrent_connects() {
        let manager = Arc::new(ConnectionManager::new());
        let handler = Arc::new(QueueingHandler::new(manager.clone(), 3));

        let handles: Vec<_> = (0..24)
            .map(|_| {
                let handler = handler.clone();
                std::thread::spawn(move || connect(&handler, ClientId::new_v4()).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 3);
        assert_eq!(manager.connection_count(), 3);
        assert_eq!(handler.stats.connections_active.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_request_completes_when_answered() {
        let manager = Arc::new(ConnectionManager::new());
        let handler = QueueingHandler::new(manager.clone(), 10);
        let id = ClientId::new_v4();
        connect(&handler, id).unwrap();
        let entry = manager.next_connection().await.unwrap();

        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = fired.clone();
        let callback: CallbackRef = Arc::new(move |_: &Context| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let context = handler
            .begin_process_request(id, &Envelope::new(&b"h"[..], &b"ping"[..]), TIMEOUT, callback)
            .unwrap();
        assert!(handler.end_process_request(&context).is_err());

        let request = entry.queue.pop().await.unwrap();
        assert_eq!(request.body(), b"ping");
        request.reply(Envelope::new(&b"h"[..], &b"pong"[..]));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let reply = handler.end_process_request(&context).unwrap();
        assert_eq!(reply.body().as_ref(), b"pong");
    }

    #[test]
    fn test_request_for_unknown_connection_fails_without_callback() {
        let handler = QueueingHandler::new(Arc::new(ConnectionManager::new()), 10);
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = fired.clone();
        let callback: CallbackRef = Arc::new(move |_: &Context| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = handler.begin_process_request(
            ClientId::new_v4(),
            &Envelope::default(),
            TIMEOUT,
            callback,
        );
        assert_eq!(result.err(), Some(TransportError::Closed));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_foreign_context_rejected() {
        let handler = QueueingHandler::new(Arc::new(ConnectionManager::new()), 10);
        let foreign = OperationContext::pending(ContextPayload::Empty, None);
        assert!(matches!(
            handler.end_process_request(&foreign),
            Err(TransportError::InvalidContext(_))
        ));
    }
}

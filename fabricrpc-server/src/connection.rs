//! Acceptor and server connections.

use crate::error::ServerError;
use crate::handler::QueueingHandler;
use crate::manager::{ConnectionEntry, ConnectionManager};
use crate::queue::ItemQueue;
use crate::request::Request;
use fabricrpc_transport::{
    complete_two_phase, ClientId, Transport, TransportListener, TransportSettings,
};
use std::sync::Arc;

/// Listens on a transport address and hands out accepted connections.
pub struct Acceptor {
    manager: Arc<ConnectionManager>,
    listener: Arc<dyn TransportListener>,
    local_address: String,
}

impl Acceptor {
    /// Opens a listener on `address` whose connections and requests are
    /// queued by `handler`.
    pub async fn bind(
        transport: &dyn Transport,
        address: &str,
        settings: &TransportSettings,
        handler: QueueingHandler,
        manager: Arc<ConnectionManager>,
    ) -> Result<Self, ServerError> {
        let handler = Arc::new(handler);
        let listener =
            transport.create_listener(address, settings, handler.clone(), handler)?;
        let local_address = complete_two_phase(
            |callback| listener.begin_open(callback),
            |context| listener.end_open(context),
        )
        .await?;
        tracing::info!("Acceptor listening on {}", local_address);

        Ok(Self {
            manager,
            listener,
            local_address,
        })
    }

    /// The address the listener is bound to.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Waits for the next client connection.
    ///
    /// Cancel-safe: dropping the future withdraws the wait.
    pub async fn accept(&self) -> Result<ServerConnection, ServerError> {
        let entry = self
            .manager
            .next_connection()
            .await
            .map_err(|_| ServerError::ShuttingDown)?;
        Ok(ServerConnection::new(entry))
    }

    /// Closes the listener and every connection queue.
    pub async fn close(&self) -> Result<(), ServerError> {
        let closed = complete_two_phase(
            |callback| self.listener.begin_close(callback),
            |context| self.listener.end_close(context),
        )
        .await;
        self.manager.close();
        tracing::info!("Acceptor on {} closed", self.local_address);
        closed.map_err(ServerError::from)
    }
}

/// One accepted client connection.
pub struct ServerConnection {
    client_id: ClientId,
    remote_address: String,
    queue: Arc<ItemQueue<Request>>,
}

impl ServerConnection {
    fn new(entry: ConnectionEntry) -> Self {
        Self {
            client_id: entry.client_id,
            remote_address: entry.remote_address,
            queue: entry.queue,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Waits for the next request on this connection. Fails with
    /// [`ServerError::ConnectionClosed`] once the client is gone and its
    /// queued requests have been taken.
    ///
    /// Cancel-safe: dropping the future withdraws the wait.
    pub async fn accept_request(&self) -> Result<Request, ServerError> {
        self.queue
            .pop()
            .await
            .map_err(|_| ServerError::ConnectionClosed)
    }

    /// Whether the client has disconnected.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("client_id", &self.client_id)
            .field("remote_address", &self.remote_address)
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabricrpc_protocol::Envelope;
    use fabricrpc_transport::{await_two_phase, MemoryTransport, TransportClient};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn acceptor(transport: &MemoryTransport, address: &str) -> Acceptor {
        let manager = Arc::new(ConnectionManager::new());
        let handler = QueueingHandler::new(manager.clone(), 16);
        Acceptor::bind(
            transport,
            address,
            &TransportSettings::default(),
            handler,
            manager,
        )
        .await
        .unwrap()
    }

    async fn open(transport: &MemoryTransport, address: &str) -> Arc<dyn TransportClient> {
        let client = transport
            .create_client(address, &TransportSettings::default())
            .unwrap();
        let opener = client.clone();
        complete_two_phase(
            move |cb| opener.begin_open(TIMEOUT, cb),
            |ctx| client.end_open(ctx),
        )
        .await
        .unwrap();
        client
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accept_connection_and_request() {
        let transport = MemoryTransport::new();
        let acceptor = acceptor(&transport, "accept-test").await;
        assert_eq!(acceptor.local_address(), "accept-test");

        let client = open(&transport, "accept-test").await;
        let connection = tokio::time::timeout(TIMEOUT, acceptor.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(!connection.is_closed());

        let sender = client.clone();
        let call = tokio::task::spawn_blocking(move || {
            await_two_phase(
                TIMEOUT,
                |cb| sender.begin_request(&Envelope::new(&b"h"[..], &b"ping"[..]), TIMEOUT, cb),
                |ctx| sender.end_request(ctx),
            )
        });

        let request = connection.accept_request().await.unwrap();
        assert_eq!(request.client_id(), connection.client_id());
        assert_eq!(request.body(), b"ping");
        request.reply(Envelope::new(&b"h"[..], &b"pong"[..]));

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.body().as_ref(), b"pong");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_close_ends_connection() {
        let transport = MemoryTransport::new();
        let acceptor = acceptor(&transport, "close-test").await;
        let client = open(&transport, "close-test").await;
        let connection = acceptor.accept().await.unwrap();

        let closer = client.clone();
        complete_two_phase(
            move |cb| closer.begin_close(TIMEOUT, cb),
            |ctx| client.end_close(ctx),
        )
        .await
        .unwrap();

        let result = tokio::time::timeout(TIMEOUT, connection.accept_request())
            .await
            .unwrap();
        assert!(matches!(result, Err(ServerError::ConnectionClosed)));
        assert_eq!(acceptor.manager().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_pending_accept() {
        let transport = MemoryTransport::new();
        let acceptor = Arc::new(acceptor(&transport, "shutdown-test").await);

        let waiting = {
            let acceptor = acceptor.clone();
            tokio::spawn(async move { acceptor.accept().await })
        };
        tokio::task::yield_now().await;
        acceptor.close().await.unwrap();

        let result = tokio::time::timeout(TIMEOUT, waiting).await.unwrap().unwrap();
        assert!(matches!(result, Err(ServerError::ShuttingDown)));
        assert_eq!(transport.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let transport = MemoryTransport::new();
        let _first = acceptor(&transport, "taken").await;

        let manager = Arc::new(ConnectionManager::new());
        let result = Acceptor::bind(
            &transport,
            "taken",
            &TransportSettings::default(),
            QueueingHandler::new(manager.clone(), 1),
            manager,
        )
        .await;
        assert!(matches!(
            result,
            Err(ServerError::Transport(fabricrpc_transport::TransportError::AddressInUse(_)))
        ));
    }
}

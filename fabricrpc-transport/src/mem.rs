//! In-process transport.
//!
//! Listeners register under a name in a registry shared by every client and
//! listener created from the same [`MemoryTransport`]. Each request is served
//! on its own worker thread, which blocks on the handler's completion with
//! the caller's timeout as the transport deadline.

use crate::context::{CallbackRef, Context, OperationContext};
use crate::error::TransportError;
use crate::port::{
    await_two_phase, ClientId, ConnectionHandler, PeerConnection, RequestHandler, Transport,
    TransportClient, TransportListener,
};
use crate::settings::TransportSettings;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fabricrpc_protocol::{Envelope, TransportMessage};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type Registry = Arc<DashMap<String, Arc<ListenerShared>>>;

/// In-process transport.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    registry: Registry,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of listeners currently open.
    pub fn listener_count(&self) -> usize {
        self.registry.len()
    }
}

impl Transport for MemoryTransport {
    fn create_client(
        &self,
        address: &str,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn TransportClient>, TransportError> {
        Ok(Arc::new(MemoryClient {
            state: Arc::new(ClientState {
                id: ClientId::new_v4(),
                address: address.to_string(),
                settings: settings.clone(),
                registry: self.registry.clone(),
                listener: Mutex::new(None),
                in_flight: AtomicUsize::new(0),
            }),
        }))
    }

    fn create_listener(
        &self,
        address: &str,
        settings: &TransportSettings,
        request_handler: Arc<dyn RequestHandler>,
        connection_handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Arc<dyn TransportListener>, TransportError> {
        if address.is_empty() {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }
        Ok(Arc::new(MemoryListener {
            shared: Arc::new(ListenerShared {
                address: address.to_string(),
                settings: settings.clone(),
                request_handler,
                connection_handler,
                open: AtomicBool::new(false),
                clients: Mutex::new(HashSet::new()),
            }),
            registry: self.registry.clone(),
        }))
    }
}

fn spawn_worker<F>(name: &str, f: F) -> Result<(), TransportError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("fabricrpc-mem-{}", name))
        .spawn(f)
        .map(|_| ())
        .map_err(TransportError::from)
}

struct ListenerShared {
    address: String,
    settings: TransportSettings,
    request_handler: Arc<dyn RequestHandler>,
    connection_handler: Arc<dyn ConnectionHandler>,
    open: AtomicBool,
    clients: Mutex<HashSet<ClientId>>,
}

impl ListenerShared {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn notify_disconnect(&self, client_id: ClientId) -> Result<(), TransportError> {
        let timeout = self.settings.operation_timeout();
        let handler = &self.connection_handler;
        await_two_phase(
            timeout,
            |callback| handler.begin_process_disconnect(client_id, timeout, callback),
            |context| handler.end_process_disconnect(context),
        )
    }
}

/// Listener half of the in-process transport.
pub struct MemoryListener {
    shared: Arc<ListenerShared>,
    registry: Registry,
}

impl TransportListener for MemoryListener {
    fn begin_open(&self, callback: CallbackRef) -> Result<Context, TransportError> {
        let address = self.shared.address.clone();
        let result = match self.registry.entry(address.clone()) {
            Entry::Occupied(_) => Err(TransportError::AddressInUse(address)),
            Entry::Vacant(slot) => {
                self.shared.open.store(true, Ordering::Release);
                slot.insert(self.shared.clone());
                tracing::info!("Memory listener open on {}", address);
                Ok(address)
            }
        };
        Ok(OperationContext::completed_with(result, callback))
    }

    fn end_open(&self, context: &Context) -> Result<String, TransportError> {
        context.take_result::<String>()
    }

    fn begin_close(&self, callback: CallbackRef) -> Result<Context, TransportError> {
        self.shared.open.store(false, Ordering::Release);
        self.registry
            .remove_if(&self.shared.address, |_, l| Arc::ptr_eq(l, &self.shared));
        let clients: Vec<ClientId> = self.shared.clients.lock().drain().collect();
        tracing::info!(
            "Memory listener on {} closing, disconnecting {} clients",
            self.shared.address,
            clients.len()
        );

        let context = OperationContext::with_result::<()>(callback);
        let finisher = context.clone();
        let shared = self.shared.clone();
        spawn_worker("close", move || {
            for client_id in clients {
                if let Err(e) = shared.notify_disconnect(client_id) {
                    tracing::warn!("[{}] disconnect notification failed: {}", client_id, e);
                }
            }
            finisher.finish::<()>(Ok(()));
        })?;
        Ok(context)
    }

    fn end_close(&self, context: &Context) -> Result<(), TransportError> {
        context.take_result::<()>()
    }
}

struct MemoryPeer {
    client_id: ClientId,
}

impl PeerConnection for MemoryPeer {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn remote_address(&self) -> String {
        format!("mem-client-{}", self.client_id)
    }
}

struct ClientState {
    id: ClientId,
    address: String,
    settings: TransportSettings,
    registry: Registry,
    listener: Mutex<Option<Arc<ListenerShared>>>,
    in_flight: AtomicUsize,
}

impl ClientState {
    fn connected_listener(&self) -> Option<Arc<ListenerShared>> {
        self.listener.lock().clone().filter(|l| l.is_open())
    }

    fn check_size(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let size = envelope.header().len() + envelope.body().len();
        let max = self.settings.max_message_size();
        if size > max {
            return Err(TransportError::MessageTooLarge { size, max });
        }
        Ok(())
    }

    fn acquire_call(&self) -> Result<(), TransportError> {
        let max = self.settings.max_concurrent_calls;
        let current = self.in_flight.fetch_add(1, Ordering::AcqRel);
        if current >= max as usize {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(TransportError::TooManyCalls(max));
        }
        Ok(())
    }

    fn release_call(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Client half of the in-process transport.
pub struct MemoryClient {
    state: Arc<ClientState>,
}

impl MemoryClient {
    pub fn client_id(&self) -> ClientId {
        self.state.id
    }
}

impl TransportClient for MemoryClient {
    fn begin_open(
        &self,
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        let timeout = self.state.settings.effective_timeout(timeout);
        let listener = self
            .state
            .registry
            .get(&self.state.address)
            .map(|entry| entry.value().clone())
            .filter(|l| l.is_open());

        let Some(listener) = listener else {
            return Ok(OperationContext::completed_with::<()>(
                Err(TransportError::ConnectionRefused(self.state.address.clone())),
                callback,
            ));
        };

        let context = OperationContext::with_result::<()>(callback);
        let finisher = context.clone();
        let state = self.state.clone();
        spawn_worker("open", move || {
            let peer: Arc<dyn PeerConnection> = Arc::new(MemoryPeer {
                client_id: state.id,
            });
            let handler = &listener.connection_handler;
            let result = await_two_phase(
                timeout,
                |callback| handler.begin_process_connect(peer, timeout, callback),
                |context| handler.end_process_connect(context),
            );
            match &result {
                Ok(()) => {
                    listener.clients.lock().insert(state.id);
                    *state.listener.lock() = Some(listener.clone());
                    tracing::debug!("[{}] connected to {}", state.id, state.address);
                }
                Err(e) => tracing::debug!("[{}] connect rejected: {}", state.id, e),
            }
            finisher.finish::<()>(result);
        })?;
        Ok(context)
    }

    fn end_open(&self, context: &Context) -> Result<(), TransportError> {
        context.take_result::<()>()
    }

    fn begin_request(
        &self,
        message: &dyn TransportMessage,
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        let timeout = self.state.settings.effective_timeout(timeout);
        let envelope = Envelope::copy_from(message);

        let Some(listener) = self.state.connected_listener() else {
            return Ok(OperationContext::completed_with::<Envelope>(
                Err(TransportError::Closed),
                callback,
            ));
        };
        if let Err(e) = self
            .state
            .check_size(&envelope)
            .and_then(|_| self.state.acquire_call())
        {
            return Ok(OperationContext::completed_with::<Envelope>(Err(e), callback));
        }

        let context = OperationContext::with_result::<Envelope>(callback);
        let finisher = context.clone();
        let state = self.state.clone();
        let spawned = spawn_worker("request", move || {
            let handler = &listener.request_handler;
            let result = await_two_phase(
                timeout,
                |callback| handler.begin_process_request(state.id, &envelope, timeout, callback),
                |context| handler.end_process_request(context),
            );
            state.release_call();
            finisher.finish::<Envelope>(result);
        });
        if let Err(e) = spawned {
            self.state.release_call();
            return Err(e);
        }
        Ok(context)
    }

    fn end_request(&self, context: &Context) -> Result<Envelope, TransportError> {
        context.take_result::<Envelope>()
    }

    fn send_one_way(&self, message: &dyn TransportMessage) -> Result<(), TransportError> {
        let listener = self
            .state
            .connected_listener()
            .ok_or(TransportError::Closed)?;
        let envelope = Envelope::copy_from(message);
        self.state.check_size(&envelope)?;

        let client_id = self.state.id;
        spawn_worker("one-way", move || {
            if let Err(e) = listener.request_handler.handle_one_way(client_id, &envelope) {
                tracing::debug!("[{}] one-way message failed: {}", client_id, e);
            }
        })
    }

    fn begin_close(
        &self,
        _timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        let listener = self.state.listener.lock().take();
        let Some(listener) = listener else {
            return Ok(OperationContext::completed_with::<()>(Ok(()), callback));
        };
        // A closing listener has already notified its clients.
        if !listener.clients.lock().remove(&self.state.id) {
            return Ok(OperationContext::completed_with::<()>(Ok(()), callback));
        }

        let context = OperationContext::with_result::<()>(callback);
        let finisher = context.clone();
        let client_id = self.state.id;
        spawn_worker("close", move || {
            finisher.finish::<()>(listener.notify_disconnect(client_id));
        })?;
        Ok(context)
    }

    fn end_close(&self, context: &Context) -> Result<(), TransportError> {
        context.take_result::<()>()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, CountingConnections, EchoHandler, StalledHandler};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn open_listener(
        transport: &MemoryTransport,
        address: &str,
        handler: Arc<dyn RequestHandler>,
        connections: Arc<CountingConnections>,
    ) -> Arc<dyn TransportListener> {
        let listener = transport
            .create_listener(address, &TransportSettings::default(), handler, connections)
            .unwrap();
        let bound = await_two_phase(
            TIMEOUT,
            |cb| listener.begin_open(cb),
            |ctx| listener.end_open(ctx),
        )
        .unwrap();
        assert_eq!(bound, address);
        listener
    }

    fn open_client(
        transport: &MemoryTransport,
        address: &str,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn TransportClient>, TransportError> {
        let client = transport.create_client(address, settings)?;
        await_two_phase(
            TIMEOUT,
            |cb| client.begin_open(TIMEOUT, cb),
            |ctx| client.end_open(ctx),
        )?;
        Ok(client)
    }

    fn request(
        client: &Arc<dyn TransportClient>,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        await_two_phase(
            TIMEOUT,
            |cb| client.begin_request(envelope, timeout, cb),
            |ctx| client.end_request(ctx),
        )
    }

    #[test]
    fn test_request_roundtrip() {
        let transport = MemoryTransport::new();
        let connections = Arc::new(CountingConnections::default());
        let _listener = open_listener(
            &transport,
            "echo",
            Arc::new(EchoHandler::default()),
            connections.clone(),
        );

        let client = open_client(&transport, "echo", &TransportSettings::default()).unwrap();
        assert_eq!(connections.connects.load(Ordering::SeqCst), 1);

        let sent = Envelope::new(&b"hdr"[..], &b"body"[..]);
        let reply = request(&client, &sent, TIMEOUT).unwrap();
        assert_eq!(reply, sent);
    }

    #[test]
    fn test_address_in_use() {
        let transport = MemoryTransport::new();
        let connections = Arc::new(CountingConnections::default());
        let _first = open_listener(
            &transport,
            "dup",
            Arc::new(EchoHandler::default()),
            connections.clone(),
        );

        let second = transport
            .create_listener(
                "dup",
                &TransportSettings::default(),
                Arc::new(EchoHandler::default()),
                connections,
            )
            .unwrap();
        let result = await_two_phase(
            TIMEOUT,
            |cb| second.begin_open(cb),
            |ctx| second.end_open(ctx),
        );
        assert!(matches!(result, Err(TransportError::AddressInUse(_))));
    }

    #[test]
    fn test_connection_refused() {
        let transport = MemoryTransport::new();
        let result = open_client(&transport, "nobody", &TransportSettings::default());
        assert!(matches!(result, Err(TransportError::ConnectionRefused(_))));
    }

    #[test]
    fn test_connect_rejected_by_handler() {
        let transport = MemoryTransport::new();
        let _listener = open_listener(
            &transport,
            "picky",
            Arc::new(EchoHandler::default()),
            Arc::new(CountingConnections::rejecting()),
        );

        let result = open_client(&transport, "picky", &TransportSettings::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_request_timeout_reports_native_timeout() {
        let transport = MemoryTransport::new();
        let _listener = open_listener(
            &transport,
            "slow",
            Arc::new(StalledHandler::default()),
            Arc::new(CountingConnections::default()),
        );
        let client = open_client(&transport, "slow", &TransportSettings::default()).unwrap();

        let err = request(&client, &Envelope::default(), Duration::from_millis(50)).unwrap_err();
        assert_eq!(err, TransportError::Timeout);
        assert_eq!(err.native_code(), crate::error::native::TIMEOUT);
    }

    #[test]
    fn test_message_too_large() {
        let transport = MemoryTransport::new();
        let _listener = open_listener(
            &transport,
            "small",
            Arc::new(EchoHandler::default()),
            Arc::new(CountingConnections::default()),
        );
        let settings = TransportSettings::default().with_max_message_size_kb(1);
        let client = open_client(&transport, "small", &settings).unwrap();

        let big = Envelope::new(&b"h"[..], vec![0u8; 2048]);
        assert!(matches!(
            request(&client, &big, TIMEOUT),
            Err(TransportError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_too_many_concurrent_calls() {
        let transport = MemoryTransport::new();
        let _listener = open_listener(
            &transport,
            "busy",
            Arc::new(StalledHandler::default()),
            Arc::new(CountingConnections::default()),
        );
        let settings = TransportSettings::default().with_max_concurrent_calls(1);
        let client = open_client(&transport, "busy", &settings).unwrap();

        let noop: CallbackRef = Arc::new(|_: &Context| {});
        let _first = client
            .begin_request(&Envelope::default(), Duration::from_secs(2), noop)
            .unwrap();
        let second = request(&client, &Envelope::default(), TIMEOUT);
        assert_eq!(second, Err(TransportError::TooManyCalls(1)));
    }

    #[test]
    fn test_one_way_delivered() {
        let transport = MemoryTransport::new();
        let handler = Arc::new(EchoHandler::default());
        let _listener = open_listener(
            &transport,
            "oneway",
            handler.clone(),
            Arc::new(CountingConnections::default()),
        );
        let client = open_client(&transport, "oneway", &TransportSettings::default()).unwrap();

        client.send_one_way(&Envelope::default()).unwrap();
        assert!(eventually(|| handler.one_way.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_client_close_notifies_disconnect() {
        let transport = MemoryTransport::new();
        let connections = Arc::new(CountingConnections::default());
        let _listener = open_listener(
            &transport,
            "bye",
            Arc::new(EchoHandler::default()),
            connections.clone(),
        );
        let client = open_client(&transport, "bye", &TransportSettings::default()).unwrap();

        await_two_phase(
            TIMEOUT,
            |cb| client.begin_close(TIMEOUT, cb),
            |ctx| client.end_close(ctx),
        )
        .unwrap();
        assert_eq!(connections.disconnects(), 1);

        let result = request(&client, &Envelope::default(), TIMEOUT);
        assert_eq!(result, Err(TransportError::Closed));
    }

    #[test]
    fn test_listener_close_disconnects_clients() {
        let transport = MemoryTransport::new();
        let connections = Arc::new(CountingConnections::default());
        let listener = open_listener(
            &transport,
            "shutdown",
            Arc::new(EchoHandler::default()),
            connections.clone(),
        );
        let a = open_client(&transport, "shutdown", &TransportSettings::default()).unwrap();
        let _b = open_client(&transport, "shutdown", &TransportSettings::default()).unwrap();

        await_two_phase(
            TIMEOUT,
            |cb| listener.begin_close(cb),
            |ctx| listener.end_close(ctx),
        )
        .unwrap();
        assert_eq!(connections.disconnects(), 2);
        assert_eq!(transport.listener_count(), 0);

        assert_eq!(
            request(&a, &Envelope::default(), TIMEOUT),
            Err(TransportError::Closed)
        );
        // Closing the client afterwards does not notify again.
        await_two_phase(TIMEOUT, |cb| a.begin_close(TIMEOUT, cb), |ctx| a.end_close(ctx))
            .unwrap();
        assert_eq!(connections.disconnects(), 2);
    }
}

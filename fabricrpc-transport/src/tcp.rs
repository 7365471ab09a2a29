//! TCP transport.
//!
//! Requests and replies travel as [`Frame`]s over a plain TCP stream. A
//! client multiplexes calls over one connection, correlating replies by
//! request id. The listener serves each accepted connection on its own
//! task; replies are written by a per-connection writer task as the
//! handler's contexts complete, so they may go out in any order.
//!
//! All I/O runs on the tokio runtime the transport was created with. The
//! begin/end surface stays synchronous: `begin_*` spawns the work and
//! returns at once.

use crate::context::{CallbackRef, Context, OperationContext};
use crate::error::TransportError;
use crate::port::{
    await_two_phase, ClientId, ConnectionHandler, PeerConnection, RequestHandler, Transport,
    TransportClient, TransportListener,
};
use crate::settings::TransportSettings;
use bytes::BytesMut;
use fabricrpc_protocol::{Envelope, Frame, FrameKind, TransportMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

/// Initial read buffer size (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Accepts both `host:port` and listener urls (`host:port+/`).
fn socket_address(address: &str) -> Result<String, TransportError> {
    let trimmed = address.trim_end_matches('/').trim_end_matches('+');
    if trimmed.is_empty() || !trimmed.contains(':') {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    Ok(trimmed.to_string())
}

fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn check_size(envelope: &Envelope, settings: &TransportSettings) -> Result<(), TransportError> {
    let size = envelope.header().len() + envelope.body().len();
    let max = settings.max_message_size();
    if size > max {
        return Err(TransportError::MessageTooLarge { size, max });
    }
    Ok(())
}

/// TCP transport bound to a tokio runtime.
#[derive(Clone)]
pub struct TcpTransport {
    handle: Handle,
}

impl TcpTransport {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the calling task.
    pub fn current() -> Result<Self, TransportError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

impl Transport for TcpTransport {
    fn create_client(
        &self,
        address: &str,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn TransportClient>, TransportError> {
        let (shutdown, _) = broadcast::channel(1);
        Ok(Arc::new(TcpClient {
            state: Arc::new(ClientState {
                address: socket_address(address)?,
                settings: settings.clone(),
                handle: self.handle.clone(),
                writer: tokio::sync::Mutex::new(None),
                pending: parking_lot::Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                shutdown,
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
        let (shutdown, _) = broadcast::channel(1);
        Ok(Arc::new(TcpTransportListener {
            state: Arc::new(ListenerState {
                address: socket_address(address)?,
                settings: settings.clone(),
                request_handler,
                connection_handler,
                handle: self.handle.clone(),
                shutdown,
                connections_active: AtomicUsize::new(0),
            }),
        }))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct ClientState {
    address: String,
    settings: TransportSettings,
    handle: Handle,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Requests waiting for a reply, by request id.
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<Frame>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    in_flight: AtomicUsize,
    shutdown: broadcast::Sender<()>,
}

impl ClientState {
    async fn connect(self: &Arc<Self>, timeout: Duration) -> Result<(), TransportError> {
        tracing::debug!("Connecting to {}...", self.address);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                tracing::debug!("Connection to {} timed out", self.address);
                TransportError::Timeout
            })??;
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);

        tokio::spawn(self.clone().read_loop(read_half, self.shutdown.subscribe()));
        if self.settings.keep_alive_timeout_secs > 0 {
            tokio::spawn(self.clone().keep_alive_loop(self.shutdown.subscribe()));
        }

        tracing::debug!("Connected to {}", self.address);
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        'read: loop {
            tokio::select! {
                result = reader.read_buf(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by server", self.address);
                            break 'read;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", self.address, e);
                            break 'read;
                        }
                    }
                }
                _ = shutdown.recv() => break 'read,
            }

            loop {
                match Frame::decode(&mut buf) {
                    Ok(Some(frame)) => self.dispatch(frame),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("[{}] Protocol error: {}", self.address, e);
                        break 'read;
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with a closed channel.
        self.pending.lock().clear();
    }

    fn dispatch(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Reply | FrameKind::Error => {
                let id = frame.request_id;
                match self.pending.lock().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => tracing::debug!("[{}] No pending request for id={}", self.address, id),
                }
            }
            FrameKind::Ping => {}
            other => tracing::warn!("[{}] Unexpected {:?} frame from server", self.address, other),
        }
    }

    async fn keep_alive_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.settings.keep_alive_timeout() / 2;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.write_frame(&Frame::ping()).await {
                        tracing::debug!("[{}] Keep-alive failed: {}", self.address, e);
                        return;
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let encoded = frame.encode()?;
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(&encoded).await?;
        Ok(())
    }

    async fn exchange(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if !self.connected.load(Ordering::SeqCst) {
            self.pending.lock().remove(&id);
            return Err(TransportError::Closed);
        }

        let frame =
            Frame::new(FrameKind::Request, id, envelope).with_timeout_ms(timeout_ms(timeout));
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        tracing::trace!("[{}] Request id={} sent", self.address, id);

        let reply = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| {
                tracing::debug!("[{}] Request id={} timed out", self.address, id);
                self.pending.lock().remove(&id);
                TransportError::Timeout
            })?
            .map_err(|_| TransportError::Closed)?;

        match reply.kind {
            FrameKind::Reply => Ok(reply.into_envelope()),
            FrameKind::Error => {
                let (code, message) = reply
                    .error_parts()
                    .ok_or_else(|| TransportError::Protocol("malformed error frame".into()))?;
                Err(TransportError::from_native(code, message))
            }
            other => Err(TransportError::Protocol(format!(
                "unexpected {:?} frame in reply",
                other
            ))),
        }
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(());
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let mut pending = self.pending.lock();
        tracing::debug!("[{}] Closing with {} pending requests", self.address, pending.len());
        pending.clear();
    }

    fn acquire_call(&self) -> Result<(), TransportError> {
        let max = self.settings.max_concurrent_calls;
        if self.in_flight.fetch_add(1, Ordering::AcqRel) >= max as usize {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(TransportError::TooManyCalls(max));
        }
        Ok(())
    }

    fn release_call(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Client half of the TCP transport.
pub struct TcpClient {
    state: Arc<ClientState>,
}

impl TcpClient {
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        let _ = self.state.shutdown.send(());
    }
}

impl TransportClient for TcpClient {
    fn begin_open(
        &self,
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        let timeout = self.state.settings.effective_timeout(timeout);
        let context = OperationContext::with_result::<()>(callback);
        let finisher = context.clone();
        let state = self.state.clone();
        self.state.handle.spawn(async move {
            let result = state.connect(timeout).await;
            finisher.finish::<()>(result);
        });
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

        let admitted = if self.is_connected() {
            check_size(&envelope, &self.state.settings).and_then(|_| self.state.acquire_call())
        } else {
            Err(TransportError::Closed)
        };
        if let Err(e) = admitted {
            return Ok(OperationContext::completed_with::<Envelope>(Err(e), callback));
        }

        let context = OperationContext::with_result::<Envelope>(callback);
        let finisher = context.clone();
        let state = self.state.clone();
        self.state.handle.spawn(async move {
            let result = state.exchange(envelope, timeout).await;
            state.release_call();
            finisher.finish::<Envelope>(result);
        });
        Ok(context)
    }

    fn end_request(&self, context: &Context) -> Result<Envelope, TransportError> {
        context.take_result::<Envelope>()
    }

    fn send_one_way(&self, message: &dyn TransportMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let envelope = Envelope::copy_from(message);
        check_size(&envelope, &self.state.settings)?;

        let state = self.state.clone();
        self.state.handle.spawn(async move {
            let frame = Frame::new(FrameKind::OneWay, 0, envelope);
            if let Err(e) = state.write_frame(&frame).await {
                tracing::debug!("[{}] One-way send failed: {}", state.address, e);
            }
        });
        Ok(())
    }

    fn begin_close(
        &self,
        _timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        let context = OperationContext::with_result::<()>(callback);
        let finisher = context.clone();
        let state = self.state.clone();
        self.state.handle.spawn(async move {
            state.close().await;
            finisher.finish::<()>(Ok(()));
        });
        Ok(context)
    }

    fn end_close(&self, context: &Context) -> Result<(), TransportError> {
        context.take_result::<()>()
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

struct ListenerState {
    address: String,
    settings: TransportSettings,
    request_handler: Arc<dyn RequestHandler>,
    connection_handler: Arc<dyn ConnectionHandler>,
    handle: Handle,
    shutdown: broadcast::Sender<()>,
    connections_active: AtomicUsize,
}

/// Work handed from completion callbacks to a connection's writer task.
enum Outbound {
    Completed {
        request_id: u64,
        context: Context,
        permit: OwnedSemaphorePermit,
    },
    Failed {
        request_id: u64,
        error: TransportError,
    },
}

struct TcpPeer {
    client_id: ClientId,
    addr: SocketAddr,
}

impl PeerConnection for TcpPeer {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn remote_address(&self) -> String {
        self.addr.to_string()
    }
}

impl ListenerState {
    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            stream.set_nodelay(true).ok();
                            let state = self.clone();
                            let conn_shutdown = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                state.connections_active.fetch_add(1, Ordering::Relaxed);
                                state.clone().handle_connection(stream, addr, conn_shutdown).await;
                                state.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Listener on {} shutting down", self.address);
                    break;
                }
            }
        }
    }

    async fn notify_connect(&self, peer: Arc<dyn PeerConnection>) -> Result<(), TransportError> {
        let handler = self.connection_handler.clone();
        let timeout = self.settings.operation_timeout();
        tokio::task::spawn_blocking(move || {
            await_two_phase(
                timeout,
                |callback| handler.begin_process_connect(peer, timeout, callback),
                |context| handler.end_process_connect(context),
            )
        })
        .await
        .map_err(|_| TransportError::Cancelled)?
    }

    async fn notify_disconnect(&self, client_id: ClientId) -> Result<(), TransportError> {
        let handler = self.connection_handler.clone();
        let timeout = self.settings.operation_timeout();
        tokio::task::spawn_blocking(move || {
            await_two_phase(
                timeout,
                |callback| handler.begin_process_disconnect(client_id, timeout, callback),
                |context| handler.end_process_disconnect(context),
            )
        })
        .await
        .map_err(|_| TransportError::Cancelled)?
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let client_id = ClientId::new_v4();
        let peer: Arc<dyn PeerConnection> = Arc::new(TcpPeer { client_id, addr });
        if let Err(e) = self.notify_connect(peer).await {
            tracing::info!("[{}] Connection rejected: {}", addr, e);
            return;
        }
        tracing::info!("[{}] Client connected ({})", addr, client_id);

        let (mut reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(self.clone().write_loop(writer, out_rx, addr));

        let queue = Arc::new(Semaphore::new(self.settings.max_queue_size.max(1) as usize));
        let idle = self.settings.keep_alive_timeout() * 2;
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        'read: loop {
            tokio::select! {
                result = reader.read_buf(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            break 'read;
                        }
                        Ok(n) => tracing::trace!("[{}] Received {} bytes", addr, n),
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            break 'read;
                        }
                    }
                }
                _ = idle_timer(idle) => {
                    tracing::debug!("[{}] Idle timeout", addr);
                    break 'read;
                }
                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    break 'read;
                }
            }

            loop {
                let frame = match Frame::decode(&mut buf) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("[{}] Protocol error: {}", addr, e);
                        break 'read;
                    }
                };
                match frame.kind {
                    FrameKind::Request => {
                        let permit = tokio::select! {
                            permit = queue.clone().acquire_owned() => permit.ok(),
                            _ = shutdown.recv() => None,
                        };
                        let Some(permit) = permit else {
                            break 'read;
                        };
                        self.begin_request(client_id, frame, permit, &out_tx);
                    }
                    FrameKind::OneWay => {
                        let envelope = frame.into_envelope();
                        if let Err(e) = self.request_handler.handle_one_way(client_id, &envelope) {
                            tracing::debug!("[{}] One-way message failed: {}", addr, e);
                        }
                    }
                    FrameKind::Ping => tracing::trace!("[{}] Ping", addr),
                    other => tracing::warn!("[{}] Unexpected {:?} frame from client", addr, other),
                }
            }
        }

        // Replies still outstanding are discarded with the connection.
        drop(out_tx);
        writer_task.abort();

        if let Err(e) = self.notify_disconnect(client_id).await {
            tracing::warn!("[{}] Disconnect notification failed: {}", addr, e);
        }
    }

    fn begin_request(
        &self,
        client_id: ClientId,
        frame: Frame,
        permit: OwnedSemaphorePermit,
        out_tx: &mpsc::UnboundedSender<Outbound>,
    ) {
        let request_id = frame.request_id;
        let timeout = self
            .settings
            .effective_timeout(Duration::from_millis(u64::from(frame.timeout_ms)));
        let envelope = frame.into_envelope();

        if let Err(error) = check_size(&envelope, &self.settings) {
            let _ = out_tx.send(Outbound::Failed { request_id, error });
            return;
        }

        let tx = out_tx.clone();
        let permit = parking_lot::Mutex::new(Some(permit));
        let callback: CallbackRef = Arc::new(move |context: &Context| {
            if let Some(permit) = permit.lock().take() {
                let _ = tx.send(Outbound::Completed {
                    request_id,
                    context: context.clone(),
                    permit,
                });
            }
        });

        if let Err(error) =
            self.request_handler
                .begin_process_request(client_id, &envelope, timeout, callback)
        {
            let _ = out_tx.send(Outbound::Failed { request_id, error });
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut out_rx: mpsc::UnboundedReceiver<Outbound>,
        addr: SocketAddr,
    ) {
        while let Some(outbound) = out_rx.recv().await {
            let (frame, permit) = match outbound {
                Outbound::Completed {
                    request_id,
                    context,
                    permit,
                } => {
                    let frame = match self.request_handler.end_process_request(&context) {
                        Ok(reply) => Frame::new(FrameKind::Reply, request_id, reply),
                        Err(e) => Frame::error(request_id, e.native_code(), &e.to_string()),
                    };
                    (frame, Some(permit))
                }
                Outbound::Failed { request_id, error } => (
                    Frame::error(request_id, error.native_code(), &error.to_string()),
                    None,
                ),
            };

            let encoded = match frame.encode() {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::warn!("[{}] Cannot encode reply: {}", addr, e);
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&encoded).await {
                tracing::debug!("[{}] Write error: {}", addr, e);
                return;
            }
            drop(permit);
        }
    }
}

async fn idle_timer(idle: Duration) {
    if idle.is_zero() {
        std::future::pending::<()>().await
    } else {
        tokio::time::sleep(idle).await
    }
}

/// Listener half of the TCP transport.
pub struct TcpTransportListener {
    state: Arc<ListenerState>,
}

impl TcpTransportListener {
    pub fn connections_active(&self) -> usize {
        self.state.connections_active.load(Ordering::Relaxed)
    }
}

impl Drop for TcpTransportListener {
    fn drop(&mut self) {
        let _ = self.state.shutdown.send(());
    }
}

impl TransportListener for TcpTransportListener {
    fn begin_open(&self, callback: CallbackRef) -> Result<Context, TransportError> {
        let context = OperationContext::with_result::<String>(callback);
        let finisher = context.clone();
        let state = self.state.clone();
        // Subscribe before binding so a close racing the open still stops the loop.
        let shutdown_rx = self.state.shutdown.subscribe();
        self.state.handle.spawn(async move {
            let bound = match TcpListener::bind(&state.address).await {
                Ok(listener) => listener.local_addr().map(|local| (listener, local)),
                Err(e) => Err(e),
            };
            match bound {
                Ok((listener, local)) => {
                    tracing::info!("Listening on {}", local);
                    tokio::spawn(state.accept_loop(listener, shutdown_rx));
                    finisher.finish::<String>(Ok(local.to_string()));
                }
                Err(e) => {
                    tracing::error!("Cannot bind {}: {}", state.address, e);
                    finisher.finish::<String>(Err(e.into()));
                }
            }
        });
        Ok(context)
    }

    fn end_open(&self, context: &Context) -> Result<String, TransportError> {
        context.take_result::<String>()
    }

    fn begin_close(&self, callback: CallbackRef) -> Result<Context, TransportError> {
        let _ = self.state.shutdown.send(());
        Ok(OperationContext::completed_with::<()>(Ok(()), callback))
    }

    fn end_close(&self, context: &Context) -> Result<(), TransportError> {
        context.take_result::<()>()
    }
}

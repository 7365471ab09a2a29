//! The transport port.
//!
//! Every asynchronous operation is split in two: `begin_*` starts it and
//! hands back a [`Context`]; when the context's callback fires, `end_*` is
//! called with that context to collect the result. A callback may fire on
//! any thread, before or after `begin_*` returns.

use crate::context::{CallbackRef, Context, WaitableCallback};
use crate::error::TransportError;
use crate::settings::TransportSettings;
use fabricrpc_protocol::{Envelope, TransportMessage};
use std::sync::Arc;
use std::time::Duration;

/// Identifies one client connection on a listener.
pub type ClientId = uuid::Uuid;

/// Creates clients and listeners.
pub trait Transport: Send + Sync {
    fn create_client(
        &self,
        address: &str,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn TransportClient>, TransportError>;

    fn create_listener(
        &self,
        address: &str,
        settings: &TransportSettings,
        request_handler: Arc<dyn RequestHandler>,
        connection_handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Arc<dyn TransportListener>, TransportError>;
}

/// Client side of a connection.
pub trait TransportClient: Send + Sync {
    fn begin_open(&self, timeout: Duration, callback: CallbackRef)
        -> Result<Context, TransportError>;

    fn end_open(&self, context: &Context) -> Result<(), TransportError>;

    fn begin_request(
        &self,
        message: &dyn TransportMessage,
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError>;

    fn end_request(&self, context: &Context) -> Result<Envelope, TransportError>;

    /// Fire-and-forget: no reply, no completion.
    fn send_one_way(&self, message: &dyn TransportMessage) -> Result<(), TransportError>;

    fn begin_close(
        &self,
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError>;

    fn end_close(&self, context: &Context) -> Result<(), TransportError>;
}

/// Server side listener.
pub trait TransportListener: Send + Sync {
    fn begin_open(&self, callback: CallbackRef) -> Result<Context, TransportError>;

    /// Returns the address the listener is bound to.
    fn end_open(&self, context: &Context) -> Result<String, TransportError>;

    fn begin_close(&self, callback: CallbackRef) -> Result<Context, TransportError>;

    fn end_close(&self, context: &Context) -> Result<(), TransportError>;
}

/// A connected client as seen by the listener.
pub trait PeerConnection: Send + Sync {
    fn client_id(&self) -> ClientId;

    fn remote_address(&self) -> String;
}

/// Processes requests arriving on a listener.
pub trait RequestHandler: Send + Sync {
    fn begin_process_request(
        &self,
        client_id: ClientId,
        message: &dyn TransportMessage,
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError>;

    fn end_process_request(&self, context: &Context) -> Result<Envelope, TransportError>;

    fn handle_one_way(
        &self,
        client_id: ClientId,
        message: &dyn TransportMessage,
    ) -> Result<(), TransportError>;
}

/// Observes clients connecting to and disconnecting from a listener.
pub trait ConnectionHandler: Send + Sync {
    fn begin_process_connect(
        &self,
        connection: Arc<dyn PeerConnection>,
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError>;

    fn end_process_connect(&self, context: &Context) -> Result<(), TransportError>;

    fn begin_process_disconnect(
        &self,
        client_id: ClientId,
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError>;

    fn end_process_disconnect(&self, context: &Context) -> Result<(), TransportError>;
}

/// Runs one begin/end pair to completion on the calling thread.
///
/// Blocks until the callback fires or `timeout` elapses. If the operation
/// lets go of its callback without firing it, the operation counts as
/// cancelled.
pub fn await_two_phase<T>(
    timeout: Duration,
    begin: impl FnOnce(CallbackRef) -> Result<Context, TransportError>,
    end: impl FnOnce(&Context) -> Result<T, TransportError>,
) -> Result<T, TransportError> {
    let waiter = WaitableCallback::new();
    let pending = begin(waiter.clone())?;
    match waiter.wait_timeout(timeout) {
        Some(context) => end(&context),
        None if !pending.has_callback() && !pending.is_completed() => {
            Err(TransportError::Cancelled)
        }
        None => Err(TransportError::Timeout),
    }
}

//! Handlers shared by the transport tests.

use crate::context::{CallbackRef, Context, ContextPayload, OperationContext};
use crate::error::TransportError;
use crate::port::{ClientId, ConnectionHandler, PeerConnection, RequestHandler};
use fabricrpc_protocol::{Envelope, TransportMessage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Replies with the request it was given.
#[derive(Default)]
pub struct EchoHandler {
    pub one_way: AtomicUsize,
}

impl RequestHandler for EchoHandler {
    fn begin_process_request(
        &self,
        _client_id: ClientId,
        message: &dyn TransportMessage,
        _timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        Ok(OperationContext::completed_with(
            Ok(Envelope::copy_from(message)),
            callback,
        ))
    }

    fn end_process_request(&self, context: &Context) -> Result<Envelope, TransportError> {
        context.take_result::<Envelope>()
    }

    fn handle_one_way(
        &self,
        _client_id: ClientId,
        _message: &dyn TransportMessage,
    ) -> Result<(), TransportError> {
        self.one_way.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Accepts requests and never completes them.
#[derive(Default)]
pub struct StalledHandler {
    pub parked: Mutex<Vec<Context>>,
}

impl RequestHandler for StalledHandler {
    fn begin_process_request(
        &self,
        _client_id: ClientId,
        _message: &dyn TransportMessage,
        _timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        let context = OperationContext::pending(ContextPayload::Empty, Some(callback));
        self.parked.lock().push(context.clone());
        Ok(context)
    }

    fn end_process_request(&self, _context: &Context) -> Result<Envelope, TransportError> {
        Err(TransportError::InvalidContext("request never completes"))
    }

    fn handle_one_way(
        &self,
        _client_id: ClientId,
        _message: &dyn TransportMessage,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Counts connects and disconnects, optionally rejecting every client.
#[derive(Default)]
pub struct CountingConnections {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub reject: bool,
}

impl CountingConnections {
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl ConnectionHandler for CountingConnections {
    fn begin_process_connect(
        &self,
        _connection: Arc<dyn PeerConnection>,
        _timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let result = if self.reject {
            Err(TransportError::ConnectionRefused("rejected".into()))
        } else {
            Ok(())
        };
        Ok(OperationContext::completed_with(result, callback))
    }

    fn end_process_connect(&self, context: &Context) -> Result<(), TransportError> {
        context.take_result::<()>()
    }

    fn begin_process_disconnect(
        &self,
        _client_id: ClientId,
        _timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(OperationContext::completed_with::<()>(Ok(()), callback))
    }

    fn end_process_disconnect(&self, context: &Context) -> Result<(), TransportError> {
        context.take_result::<()>()
    }
}

/// Polls `condition` for up to two seconds.
pub fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

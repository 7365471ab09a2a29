//! Inbound requests.

use fabricrpc_protocol::Envelope;
use fabricrpc_transport::{ClientId, Context, TransportError};
use std::time::{Duration, Instant};

/// A request received on a server connection.
///
/// The transport call stays open until the request is answered with
/// [`reply`](Request::reply) or [`fail`](Request::fail). A request dropped
/// unanswered fails the call with a cancelled transport error.
pub struct Request {
    client_id: ClientId,
    message: Envelope,
    timeout: Duration,
    received_at: Instant,
    context: Option<Context>,
}

impl Request {
    /// Binds `message` to the transport call behind `context`, whose payload
    /// must be a request slot.
    pub fn new(client_id: ClientId, message: Envelope, timeout: Duration, context: Context) -> Self {
        Self {
            client_id,
            message,
            timeout,
            received_at: Instant::now(),
            context: Some(context),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn message(&self) -> &Envelope {
        &self.message
    }

    pub fn header(&self) -> &[u8] {
        self.message.header()
    }

    pub fn body(&self) -> &[u8] {
        self.message.body()
    }

    /// The caller's deadline as received.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// What is left of the caller's deadline.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.received_at.elapsed())
    }

    /// Answers the request.
    pub fn reply(mut self, reply: Envelope) -> bool {
        self.finish(Ok(reply))
    }

    /// Fails the transport call.
    pub fn fail(mut self, error: TransportError) -> bool {
        self.finish(Err(error))
    }

    /// Gives up the transport call without completing it, for a request
    /// that never reached a connection queue.
    pub(crate) fn detach(mut self) -> Option<Context> {
        self.context.take()
    }

    fn finish(&mut self, reply: Result<Envelope, TransportError>) -> bool {
        let Some(context) = self.context.take() else {
            return false;
        };
        let Some(slot) = context.request_slot() else {
            tracing::error!("[{}] Request context carries no reply slot", self.client_id);
            return false;
        };
        slot.write_reply(reply) && context.complete()
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.context.is_some() {
            tracing::debug!("[{}] Request dropped without a reply", self.client_id);
            self.finish(Err(TransportError::Cancelled));
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("client_id", &self.client_id)
            .field("header_len", &self.message.header().len())
            .field("body_len", &self.message.body().len())
            .field("timeout", &self.timeout)
            .field("answered", &self.context.is_none())
            .finish()
    }
}

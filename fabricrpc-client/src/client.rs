//! High-level client API.

use crate::connection::ClientConnection;
use fabricrpc_core::{decode_reply, encode_call};
use fabricrpc_protocol::{HeaderCodec, Message, ProtoHeaderCodec, Status};
use std::sync::Arc;
use std::time::Duration;

/// Typed RPC calls over a [`ClientConnection`].
///
/// Every failure, whether from the transport or from the remote service,
/// surfaces as a [`Status`]; transport failures keep their native code.
pub struct RpcClient {
    conn: Arc<ClientConnection>,
    codec: Arc<dyn HeaderCodec>,
}

impl RpcClient {
    pub fn new(conn: Arc<ClientConnection>) -> Self {
        Self {
            conn,
            codec: Arc::new(ProtoHeaderCodec),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn HeaderCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<ClientConnection> {
        self.conn.clone()
    }

    /// Calls the method at `url` with the configured request timeout.
    pub async fn call<Req: Message, Resp: Message>(
        &self,
        url: &str,
        request: &Req,
    ) -> Result<Resp, Status> {
        self.call_with_timeout(url, request, Duration::ZERO).await
    }

    /// Calls the method at `url`, giving up after `timeout`.
    pub async fn call_with_timeout<Req: Message, Resp: Message>(
        &self,
        url: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, Status> {
        let message = encode_call(self.codec.as_ref(), url, request)?;
        let reply = self.conn.send(&message, timeout).await.map_err(|e| {
            tracing::debug!("{}: {}", url, e);
            Status::from(e)
        })?;
        decode_reply(self.codec.as_ref(), &reply)
    }
}

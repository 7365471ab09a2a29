//! Client helpers.
//!
//! Generated or hand-written client stubs call [`exec_client_begin`] to put
//! a typed request on the wire and [`exec_client_end`] to turn the reply back
//! into a typed response. Both report failures as a [`Status`]; transport
//! failures keep their native code and can be told apart with
//! [`Status::is_transport_error`].

use fabricrpc_protocol::{Envelope, HeaderCodec, Message, RequestHeader, Status};
use fabricrpc_transport::{CallbackRef, Context, TransportClient, WaitableCallback};
use std::time::Duration;

/// Builds the request envelope for a call to `url`.
pub fn encode_call<Req: Message>(
    codec: &dyn HeaderCodec,
    url: &str,
    request: &Req,
) -> Result<Envelope, Status> {
    let header = codec
        .serialize_request_header(&RequestHeader::new(url))
        .map_err(|e| Status::invalid_argument(format!("cannot encode request header: {}", e)))?;
    let body = request
        .encode()
        .map_err(|e| Status::invalid_argument(format!("cannot serialize request: {}", e)))?;
    Ok(Envelope::new(header, body))
}

/// Interprets a reply envelope: the header status first, then the body.
pub fn decode_reply<Resp: Message>(codec: &dyn HeaderCodec, reply: &Envelope) -> Result<Resp, Status> {
    if reply.header().is_empty() {
        return Err(Status::unknown("server returned empty header"));
    }
    let header = codec
        .deserialize_reply_header(reply.header())
        .map_err(|_| Status::unknown("server returned bad header"))?;
    let status = header.to_status().ok_or_else(|| {
        Status::unknown(format!(
            "reply header has unknown status code: {}",
            header.status_code
        ))
    })?;
    status.into_result()?;

    Resp::decode(reply.body()).map_err(|_| Status::unknown("server returned bad body"))
}

/// Encodes `request` for `url` and starts the transport request.
pub fn exec_client_begin<Req: Message>(
    client: &dyn TransportClient,
    codec: &dyn HeaderCodec,
    url: &str,
    request: &Req,
    timeout: Duration,
    callback: CallbackRef,
) -> Result<Context, Status> {
    let message = encode_call(codec, url, request)?;
    client
        .begin_request(&message, timeout, callback)
        .map_err(|e| {
            tracing::debug!("{}: begin request failed: {}", url, e);
            Status::from(e)
        })
}

/// Collects the reply of a completed request and decodes the response.
pub fn exec_client_end<Resp: Message>(
    client: &dyn TransportClient,
    codec: &dyn HeaderCodec,
    context: &Context,
) -> Result<Resp, Status> {
    let reply = client.end_request(context).map_err(|e| {
        tracing::debug!("End request failed: {}", e);
        Status::from(e)
    })?;
    decode_reply(codec, &reply)
}

/// Runs one call to completion, blocking the calling thread.
pub fn call<Req: Message, Resp: Message>(
    client: &dyn TransportClient,
    codec: &dyn HeaderCodec,
    url: &str,
    request: &Req,
    timeout: Duration,
) -> Result<Resp, Status> {
    let waiter = WaitableCallback::new();
    let _pending = exec_client_begin(client, codec, url, request, timeout, waiter.clone())?;
    let completed = waiter.wait();
    exec_client_end(client, codec, &completed)
}

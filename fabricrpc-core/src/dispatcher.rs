//! Request dispatcher.
//!
//! [`RequestDispatcher`] is the [`RequestHandler`] a transport listener
//! calls into. Begin decodes the request header, routes the url and starts
//! the user's begin operation; end runs the routed end operation and builds
//! the reply.
//!
//! Every begin hands the transport an outer context of kind
//! [`ContextPayload::Dispatch`] that carries what end needs: the begin-phase
//! error if there was one, otherwise the end operation and, once the user's
//! operation completes, the user's (inner) context.
//!
//! Success path: the user's begin operation gets a proxy callback instead of
//! the transport's. When the user completes the inner context, possibly
//! inline before begin has even returned, the proxy records the inner
//! context on the outer one and only then completes the outer context,
//! which fires the transport's callback. The proxy drops its reference to
//! the outer context as it fires.
//!
//! Error path: nothing user-supplied exists to hang the error on, so an
//! already complete inner context is made up and the outer context is
//! completed right away. The transport's callback fires exactly once.

use crate::error::CoreError;
use crate::router::{MiddleWare, Route, Router};
use bytes::Bytes;
use fabricrpc_protocol::{
    Envelope, HeaderCodec, ProtoHeaderCodec, ReplyHeader, Status, TransportMessage,
};
use fabricrpc_transport::{
    Callback, CallbackRef, ClientId, Context, ContextPayload, DispatchState, EndFn,
    OperationContext, RequestHandler, TransportError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Routes transport requests to registered services.
pub struct RequestDispatcher {
    router: Arc<dyn MiddleWare>,
    codec: Arc<dyn HeaderCodec>,
}

impl RequestDispatcher {
    /// Builds a dispatcher over `services`, tried in order.
    pub fn new(services: Vec<Arc<dyn MiddleWare>>) -> Result<Self, CoreError> {
        if services.is_empty() {
            return Err(CoreError::NoServices);
        }
        let router = services
            .into_iter()
            .fold(Router::new(), |router, service| router.with_service(service));
        Ok(Self::with_router(Arc::new(router)))
    }

    /// Uses `router` as is, with the protobuf header codec.
    pub fn with_router(router: Arc<dyn MiddleWare>) -> Self {
        Self {
            router,
            codec: Arc::new(ProtoHeaderCodec),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn HeaderCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn codec(&self) -> &Arc<dyn HeaderCodec> {
        &self.codec
    }

    fn resolve(&self, header: &[u8]) -> Result<(String, Route), Status> {
        if header.is_empty() {
            return Err(Status::invalid_argument("fabric rpc header is empty"));
        }
        let request_header = self.codec.deserialize_request_header(header).map_err(|e| {
            tracing::debug!("Cannot parse request header: {}", e);
            Status::invalid_argument("cannot parse fabric rpc header")
        })?;
        let route = self.router.route(&request_header.url)?;
        Ok((request_header.url, route))
    }

    /// Completes a call that failed before reaching user code.
    fn fail(&self, error: Status, callback: CallbackRef) -> Context {
        tracing::debug!("Request failed before dispatch: {}", error);
        let inner = OperationContext::ready(ContextPayload::Empty, None);
        inner.complete();
        let outer = OperationContext::ready(
            ContextPayload::Dispatch(DispatchState::failed(error, inner)),
            Some(callback),
        );
        outer.complete();
        outer
    }

    /// Builds a reply envelope carrying `status`. A status that cannot be
    /// encoded is replaced by an Internal one.
    fn reply(&self, status: &Status, body: Bytes) -> Envelope {
        match self
            .codec
            .serialize_reply_header(&ReplyHeader::from_status(status))
        {
            Ok(header) => Envelope::new(header, body),
            Err(e) => {
                tracing::error!("Cannot serialize reply header: {}", e);
                let fallback = Status::internal("cannot serialize reply header");
                let header = self
                    .codec
                    .serialize_reply_header(&ReplyHeader::from_status(&fallback))
                    .unwrap_or_default();
                Envelope::new(header, Bytes::new())
            }
        }
    }
}

/// Stands in for the transport's callback while user code runs.
struct ProxyCallback {
    outer: Mutex<Option<Context>>,
}

impl ProxyCallback {
    fn new(outer: Context) -> Arc<Self> {
        Arc::new(Self {
            outer: Mutex::new(Some(outer)),
        })
    }

    /// Releases the outer context without completing it. Returns `false` if
    /// the proxy already fired.
    fn disarm(&self) -> bool {
        self.outer.lock().take().is_some()
    }
}

impl Callback for ProxyCallback {
    fn invoke(&self, inner: &Context) {
        let Some(outer) = self.outer.lock().take() else {
            return;
        };
        if let Some(state) = outer.dispatch() {
            if let Err(e) = state.set_inner(inner) {
                tracing::error!("Completion reported with a foreign context: {}", e);
            }
        }
        outer.complete();
    }
}

impl RequestHandler for RequestDispatcher {
    fn begin_process_request(
        &self,
        client_id: ClientId,
        message: &dyn TransportMessage,
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, TransportError> {
        let envelope = Envelope::copy_from(message);

        let (url, route) = match self.resolve(envelope.header()) {
            Ok(resolved) => resolved,
            Err(status) => return Ok(self.fail(status, callback)),
        };
        tracing::debug!("[{}] Request: {}", client_id, url);

        let end_operation = route.end.clone();
        let end: EndFn = Box::new(move |inner: &Context| end_operation.invoke(inner));
        let outer = OperationContext::pending(
            ContextPayload::Dispatch(DispatchState::routed(end)),
            Some(callback),
        );
        let proxy = ProxyCallback::new(outer.clone());

        match route.begin.invoke(envelope.body(), timeout, proxy.clone()) {
            Ok(inner) => {
                if let Some(state) = outer.dispatch() {
                    if let Err(e) = state.set_inner(&inner) {
                        tracing::error!(
                            "[{}] {}: begin returned a foreign context: {}",
                            client_id,
                            url,
                            e
                        );
                    }
                }
                Ok(outer)
            }
            Err(status) => {
                if !proxy.disarm() {
                    tracing::warn!(
                        "[{}] {}: begin failed after completing its context, keeping the completion",
                        client_id,
                        url
                    );
                    return Ok(outer);
                }
                tracing::debug!("[{}] {}: begin failed: {}", client_id, url, status);
                if let Some(state) = outer.dispatch() {
                    state.record_failure(status);
                    let inner = OperationContext::ready(ContextPayload::Empty, None);
                    inner.complete();
                    let _ = state.set_inner(&inner);
                }
                outer.complete();
                Ok(outer)
            }
        }
    }

    fn end_process_request(&self, context: &Context) -> Result<Envelope, TransportError> {
        let state = context
            .dispatch()
            .ok_or(TransportError::InvalidContext("not a dispatch context"))?;

        if let Some(error) = state.begin_error() {
            return Ok(self.reply(&error, Bytes::new()));
        }

        let end = state
            .take_end()
            .ok_or(TransportError::InvalidContext("request already ended"))?;
        let inner = state
            .inner()
            .ok_or(TransportError::InvalidContext("request has not completed"))?;

        match end(&inner) {
            Ok(body) => Ok(self.reply(&Status::ok(), body)),
            Err(status) => {
                tracing::debug!("Request ended with {}", status);
                Ok(self.reply(&status, Bytes::new()))
            }
        }
    }

    fn handle_one_way(
        &self,
        client_id: ClientId,
        message: &dyn TransportMessage,
    ) -> Result<(), TransportError> {
        tracing::debug!(
            "[{}] Dropping one-way message ({} header bytes)",
            client_id,
            message.header().len()
        );
        Ok(())
    }
}

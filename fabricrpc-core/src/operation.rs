//! Begin/end operation wrappers.
//!
//! A service method is a pair of user handlers: a typed begin handler that
//! starts the work and returns a [`Context`], and a typed end handler that
//! turns the completed context into a typed response. The router stores
//! them type-erased behind [`BeginOperation`] and [`EndOperation`], which
//! take care of the bytes on either side.

use bytes::Bytes;
use fabricrpc_protocol::{Message, Status};
use fabricrpc_transport::{CallbackRef, Context};
use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// Parses a request body and starts the typed handler.
pub trait BeginOperation: Send + Sync {
    /// On success the returned context completes through `callback`. On
    /// failure the callback is never invoked.
    fn invoke(
        &self,
        body: &[u8],
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, Status>;
}

/// Finishes a completed call and serializes its response.
pub trait EndOperation: Send + Sync {
    fn invoke(&self, context: &Context) -> Result<Bytes, Status>;
}

/// What is left of `timeout` once `elapsed` has been spent. Never negative.
pub fn remaining_budget(timeout: Duration, elapsed: Duration) -> Duration {
    timeout.saturating_sub(elapsed)
}

/// Begin operation for requests of type `Req`.
pub struct TypedBeginOperation<Req, F> {
    handler: F,
    _request: PhantomData<fn() -> Req>,
}

impl<Req, F> TypedBeginOperation<Req, F>
where
    Req: Message,
    F: Fn(Req, Duration, CallbackRef) -> Result<Context, Status> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _request: PhantomData,
        }
    }
}

impl<Req, F> BeginOperation for TypedBeginOperation<Req, F>
where
    Req: Message,
    F: Fn(Req, Duration, CallbackRef) -> Result<Context, Status> + Send + Sync,
{
    fn invoke(
        &self,
        body: &[u8],
        timeout: Duration,
        callback: CallbackRef,
    ) -> Result<Context, Status> {
        let started = Instant::now();
        let request = Req::decode(body).map_err(|e| {
            tracing::debug!("Cannot parse request body: {}", e);
            Status::invalid_argument("cannot parse body")
        })?;
        // Time spent parsing counts against the caller's deadline.
        let budget = remaining_budget(timeout, started.elapsed());
        (self.handler)(request, budget, callback)
    }
}

/// End operation producing responses of type `Resp`.
pub struct TypedEndOperation<Resp, F> {
    handler: F,
    _response: PhantomData<fn() -> Resp>,
}

impl<Resp, F> TypedEndOperation<Resp, F>
where
    Resp: Message,
    F: Fn(&Context) -> Result<Resp, Status> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _response: PhantomData,
        }
    }
}

impl<Resp, F> EndOperation for TypedEndOperation<Resp, F>
where
    Resp: Message,
    F: Fn(&Context) -> Result<Resp, Status> + Send + Sync,
{
    fn invoke(&self, context: &Context) -> Result<Bytes, Status> {
        let response = (self.handler)(context)?;
        let body = response.encode().map_err(|e| {
            tracing::warn!("Cannot serialize response body: {}", e);
            Status::internal("cannot serialize body")
        })?;
        Ok(Bytes::from(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabricrpc_protocol::{CodecError, Json, StatusCode};
    use fabricrpc_transport::{ContextPayload, OperationContext};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;

    fn noop_callback() -> CallbackRef {
        Arc::new(|_: &Context| {})
    }

    /// Decodes slowly, to stand in for an expensive parse.
    struct SlowDecode;

    impl Message for SlowDecode {
        fn decode(_bytes: &[u8]) -> Result<Self, CodecError> {
            thread::sleep(Duration::from_millis(30));
            Ok(SlowDecode)
        }

        fn encode(&self) -> Result<Vec<u8>, CodecError> {
            Ok(Vec::new())
        }
    }

    struct Unencodable;

    impl Message for Unencodable {
        fn decode(_bytes: &[u8]) -> Result<Self, CodecError> {
            Ok(Unencodable)
        }

        fn encode(&self) -> Result<Vec<u8>, CodecError> {
            Err(CodecError::Custom("unencodable".into()))
        }
    }

    #[test]
    fn test_remaining_budget_floors_at_zero() {
        let t = Duration::from_millis(100);
        assert_eq!(remaining_budget(t, Duration::from_millis(40)), Duration::from_millis(60));
        assert_eq!(remaining_budget(t, Duration::from_millis(250)), Duration::ZERO);
    }

    #[test]
    fn test_begin_passes_decremented_timeout() {
        let seen = Arc::new(Mutex::new(None));
        let recorder = seen.clone();
        let op = TypedBeginOperation::new(move |_: SlowDecode, timeout, callback| {
            *recorder.lock() = Some(timeout);
            Ok(OperationContext::pending(ContextPayload::Empty, Some(callback)))
        });

        // Decode delay longer than the caller's budget.
        op.invoke(b"", Duration::from_millis(10), noop_callback())
            .unwrap();
        assert_eq!(*seen.lock(), Some(Duration::ZERO));

        op.invoke(b"", Duration::from_secs(10), noop_callback())
            .unwrap();
        let budget = seen.lock().unwrap();
        assert!(budget < Duration::from_secs(10));
        assert!(budget > Duration::from_secs(9));
    }

    #[test]
    fn test_begin_rejects_bad_body_without_calling_handler() {
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let op = TypedBeginOperation::new(move |_: Json<String>, _, callback| {
            *flag.lock() = true;
            Ok(OperationContext::pending(ContextPayload::Empty, Some(callback)))
        });

        let err = op
            .invoke(b"not json", Duration::from_secs(1), noop_callback())
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert_eq!(err.message(), "cannot parse body");
        assert!(!*called.lock());
    }

    #[test]
    fn test_begin_propagates_handler_status() {
        let op = TypedBeginOperation::new(|_: Vec<u8>, _, _| {
            Err(Status::deadline_exceeded("too late"))
        });
        let err = op
            .invoke(b"x", Duration::from_secs(1), noop_callback())
            .unwrap_err();
        assert_eq!(err, Status::deadline_exceeded("too late"));
    }

    #[test]
    fn test_end_serializes_response() {
        let op = TypedEndOperation::new(|_: &Context| Ok(Json("hi".to_string())));
        let context = OperationContext::pending(ContextPayload::Empty, None);
        assert_eq!(op.invoke(&context).unwrap().as_ref(), b"\"hi\"");
    }

    #[test]
    fn test_end_propagates_handler_status() {
        let op = TypedEndOperation::new(|_: &Context| -> Result<Vec<u8>, Status> {
            Err(Status::not_found("no such item"))
        });
        let context = OperationContext::pending(ContextPayload::Empty, None);
        assert_eq!(
            op.invoke(&context).unwrap_err(),
            Status::not_found("no such item")
        );
    }

    #[test]
    fn test_end_serialize_failure_is_internal() {
        let op = TypedEndOperation::new(|_: &Context| Ok(Unencodable));
        let context = OperationContext::pending(ContextPayload::Empty, None);
        let err = op.invoke(&context).unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);
        assert_eq!(err.message(), "cannot serialize body");
    }
}

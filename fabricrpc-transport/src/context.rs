//! Operation contexts.
//!
//! An [`OperationContext`] represents one in-flight begin/end operation. It
//! is shared as [`Context`] (`Arc<OperationContext>`) between whoever starts
//! the operation and whoever finishes it.
//!
//! Rules every context follows:
//! - it completes at most once; [`OperationContext::complete`] is first-wins
//!   and later calls are no-ops
//! - completing invokes the registered callback exactly once
//! - the callback reference is dropped when it fires, so a callback that
//!   holds the context does not keep the pair alive
//!
//! What a context carries is a closed [`ContextPayload`]. Code that receives
//! a context back through a port matches on the payload and rejects kinds it
//! did not create.

use crate::error::TransportError;
use crate::port::ClientId;
use bytes::Bytes;
use fabricrpc_protocol::{Envelope, Status};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared handle to an in-flight operation.
pub type Context = Arc<OperationContext>;

/// Completion notification target.
pub trait Callback: Send + Sync {
    fn invoke(&self, context: &Context);
}

impl<F> Callback for F
where
    F: Fn(&Context) + Send + Sync,
{
    fn invoke(&self, context: &Context) {
        self(context)
    }
}

pub type CallbackRef = Arc<dyn Callback>;

/// Deferred end step of a routed call: produces the reply body or a status.
pub type EndFn = Box<dyn FnOnce(&Context) -> Result<Bytes, Status> + Send>;

/// What a context carries.
pub enum ContextPayload {
    Empty,
    /// Typed state owned by whoever created the context.
    Content(Box<dyn Any + Send + Sync>),
    /// Routing metadata threaded from a dispatcher's begin to its end.
    Dispatch(DispatchState),
    /// A request bound to a client connection, awaiting its reply.
    Request(RequestSlot),
}

impl fmt::Debug for ContextPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextPayload::Empty => write!(f, "Empty"),
            ContextPayload::Content(_) => write!(f, "Content"),
            ContextPayload::Dispatch(_) => write!(f, "Dispatch"),
            ContextPayload::Request(slot) => write!(f, "Request({})", slot.client_id),
        }
    }
}

/// One in-flight operation.
pub struct OperationContext {
    payload: ContextPayload,
    callback: Mutex<Option<CallbackRef>>,
    completed: AtomicBool,
    completed_synchronously: bool,
}

impl OperationContext {
    /// A context whose result will be produced later.
    pub fn pending(payload: ContextPayload, callback: Option<CallbackRef>) -> Context {
        Arc::new(Self {
            payload,
            callback: Mutex::new(callback),
            completed: AtomicBool::new(false),
            completed_synchronously: false,
        })
    }

    /// A context whose result is already available. The callback still fires
    /// only once [`complete`](Self::complete) is called.
    pub fn ready(payload: ContextPayload, callback: Option<CallbackRef>) -> Context {
        Arc::new(Self {
            payload,
            callback: Mutex::new(callback),
            completed: AtomicBool::new(false),
            completed_synchronously: true,
        })
    }

    /// Marks the context complete and fires its callback.
    ///
    /// Returns `true` for the call that completed it, `false` afterwards.
    pub fn complete(self: &Arc<Self>) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback.invoke(self);
        }
        true
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn completed_synchronously(&self) -> bool {
        self.completed_synchronously
    }

    /// Whether a callback is still registered (has not fired).
    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn payload(&self) -> &ContextPayload {
        &self.payload
    }

    /// Checked access to `Content` of type `T`.
    pub fn content<T: Any>(&self) -> Option<&T> {
        match &self.payload {
            ContextPayload::Content(content) => content.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn dispatch(&self) -> Option<&DispatchState> {
        match &self.payload {
            ContextPayload::Dispatch(state) => Some(state),
            _ => None,
        }
    }

    pub fn request_slot(&self) -> Option<&RequestSlot> {
        match &self.payload {
            ContextPayload::Request(slot) => Some(slot),
            _ => None,
        }
    }

    /// A pending context that will carry a `Result<T, TransportError>`.
    pub fn with_result<T: Send + 'static>(callback: CallbackRef) -> Context {
        Self::pending(
            ContextPayload::Content(Box::new(ResultCell::<T>::new())),
            Some(callback),
        )
    }

    /// A completed context carrying `result`. The callback has fired when
    /// this returns.
    pub fn completed_with<T: Send + 'static>(
        result: Result<T, TransportError>,
        callback: CallbackRef,
    ) -> Context {
        let cell = ResultCell::new();
        cell.set(result);
        let context = Self::ready(ContextPayload::Content(Box::new(cell)), Some(callback));
        context.complete();
        context
    }

    /// Stores the result of a [`with_result`](Self::with_result) context and
    /// completes it. Returns `false` if it was already finished.
    pub fn finish<T: Send + 'static>(self: &Arc<Self>, result: Result<T, TransportError>) -> bool {
        let Some(cell) = self.content::<ResultCell<T>>() else {
            tracing::error!("finish called on a context of kind {:?}", self.payload);
            return false;
        };
        if cell.set(result) {
            self.complete()
        } else {
            false
        }
    }

    /// Takes the result out of a finished [`with_result`](Self::with_result)
    /// context.
    pub fn take_result<T: Send + 'static>(&self) -> Result<T, TransportError> {
        let cell = self
            .content::<ResultCell<T>>()
            .ok_or(TransportError::InvalidContext("unexpected context kind"))?;
        cell.take()
            .ok_or(TransportError::InvalidContext("operation result not available"))?
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("payload", &self.payload)
            .field("completed", &self.is_completed())
            .field("completed_synchronously", &self.completed_synchronously)
            .finish()
    }
}

/// A result written once and read once.
pub struct ResultCell<T> {
    value: Mutex<Option<Result<T, TransportError>>>,
    written: AtomicBool,
}

impl<T> ResultCell<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            written: AtomicBool::new(false),
        }
    }

    /// Stores the result. Only the first write is kept.
    pub fn set(&self, result: Result<T, TransportError>) -> bool {
        if self.written.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.value.lock() = Some(result);
        true
    }

    pub fn is_set(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }

    pub fn take(&self) -> Option<Result<T, TransportError>> {
        self.value.lock().take()
    }
}

impl<T> Default for ResultCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Routing metadata a request dispatcher carries from begin to end.
pub struct DispatchState {
    begin_error: Mutex<Option<Status>>,
    end: Mutex<Option<EndFn>>,
    inner: Mutex<Option<Context>>,
}

impl DispatchState {
    /// State for a call that failed before reaching user code.
    pub fn failed(error: Status, inner: Context) -> Self {
        Self {
            begin_error: Mutex::new(Some(error)),
            end: Mutex::new(None),
            inner: Mutex::new(Some(inner)),
        }
    }

    /// State for a routed call whose inner context is not known yet.
    pub fn routed(end: EndFn) -> Self {
        Self {
            begin_error: Mutex::new(None),
            end: Mutex::new(Some(end)),
            inner: Mutex::new(None),
        }
    }

    pub fn begin_error(&self) -> Option<Status> {
        self.begin_error.lock().clone()
    }

    /// Records a begin-phase failure discovered after routing. Drops the
    /// end step so it can never run.
    pub fn record_failure(&self, error: Status) {
        self.end.lock().take();
        *self.begin_error.lock() = Some(error);
    }

    /// Records the inner context. Set-once: the same context again is a
    /// no-op returning `Ok(false)`, a different one is rejected.
    pub fn set_inner(&self, inner: &Context) -> Result<bool, TransportError> {
        let mut slot = self.inner.lock();
        match slot.as_ref() {
            None => {
                *slot = Some(inner.clone());
                Ok(true)
            }
            Some(existing) if Arc::ptr_eq(existing, inner) => Ok(false),
            Some(_) => Err(TransportError::InvalidContext(
                "inner context already set to a different context",
            )),
        }
    }

    pub fn inner(&self) -> Option<Context> {
        self.inner.lock().clone()
    }

    /// Takes the end step. Returns `Some` at most once.
    pub fn take_end(&self) -> Option<EndFn> {
        self.end.lock().take()
    }
}

/// A request bound to a client connection. The reply is written once by
/// whoever finishes the request and read once by the transport.
pub struct RequestSlot {
    client_id: ClientId,
    reply: ResultCell<Envelope>,
}

impl RequestSlot {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            reply: ResultCell::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn write_reply(&self, reply: Result<Envelope, TransportError>) -> bool {
        self.reply.set(reply)
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_set()
    }

    pub fn take_reply(&self) -> Option<Result<Envelope, TransportError>> {
        self.reply.take()
    }
}

/// Callback that lets a thread block until a context completes.
///
/// Completion may happen before [`wait`](Self::wait) is called; the wait
/// then returns immediately.
pub struct WaitableCallback {
    slot: Mutex<Option<Context>>,
    signal: Condvar,
}

impl WaitableCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            signal: Condvar::new(),
        })
    }

    /// Blocks until the callback fires and returns the completed context.
    pub fn wait(&self) -> Context {
        let mut slot = self.slot.lock();
        loop {
            if let Some(context) = slot.take() {
                return context;
            }
            self.signal.wait(&mut slot);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Context> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(context) = slot.take() {
                return Some(context);
            }
            if self.signal.wait_until(&mut slot, deadline).timed_out() {
                return slot.take();
            }
        }
    }
}

impl Callback for WaitableCallback {
    fn invoke(&self, context: &Context) {
        *self.slot.lock() = Some(context.clone());
        self.signal.notify_all();
    }
}

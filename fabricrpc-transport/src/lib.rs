//! # fabricrpc-transport
//!
//! The transport port fabricrpc is layered on.
//!
//! This crate provides:
//! - Operation contexts and completion callbacks for the begin/end model
//! - Blocking and async bridges that await one begin/end operation
//! - The port traits: transports, clients, listeners, request and
//!   connection handlers
//! - Transport settings and endpoints
//! - An in-process transport and a TCP transport

pub mod context;
pub mod error;
pub mod event;
pub mod mem;
pub mod port;
pub mod settings;
pub mod tcp;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{
    Callback, CallbackRef, Context, ContextPayload, DispatchState, EndFn, OperationContext,
    RequestSlot, ResultCell, WaitableCallback,
};
pub use error::TransportError;
pub use event::{complete_two_phase, Event};
pub use mem::{MemoryClient, MemoryListener, MemoryTransport};
pub use port::{
    await_two_phase, ClientId, ConnectionHandler, PeerConnection, RequestHandler, Transport,
    TransportClient, TransportListener,
};
pub use settings::{Endpoint, TransportSettings};
pub use tcp::{TcpClient, TcpTransport, TcpTransportListener};

//! # fabricrpc-core
//!
//! The routing and completion engine of fabricrpc, in the two-phase
//! begin/end style.
//!
//! This crate provides:
//! - Typed begin/end operation wrappers around user handlers
//! - URL routing over registered services
//! - The request dispatcher that plugs the router into a transport listener
//! - Client helpers that encode calls and interpret replies

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod operation;
pub mod router;

pub use client::{call, decode_reply, encode_call, exec_client_begin, exec_client_end};
pub use connection::AcceptAllConnections;
pub use dispatcher::RequestDispatcher;
pub use error::CoreError;
pub use operation::{
    remaining_budget, BeginOperation, EndOperation, TypedBeginOperation, TypedEndOperation,
};
pub use router::{MiddleWare, Route, Router, ServiceTable};

//! # fabricrpc-client
//!
//! Client library for fabricrpc.
//!
//! This crate provides:
//! - Awaitable client connections (open, send, one-way, close)
//! - Typed RPC calls that report every failure as a `Status`

pub mod client;
pub mod connection;
pub mod error;

pub use client::RpcClient;
pub use connection::{ClientConnection, ConnectionConfig};
pub use error::ClientError;

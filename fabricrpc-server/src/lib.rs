//! # fabricrpc-server
//!
//! Reactor-style server for fabricrpc.
//!
//! This crate provides:
//! - Cancel-safe item queues
//! - Connection manager with one request queue per client
//! - Acceptor and server connections over any transport
//! - Service middleware routing urls to async services
//! - Server loop with graceful shutdown
//! - YAML/env configuration and Prometheus metrics

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod middleware;
pub mod queue;
pub mod request;
pub mod server;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig};
pub use connection::{Acceptor, ServerConnection};
pub use error::ServerError;
pub use fabricrpc_transport::{complete_two_phase, Event};
pub use handler::QueueingHandler;
pub use manager::{ConnectionEntry, ConnectionManager};
pub use metrics::{run_metrics_server, Metrics};
pub use middleware::{handle_typed, MethodService, Service, ServiceMiddleware};
pub use queue::{ItemQueue, PopSlot, QueueClosed};
pub use request::Request;
pub use server::{Server, ServerConfig, ServerStats};

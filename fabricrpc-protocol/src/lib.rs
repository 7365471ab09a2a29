//! # fabricrpc-protocol
//!
//! Wire-level building blocks for fabricrpc.
//!
//! This crate provides:
//! - The RPC status model shared by clients and servers
//! - Request/reply headers behind a pluggable header codec
//! - Message envelopes (header bytes + body bytes)
//! - The typed payload capability used by operations
//! - Binary framing with CRC32C validation for stream transports

pub mod envelope;
pub mod error;
pub mod frame;
pub mod header;
pub mod message;
pub mod status;
pub mod wire;

pub use envelope::{ChunkedMessage, Envelope, TransportMessage};
pub use error::{CodecError, HeaderError, ProtocolError};
pub use frame::{Frame, FrameKind, FRAME_HEADER_SIZE, MAGIC};
pub use header::{HeaderCodec, JsonHeaderCodec, ProtoHeaderCodec, ReplyHeader, RequestHeader};
pub use message::{Json, Message};
pub use status::{Status, StatusCode};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for fabricrpc servers.
pub const DEFAULT_PORT: u16 = 7501;

/// Maximum frame section size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

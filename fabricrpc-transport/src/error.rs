//! Transport error types.

use fabricrpc_protocol::{ProtocolError, Status};
use thiserror::Error;

/// Native error codes reported alongside transport failures.
pub mod native {
    pub const IO: i32 = 5;
    pub const TOO_MANY_CALLS: i32 = 16;
    pub const INVALID_CONTEXT: i32 = 22;
    pub const PROTOCOL: i32 = 71;
    pub const MESSAGE_TOO_LARGE: i32 = 90;
    pub const ADDRESS_IN_USE: i32 = 98;
    pub const INVALID_ADDRESS: i32 = 99;
    pub const CLOSED: i32 = 104;
    pub const TIMEOUT: i32 = 110;
    pub const CONNECTION_REFUSED: i32 = 111;
    pub const CANCELLED: i32 = 125;
}

/// Failures raised by the transport substrate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("address already in use: {0}")]
    AddressInUse(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("connection closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("too many concurrent calls (max {0})")]
    TooManyCalls(u32),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid operation context: {0}")]
    InvalidContext(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("remote transport error {code}: {message}")]
    Remote { code: i32, message: String },
}

impl TransportError {
    /// The substrate-native code for this failure.
    pub fn native_code(&self) -> i32 {
        match self {
            TransportError::Timeout => native::TIMEOUT,
            TransportError::ConnectionRefused(_) => native::CONNECTION_REFUSED,
            TransportError::AddressInUse(_) => native::ADDRESS_IN_USE,
            TransportError::InvalidAddress(_) => native::INVALID_ADDRESS,
            TransportError::Closed => native::CLOSED,
            TransportError::Cancelled => native::CANCELLED,
            TransportError::TooManyCalls(_) => native::TOO_MANY_CALLS,
            TransportError::MessageTooLarge { .. } => native::MESSAGE_TOO_LARGE,
            TransportError::InvalidContext(_) => native::INVALID_CONTEXT,
            TransportError::Protocol(_) => native::PROTOCOL,
            TransportError::Io(_) => native::IO,
            TransportError::Remote { code, .. } => *code,
        }
    }

    /// Rebuilds an error from a native code received from a peer.
    pub fn from_native(code: i32, message: String) -> Self {
        match code {
            native::TIMEOUT => TransportError::Timeout,
            native::CLOSED => TransportError::Closed,
            native::CANCELLED => TransportError::Cancelled,
            _ => TransportError::Remote { code, message },
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => TransportError::Timeout,
            ErrorKind::ConnectionRefused => TransportError::ConnectionRefused(err.to_string()),
            ErrorKind::AddrInUse => TransportError::AddressInUse(err.to_string()),
            ErrorKind::AddrNotAvailable | ErrorKind::InvalidInput => {
                TransportError::InvalidAddress(err.to_string())
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(io) => io.into(),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        Status::transport(err.native_code(), err.to_string())
    }
}

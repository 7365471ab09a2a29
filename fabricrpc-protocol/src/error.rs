//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while framing messages on a byte stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'FRPC', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame kind: {0:#x}")]
    InvalidKind(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by a [`HeaderCodec`](crate::header::HeaderCodec).
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("malformed header: {0}")]
    Malformed(&'static str),

    #[error("invalid UTF-8 in header field")]
    InvalidUtf8,

    #[error("status message must not be empty")]
    EmptyStatusMessage,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors produced while converting typed payloads to and from bytes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("{0}")]
    Custom(String),
}

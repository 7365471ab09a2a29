//! RPC status model.
//!
//! Every call completes with exactly one [`Status`]. A status is "failed"
//! iff its code is not [`StatusCode::Ok`]. Failures raised by the transport
//! substrate carry [`StatusCode::TransportError`] plus the substrate's native
//! error code, so callers can tell them apart from application failures.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status codes carried in reply headers.
///
/// The numeric values are part of the wire contract and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    Unimplemented = 12,
    Internal = 13,
    TransportError = 50,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Maps a wire value back to a code. Unknown values yield `None`.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(StatusCode::Ok),
            2 => Some(StatusCode::Unknown),
            3 => Some(StatusCode::InvalidArgument),
            4 => Some(StatusCode::DeadlineExceeded),
            5 => Some(StatusCode::NotFound),
            12 => Some(StatusCode::Unimplemented),
            13 => Some(StatusCode::Internal),
            50 => Some(StatusCode::TransportError),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::Unknown => write!(f, "UNKNOWN"),
            StatusCode::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            StatusCode::DeadlineExceeded => write!(f, "DEADLINE_EXCEEDED"),
            StatusCode::NotFound => write!(f, "NOT_FOUND"),
            StatusCode::Unimplemented => write!(f, "UNIMPLEMENTED"),
            StatusCode::Internal => write!(f, "INTERNAL"),
            StatusCode::TransportError => write!(f, "TRANSPORT_ERROR"),
        }
    }
}

/// Outcome of an RPC call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: StatusCode,
    message: String,
    transport_code: Option<i32>,
}

impl Status {
    /// The success status: code `Ok`, message `"OK"`.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "OK")
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            transport_code: None,
        }
    }

    /// A failure reported by the transport substrate.
    pub fn transport(native_code: i32, message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::TransportError,
            message: message.into(),
            transport_code: Some(native_code),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unknown, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transport_error(&self) -> bool {
        self.code == StatusCode::TransportError
    }

    /// The substrate's native error code, for transport failures.
    pub fn transport_error_code(&self) -> Option<i32> {
        self.transport_code
    }

    /// Converts into `Ok(())` for a success status, `Err(self)` otherwise.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

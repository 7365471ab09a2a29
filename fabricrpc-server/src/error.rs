//! Server error types.

use fabricrpc_transport::{ClientId, TransportError};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unknown connection: {0}")]
    UnknownConnection(ClientId),

    #[error("duplicate connection: {0}")]
    DuplicateConnection(ClientId),

    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),

    #[error("no services registered")]
    NoServices,

    #[error("server already running")]
    AlreadyRunning,

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// The transport failure reported to a peer for this error.
    pub fn to_transport_error(&self) -> TransportError {
        match self {
            ServerError::Transport(e) => e.clone(),
            ServerError::Io(e) => TransportError::Io(e.to_string()),
            ServerError::ConnectionClosed | ServerError::UnknownConnection(_) => {
                TransportError::Closed
            }
            ServerError::ConnectionLimit(_) | ServerError::DuplicateConnection(_) => {
                TransportError::ConnectionRefused(self.to_string())
            }
            ServerError::ShuttingDown => TransportError::Cancelled,
            ServerError::NoServices | ServerError::AlreadyRunning => {
                TransportError::Protocol(self.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_mapping() {
        assert_eq!(
            ServerError::ConnectionClosed.to_transport_error(),
            TransportError::Closed
        );
        assert_eq!(
            ServerError::Transport(TransportError::Timeout).to_transport_error(),
            TransportError::Timeout
        );
        assert!(matches!(
            ServerError::ConnectionLimit(3).to_transport_error(),
            TransportError::ConnectionRefused(_)
        ));
    }
}

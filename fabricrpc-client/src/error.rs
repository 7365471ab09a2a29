//! Client error types.

use fabricrpc_protocol::Status;
use fabricrpc_transport::TransportError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::NotConnected
                | ClientError::Transport(TransportError::Timeout)
                | ClientError::Transport(TransportError::Closed)
                | ClientError::Transport(TransportError::ConnectionRefused(_))
                | ClientError::Transport(TransportError::TooManyCalls(_))
        )
    }
}

impl From<ClientError> for Status {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Transport(e) => Status::from(e),
            ClientError::NotConnected => Status::from(TransportError::Closed),
            ClientError::AlreadyConnected => Status::internal("already connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_keeps_transport_code() {
        let status = Status::from(ClientError::Transport(TransportError::Timeout));
        assert!(status.is_transport_error());
        assert_eq!(
            status.transport_error_code(),
            Some(TransportError::Timeout.native_code())
        );

        let status = Status::from(ClientError::NotConnected);
        assert_eq!(
            status.transport_error_code(),
            Some(TransportError::Closed.native_code())
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ClientError::NotConnected.is_retryable());
        assert!(ClientError::Transport(TransportError::Timeout).is_retryable());
        assert!(!ClientError::AlreadyConnected.is_retryable());
        assert!(!ClientError::Transport(TransportError::InvalidAddress("x".into())).is_retryable());
    }
}

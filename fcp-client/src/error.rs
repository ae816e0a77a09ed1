//! Client error types.

use fcp_protocol::Failure;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] fcp_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("node reported {0}")]
    Failure(Box<Failure>),

    #[error("{message} is missing attribute {attribute}")]
    MissingAttribute {
        message: String,
        attribute: &'static str,
    },
}

impl From<Failure> for ClientError {
    fn from(failure: Failure) -> Self {
        ClientError::Failure(Box::new(failure))
    }
}

impl ClientError {
    /// Returns whether this error is retryable.
    ///
    /// The client never retries by itself; this is advice for callers.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            _ => false,
        }
    }

    /// Returns the node's failure, if this error carries one.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ClientError::Failure(failure) => Some(&**failure),
            _ => None,
        }
    }

    /// Returns the node's failure code, if this error carries one.
    pub fn code(&self) -> Option<i32> {
        self.failure().map(|failure| failure.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcp_protocol::{FailureKind, Message};

    #[test]
    fn test_failure_conversion() {
        let msg = Message::new("PutFailed")
            .with("Code", "9")
            .with("CodeDescription", "Route not found");
        let err: ClientError = Failure::from_message(&msg).unwrap().into();

        assert_eq!(err.code(), Some(9));
        assert_eq!(err.failure().unwrap().kind, FailureKind::Put);
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "node reported put failed with code 9: Route not found"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());
        assert!(ClientError::NotConnected.failure().is_none());
    }
}

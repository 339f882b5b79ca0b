//! Error taxonomy shared by the server and client crates.

use thiserror::Error;

use crate::{protocol::ErrorObject, store::StoreError};

/// Failure writing to a physical channel.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Channel write failed: {0}")]
    Write(String),
}

/// Failure of a client-side transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Why a correlated request did not produce a result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("Remote error: {0}")]
    Rpc(ErrorObject),
    #[error("Request cancelled: {0}")]
    Cancelled(String),
    #[error("Request hanged: {0}")]
    Hanged(String),
}

/// Session-level error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Request cancelled: {0}")]
    Cancelled(String),
    #[error("Request hanged: {0}")]
    Hanged(String),
    #[error("Remote error: {0}")]
    Remote(ErrorObject),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl SessionError {
    /// Map onto the JSON-RPC error object sent back to the peer.
    #[must_use]
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            Self::NotFound(_) => ErrorObject::new(ErrorObject::NOT_FOUND, self.to_string()),
            Self::Forbidden(_) => ErrorObject::new(ErrorObject::FORBIDDEN, self.to_string()),
            Self::InvalidRequest(_) => {
                ErrorObject::new(ErrorObject::INVALID_REQUEST, self.to_string())
            }
            Self::Cancelled(_) => ErrorObject::new(ErrorObject::REQUEST_CANCELLED, self.to_string()),
            Self::Hanged(_) => ErrorObject::new(ErrorObject::REQUEST_HANGED, self.to_string()),
            Self::Remote(error) => error.clone(),
            Self::Internal(_) | Self::Store(_) | Self::Channel(_) => {
                ErrorObject::new(ErrorObject::INTERNAL_ERROR, self.to_string())
            }
        }
    }

    /// True for handshake and session-identifier validation failures.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::NotFound(_) | Self::Forbidden(_)
        )
    }
}

impl From<RequestError> for SessionError {
    fn from(error: RequestError) -> Self {
        match error {
            RequestError::Rpc(obj) => Self::Remote(obj),
            RequestError::Cancelled(reason) => Self::Cancelled(reason),
            RequestError::Hanged(reason) => Self::Hanged(reason),
        }
    }
}

impl From<ErrorObject> for SessionError {
    fn from(error: ErrorObject) -> Self {
        Self::Remote(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SessionError::Forbidden("x".into()).to_error_object().code,
            ErrorObject::FORBIDDEN
        );
        assert_eq!(
            SessionError::InvalidRequest("x".into()).to_error_object().code,
            ErrorObject::INVALID_REQUEST
        );
        let remote = ErrorObject::new(-7, "custom");
        assert_eq!(SessionError::Remote(remote.clone()).to_error_object(), remote);
    }

    #[test]
    fn test_validation_classification() {
        assert!(SessionError::NotFound("s".into()).is_validation());
        assert!(!SessionError::Internal("boom".into()).is_validation());
    }
}

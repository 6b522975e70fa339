//! Diagnostic layer errors

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the codec and the vehicle client.
///
/// These reach callers unchanged; the client never retries on its own.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObdError {
    #[error("Adapter not connected")]
    NotConnected,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No data")]
    NoData,

    /// ECU answered with a negative response (`7F <service> <nrc>`)
    #[error("Negative response 0x{nrc:02X} for service 0x{service:02X}")]
    Rejected { service: u8, nrc: u8 },

    #[error("Response timeout")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// Another owner holds the vehicle session
    #[error("Vehicle session busy ({0})")]
    Busy(String),

    #[error("Vehicle client is shut down")]
    ClientClosed,
}

impl ObdError {
    /// Whether the failure means the adapter link is gone
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ObdError::NotConnected
                | ObdError::Transport(TransportError::ConnectionClosed)
                | ObdError::Transport(TransportError::ConnectionFailed(_))
        )
    }
}

impl From<TransportError> for ObdError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => ObdError::NotConnected,
            TransportError::Timeout(_) => ObdError::Timeout,
            other => ObdError::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_not_connected_maps_to_protocol_error() {
        let err: ObdError = TransportError::NotConnected.into();
        assert_eq!(err, ObdError::NotConnected);
        assert!(err.is_connection_loss());
    }

    #[test]
    fn test_closed_link_is_connection_loss() {
        let err: ObdError = TransportError::ConnectionClosed.into();
        assert!(err.is_connection_loss());
        assert!(!ObdError::NoData.is_connection_loss());
    }
}

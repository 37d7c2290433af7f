//! Error types for the courier client.

use std::time::Duration;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, CourierError>;

/// Errors that can occur during client operations.
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    /// Queue or event name is not part of the client configuration.
    #[error("invalid queue: {0}")]
    InvalidQueue(String),

    /// Payload is not valid JSON.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Channel-bound operation invoked before a channel exists.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Client options failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Broker transport reported a failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Transport call did not complete within the configured bound.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// A concurrent connect attempt failed before reaching ready.
    #[error("connection attempt aborted")]
    ConnectionAborted,

    /// One or both close steps failed.
    #[error("close failed: {}", .0.join("; "))]
    Close(Vec<String>),
}

impl CourierError {
    /// Returns true for errors caused by calling the client incorrectly.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            CourierError::InvalidQueue(_)
                | CourierError::InvalidPayload(_)
                | CourierError::Config(_)
        )
    }

    /// Returns true for errors reported by or on the way to the broker.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            CourierError::Transport(_)
                | CourierError::Timeout { .. }
                | CourierError::ConnectionAborted
                | CourierError::ChannelUnavailable(_)
        )
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for CourierError {
    fn from(err: lapin::Error) -> Self {
        CourierError::Transport(err.to_string())
    }
}

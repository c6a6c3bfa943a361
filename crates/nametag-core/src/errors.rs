//! Error types for the nametag relay client
//!
//! `Rejected` publishes and empty query results are not errors. They travel as
//! ordinary values (`PublishOutcome`, `Option<Event>`). Everything here is a
//! genuine fault: bad input, failed signing, a broken transport, a malformed
//! frame, an expired deadline or a dropped connection.

use std::time::Duration;

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Socket-level failures reported by a relay connector or connection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to relay {url}: {reason}")]
    ConnectFailed { url: String, reason: String },
    #[error("Handshake with {url} timed out after {duration_ms}ms")]
    HandshakeTimeout { url: String, duration_ms: u64 },
    #[error("Invalid relay URL: {url}")]
    InvalidUrl { url: String },
    #[error("Not connected to relay {url}")]
    NotConnected { url: String },
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },
    #[error("Connection closed: {reason}")]
    Closed { reason: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Errors surfaced by signing, encoding and relay operations
#[derive(Debug, thiserror::Error)]
pub enum NametagError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{operation} {correlation_id} got no response within {}ms", .duration.as_millis())]
    Timeout {
        operation: &'static str,
        correlation_id: String,
        duration: Duration,
    },

    #[error("Connection to {url} lost: {reason}")]
    ConnectionLost { url: String, reason: String },

    #[error("Subscription {subscription_id} closed by relay: {message}")]
    SubscriptionClosed {
        subscription_id: String,
        message: String,
    },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl NametagError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    pub fn connection_lost(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout { .. } | Self::ConnectionLost { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, NametagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(NametagError::connection_lost("ws://a", "reset").is_retryable());
        assert!(NametagError::Timeout {
            operation: "query",
            correlation_id: "abc".into(),
            duration: Duration::from_millis(5),
        }
        .is_retryable());
        assert!(!NametagError::invalid_input("short key").is_retryable());
        assert!(!NametagError::protocol("bad frame").is_retryable());
    }

    #[test]
    fn test_timeout_display() {
        let err = NametagError::Timeout {
            operation: "publish",
            correlation_id: "ff00".into(),
            duration: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "publish ff00 got no response within 1500ms");
    }
}

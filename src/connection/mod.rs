//! Realtime connection to the remote speech service
//!
//! Owns exactly one logical WebSocket to the service and keeps it alive.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager ──connect()──▶ Connector (WebSocket) ──▶ Socket
//!        │                                                     │
//!        │◀──────────── inbound frames (reader task) ──────────┘
//!        │
//!        ├─▶ ConnectionEvent handlers (open/message/close/error/state)
//!        └─▶ watch<ConnectionState>
//! ```
//!
//! # Reconnect Strategy
//!
//! - Unexpected closes reconnect with exponential backoff (base × 2^(n−1))
//! - The attempt counter only resets on a successful connect
//! - Reaching the attempt ceiling leaves the manager in `Error`

mod config;
mod manager;
mod protocol;
mod transport;

pub use config::{get_api_key, ConnectionConfig, DEFAULT_ENDPOINT, DEFAULT_MODEL};
pub use manager::{
    ConnectionEvent, ConnectionManager, ConnectionState, EventHandler, EventKind,
};
pub use protocol::{
    ClientMessage, ErrorInfo, RemoteSession, ServerMessage, SessionConfig, TranscriptionConfig,
    TurnDetection,
};
pub use transport::{ConnectRequest, Connector, Frame, Socket, WebSocketConnector};

/// Errors that can occur on the realtime connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Missing or malformed construction parameter
    Config(String),
    /// Credential does not have the expected shape, or the server rejected it
    Authentication(String),
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// Connection was not established within the configured budget
    Timeout(u64),
    /// Operation requires an open connection
    NotConnected,
    /// Failed to hand a frame to the socket
    SendFailed(String),
    /// Inbound frame could not be parsed
    Parse(String),
    /// Outbound message could not be encoded, or the server reported an error
    Protocol(String),
    /// Reconnect ceiling reached, no further attempts will be made
    ReconnectExhausted(u32),
}

impl ConnectionError {
    /// Whether a reconnect attempt may fix this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed(_) | ConnectionError::Timeout(_)
        )
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Config(e) => write!(f, "Invalid connection configuration: {}", e),
            ConnectionError::Authentication(e) => write!(f, "Authentication failed: {}", e),
            ConnectionError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to realtime service: {}", e)
            }
            ConnectionError::Timeout(ms) => {
                write!(f, "Connection timed out after {}ms", ms)
            }
            ConnectionError::NotConnected => write!(f, "Not connected to realtime service"),
            ConnectionError::SendFailed(e) => write!(f, "Failed to send message: {}", e),
            ConnectionError::Parse(e) => write!(f, "Failed to parse server message: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Realtime protocol error: {}", e),
            ConnectionError::ReconnectExhausted(attempts) => write!(
                f,
                "Connection lost and {} reconnect attempts failed; giving up",
                attempts
            ),
        }
    }
}

impl std::error::Error for ConnectionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::Timeout(10_000);
        assert!(err.to_string().contains("10000ms"));

        let err = ConnectionError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = ConnectionError::ReconnectExhausted(5);
        assert!(err.to_string().contains("5 reconnect attempts"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ConnectionError::Timeout(1).is_retryable());
        assert!(ConnectionError::ConnectionFailed("x".into()).is_retryable());
        assert!(!ConnectionError::Authentication("x".into()).is_retryable());
        assert!(!ConnectionError::NotConnected.is_retryable());
    }
}

//! Transport error types
//!
//! Every failure surfaced by a transport carries a numeric code and a
//! human-readable message. Codes follow the JSON-RPC 2.0 convention, with the
//! transport-specific range living between -32000 and -32099.

use std::time::Duration;
use thiserror::Error;

/// Error codes for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpErrorCode {
    /// Spawn or dial failure
    ConnectionError = -32000,
    /// Write or framing failure on an established channel
    TransportError = -32001,
    /// Malformed stream data
    ProtocolError = -32002,
    /// Deadline elapsed
    TimeoutError = -32003,
    /// Operation cancelled by `close()`
    CancelledError = -32004,
    /// Invalid configuration
    ConfigError = -32006,
    /// Operation requires a connected transport
    NotConnected = -32011,
    /// Peer answered with a non-success HTTP status
    HttpStatus = -32012,
}

impl McpErrorCode {
    /// Returns the numeric code value
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

/// Transport error with structured code and message.
#[derive(Debug, Error)]
pub enum McpError {
    /// The underlying resource could not be created or never became ready
    #[error("Connection error: {message}")]
    Connection {
        code: i32,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A write could not be delivered or a frame could not be handled
    #[error("Transport error: {message}")]
    Transport {
        code: i32,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The transport is not in the `Connected` state
    #[error("Not connected: {message}")]
    NotConnected { code: i32, message: String },

    /// The peer answered with a non-success HTTP status
    #[error("HTTP error {status}: {message}")]
    Http {
        code: i32,
        message: String,
        status: u16,
    },

    /// Malformed data on the wire
    #[error("Protocol error: {message}")]
    Protocol { code: i32, message: String },

    /// Deadline elapsed
    #[error("Timeout after {duration:?}: {message}")]
    Timeout {
        code: i32,
        message: String,
        duration: Duration,
    },

    /// Operation was cancelled
    #[error("Cancelled: {message}")]
    Cancelled {
        code: i32,
        message: String,
        reason: Option<String>,
    },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config { code: i32, message: String },
}

impl McpError {
    /// Returns the error code
    pub fn code(&self) -> i32 {
        match self {
            Self::Connection { code, .. }
            | Self::Transport { code, .. }
            | Self::NotConnected { code, .. }
            | Self::Http { code, .. }
            | Self::Protocol { code, .. }
            | Self::Timeout { code, .. }
            | Self::Cancelled { code, .. }
            | Self::Config { code, .. } => *code,
        }
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Connection { message, .. }
            | Self::Transport { message, .. }
            | Self::NotConnected { message, .. }
            | Self::Http { message, .. }
            | Self::Protocol { message, .. }
            | Self::Timeout { message, .. }
            | Self::Cancelled { message, .. }
            | Self::Config { message, .. } => message,
        }
    }

    /// True for deadline failures
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True when the operation was rejected because the transport is not connected
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }

    /// True when the operation was cancelled by `close()`
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    // Constructor helpers

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            code: McpErrorCode::ConnectionError.code(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            code: McpErrorCode::ConnectionError.code(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            code: McpErrorCode::TransportError.code(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            code: McpErrorCode::TransportError.code(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a not-connected error
    pub fn not_connected() -> Self {
        Self::NotConnected {
            code: McpErrorCode::NotConnected.code(),
            message: "Transport is not connected".to_string(),
        }
    }

    /// Create an HTTP status error
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            code: McpErrorCode::HttpStatus.code(),
            message: message.into(),
            status,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: McpErrorCode::ProtocolError.code(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            code: McpErrorCode::TimeoutError.code(),
            message: message.into(),
            duration,
        }
    }

    /// Create a cancelled error
    pub fn cancelled(message: impl Into<String>, reason: Option<String>) -> Self {
        Self::Cancelled {
            code: McpErrorCode::CancelledError.code(),
            message: message.into(),
            reason,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            code: McpErrorCode::ConfigError.code(),
            message: message.into(),
        }
    }
}

/// Result type alias for transport operations
pub type McpResult<T> = Result<T, McpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(McpErrorCode::ConnectionError.code(), -32000);
        assert_eq!(McpErrorCode::NotConnected.code(), -32011);
    }

    #[test]
    fn test_error_has_code_and_message() {
        let err = McpError::connection("spawn failed");
        assert_eq!(err.code(), McpErrorCode::ConnectionError.code());
        assert_eq!(err.message(), "spawn failed");
    }

    #[test]
    fn test_not_connected() {
        let err = McpError::not_connected();
        assert!(err.is_not_connected());
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("not connected"));
    }

    #[test]
    fn test_timeout_error() {
        let err = McpError::timeout("connect timed out", Duration::from_millis(250));
        assert!(err.is_timeout());
        assert_eq!(err.code(), McpErrorCode::TimeoutError.code());
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_http_error_keeps_status() {
        let err = McpError::http(503, "service unavailable");
        match err {
            McpError::Http { status, .. } => assert_eq!(status, 503),
            other => panic!("Expected Http error, got {other:?}"),
        }
    }

    #[test]
    fn test_source_is_preserved() {
        use std::error::Error as _;
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = McpError::connection_with_source("Failed to spawn", io_err);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_codes_stay_in_transport_range() {
        let codes = [
            McpErrorCode::ConnectionError,
            McpErrorCode::TransportError,
            McpErrorCode::ProtocolError,
            McpErrorCode::TimeoutError,
            McpErrorCode::CancelledError,
            McpErrorCode::ConfigError,
            McpErrorCode::NotConnected,
            McpErrorCode::HttpStatus,
        ];
        for code in codes {
            assert!((-32099..=-32000).contains(&code.code()), "{code:?}");
        }
    }

    #[test]
    fn test_every_variant_has_code_and_message() {
        let errors = vec![
            McpError::connection("x"),
            McpError::transport("x"),
            McpError::not_connected(),
            McpError::http(500, "x"),
            McpError::protocol("x"),
            McpError::timeout("x", Duration::from_secs(1)),
            McpError::cancelled("x", None),
            McpError::config("x"),
        ];
        for err in errors {
            assert_ne!(err.code(), 0);
            assert!(!err.message().is_empty());
        }
    }
}

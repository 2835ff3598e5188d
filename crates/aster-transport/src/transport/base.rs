//! Transport Base Types
//!
//! This module defines the `Transport` trait shared by every transport, the
//! events it publishes and the factory that builds a transport from
//! configuration.
//!
//! # Contract
//!
//! - `connect` allocates the resource and resolves once it signals readiness.
//!   Calling it while connected is a no-op.
//! - `send` is rejected with `McpError::NotConnected` unless connected, and
//!   never changes the connection status.
//! - `close` is idempotent, releases the resource, wakes queued
//!   `wait_for_data` callers with an empty string and ends in `Disconnected`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::TransportConfig;
use crate::error::McpResult;
use crate::transport::core::TransportCore;
use crate::types::{ConnectionOptions, ConnectionStatus, TransportType};

/// Notification published by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Emitted on every status transition, before the specific event
    StatusChanged {
        status: ConnectionStatus,
        previous: ConnectionStatus,
    },
    /// Entered `Connected`
    Connected,
    /// Entered `Disconnected`
    Disconnected,
    /// Entered `Error`
    Error { message: String },
    /// One unit of inbound data
    Data(String),
    /// A line the child process wrote to stderr (stdio with piped stderr only)
    Stderr(String),
}

/// Transport trait for MCP communication
///
/// All methods take `&self` so that `close` can run while a `connect` is
/// still pending; share a transport between tasks as [`SharedTransport`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the transport type
    fn transport_type(&self) -> TransportType;

    /// Shared state machine backing this transport
    fn core(&self) -> &TransportCore;

    /// Timeout applied to `send` and `wait_for_data` by default
    fn operation_timeout(&self) -> Duration;

    /// Establish the underlying resource and wait for readiness
    async fn connect(&self, options: Option<ConnectionOptions>) -> McpResult<()>;

    /// Deliver one message to the peer
    async fn send(&self, message: &str) -> McpResult<()>;

    /// Release the underlying resource
    async fn close(&self) -> McpResult<()>;

    /// Get the current connection status
    fn status(&self) -> ConnectionStatus {
        self.core().status()
    }

    /// Check if the transport is connected
    fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Subscribe to transport events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.core().subscribe()
    }

    /// Wait for the next unit of inbound data (or everything buffered so far)
    async fn wait_for_data(&self, timeout: Option<Duration>) -> McpResult<String> {
        let timeout = timeout.unwrap_or_else(|| self.operation_timeout());
        self.core().wait_for_data(timeout).await
    }
}

/// Boxed transport type for dynamic dispatch
pub type BoxedTransport = Box<dyn Transport>;

/// Arc-wrapped transport for shared ownership
pub type SharedTransport = Arc<dyn Transport>;

/// Transport factory for creating transports from configuration
pub struct TransportFactory;

impl TransportFactory {
    /// Create a transport from configuration
    ///
    /// `options` become the transport's defaults; each `connect` call may
    /// override them.
    pub fn create(
        config: TransportConfig,
        options: ConnectionOptions,
    ) -> McpResult<BoxedTransport> {
        config.validate()?;
        match config {
            TransportConfig::Stdio(config) => {
                use super::stdio::StdioTransport;
                Ok(Box::new(StdioTransport::new(config, options)))
            }
            TransportConfig::Http(config) => {
                use super::http::HttpTransport;
                Ok(Box::new(HttpTransport::new(config, options)))
            }
            TransportConfig::Sse(config) => {
                use super::sse::SseTransport;
                Ok(Box::new(SseTransport::new(config, options)))
            }
            TransportConfig::WebSocket(config) => {
                use super::websocket::WebSocketTransport;
                Ok(Box::new(WebSocketTransport::new(config, options)))
            }
        }
    }

    /// Create a transport behind an `Arc`
    pub fn create_shared(
        config: TransportConfig,
        options: ConnectionOptions,
    ) -> McpResult<SharedTransport> {
        Ok(Arc::from(Self::create(config, options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpConfig, SseConfig, StdioConfig, WebSocketConfig};

    #[test]
    fn test_factory_builds_each_type() {
        let configs = vec![
            (
                TransportConfig::Stdio(StdioConfig::new("node")),
                TransportType::Stdio,
            ),
            (
                TransportConfig::Http(HttpConfig::new("http://localhost:8080/mcp")),
                TransportType::Http,
            ),
            (
                TransportConfig::Sse(SseConfig::new("http://localhost:8080/sse")),
                TransportType::Sse,
            ),
            (
                TransportConfig::WebSocket(WebSocketConfig::new("ws://localhost:9000")),
                TransportType::WebSocket,
            ),
        ];

        for (config, expected) in configs {
            let transport = TransportFactory::create(config, ConnectionOptions::default()).unwrap();
            assert_eq!(transport.transport_type(), expected);
            assert_eq!(transport.status(), ConnectionStatus::Disconnected);
            assert!(!transport.is_connected());
        }
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let config = TransportConfig::WebSocket(WebSocketConfig::new("http://localhost"));
        assert!(TransportFactory::create(config, ConnectionOptions::default()).is_err());
    }

    #[test]
    fn test_factory_applies_default_timeout() {
        let transport = TransportFactory::create_shared(
            TransportConfig::Stdio(StdioConfig::new("node")),
            ConnectionOptions::with_timeout(Duration::from_millis(750)),
        )
        .unwrap();
        assert_eq!(transport.operation_timeout(), Duration::from_millis(750));
    }
}

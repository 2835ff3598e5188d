//! Aster Transport - multi-transport MCP client layer
//!
//! Lets a host exchange opaque string messages with MCP tool servers over a
//! child process's stdio, HTTP, Server-Sent Events or WebSocket. All four
//! transports share one connection state machine and are interchangeable
//! behind the [`Transport`] trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use aster_transport::{ConnectionOptions, StdioConfig, TransportConfig, TransportFactory};
//!
//! let transport = TransportFactory::create(
//!     TransportConfig::Stdio(StdioConfig::new("npx").args(["-y", "some-mcp-server"])),
//!     ConnectionOptions::default(),
//! )?;
//! transport.connect(None).await?;
//! transport.send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await?;
//! let reply = transport.wait_for_data(None).await?;
//! transport.close().await?;
//! ```

pub mod config;
pub mod error;
pub mod transport;
pub mod types;

pub use config::{
    HttpConfig, OutputMode, ReadySignal, SseConfig, StderrMode, StdioConfig, TransportConfig,
    WebSocketConfig,
};
pub use error::{McpError, McpErrorCode, McpResult};
pub use transport::{
    BoxedTransport, HttpTransport, SharedTransport, SseTransport, StdioTransport, Transport,
    TransportCore, TransportEvent, TransportFactory, WebSocketTransport,
};
pub use types::{merge_environment, ConnectionOptions, ConnectionStatus, TransportType, DEFAULT_TIMEOUT_MS};

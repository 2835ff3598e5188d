//! MCP Transport Layer
//!
//! This module provides the transport abstraction and concrete implementations
//! for MCP communication.
//!
//! # Available Transports
//!
//! - **StdioTransport**: Subprocess communication via stdin/stdout
//! - **HttpTransport**: HTTP POST requests, optionally answered with event streams
//! - **SseTransport**: Server-Sent Events inbound, HTTP POST outbound
//! - **WebSocketTransport**: Full-duplex WebSocket connections
//!
//! # Architecture
//!
//! Every transport composes a [`TransportCore`], which owns the connection
//! status, the event fan-out and the inbound data queue. The concrete types
//! only manage their resource and report readiness, data and loss to the core.

mod base;
mod core;
pub mod event_stream;
pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

pub use self::base::{BoxedTransport, SharedTransport, Transport, TransportEvent, TransportFactory};
pub use self::core::TransportCore;

// Re-export transport implementations
pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;


#[cfg(test)]
mod http_tests;

//! WebSocket Transport Implementation
//!
//! This module implements the WebSocket transport for MCP communication.
//! It provides full-duplex communication over WebSocket connections.
//!
//! # Message Format
//!
//! Messages are sent as text frames, one message per frame. Every inbound
//! text frame is one unit of data; binary frames are decoded as UTF-8.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::{validate_url, TransportConfig, WebSocketConfig};
use crate::error::{McpError, McpResult};
use crate::transport::core::{Attempt, TransportCore};
use crate::transport::Transport;
use crate::types::{ConnectionOptions, ConnectionStatus, TransportType};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Upper bound for the closing handshake
const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct WsSession {
    epoch: u64,
    token: CancellationToken,
    writer: Arc<tokio::sync::Mutex<WsWriter>>,
}

/// WebSocket transport for MCP communication
///
/// This transport provides full-duplex communication over WebSocket connections.
/// The socket opening is the readiness signal.
pub struct WebSocketTransport {
    /// Transport configuration
    config: WebSocketConfig,
    /// Default connection options
    options: ConnectionOptions,
    active: Mutex<ConnectionOptions>,
    core: Arc<TransportCore>,
    session: Mutex<Option<WsSession>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport
    pub fn new(config: WebSocketConfig, options: ConnectionOptions) -> Self {
        Self {
            config,
            active: Mutex::new(options.clone()),
            options,
            core: Arc::new(TransportCore::new(TransportType::WebSocket)),
            session: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create from transport config
    pub fn from_config(config: TransportConfig, options: ConnectionOptions) -> McpResult<Self> {
        match config {
            TransportConfig::WebSocket(config) => Ok(Self::new(config, options)),
            _ => Err(McpError::config("Expected WebSocket transport configuration")),
        }
    }

    /// Transport configuration
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    fn build_request(&self, headers: &HashMap<String, String>) -> McpResult<Request<()>> {
        let url = validate_url(&self.config.url, &["ws", "wss"])?;
        let mut request = url.as_str().into_client_request().map_err(|e| {
            McpError::config(format!("Failed to build WebSocket request: {}", e))
        })?;

        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| McpError::config(format!("Invalid header name '{}': {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| McpError::config(format!("Invalid value for header '{}': {}", key, e)))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }

    async fn open(&self, attempt: &Attempt, options: &ConnectionOptions) -> McpResult<()> {
        let mut headers = self.config.headers.clone();
        headers.extend(options.headers.clone());
        let request = self.build_request(&headers)?;

        let (ws_stream, _response) = connect_async(request).await.map_err(|e| {
            McpError::connection_with_source(
                format!("Failed to connect to WebSocket server {}: {}", self.config.url, e),
                e,
            )
        })?;

        let (writer, reader) = ws_stream.split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        *self.session.lock() = Some(WsSession {
            epoch: attempt.epoch,
            token: attempt.token.clone(),
            writer,
        });

        self.core.mark_connected(attempt.epoch);
        tokio::spawn(read_frames(
            self.core.clone(),
            attempt.epoch,
            attempt.token.clone(),
            reader,
        ));
        Ok(())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }

    fn core(&self) -> &TransportCore {
        &self.core
    }

    fn operation_timeout(&self) -> Duration {
        self.active.lock().timeout()
    }

    async fn connect(&self, options: Option<ConnectionOptions>) -> McpResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.core.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        let options = options.unwrap_or_default().merged_over(&self.options);
        *self.active.lock() = options.clone();
        let attempt = self.core.begin_attempt();
        tracing::info!(url = %self.config.url, epoch = attempt.epoch, "connecting WebSocket transport");

        let result = self
            .core
            .drive_attempt(&attempt, options.timeout(), self.open(&attempt, &options))
            .await;

        match &result {
            Ok(()) => tracing::info!(url = %self.config.url, "WebSocket transport connected"),
            Err(e) => {
                tracing::warn!(url = %self.config.url, "WebSocket transport failed to connect: {}", e);
                let stale = {
                    let mut slot = self.session.lock();
                    if slot.as_ref().is_some_and(|s| s.epoch == attempt.epoch) {
                        slot.take()
                    } else {
                        None
                    }
                };
                if let Some(session) = stale {
                    close_socket(session).await;
                }
            }
        }
        result
    }

    async fn send(&self, message: &str) -> McpResult<()> {
        if self.core.status() != ConnectionStatus::Connected {
            return Err(McpError::not_connected());
        }
        let writer = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.writer.clone())
            .ok_or_else(McpError::not_connected)?;

        let timeout = self.operation_timeout();
        let frame = Message::Text(message.to_string().into());
        let write = async { writer.lock().await.send(frame).await };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(McpError::transport_with_source(
                format!("Failed to send WebSocket message: {}", e),
                e,
            )),
            Err(_) => Err(McpError::timeout("WebSocket send timed out", timeout)),
        }
    }

    async fn close(&self) -> McpResult<()> {
        let session = self.session.lock().take();
        let changed = self.core.shutdown();
        if let Some(session) = session {
            close_socket(session).await;
        }
        if changed {
            tracing::info!(url = %self.config.url, "WebSocket transport closed");
        }
        Ok(())
    }
}

/// Cancel the reader and attempt a closing handshake
async fn close_socket(session: WsSession) {
    session.token.cancel();
    let handshake = async {
        let mut writer = session.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
        writer.close().await
    };
    match tokio::time::timeout(CLOSE_GRACE, handshake).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("WebSocket close failed: {}", e),
        Err(_) => tracing::debug!("WebSocket close timed out"),
    }
}

async fn read_frames(
    core: Arc<TransportCore>,
    epoch: u64,
    token: CancellationToken,
    mut reader: WsReader,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                core.deliver(epoch, text.to_string());
            }
            Some(Ok(Message::Binary(bytes))) => {
                core.deliver(epoch, String::from_utf8_lossy(&bytes).into_owned());
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(?frame, "WebSocket closed by server");
                core.connection_lost(epoch, None);
                return;
            }
            // Pings are answered by tungstenite itself.
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                tracing::warn!("WebSocket read failed: {}", e);
                core.connection_lost(epoch, Some(format!("WebSocket error: {}", e)));
                return;
            }
            None => {
                tracing::debug!("WebSocket stream ended");
                core.connection_lost(epoch, None);
                return;
            }
        }
    }
}

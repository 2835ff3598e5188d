//! HTTP Transport Implementation
//!
//! This module implements the HTTP transport for MCP communication.
//! Every `send` is one HTTP POST; the response body is fed back as inbound
//! data. A response of type `text/event-stream` is read incrementally and
//! each event becomes its own unit.
//!
//! # Message Format
//!
//! Messages are posted verbatim as `application/json` bodies. A server-issued
//! `Mcp-Session-Id` header is echoed on every later request.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{validate_url, HttpConfig, TransportConfig};
use crate::error::{McpError, McpResult};
use crate::transport::core::{Attempt, TransportCore};
use crate::transport::event_stream::{is_event_stream, pump_event_stream, StreamContext};
use crate::transport::Transport;
use crate::types::{ConnectionOptions, ConnectionStatus, TransportType};

/// Header carrying the server-assigned session id
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

const ERROR_BODY_LIMIT: usize = 512;

/// What came back from a POST
pub(crate) enum PostReply {
    /// 2xx with no body
    Empty,
    /// 2xx with a complete body
    Body(String),
    /// 2xx with an event stream still being read
    Stream(reqwest::Response),
}

/// Client plus the state shared by every request to one server
#[derive(Clone)]
pub(crate) struct HttpChannel {
    client: reqwest::Client,
    session_id: Arc<Mutex<Option<String>>>,
}

impl HttpChannel {
    /// Build a client sending `headers` with every request.
    ///
    /// Only connection establishment is bounded here; request deadlines are
    /// applied per operation since streamed responses stay open indefinitely.
    pub(crate) fn new(headers: &HashMap<String, String>, connect_timeout: Duration) -> McpResult<Self> {
        let mut default_headers = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| McpError::config(format!("Invalid header name '{}': {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| McpError::config(format!("Invalid value for header '{}': {}", key, e)))?;
            default_headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| McpError::transport_with_source("Failed to create HTTP client", e))?;

        Ok(Self {
            client,
            session_id: Arc::new(Mutex::new(None)),
        })
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    pub(crate) fn capture_session_id(&self, response: &reqwest::Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session_id.lock();
            if slot.as_deref() != Some(id) {
                tracing::debug!(session_id = id, "server assigned MCP session");
                *slot = Some(id.to_string());
            }
        }
    }

    /// POST one message to `url`
    pub(crate) async fn post(&self, url: &Url, message: &str) -> McpResult<PostReply> {
        let mut request = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(message.to_string());
        if let Some(id) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, id);
        }

        let response = request.send().await.map_err(|e| {
            McpError::transport_with_source(format!("Failed to send HTTP request to {}: {}", url, e), e)
        })?;
        self.capture_session_id(&response);

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response, "HTTP request").await);
        }
        if is_event_stream(&response) {
            return Ok(PostReply::Stream(response));
        }

        let body = response.text().await.map_err(|e| {
            McpError::transport_with_source(format!("Failed to read HTTP response body: {}", e), e)
        })?;
        if body.trim().is_empty() {
            Ok(PostReply::Empty)
        } else {
            Ok(PostReply::Body(body))
        }
    }
}

/// Turn a non-success response into `McpError::Http`, keeping a bit of the body
pub(crate) async fn status_error(
    status: StatusCode,
    response: reqwest::Response,
    what: &str,
) -> McpError {
    let body = response.text().await.unwrap_or_default();
    let body: String = body.trim().chars().take(ERROR_BODY_LIMIT).collect();
    if body.is_empty() {
        McpError::http(status.as_u16(), format!("{} failed with HTTP {}", what, status))
    } else {
        McpError::http(
            status.as_u16(),
            format!("{} failed with HTTP {}: {}", what, status, body),
        )
    }
}

struct HttpSession {
    epoch: u64,
    token: CancellationToken,
    url: Url,
    channel: HttpChannel,
}

/// HTTP transport for MCP communication
///
/// This transport uses HTTP POST requests for request/response communication.
/// `connect` probes the endpoint unless probing is disabled, in which case
/// reachability is only discovered by the first `send`.
pub struct HttpTransport {
    /// Transport configuration
    config: HttpConfig,
    /// Default connection options
    options: ConnectionOptions,
    active: Mutex<ConnectionOptions>,
    core: Arc<TransportCore>,
    session: Mutex<Option<HttpSession>>,
    last_event_id: Arc<Mutex<Option<String>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(config: HttpConfig, options: ConnectionOptions) -> Self {
        Self {
            config,
            active: Mutex::new(options.clone()),
            options,
            core: Arc::new(TransportCore::new(TransportType::Http)),
            session: Mutex::new(None),
            last_event_id: Arc::new(Mutex::new(None)),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create from transport config
    pub fn from_config(config: TransportConfig, options: ConnectionOptions) -> McpResult<Self> {
        match config {
            TransportConfig::Http(config) => Ok(Self::new(config, options)),
            _ => Err(McpError::config("Expected HTTP transport configuration")),
        }
    }

    /// Transport configuration
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Session id assigned by the server, if any
    pub fn session_id(&self) -> Option<String> {
        self.session.lock().as_ref().and_then(|s| s.channel.session_id())
    }

    fn stream_context(&self, session: &HttpSession) -> StreamContext {
        StreamContext {
            core: self.core.clone(),
            epoch: session.epoch,
            token: session.token.clone(),
            base_url: session.url.clone(),
            endpoint: None,
            last_event_id: self.last_event_id.clone(),
            ends_session: false,
        }
    }

    async fn open(&self, attempt: &Attempt, options: &ConnectionOptions) -> McpResult<()> {
        let url = validate_url(&self.config.url, &["http", "https"])?;
        let mut headers = self.config.headers.clone();
        headers.extend(options.headers.clone());
        let channel = HttpChannel::new(&headers, options.timeout())?;

        let session = HttpSession {
            epoch: attempt.epoch,
            token: attempt.token.clone(),
            url: url.clone(),
            channel: channel.clone(),
        };
        let ctx = self.stream_context(&session);
        *self.session.lock() = Some(session);

        if !self.config.probe {
            return Ok(());
        }

        let response = channel
            .client()
            .get(url.clone())
            .header(ACCEPT, "text/event-stream, application/json")
            .send()
            .await
            .map_err(|e| {
                McpError::connection_with_source(format!("Failed to reach {}: {}", url, e), e)
            })?;
        channel.capture_session_id(&response);

        let status = response.status();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            // Server does not offer a standalone stream; it still answered.
            tracing::debug!(url = %url, "probe answered 405, treating endpoint as reachable");
            return Ok(());
        }
        if !status.is_success() {
            return Err(status_error(status, response, "Probe").await);
        }

        if is_event_stream(&response) {
            self.core.mark_connected(attempt.epoch);
            tokio::spawn(pump_event_stream(ctx, response));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Http
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
        tracing::info!(url = %self.config.url, epoch = attempt.epoch, probe = self.config.probe, "connecting HTTP transport");

        let result = self
            .core
            .drive_attempt(&attempt, options.timeout(), self.open(&attempt, &options))
            .await;

        match &result {
            Ok(()) => tracing::info!(url = %self.config.url, "HTTP transport connected"),
            Err(e) => {
                tracing::warn!(url = %self.config.url, "HTTP transport failed to connect: {}", e);
                let mut slot = self.session.lock();
                if slot.as_ref().is_some_and(|s| s.epoch == attempt.epoch) {
                    *slot = None;
                }
            }
        }
        result
    }

    async fn send(&self, message: &str) -> McpResult<()> {
        if self.core.status() != ConnectionStatus::Connected {
            return Err(McpError::not_connected());
        }
        let (ctx, url, channel) = {
            let slot = self.session.lock();
            let session = slot.as_ref().ok_or_else(McpError::not_connected)?;
            (
                self.stream_context(session),
                session.url.clone(),
                session.channel.clone(),
            )
        };

        let timeout = self.operation_timeout();
        let reply = tokio::time::timeout(timeout, channel.post(&url, message))
            .await
            .map_err(|_| McpError::timeout("HTTP request timed out", timeout))??;

        match reply {
            PostReply::Empty => {}
            PostReply::Body(body) => {
                ctx.core.deliver(ctx.epoch, body);
            }
            PostReply::Stream(response) => {
                tokio::spawn(pump_event_stream(ctx, response));
            }
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.token.cancel();
        }
        if self.core.shutdown() {
            tracing::info!(url = %self.config.url, "HTTP transport closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_transport_new() {
        let transport = HttpTransport::new(
            HttpConfig::new("http://localhost:8080/mcp"),
            ConnectionOptions::default(),
        );
        assert_eq!(transport.transport_type(), TransportType::Http);
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
        assert!(transport.session_id().is_none());
    }

    #[test]
    fn test_from_config_wrong_type() {
        let config = TransportConfig::Stdio(crate::config::StdioConfig::new("node"));
        assert!(HttpTransport::from_config(config, ConnectionOptions::default()).is_err());
    }

    #[test]
    fn test_channel_rejects_invalid_header() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let err = HttpChannel::new(&headers, Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, McpError::Config { .. }));
    }

    #[tokio::test]
    async fn test_send_not_connected() {
        let transport = HttpTransport::new(
            HttpConfig::new("http://localhost:8080/mcp"),
            ConnectionOptions::default(),
        );
        let err = transport.send("{}").await.unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn test_connect_without_probe_is_immediate() {
        let mut config = HttpConfig::new("http://127.0.0.1:9/mcp");
        config.probe = false;
        let transport = HttpTransport::new(config, ConnectionOptions::default());
        transport.connect(None).await.unwrap();
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
    }
}

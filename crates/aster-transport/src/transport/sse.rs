//! SSE Transport Implementation
//!
//! Inbound data arrives on a long-lived `text/event-stream` response; each
//! event's data becomes one unit. Outbound messages are POSTed, by priority,
//! to the configured message URL, to the endpoint the server announced with an
//! `endpoint` event, or to the stream URL itself. A `send` that finds neither
//! a message URL nor an endpoint gives the server a short grace period to
//! announce one.
//!
//! The stream ending or failing ends the session.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{validate_url, SseConfig, TransportConfig};
use crate::error::{McpError, McpResult};
use crate::transport::core::{Attempt, TransportCore};
use crate::transport::event_stream::{is_event_stream, pump_event_stream, StreamContext};
use crate::transport::http::{status_error, HttpChannel, PostReply};
use crate::transport::Transport;
use crate::types::{ConnectionOptions, ConnectionStatus, TransportType};

/// Longest a `send` waits for the server to announce its message endpoint
const ENDPOINT_GRACE: Duration = Duration::from_secs(2);

/// Where `send` POSTs to within one session
#[derive(Clone)]
struct PostRoute {
    stream_url: Url,
    message_url: Option<Url>,
    endpoint: watch::Receiver<Option<Url>>,
    /// Set once a wait for the endpoint ran out; later sends stop waiting
    endpoint_overdue: Arc<AtomicBool>,
}

impl PostRoute {
    fn current(&self) -> Url {
        if let Some(url) = &self.message_url {
            return url.clone();
        }
        if let Some(url) = self.endpoint.borrow().as_ref() {
            return url.clone();
        }
        self.stream_url.clone()
    }

    fn awaiting_endpoint(&self) -> bool {
        self.message_url.is_none()
            && self.endpoint.borrow().is_none()
            && !self.endpoint_overdue.load(Ordering::Acquire)
    }

    /// Resolve the POST target, first giving the server up to `grace` to
    /// announce an endpoint when neither a message URL nor an endpoint is known.
    async fn resolve(&mut self, grace: Duration) -> Url {
        if self.awaiting_endpoint()
            && tokio::time::timeout(grace, self.endpoint.wait_for(Option::is_some))
                .await
                .is_err()
        {
            self.endpoint_overdue.store(true, Ordering::Release);
            tracing::debug!(
                url = %self.stream_url,
                "no endpoint announced, posting to the stream URL"
            );
        }
        self.current()
    }
}

struct SseSession {
    epoch: u64,
    token: CancellationToken,
    endpoint: Arc<watch::Sender<Option<Url>>>,
    route: PostRoute,
    channel: HttpChannel,
}

/// Server-Sent Events transport for MCP communication
pub struct SseTransport {
    /// Transport configuration
    config: SseConfig,
    /// Default connection options
    options: ConnectionOptions,
    active: Mutex<ConnectionOptions>,
    core: Arc<TransportCore>,
    session: Mutex<Option<SseSession>>,
    /// Survives reconnects so the server can resume the stream
    last_event_id: Arc<Mutex<Option<String>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl SseTransport {
    /// Create a new SSE transport
    pub fn new(config: SseConfig, options: ConnectionOptions) -> Self {
        Self {
            config,
            active: Mutex::new(options.clone()),
            options,
            core: Arc::new(TransportCore::new(TransportType::Sse)),
            session: Mutex::new(None),
            last_event_id: Arc::new(Mutex::new(None)),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create from transport config
    pub fn from_config(config: TransportConfig, options: ConnectionOptions) -> McpResult<Self> {
        match config {
            TransportConfig::Sse(config) => Ok(Self::new(config, options)),
            _ => Err(McpError::config("Expected SSE transport configuration")),
        }
    }

    /// Transport configuration
    pub fn config(&self) -> &SseConfig {
        &self.config
    }

    /// Id of the last event received on any stream of this transport
    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id.lock().clone()
    }

    /// Where the next `send` will POST to, while connected
    pub fn message_endpoint(&self) -> Option<Url> {
        self.session.lock().as_ref().map(|s| s.route.current())
    }

    fn stream_context(&self, session: &SseSession, endpoint: bool) -> StreamContext {
        StreamContext {
            core: self.core.clone(),
            epoch: session.epoch,
            token: session.token.clone(),
            base_url: session.route.stream_url.clone(),
            endpoint: endpoint.then(|| session.endpoint.clone()),
            last_event_id: self.last_event_id.clone(),
            ends_session: endpoint,
        }
    }

    async fn open(&self, attempt: &Attempt, options: &ConnectionOptions) -> McpResult<()> {
        let stream_url = validate_url(&self.config.url, &["http", "https"])?;
        let message_url = self
            .config
            .message_url
            .as_deref()
            .map(|raw| validate_url(raw, &["http", "https"]))
            .transpose()?;
        let mut headers = self.config.headers.clone();
        headers.extend(options.headers.clone());
        let channel = HttpChannel::new(&headers, options.timeout())?;

        let (endpoint, announced) = watch::channel(None);
        let session = SseSession {
            epoch: attempt.epoch,
            token: attempt.token.clone(),
            endpoint: Arc::new(endpoint),
            route: PostRoute {
                stream_url: stream_url.clone(),
                message_url,
                endpoint: announced,
                endpoint_overdue: Arc::new(AtomicBool::new(false)),
            },
            channel: channel.clone(),
        };
        let ctx = self.stream_context(&session, true);
        *self.session.lock() = Some(session);

        let mut request = channel
            .client()
            .get(stream_url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = self.last_event_id() {
            request = request.header("Last-Event-ID", id);
        }

        let response = request.send().await.map_err(|e| {
            McpError::connection_with_source(
                format!("Failed to open event stream {}: {}", stream_url, e),
                e,
            )
        })?;
        channel.capture_session_id(&response);

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response, "Event stream request").await);
        }
        if !is_event_stream(&response) {
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string();
            return Err(McpError::protocol(format!(
                "Expected text/event-stream from {}, got content type '{}'",
                stream_url, content_type
            )));
        }

        self.core.mark_connected(attempt.epoch);
        tokio::spawn(pump_event_stream(ctx, response));
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Sse
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
        tracing::info!(url = %self.config.url, epoch = attempt.epoch, "connecting SSE transport");

        let result = self
            .core
            .drive_attempt(&attempt, options.timeout(), self.open(&attempt, &options))
            .await;

        match &result {
            Ok(()) => tracing::info!(url = %self.config.url, "SSE transport connected"),
            Err(e) => {
                tracing::warn!(url = %self.config.url, "SSE transport failed to connect: {}", e);
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
        let (ctx, mut route, channel) = {
            let slot = self.session.lock();
            let session = slot.as_ref().ok_or_else(McpError::not_connected)?;
            (
                self.stream_context(session, false),
                session.route.clone(),
                session.channel.clone(),
            )
        };

        let timeout = self.operation_timeout();
        let target = route.resolve(ENDPOINT_GRACE.min(timeout)).await;
        if !ctx.core.is_current(ctx.epoch) {
            return Err(McpError::not_connected());
        }
        tracing::trace!(url = %target, "posting message");
        let reply = tokio::time::timeout(timeout, channel.post(&target, message))
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
            tracing::info!(url = %self.config.url, "SSE transport closed");
        }
        Ok(())
    }
}

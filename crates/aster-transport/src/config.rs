//! Transport Configuration
//!
//! Serde-friendly descriptions of how to reach one tool server. Hosts embed
//! these in their own configuration files and hand them to
//! [`TransportFactory`](crate::transport::TransportFactory).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use url::Url;

use crate::error::{McpError, McpResult};
use crate::types::TransportType;

/// What happens to the child's stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Capture and publish as a side-channel diagnostic stream
    Pipe,
    /// Discard
    #[default]
    Ignore,
    /// Share the host's stderr
    Inherit,
}

/// How stdout is cut into data units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// One unit per newline-terminated line
    #[default]
    Lines,
    /// One unit per read chunk
    Raw,
}

/// What the stdio transport treats as proof that the child is ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadySignal {
    /// The first unit read from stdout
    #[default]
    FirstOutput,
    /// The first unit containing this text
    Marker(String),
    /// A successful spawn
    Spawned,
}

impl ReadySignal {
    /// Whether `unit` satisfies this signal
    pub fn is_satisfied_by(&self, unit: &str) -> bool {
        match self {
            ReadySignal::FirstOutput => true,
            ReadySignal::Marker(marker) => unit.contains(marker.as_str()),
            ReadySignal::Spawned => true,
        }
    }
}

/// Stdio transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioConfig {
    /// Command to execute
    pub command: String,
    /// Command arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides, merged over the host environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub stderr: StderrMode,
    #[serde(default)]
    pub output: OutputMode,
    #[serde(default)]
    pub ready: ReadySignal,
}

impl StdioConfig {
    /// Configuration for `command` with everything else defaulted
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            stderr: StderrMode::default(),
            output: OutputMode::default(),
            ready: ReadySignal::default(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }

    pub fn output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    pub fn ready(mut self, signal: ReadySignal) -> Self {
        self.ready = signal;
        self
    }
}

fn default_probe() -> bool {
    true
}

/// HTTP transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Server URL
    pub url: String,
    /// HTTP headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Probe the URL during `connect` instead of deferring to the first send
    #[serde(default = "default_probe")]
    pub probe: bool,
}

impl HttpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            probe: true,
        }
    }
}

/// SSE transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseConfig {
    /// Event stream URL
    pub url: String,
    /// Where outgoing messages are POSTed; overrides any `endpoint` event
    #[serde(default)]
    pub message_url: Option<String>,
    /// HTTP headers sent with the stream request and every POST
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl SseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            message_url: None,
            headers: HashMap::new(),
        }
    }
}

/// WebSocket transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Server URL (ws:// or wss://)
    pub url: String,
    /// HTTP headers for the upgrade request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
        }
    }
}

/// Transport configuration for one tool server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportConfig {
    #[serde(rename = "stdio")]
    Stdio(StdioConfig),
    #[serde(rename = "http")]
    Http(HttpConfig),
    #[serde(rename = "sse")]
    Sse(SseConfig),
    #[serde(rename = "websocket")]
    WebSocket(WebSocketConfig),
}

impl TransportConfig {
    /// Parse a single transport entry from JSON
    pub fn from_json(json: &str) -> McpResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| McpError::config(format!("Invalid transport configuration: {}", e)))
    }

    /// Get the transport type
    pub fn transport_type(&self) -> TransportType {
        match self {
            TransportConfig::Stdio(_) => TransportType::Stdio,
            TransportConfig::Http(_) => TransportType::Http,
            TransportConfig::Sse(_) => TransportType::Sse,
            TransportConfig::WebSocket(_) => TransportType::WebSocket,
        }
    }

    /// Check that the configuration can be used to build a transport
    pub fn validate(&self) -> McpResult<()> {
        match self {
            TransportConfig::Stdio(config) => {
                if config.command.trim().is_empty() {
                    return Err(McpError::config("Stdio transport requires a command"));
                }
                if let ReadySignal::Marker(marker) = &config.ready {
                    if marker.is_empty() {
                        return Err(McpError::config("Ready marker must not be empty"));
                    }
                }
                Ok(())
            }
            TransportConfig::Http(config) => {
                validate_url(&config.url, &["http", "https"]).map(|_| ())
            }
            TransportConfig::Sse(config) => {
                validate_url(&config.url, &["http", "https"])?;
                if let Some(message_url) = &config.message_url {
                    validate_url(message_url, &["http", "https"])?;
                }
                Ok(())
            }
            TransportConfig::WebSocket(config) => {
                validate_url(&config.url, &["ws", "wss"]).map(|_| ())
            }
        }
    }
}

/// Parse `raw` and check its scheme against `schemes`
pub(crate) fn validate_url(raw: &str, schemes: &[&str]) -> McpResult<Url> {
    let url = Url::parse(raw).map_err(|e| McpError::config(format!("Invalid URL '{}': {}", raw, e)))?;
    if !schemes.contains(&url.scheme()) {
        return Err(McpError::config(format!(
            "Unsupported URL scheme '{}' in '{}', expected one of: {}",
            url.scheme(),
            raw,
            schemes.join(", ")
        )));
    }
    Ok(url)
}

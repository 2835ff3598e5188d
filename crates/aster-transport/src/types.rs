//! Core Types
//!
//! Status, transport kind and per-connect options shared by every transport.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::time::Duration;

/// Default connection and operation timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Transport type for MCP connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Standard input/output transport (subprocess)
    #[default]
    Stdio,
    /// HTTP transport
    Http,
    /// Server-Sent Events transport
    Sse,
    /// WebSocket transport
    WebSocket,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
            Self::Sse => write!(f, "sse"),
            Self::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Connection status of a transport instance
///
/// Only the transport itself moves between states:
///
/// ```text
/// Disconnected ──connect──▶ Connecting ──ready──▶ Connected
///       ▲                      │                     │
///       │                      └──fail/timeout──▶ Error
///       └───────────── close (from any state) ───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No resource held
    #[default]
    Disconnected,
    /// Resource allocated, waiting for the readiness signal
    Connecting,
    /// Ready for `send` and receive
    Connected,
    /// Connection attempt or session failed
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Options for a single `connect` call.
///
/// Each transport also carries a default set supplied at construction; the
/// options passed to `connect` are merged over those defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Connection and operation timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Extra headers (HTTP, SSE and WebSocket only)
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Environment overrides (stdio only)
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl ConnectionOptions {
    /// Options with only a timeout set
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout_ms: Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
            ..Default::default()
        }
    }

    /// Merge these options over `defaults`; entries in `self` win.
    pub fn merged_over(&self, defaults: &ConnectionOptions) -> ConnectionOptions {
        let mut headers = defaults.headers.clone();
        headers.extend(self.headers.clone());
        let mut env = defaults.env.clone();
        env.extend(self.env.clone());
        ConnectionOptions {
            timeout_ms: self.timeout_ms.or(defaults.timeout_ms),
            headers,
            env,
        }
    }

    /// Effective timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }
}

/// Build a child environment from an ambient set and explicit overrides.
///
/// Overrides win over ambient entries with the same key. Ambient entries
/// are kept as OS strings, so host variables that are not valid UTF-8 pass
/// through unchanged.
pub fn merge_environment<I, K, V>(
    ambient: I,
    overrides: &HashMap<String, String>,
) -> HashMap<OsString, OsString>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<OsString>,
    V: Into<OsString>,
{
    let mut merged: HashMap<OsString, OsString> = ambient
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    for (key, value) in overrides {
        merged.insert(OsString::from(key), OsString::from(value));
    }
    merged
}

//! `text/event-stream` framing
//!
//! An incremental parser for Server-Sent Events plus the background pump that
//! feeds an HTTP response body through it. Used by the SSE transport for its
//! session stream and by the HTTP transport for streamed responses.

use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::transport::core::TransportCore;

/// One dispatched event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `None` means the default `message` type
    pub event: Option<String>,
    /// Data lines joined with `\n`
    pub data: String,
    /// Last event id seen on the stream at dispatch time
    pub id: Option<String>,
}

impl SseEvent {
    /// Event type with the default applied
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental event-stream parser.
///
/// Bytes may be fed in chunks split at arbitrary positions, including in the
/// middle of a CRLF pair or a multi-byte character.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    line: Vec<u8>,
    after_cr: bool,
    started: bool,
    data: String,
    has_data: bool,
    event: Option<String>,
    last_id: Option<String>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last event id seen so far
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    /// Feed a chunk, returning every event completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr => {
                    self.after_cr = false;
                }
                b'\n' | b'\r' => {
                    self.after_cr = byte == b'\r';
                    let line = std::mem::take(&mut self.line);
                    if let Some(event) = self.process_line(&line) {
                        events.push(event);
                    }
                }
                _ => {
                    self.after_cr = false;
                    self.line.push(byte);
                }
            }
        }
        events
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<SseEvent> {
        let decoded = String::from_utf8_lossy(raw);
        let mut line: &str = &decoded;
        if !self.started {
            self.started = true;
            line = line.strip_prefix('\u{feff}').unwrap_or(line);
        }

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.event = Some(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.last_id = Some(value.to_string());
                }
            }
            // `retry` and unknown fields
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(SseEvent {
            event: event.filter(|e| !e.is_empty()),
            data: std::mem::take(&mut self.data),
            id: self.last_id.clone(),
        })
    }
}

/// Where a pumped stream sends what it parses
#[derive(Clone)]
pub(crate) struct StreamContext {
    pub core: Arc<TransportCore>,
    pub epoch: u64,
    pub token: CancellationToken,
    /// Base for resolving `endpoint` events
    pub base_url: Url,
    /// Receives the POST target announced by `endpoint` events, if handled
    pub endpoint: Option<Arc<watch::Sender<Option<Url>>>>,
    /// Updated with the stream's last event id
    pub last_event_id: Arc<Mutex<Option<String>>>,
    /// Whether the end of this stream ends the session
    pub ends_session: bool,
}

impl StreamContext {
    fn handle(&self, event: SseEvent) {
        if let Some(id) = &event.id {
            *self.last_event_id.lock() = Some(id.clone());
        }

        if event.event_type() == "endpoint" {
            if let Some(slot) = &self.endpoint {
                match self.base_url.join(event.data.trim()) {
                    Ok(url) => {
                        tracing::debug!(endpoint = %url, "event stream announced message endpoint");
                        slot.send_replace(Some(url));
                    }
                    Err(e) => {
                        tracing::warn!(data = %event.data, "ignoring invalid endpoint event: {}", e);
                    }
                }
                return;
            }
        }

        if event.data.is_empty() {
            return;
        }
        let mut unit = event.data;
        unit.push('\n');
        if !self.core.deliver(self.epoch, unit) {
            tracing::trace!(epoch = self.epoch, "dropped event from stale stream");
        }
    }
}

/// Read `response` as an event stream until it ends or `ctx.token` fires
pub(crate) async fn pump_event_stream(ctx: StreamContext, response: reqwest::Response) {
    let mut body = response.bytes_stream();
    let mut parser = EventStreamParser::new();

    loop {
        let chunk = tokio::select! {
            _ = ctx.token.cancelled() => return,
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for event in parser.feed(&bytes) {
                    ctx.handle(event);
                }
            }
            Some(Err(e)) => {
                tracing::warn!(url = %ctx.base_url, "event stream failed: {}", e);
                if ctx.ends_session {
                    ctx.core
                        .connection_lost(ctx.epoch, Some(format!("Event stream failed: {}", e)));
                }
                return;
            }
            None => {
                tracing::debug!(url = %ctx.base_url, "event stream ended");
                if ctx.ends_session {
                    ctx.core.connection_lost(ctx.epoch, None);
                }
                return;
            }
        }
    }
}

/// Whether a response carries an event stream
pub(crate) fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("text/event-stream"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse_all(input: &str) -> Vec<SseEvent> {
        EventStreamParser::new().feed(input.as_bytes())
    }

    #[test]
    fn test_single_event() {
        let events = parse_all("data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[0].event_type(), "message");
    }

    #[test]
    fn test_multiline_data() {
        let events = parse_all("data: first\ndata: second\n\n");
        assert_eq!(events[0].data, "first\nsecond");
    }

    #[test]
    fn test_event_type_and_id() {
        let events = parse_all("event: endpoint\nid: 7\ndata: /messages?session=1\n\n");
        assert_eq!(events[0].event_type(), "endpoint");
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].data, "/messages?session=1");
    }

    #[test]
    fn test_comments_and_unknown_fields_ignored() {
        let events = parse_all(": keep-alive\nfoo: bar\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_empty_data_not_dispatched() {
        assert!(parse_all("event: ping\n\n").is_empty());
        let events = parse_all("data\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "");
    }

    #[test]
    fn test_only_one_leading_space_stripped() {
        let events = parse_all("data:  two spaces\n\n");
        assert_eq!(events[0].data, " two spaces");
    }

    #[test]
    fn test_crlf_and_cr_line_endings() {
        let events = parse_all("data: a\r\n\r\ndata: b\r\rdata: c\n\n");
        let data: Vec<_> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let mut parser = EventStreamParser::new();
        assert!(parser.feed(b"data: a\r").is_empty());
        // The \n completing the CRLF must not count as a blank line.
        assert!(parser.feed(b"\ndata: b\r").is_empty());
        let events = parser.feed(b"\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_bom_stripped() {
        let events = parse_all("\u{feff}data: x\n\n");
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_retry_field_is_ignored() {
        let events = parse_all("retry: 1500\ndata: x\n\nretry: soon\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            SseEvent {
                event: None,
                data: "x".to_string(),
                id: None,
            }
        );
    }

    #[test]
    fn test_incomplete_event_not_dispatched() {
        let mut parser = EventStreamParser::new();
        assert!(parser.feed(b"data: partial").is_empty());
        assert!(parser.feed(b"\n").is_empty());
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let bytes = "data: héllo\n\n".as_bytes();
        let mut parser = EventStreamParser::new();
        let split = 8; // inside the two-byte 'é'
        assert!(parser.feed(&bytes[..split]).is_empty());
        let events = parser.feed(&bytes[split..]);
        assert_eq!(events[0].data, "héllo");
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_events(
            payloads in prop::collection::vec("[a-z0-9 {}:\"]{0,12}", 1..6),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
            crlf in any::<bool>(),
        ) {
            let eol = if crlf { "\r\n" } else { "\n" };
            let stream: String = payloads
                .iter()
                .map(|p| format!("event: m{eol}data: {p}{eol}{eol}"))
                .collect();
            let bytes = stream.as_bytes();

            let whole = EventStreamParser::new().feed(bytes);

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();
            let mut parser = EventStreamParser::new();
            let mut chunked = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(bytes.len())) {
                chunked.extend(parser.feed(&bytes[start..point]));
                start = point;
            }

            prop_assert_eq!(&whole, &chunked);
            prop_assert_eq!(whole.len(), payloads.len());
        }
    }
}

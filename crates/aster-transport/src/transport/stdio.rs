//! Stdio Transport Implementation
//!
//! This module implements the stdio transport for MCP communication.
//! It spawns a subprocess and exchanges newline-delimited UTF-8 messages over
//! its stdin/stdout. Stderr, when piped, is published as a separate
//! diagnostic stream and never mixed into the data.
//!
//! # Readiness
//!
//! By default the first unit read from stdout counts as the readiness signal,
//! so a server that never writes anything times out instead of connecting.
//! [`ReadySignal`] makes this configurable.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{OutputMode, ReadySignal, StderrMode, StdioConfig, TransportConfig};
use crate::error::{McpError, McpResult};
use crate::transport::core::{Attempt, TransportCore};
use crate::transport::{Transport, TransportEvent};
use crate::types::{merge_environment, ConnectionOptions, ConnectionStatus, TransportType};

/// How long output written right before exit may take to drain
const DRAIN_GRACE: Duration = Duration::from_millis(250);
/// Upper bound for killing and reaping the child on close
const KILL_GRACE: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 8 * 1024;

struct StdioSession {
    epoch: u64,
    pid: Option<u32>,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    token: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Stdio transport for MCP communication
///
/// This transport spawns a subprocess and communicates via stdin/stdout.
pub struct StdioTransport {
    /// Transport configuration
    config: StdioConfig,
    /// Default connection options
    options: ConnectionOptions,
    /// Options of the current or last connection attempt
    active: Mutex<ConnectionOptions>,
    core: Arc<TransportCore>,
    session: Mutex<Option<StdioSession>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl StdioTransport {
    /// Create a new stdio transport
    pub fn new(config: StdioConfig, options: ConnectionOptions) -> Self {
        Self {
            config,
            active: Mutex::new(options.clone()),
            options,
            core: Arc::new(TransportCore::new(TransportType::Stdio)),
            session: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create from transport config
    pub fn from_config(config: TransportConfig, options: ConnectionOptions) -> McpResult<Self> {
        match config {
            TransportConfig::Stdio(config) => Ok(Self::new(config, options)),
            _ => Err(McpError::config("Expected Stdio transport configuration")),
        }
    }

    /// Transport configuration
    pub fn config(&self) -> &StdioConfig {
        &self.config
    }

    /// Process id of the running child, if any
    pub fn pid(&self) -> Option<u32> {
        self.session.lock().as_ref().and_then(|s| s.pid)
    }

    fn command_line(&self) -> String {
        if self.config.args.is_empty() {
            self.config.command.clone()
        } else {
            format!("{} {}", self.config.command, self.config.args.join(" "))
        }
    }

    fn build_command(&self, options: &ConnectionOptions) -> Command {
        let mut overrides = self.config.env.clone();
        overrides.extend(options.env.clone());
        let env = merge_environment(std::env::vars_os(), &overrides);

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match self.config.stderr {
                StderrMode::Pipe => Stdio::piped(),
                StderrMode::Ignore => Stdio::null(),
                StderrMode::Inherit => Stdio::inherit(),
            })
            .kill_on_drop(true);

        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Spawn the child and wait for its readiness signal
    async fn open(&self, attempt: &Attempt, options: &ConnectionOptions) -> McpResult<()> {
        let label = self.command_line();
        let mut child = self.build_command(options).spawn().map_err(|e| {
            McpError::connection_with_source(format!("Failed to spawn process '{}': {}", label, e), e)
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connection("Failed to capture stdin of child process"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connection("Failed to capture stdout of child process"))?;
        let stderr = child.stderr.take();

        let waits_for_output = !matches!(self.config.ready, ReadySignal::Spawned);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, mut exit_rx) = oneshot::channel();

        let sink = OutputSink {
            core: self.core.clone(),
            epoch: attempt.epoch,
            ready: waits_for_output.then(|| (self.config.ready.clone(), ready_tx)),
        };
        let reader = tokio::spawn(read_stdout(
            sink,
            stdout,
            self.config.output,
            attempt.token.clone(),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(read_stderr(
                self.core.clone(),
                attempt.epoch,
                stderr,
                attempt.token.clone(),
            ));
        }
        let supervisor = tokio::spawn(supervise(
            Supervisor {
                core: self.core.clone(),
                epoch: attempt.epoch,
                token: attempt.token.clone(),
                label: label.clone(),
            },
            child,
            reader,
            exit_tx,
        ));

        *self.session.lock() = Some(StdioSession {
            epoch: attempt.epoch,
            pid,
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            token: attempt.token.clone(),
            supervisor,
        });
        tracing::debug!(command = %label, pid, epoch = attempt.epoch, "spawned stdio server");

        if !waits_for_output {
            return Ok(());
        }

        let outcome = tokio::select! {
            biased;
            ready = ready_rx => match ready {
                Ok(()) => Startup::Ready,
                Err(_) => Startup::OutputClosed,
            },
            reason = &mut exit_rx => Startup::Exited(reason.unwrap_or_else(|_| "stopped".to_string())),
        };

        let reason = match outcome {
            Startup::Ready => return Ok(()),
            Startup::Exited(reason) => reason,
            Startup::OutputClosed => exit_rx
                .await
                .unwrap_or_else(|_| "stdout closed".to_string()),
        };
        Err(McpError::connection(format!(
            "Process '{}' exited before becoming ready ({})",
            label, reason
        )))
    }

    fn take_session_for(&self, epoch: u64) -> Option<StdioSession> {
        let mut slot = self.session.lock();
        if slot.as_ref().is_some_and(|s| s.epoch == epoch) {
            slot.take()
        } else {
            None
        }
    }
}

enum Startup {
    Ready,
    Exited(String),
    OutputClosed,
}

#[async_trait]
impl Transport for StdioTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
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

        let stale = self.session.lock().take();
        if let Some(stale) = stale {
            release_session(stale).await;
        }

        let options = options.unwrap_or_default().merged_over(&self.options);
        *self.active.lock() = options.clone();
        let attempt = self.core.begin_attempt();
        tracing::info!(command = %self.command_line(), epoch = attempt.epoch, "connecting stdio transport");

        let result = self
            .core
            .drive_attempt(&attempt, options.timeout(), self.open(&attempt, &options))
            .await;

        match &result {
            Ok(()) => tracing::info!(command = %self.command_line(), pid = self.pid(), "stdio transport connected"),
            Err(e) => {
                tracing::warn!(command = %self.command_line(), "stdio transport failed to connect: {}", e);
                if let Some(session) = self.take_session_for(attempt.epoch) {
                    release_session(session).await;
                }
            }
        }
        result
    }

    async fn send(&self, message: &str) -> McpResult<()> {
        if self.core.status() != ConnectionStatus::Connected {
            return Err(McpError::not_connected());
        }
        let stdin = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.stdin.clone())
            .ok_or_else(McpError::not_connected)?;

        let mut payload = message.to_string();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }

        let timeout = self.operation_timeout();
        let write = async {
            let mut stdin = stdin.lock().await;
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(McpError::transport_with_source(
                format!("Failed to write to process stdin: {}", e),
                e,
            )),
            Err(_) => Err(McpError::timeout("Write to process stdin timed out", timeout)),
        }
    }

    async fn close(&self) -> McpResult<()> {
        let session = self.session.lock().take();
        let changed = self.core.shutdown();
        if let Some(session) = session {
            tracing::debug!(pid = session.pid, "stopping stdio server");
            release_session(session).await;
        }
        if changed {
            tracing::info!(command = %self.command_line(), "stdio transport closed");
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // The supervisor kills the child once the token fires.
        if let Some(session) = self.session.get_mut().take() {
            session.token.cancel();
        }
    }
}

/// Cancel a session and wait for its child to be killed and reaped
async fn release_session(session: StdioSession) {
    session.token.cancel();
    drop(session.stdin);
    if tokio::time::timeout(KILL_GRACE, session.supervisor)
        .await
        .is_err()
    {
        tracing::warn!(pid = session.pid, "stdio server did not exit after kill");
    }
}

/// Receives units cut from stdout
struct OutputSink {
    core: Arc<TransportCore>,
    epoch: u64,
    ready: Option<(ReadySignal, oneshot::Sender<()>)>,
}

impl OutputSink {
    fn push(&mut self, unit: String) {
        let satisfied = self
            .ready
            .as_ref()
            .is_some_and(|(signal, _)| signal.is_satisfied_by(&unit));
        if satisfied {
            if let Some((_, tx)) = self.ready.take() {
                if self.core.mark_connected(self.epoch) {
                    let _ = tx.send(());
                }
            }
        }
        self.core.deliver(self.epoch, unit);
    }
}

async fn read_stdout(
    sink: OutputSink,
    stdout: ChildStdout,
    mode: OutputMode,
    token: CancellationToken,
) {
    match mode {
        OutputMode::Lines => read_lines(sink, stdout, token).await,
        OutputMode::Raw => read_chunks(sink, stdout, token).await,
    }
}

async fn read_lines(mut sink: OutputSink, stdout: ChildStdout, token: CancellationToken) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => sink.push(terminate_line(&line)),
            Err(e) => {
                tracing::warn!(epoch = sink.epoch, "failed to read stdout: {}", e);
                break;
            }
        }
    }
}

async fn read_chunks(mut sink: OutputSink, mut stdout: ChildStdout, token: CancellationToken) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut decoder = Utf8Chunks::default();
    loop {
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = stdout.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                let rest = decoder.finish();
                if !rest.is_empty() {
                    sink.push(rest);
                }
                break;
            }
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    sink.push(text);
                }
            }
            Err(e) => {
                tracing::warn!(epoch = sink.epoch, "failed to read stdout: {}", e);
                break;
            }
        }
    }
}

async fn read_stderr(
    core: Arc<TransportCore>,
    epoch: u64,
    stderr: ChildStderr,
    token: CancellationToken,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                tracing::debug!(epoch, stderr = %line, "stdio server stderr");
                if !core.emit_for(epoch, TransportEvent::Stderr(line)) {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(epoch, "stopped reading stderr: {}", e);
                break;
            }
        }
    }
}

struct Supervisor {
    core: Arc<TransportCore>,
    epoch: u64,
    token: CancellationToken,
    label: String,
}

/// Own the child until it exits or the attempt is cancelled
async fn supervise(
    supervisor: Supervisor,
    mut child: Child,
    reader: JoinHandle<()>,
    exit_tx: oneshot::Sender<String>,
) {
    tokio::select! {
        status = child.wait() => {
            if tokio::time::timeout(DRAIN_GRACE, reader).await.is_err() {
                tracing::debug!(command = %supervisor.label, "stdout still open after exit");
            }
            let reason = match status {
                Ok(status) => status.to_string(),
                Err(e) => format!("failed to wait for process: {}", e),
            };
            tracing::debug!(command = %supervisor.label, epoch = supervisor.epoch, %reason, "stdio server exited");
            let _ = exit_tx.send(reason.clone());
            if supervisor.core.connection_lost(supervisor.epoch, None) {
                tracing::warn!(command = %supervisor.label, %reason, "stdio server exited while connected");
            }
        }
        _ = supervisor.token.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::warn!(command = %supervisor.label, "failed to kill stdio server: {}", e);
            }
            reader.abort();
        }
    }
}

/// Normalize one raw line to text with exactly one trailing newline
fn terminate_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    let mut line = String::from_utf8_lossy(&raw[..end]).into_owned();
    line.push('\n');
    line
}

/// Decodes a byte stream as UTF-8, holding back a character split across reads
#[derive(Debug, Default)]
struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

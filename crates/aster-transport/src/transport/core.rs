//! Shared connection state machine
//!
//! `TransportCore` is composed into every concrete transport. It owns the
//! status, the event fan-out, the buffer of unconsumed data and the FIFO queue
//! of `wait_for_data` callers. Everything here is pure bookkeeping guarded by
//! a single lock that is never held across an await point.
//!
//! Every `connect` and `close` bumps an attempt epoch. Background tasks carry
//! the epoch they were started under, and whatever they report under an older
//! epoch is dropped. That is how a closed transport stops hearing from the
//! resource it just released.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, McpResult};
use crate::transport::TransportEvent;
use crate::types::{ConnectionStatus, TransportType};

const EVENT_CAPACITY: usize = 256;

/// Handle for one connection attempt
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub epoch: u64,
    pub token: CancellationToken,
}

struct CoreState {
    status: ConnectionStatus,
    epoch: u64,
    token: CancellationToken,
    buffer: VecDeque<String>,
    waiters: VecDeque<oneshot::Sender<String>>,
}

/// Status, events and inbound data shared by all transports
pub struct TransportCore {
    transport_type: TransportType,
    state: Mutex<CoreState>,
    events: broadcast::Sender<TransportEvent>,
}

impl TransportCore {
    pub fn new(transport_type: TransportType) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport_type,
            state: Mutex::new(CoreState {
                status: ConnectionStatus::Disconnected,
                epoch: 0,
                token: CancellationToken::new(),
                buffer: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
            events,
        }
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Subscribe to status, data and diagnostic events
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Data received but not yet consumed through `wait_for_data`
    pub fn buffered(&self) -> String {
        self.state.lock().buffer.iter().map(String::as_str).collect()
    }

    /// Number of `wait_for_data` callers currently queued
    pub fn pending_waiters(&self) -> usize {
        self.state
            .lock()
            .waiters
            .iter()
            .filter(|waiter| !waiter.is_closed())
            .count()
    }

    /// Wait for the next unit of inbound data.
    ///
    /// Buffered data is returned at once (and the buffer cleared). Otherwise
    /// the caller queues behind earlier waiters and receives the next unit
    /// that arrives. Returns an empty string if the transport is closed while
    /// waiting or is not connected and has nothing buffered.
    pub async fn wait_for_data(&self, timeout: Duration) -> McpResult<String> {
        let mut rx = {
            let mut state = self.state.lock();
            if !state.buffer.is_empty() {
                return Ok(state.buffer.drain(..).collect());
            }
            if !matches!(
                state.status,
                ConnectionStatus::Connecting | ConnectionStatus::Connected
            ) {
                return Ok(String::new());
            }
            // Waiters that gave up leave closed senders behind.
            state.waiters.retain(|waiter| !waiter.is_closed());
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(unit)) => Ok(unit),
            Ok(Err(_)) => Ok(String::new()),
            Err(_) => {
                // A unit handed over between the deadline and now still belongs to us.
                rx.close();
                match rx.try_recv() {
                    Ok(unit) => Ok(unit),
                    Err(_) => Err(McpError::timeout(
                        format!("No data from {} transport", self.transport_type),
                        timeout,
                    )),
                }
            }
        }
    }

    /// Publish an event without changing state
    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Publish an event if `epoch` is still current
    pub(crate) fn emit_for(&self, epoch: u64, event: TransportEvent) -> bool {
        let state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }
        let _ = self.events.send(event);
        true
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.state.lock().epoch == epoch
    }

    fn transition(&self, state: &mut CoreState, status: ConnectionStatus, error: Option<String>) {
        let previous = state.status;
        if previous == status {
            return;
        }
        state.status = status;
        tracing::debug!(
            transport = %self.transport_type,
            epoch = state.epoch,
            %previous,
            %status,
            "transport status changed"
        );

        self.emit(TransportEvent::StatusChanged { status, previous });
        match status {
            ConnectionStatus::Connected => self.emit(TransportEvent::Connected),
            ConnectionStatus::Disconnected => self.emit(TransportEvent::Disconnected),
            ConnectionStatus::Error => self.emit(TransportEvent::Error {
                message: error.unwrap_or_else(|| "Unknown transport error".to_string()),
            }),
            ConnectionStatus::Connecting => {}
        }
    }

    /// Start a new attempt: invalidate the previous epoch and move to `Connecting`
    pub(crate) fn begin_attempt(&self) -> Attempt {
        let mut state = self.state.lock();
        state.token.cancel();
        state.epoch += 1;
        state.token = CancellationToken::new();
        self.transition(&mut state, ConnectionStatus::Connecting, None);
        Attempt {
            epoch: state.epoch,
            token: state.token.clone(),
        }
    }

    /// Record readiness. True if the attempt is (now) connected.
    pub(crate) fn mark_connected(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }
        match state.status {
            ConnectionStatus::Connecting => {
                self.transition(&mut state, ConnectionStatus::Connected, None);
                true
            }
            ConnectionStatus::Connected => true,
            _ => false,
        }
    }

    /// Fail a pending attempt. True if the attempt was still connecting.
    pub(crate) fn fail_attempt(&self, epoch: u64, message: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch || state.status != ConnectionStatus::Connecting {
            return false;
        }
        state.token.cancel();
        release_waiters(&mut state);
        self.transition(&mut state, ConnectionStatus::Error, Some(message.into()));
        true
    }

    /// The resource of a connected session went away.
    ///
    /// Moves to `Error` when `error` is given, otherwise to `Disconnected`.
    /// Queued waiters resolve with an empty string; buffered data stays
    /// readable. True if this changed the status.
    pub(crate) fn connection_lost(&self, epoch: u64, error: Option<String>) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch || state.status != ConnectionStatus::Connected {
            return false;
        }
        state.token.cancel();
        release_waiters(&mut state);
        match error {
            Some(message) => self.transition(&mut state, ConnectionStatus::Error, Some(message)),
            None => self.transition(&mut state, ConnectionStatus::Disconnected, None),
        }
        true
    }

    /// Hand one unit of inbound data to the oldest live waiter, or buffer it.
    ///
    /// Returns false when `epoch` is stale and the unit was dropped.
    pub(crate) fn deliver(&self, epoch: u64, unit: String) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }
        self.emit(TransportEvent::Data(unit.clone()));

        let mut unit = unit;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(unit) {
                Ok(()) => return true,
                // Waiter timed out; offer the unit to the next one.
                Err(returned) => unit = returned,
            }
        }
        state.buffer.push_back(unit);
        true
    }

    /// Tear down bookkeeping for `close()`.
    ///
    /// Cancels the current attempt, detaches background tasks, resolves every
    /// queued waiter with an empty string and clears the buffer. Returns true
    /// if the status changed.
    pub(crate) fn shutdown(&self) -> bool {
        let mut state = self.state.lock();
        state.token.cancel();
        state.epoch += 1;
        state.token = CancellationToken::new();
        release_waiters(&mut state);
        state.buffer.clear();
        let changed = state.status != ConnectionStatus::Disconnected;
        self.transition(&mut state, ConnectionStatus::Disconnected, None);
        changed
    }

    /// Run `open` for `attempt`, racing it against `timeout` and cancellation.
    ///
    /// `open` completing successfully is the readiness signal. Readiness wins
    /// over a simultaneous timeout; a `close()` during the attempt makes this
    /// return `McpError::Cancelled`.
    pub(crate) async fn drive_attempt<F>(
        &self,
        attempt: &Attempt,
        timeout: Duration,
        open: F,
    ) -> McpResult<()>
    where
        F: Future<Output = McpResult<()>>,
    {
        let outcome = tokio::select! {
            biased;
            result = tokio::time::timeout(timeout, open) => match result {
                Ok(result) => result,
                Err(_) => Err(McpError::timeout(
                    format!("{} transport did not become ready", self.transport_type),
                    timeout,
                )),
            },
            _ = attempt.token.cancelled() => Err(closed_during_connect()),
        };
        self.settle_attempt(attempt, outcome)
    }

    fn settle_attempt(&self, attempt: &Attempt, outcome: McpResult<()>) -> McpResult<()> {
        match outcome {
            Ok(()) => {
                if self.mark_connected(attempt.epoch) || self.is_current(attempt.epoch) {
                    // A session that ended right after becoming ready still connected.
                    Ok(())
                } else {
                    Err(closed_during_connect())
                }
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                if self.fail_attempt(attempt.epoch, err.to_string()) {
                    Err(err)
                } else if self.is_current(attempt.epoch) {
                    // Readiness was recorded before the failure was observed.
                    Ok(())
                } else {
                    Err(closed_during_connect())
                }
            }
        }
    }
}

fn release_waiters(state: &mut CoreState) {
    for waiter in state.waiters.drain(..) {
        let _ = waiter.send(String::new());
    }
}

fn closed_during_connect() -> McpError {
    McpError::cancelled(
        "Transport closed before the connection became ready",
        Some("close".to_string()),
    )
}

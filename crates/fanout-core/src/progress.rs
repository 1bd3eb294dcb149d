//! Progress reporting for sessions and the receiver log feed.
//!
//! Sessions publish [`ProgressUpdate`]s on an unbounded channel so a slow
//! consumer never stalls a transfer. The receiver side publishes plain text
//! lines through [`ReceiverLog`], mirrored into `tracing`.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

/// Sender-side session states, in the order a successful session visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    SendingFilename,
    AwaitFilenameAck,
    SendingSize,
    AwaitSizeAck,
    Streaming,
    Completed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting...",
            SessionState::Connected => "Connected",
            SessionState::SendingFilename => "Sending filename",
            SessionState::AwaitFilenameAck => "Awaiting filename ack",
            SessionState::SendingSize => "Sending size",
            SessionState::AwaitSizeAck => "Awaiting size ack",
            SessionState::Streaming => "Transferring...",
            SessionState::Completed => "Completed",
            SessionState::Failed => "Failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Non-terminal state change; terminal states arrive as `Completed`/`Failed`
    State {
        state: SessionState,
    },
    Progress {
        sent: u64,
        total: u64,
        percent: u8,
        /// Bytes per second, present only when a new sample was taken
        rate: Option<f64>,
    },
    Completed {
        sent: u64,
        elapsed_secs: f64,
    },
    Failed {
        /// State the session was in when it failed
        state: SessionState,
        /// Short cause for a status line
        cause: String,
        detail: String,
    },
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Completed { .. } | SessionEvent::Failed { .. })
    }
}

/// One event for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub target: String,
    #[serde(flatten)]
    pub event: SessionEvent,
}

pub type ProgressTx = mpsc::UnboundedSender<ProgressUpdate>;
pub type ProgressRx = mpsc::UnboundedReceiver<ProgressUpdate>;

pub fn progress_channel() -> (ProgressTx, ProgressRx) {
    mpsc::unbounded_channel()
}

/// Percentage of `total` covered by `done`, capped at 100.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as u128 * 100 / total as u128).min(100)) as u8
}

/// Instantaneous throughput, sampled no more often than `interval`.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    interval: Duration,
    last_at: Instant,
    last_bytes: u64,
}

impl ThroughputMeter {
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            last_at: start,
            last_bytes: 0,
        }
    }

    /// Returns bytes/second since the previous sample once `interval` has passed.
    pub fn sample(&mut self, now: Instant, total_bytes: u64) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.last_at);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }

        let delta = total_bytes.saturating_sub(self.last_bytes);
        let rate = delta as f64 / elapsed.as_secs_f64();
        self.last_at = now;
        self.last_bytes = total_bytes;
        Some(rate)
    }
}

/// `tracing` target the receiver feed is mirrored under.
pub const RECEIVER_LOG_TARGET: &str = "fanout::receiver";

/// Text log feed of the receiving side.
#[derive(Debug, Clone, Default)]
pub struct ReceiverLog {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl ReceiverLog {
    /// A feed that only goes to `tracing`.
    pub fn tracing_only() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn info(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(target: RECEIVER_LOG_TARGET, "{}", line);
        self.push(line);
    }

    pub fn warn(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::warn!(target: RECEIVER_LOG_TARGET, "{}", line);
        self.push(line);
    }

    pub fn error(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::error!(target: RECEIVER_LOG_TARGET, "{}", line);
        self.push(line);
    }

    fn push(&self, line: String) {
        if let Some(tx) = &self.tx {
            // Nobody listening is fine
            let _ = tx.send(line);
        }
    }
}

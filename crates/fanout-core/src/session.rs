//! Sender side of one transfer: connect, handshake, stream, close.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::dispatcher::TransferRequest;
use crate::error::TransferError;
use crate::handshake::{Ack, Codec};
use crate::progress::{percent, ProgressTx, ProgressUpdate, SessionEvent, SessionState, ThroughputMeter};
use crate::target::Target;

/// Length of the failure cause shown next to a target.
pub const CAUSE_DISPLAY_LEN: usize = 20;

/// Outcome of a completed session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub target: String,
    pub sent: u64,
    pub size: u64,
    pub elapsed: Duration,
}

/// One outbound connection carrying one file to one target.
pub struct TransferSession {
    target: String,
    request: Arc<TransferRequest>,
    config: Arc<TransferConfig>,
    codec: Codec,
    progress: ProgressTx,
    state: SessionState,
    sent: u64,
}

impl TransferSession {
    pub fn new(
        target: String,
        request: Arc<TransferRequest>,
        config: Arc<TransferConfig>,
        progress: ProgressTx,
        cancel: CancellationToken,
    ) -> Self {
        let codec = Codec::new(config.wire_format, config.io_timeout(), cancel);
        Self {
            target,
            request,
            config,
            codec,
            progress,
            state: SessionState::Idle,
            sent: 0,
        }
    }

    /// Drive the session to a terminal state. The last event published is
    /// always `Completed` or `Failed`.
    pub async fn run(mut self) -> Result<SessionReport, TransferError> {
        let started = Instant::now();

        match self.drive().await {
            Ok(()) => {
                self.state = SessionState::Completed;
                let elapsed = started.elapsed();
                tracing::info!(
                    "Transfer to {} complete: {} bytes in {:.1}s",
                    self.target,
                    self.sent,
                    elapsed.as_secs_f64()
                );
                self.emit(SessionEvent::Completed {
                    sent: self.sent,
                    elapsed_secs: elapsed.as_secs_f64(),
                });
                Ok(SessionReport {
                    target: self.target.clone(),
                    sent: self.sent,
                    size: self.request.size(),
                    elapsed,
                })
            }
            Err(e) => {
                let failed_in = self.state;
                self.state = SessionState::Failed;
                tracing::warn!("Transfer to {} failed while {:?}: {}", self.target, failed_in, e);
                self.emit(SessionEvent::Failed {
                    state: failed_in,
                    cause: e.short_cause(CAUSE_DISPLAY_LEN),
                    detail: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<(), TransferError> {
        self.transition(SessionState::Connecting);
        let target = Target::parse(&self.target, self.config.port)?;
        let mut stream = self.connect(&target).await?;
        self.transition(SessionState::Connected);

        self.transition(SessionState::SendingFilename);
        self.codec.send_filename(&mut stream, self.request.filename()).await?;
        self.transition(SessionState::AwaitFilenameAck);
        self.codec.expect_ack(&mut stream, Ack::Filename).await?;

        self.transition(SessionState::SendingSize);
        self.codec.send_size(&mut stream, self.request.size()).await?;
        self.transition(SessionState::AwaitSizeAck);
        self.codec.expect_ack(&mut stream, Ack::FileSize).await?;

        self.transition(SessionState::Streaming);
        self.stream_file(&mut stream).await?;
        self.codec.guard("close", stream.shutdown()).await?;
        Ok(())
    }

    async fn connect(&self, target: &Target) -> Result<TcpStream, TransferError> {
        let timeout = self.config.connect_timeout();
        let connect = TcpStream::connect((target.host.as_str(), target.port));

        let stream = tokio::select! {
            biased;
            _ = self.codec.cancel_token().cancelled() => return Err(TransferError::Cancelled),
            res = tokio::time::timeout(timeout, connect) => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(TransferError::Connect { target: target.to_string(), source })
                }
                Err(_) => {
                    return Err(TransferError::ConnectTimeout { target: target.to_string(), timeout })
                }
            },
        };

        tracing::debug!("Connected to {}", target);
        Ok(stream)
    }

    async fn stream_file(&mut self, stream: &mut TcpStream) -> Result<(), TransferError> {
        let mut file = tokio::fs::File::open(self.request.path()).await?;
        let mut buf = vec![0u8; self.config.chunk_size()];
        let size = self.request.size();
        let mut meter = ThroughputMeter::new(self.config.sample_interval(), Instant::now());

        // Stop at the declared size even if the file grew since it was measured
        while self.sent < size {
            if self.codec.cancel_token().is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let want = (size - self.sent).min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }

            // Awaiting the write is what lets a slow receiver hold us back
            self.codec.write_chunk(stream, &buf[..n]).await?;
            self.sent += n as u64;

            let rate = meter.sample(Instant::now(), self.sent);
            self.emit(SessionEvent::Progress {
                sent: self.sent,
                total: size,
                percent: percent(self.sent, size),
                rate,
            });
        }

        Ok(())
    }

    fn transition(&mut self, state: SessionState) {
        tracing::debug!("{}: {:?} -> {:?}", self.target, self.state, state);
        self.state = state;
        self.emit(SessionEvent::State { state });
    }

    fn emit(&self, event: SessionEvent) {
        // The caller may have stopped listening; the transfer goes on regardless
        let _ = self.progress.send(ProgressUpdate {
            target: self.target.clone(),
            event,
        });
    }
}

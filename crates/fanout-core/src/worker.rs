//! Receiver side of one transfer.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use storage::Storage;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::handshake::{Ack, Codec};
use crate::progress::ReceiverLog;

/// State of one inbound transfer; returned once the connection is done.
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    pub peer: SocketAddr,
    pub filename: String,
    pub declared_size: u64,
    pub destination: PathBuf,
    pub received: u64,
    pub started: Instant,
    pub elapsed: Duration,
}

impl IncomingTransfer {
    /// False when the peer closed before the declared size arrived.
    pub fn is_complete(&self) -> bool {
        self.received == self.declared_size
    }
}

pub struct ReceiveWorker<S> {
    storage: Arc<S>,
    config: Arc<TransferConfig>,
    log: ReceiverLog,
    codec: Codec,
}

impl<S> ReceiveWorker<S>
where
    S: Storage + 'static,
{
    pub fn new(
        storage: Arc<S>,
        config: Arc<TransferConfig>,
        log: ReceiverLog,
        cancel: CancellationToken,
    ) -> Self {
        let codec = Codec::new(config.wire_format, config.io_timeout(), cancel);
        Self { storage, config, log, codec }
    }

    /// Handle one connection. Errors are logged with the peer address before
    /// being returned; a peer that closes early is not an error.
    pub async fn run<T>(self, stream: T, peer: SocketAddr) -> Result<IncomingTransfer, TransferError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match self.receive(stream, peer).await {
            Ok(incoming) => Ok(incoming),
            Err(e) => {
                self.log.error(format!("Error receiving file from {}: {}", peer.ip(), e));
                Err(e)
            }
        }
    }

    async fn receive<T>(&self, mut stream: T, peer: SocketAddr) -> Result<IncomingTransfer, TransferError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let filename = self.codec.recv_filename(&mut stream).await?;
        // Refuse a bad name before acknowledging it so the sender fails fast
        self.storage.destination(&filename)?;
        self.log.info(format!("Receiving file '{}' from {}", filename, peer.ip()));
        self.codec.send_ack(&mut stream, Ack::Filename).await?;

        let declared_size = self.codec.recv_size(&mut stream).await?;
        self.log.info(format!("File size: {:.1} KB", kib(declared_size)));
        self.codec.send_ack(&mut stream, Ack::FileSize).await?;

        let (destination, mut file) = self.storage.create(&filename).await?;
        let mut incoming = IncomingTransfer {
            peer,
            filename,
            declared_size,
            destination,
            received: 0,
            started: Instant::now(),
            elapsed: Duration::ZERO,
        };

        let log_every = self.config.progress_log_interval.max(1);
        let mut next_mark = log_every;
        let mut buf = vec![0u8; self.config.chunk_size()];

        while incoming.received < declared_size {
            let want = (declared_size - incoming.received).min(buf.len() as u64) as usize;
            let n = self.codec.read_chunk(&mut stream, &mut buf[..want]).await?;
            if n == 0 {
                break;
            }

            file.write_all(&buf[..n]).await?;
            incoming.received += n as u64;

            if incoming.received >= next_mark {
                self.log.info(format!(
                    "Transfer progress: {:.1}% ({:.1} KB)",
                    incoming.received as f64 * 100.0 / declared_size as f64,
                    kib(incoming.received)
                ));
                while next_mark <= incoming.received {
                    next_mark += log_every;
                }
            }
        }
        file.flush().await?;
        incoming.elapsed = incoming.started.elapsed();

        let secs = incoming.elapsed.as_secs_f64();
        let speed = if secs > 0.0 { kib(incoming.received) / secs } else { 0.0 };

        if incoming.is_complete() {
            self.log.info(format!(
                "File '{}' received successfully from {}",
                incoming.filename,
                peer.ip()
            ));
        } else {
            self.log.warn(format!(
                "Connection from {} closed early: {} of {} bytes received",
                peer.ip(),
                incoming.received,
                declared_size
            ));
        }
        self.log.info(format!(
            "Transfer complete: {:.1} KB in {:.1} seconds ({:.1} KB/s)",
            kib(incoming.received),
            secs,
            speed
        ));
        self.log.info(format!("File saved to {}", incoming.destination.display()));

        Ok(incoming)
    }
}

fn kib(bytes: u64) -> f64 {
    bytes as f64 / 1024.0
}

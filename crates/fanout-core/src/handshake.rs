//! Handshake codec.
//!
//! Sender and receiver run the same exchange in mirrored roles:
//!
//! ```text
//! sender   -> filename (UTF-8)
//! receiver -> "Filename received"
//! sender   -> file size (decimal ASCII)
//! receiver -> "File size received"
//! sender   -> raw file bytes until EOF, then close
//! ```
//!
//! - `WireFormat::Framed` puts a u32 BE length in front of each handshake message.
//! - `WireFormat::Legacy` sends each message bare; the reader takes whatever a
//!   single 1024-byte read returns as the whole message, so longer names are cut.
//!
//! Every operation is bounded by the optional per-op timeout and raced against
//! the owning task's cancellation token.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

pub const FILENAME_ACK: &[u8] = b"Filename received";
pub const FILE_SIZE_ACK: &[u8] = b"File size received";

/// Single-read buffer size of the unframed format.
pub const LEGACY_READ_LIMIT: usize = 1024;

/// Upper bound on a framed handshake message.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Framed,
    Legacy,
}

impl std::str::FromStr for WireFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "framed" => Ok(Self::Framed),
            "legacy" => Ok(Self::Legacy),
            other => anyhow::bail!("unknown wire format: {} (expected framed or legacy)", other),
        }
    }
}

/// The two acknowledgments a receiver sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Filename,
    FileSize,
}

impl Ack {
    pub fn token(self) -> &'static [u8] {
        match self {
            Ack::Filename => FILENAME_ACK,
            Ack::FileSize => FILE_SIZE_ACK,
        }
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ack::Filename => f.write_str("filename"),
            Ack::FileSize => f.write_str("file size"),
        }
    }
}

/// Minimal length-prefixed frame helpers (u32 BE length).
async fn write_lp<T: AsyncWrite + Unpin>(transport: &mut T, data: &[u8]) -> io::Result<()> {
    transport.write_all(&(data.len() as u32).to_be_bytes()).await?;
    transport.write_all(data).await?;
    transport.flush().await?;
    Ok(())
}

async fn read_lp<T: AsyncRead + Unpin>(transport: &mut T) -> io::Result<Vec<u8>> {
    let mut lenb = [0u8; 4];
    transport.read_exact(&mut lenb).await?;
    let len = u32::from_be_bytes(lenb) as usize;

    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("handshake frame too large: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_bare<T: AsyncWrite + Unpin>(transport: &mut T, data: &[u8]) -> io::Result<()> {
    transport.write_all(data).await?;
    transport.flush().await
}

async fn read_bare<T: AsyncRead + Unpin>(transport: &mut T) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; LEGACY_READ_LIMIT];
    let n = transport.read(&mut buf).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed during handshake",
        ));
    }
    buf.truncate(n);
    Ok(buf)
}

/// Handshake and stream I/O for one connection.
#[derive(Debug, Clone)]
pub struct Codec {
    format: WireFormat,
    io_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Codec {
    pub fn new(format: WireFormat, io_timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self { format, io_timeout, cancel }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one I/O operation under the timeout and the cancellation token.
    pub async fn guard<F, T>(&self, op: &'static str, fut: F) -> Result<T, TransferError>
    where
        F: Future<Output = io::Result<T>>,
    {
        let timed = async {
            match self.io_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                    Ok(res) => res.map_err(TransferError::from),
                    Err(_) => Err(TransferError::Timeout { op, timeout }),
                },
                None => fut.await.map_err(TransferError::from),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            res = timed => res,
        }
    }

    async fn write_message<T>(&self, transport: &mut T, data: &[u8], op: &'static str) -> Result<(), TransferError>
    where
        T: AsyncWrite + Unpin,
    {
        match self.format {
            WireFormat::Framed => self.guard(op, write_lp(transport, data)).await,
            WireFormat::Legacy => self.guard(op, write_bare(transport, data)).await,
        }
    }

    async fn read_message<T>(&self, transport: &mut T, op: &'static str) -> Result<Vec<u8>, TransferError>
    where
        T: AsyncRead + Unpin,
    {
        match self.format {
            WireFormat::Framed => self.guard(op, read_lp(transport)).await,
            WireFormat::Legacy => self.guard(op, read_bare(transport)).await,
        }
    }

    pub async fn send_filename<T>(&self, transport: &mut T, filename: &str) -> Result<(), TransferError>
    where
        T: AsyncWrite + Unpin,
    {
        if self.format == WireFormat::Framed && filename.len() > MAX_FRAME_LEN {
            return Err(TransferError::InvalidFilename(format!(
                "name is {} bytes, limit is {}",
                filename.len(),
                MAX_FRAME_LEN
            )));
        }
        self.write_message(transport, filename.as_bytes(), "send filename").await
    }

    pub async fn recv_filename<T>(&self, transport: &mut T) -> Result<String, TransferError>
    where
        T: AsyncRead + Unpin,
    {
        let raw = self.read_message(transport, "receive filename").await?;
        String::from_utf8(raw).map_err(|e| TransferError::InvalidFilename(e.to_string()))
    }

    pub async fn send_size<T>(&self, transport: &mut T, size: u64) -> Result<(), TransferError>
    where
        T: AsyncWrite + Unpin,
    {
        self.write_message(transport, size.to_string().as_bytes(), "send file size").await
    }

    pub async fn recv_size<T>(&self, transport: &mut T) -> Result<u64, TransferError>
    where
        T: AsyncRead + Unpin,
    {
        let raw = self.read_message(transport, "receive file size").await?;
        parse_size(&raw)
    }

    pub async fn send_ack<T>(&self, transport: &mut T, ack: Ack) -> Result<(), TransferError>
    where
        T: AsyncWrite + Unpin,
    {
        self.write_message(transport, ack.token(), "send ack").await
    }

    /// Wait for `ack`; anything but the exact literal is a mismatch.
    pub async fn expect_ack<T>(&self, transport: &mut T, ack: Ack) -> Result<(), TransferError>
    where
        T: AsyncRead + Unpin,
    {
        let received = match self.read_message(transport, "await ack").await {
            Ok(received) => received,
            // A peer that hangs up instead of acknowledging never sent the ack
            Err(TransferError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Vec::new(),
            Err(e) => return Err(e),
        };

        if received != ack.token() {
            return Err(TransferError::AckMismatch { ack, received });
        }
        Ok(())
    }

    pub async fn write_chunk<T>(&self, transport: &mut T, chunk: &[u8]) -> Result<(), TransferError>
    where
        T: AsyncWrite + Unpin,
    {
        self.guard("write chunk", transport.write_all(chunk)).await
    }

    /// Read up to `buf.len()` stream bytes; 0 means the peer closed.
    pub async fn read_chunk<T>(&self, transport: &mut T, buf: &mut [u8]) -> Result<usize, TransferError>
    where
        T: AsyncRead + Unpin,
    {
        self.guard("read chunk", transport.read(buf)).await
    }
}

/// Parse the decimal size text sent in step 3.
pub fn parse_size(raw: &[u8]) -> Result<u64, TransferError> {
    let text = String::from_utf8_lossy(raw);
    text.trim()
        .parse::<u64>()
        .map_err(|_| TransferError::MalformedSize(text.into_owned()))
}

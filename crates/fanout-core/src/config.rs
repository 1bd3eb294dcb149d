use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use storage::PathPolicy;

use crate::handshake::WireFormat;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Address the listener binds to
    pub listen_host: String,

    /// Listener port, and the port used for targets given without one
    pub port: u16,

    /// Directory received files are written under
    pub save_dir: PathBuf,

    /// Pending-connection backlog for the listener socket
    pub backlog: u32,

    /// Bytes per read/write cycle while streaming (4 KiB)
    pub chunk_size: usize,

    pub connect_timeout_ms: u64,

    /// Bound on every single handshake or stream operation; `None` waits forever
    pub io_timeout_ms: Option<u64>,

    /// Minimum spacing between throughput samples
    pub sample_interval_ms: u64,

    /// Receiver emits a progress log line every this many bytes (512 KiB)
    pub progress_log_interval: u64,

    pub wire_format: WireFormat,

    pub path_policy: PathPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            port: 5000,
            save_dir: PathBuf::from("received_files"),
            backlog: 5,
            chunk_size: 4096,
            connect_timeout_ms: 5_000,
            io_timeout_ms: Some(30_000),
            sample_interval_ms: 500,
            progress_log_interval: 512 * 1024,
            wire_format: WireFormat::default(),
            path_policy: PathPolicy::default(),
        }
    }
}

impl TransferConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_save_dir(mut self, save_dir: impl Into<PathBuf>) -> Self {
        self.save_dir = save_dir.into();
        self
    }

    pub fn with_wire_format(mut self, wire_format: WireFormat) -> Self {
        self.wire_format = wire_format;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Chunk size clamped to at least one byte.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }

    pub fn ensure_save_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.save_dir)?;
        Ok(())
    }
}

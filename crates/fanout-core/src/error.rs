use std::time::Duration;
use thiserror::Error;

use crate::handshake::Ack;

/// Everything that can end a session or a receive worker.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("invalid target address: {0}")]
    InvalidTarget(String),

    #[error("connection to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("peer did not acknowledge {ack}")]
    AckMismatch { ack: Ack, received: Vec<u8> },

    #[error("malformed file size: {0:?}")]
    MalformedSize(String),

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("task aborted: {0}")]
    Aborted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl TransferError {
    /// Error text cut down to `max` characters for a status line.
    pub fn short_cause(&self, max: usize) -> String {
        truncate_chars(&self.to_string(), max)
    }
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_mismatch_names_missing_ack() {
        let err = TransferError::AckMismatch {
            ack: Ack::FileSize,
            received: b"nope".to_vec(),
        };
        assert_eq!(err.to_string(), "peer did not acknowledge file size");
    }

    #[test]
    fn test_short_cause_respects_char_boundaries() {
        let err = TransferError::InvalidFilename("äöüäöüäöüäöüäöü".into());
        let short = err.short_cause(20);
        assert_eq!(short.chars().count(), 20);
        assert!(short.starts_with("invalid filename: "));

        let io = TransferError::Cancelled;
        assert_eq!(io.short_cause(20), "cancelled");
    }
}

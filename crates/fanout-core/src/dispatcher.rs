//! Fan-out of one file to many targets.
//!
//! Each target gets its own [`TransferSession`] on its own task. Sessions share
//! nothing mutable, and one failing never touches another.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::progress::ProgressTx;
use crate::session::{SessionReport, TransferSession};

/// A file and the targets it should reach. Metadata is read once, here.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    path: PathBuf,
    filename: String,
    size: u64,
    targets: Vec<String>,
}

impl TransferRequest {
    pub fn new<I, S>(path: impl Into<PathBuf>, targets: I) -> Result<Self, TransferError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path = path.into();
        let meta = std::fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }

        // Only the final component goes on the wire
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidFilename(path.display().to_string()))?;

        Ok(Self {
            path,
            filename,
            size: meta.len(),
            targets: targets.into_iter().map(Into::into).collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }
}

/// Starts sessions; owns the parent cancellation token of everything it starts.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<TransferConfig>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token cancels every session started by this dispatcher.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn one session per target and return immediately.
    ///
    /// Must be called from within a tokio runtime. Dropping the returned
    /// [`Dispatch`] detaches the sessions; they keep running and keep
    /// reporting on `progress`.
    pub fn dispatch(&self, request: TransferRequest, progress: ProgressTx) -> Dispatch {
        let request = Arc::new(request);
        tracing::info!(
            "Initiating transfers of {} ({} bytes) to {} targets",
            request.filename(),
            request.size(),
            request.targets().len()
        );

        let handles = request
            .targets()
            .iter()
            .map(|target| {
                let cancel = self.cancel.child_token();
                let session = TransferSession::new(
                    target.clone(),
                    Arc::clone(&request),
                    Arc::clone(&self.config),
                    progress.clone(),
                    cancel.clone(),
                );
                SessionHandle {
                    target: target.clone(),
                    cancel,
                    join: tokio::spawn(session.run()),
                }
            })
            .collect();

        Dispatch { handles }
    }
}

/// Handle to one running session.
#[derive(Debug)]
pub struct SessionHandle {
    target: String,
    cancel: CancellationToken,
    join: JoinHandle<Result<SessionReport, TransferError>>,
}

impl SessionHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Ask the session to stop at its next I/O step or chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<SessionReport, TransferError> {
        match self.join.await {
            Ok(res) => res,
            Err(e) => Err(TransferError::Aborted(e.to_string())),
        }
    }
}

/// All sessions started by one `dispatch` call.
#[derive(Debug)]
pub struct Dispatch {
    handles: Vec<SessionHandle>,
}

impl Dispatch {
    pub fn handles(&self) -> &[SessionHandle] {
        &self.handles
    }

    pub fn cancel_all(&self) {
        for handle in &self.handles {
            handle.cancel();
        }
    }

    /// Wait for every session, in target order.
    pub async fn wait_all(self) -> Vec<(String, Result<SessionReport, TransferError>)> {
        let mut out = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            let target = handle.target.clone();
            out.push((target, handle.wait().await));
        }
        out
    }
}

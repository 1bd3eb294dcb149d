//! Accept loop: one [`ReceiveWorker`] task per inbound connection.

use std::net::SocketAddr;
use std::sync::Arc;

use storage::Storage;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::progress::ReceiverLog;
use crate::worker::{IncomingTransfer, ReceiveWorker};

/// Counts of what the listener handled before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerSummary {
    pub accepted: usize,
    /// Workers that received the whole declared size
    pub completed: usize,
    /// Workers whose peer closed before the declared size
    pub short: usize,
    pub failed: usize,
}

impl ListenerSummary {
    fn record(&mut self, done: Result<Result<IncomingTransfer, TransferError>, JoinError>) {
        match done {
            Ok(Ok(incoming)) if incoming.is_complete() => self.completed += 1,
            Ok(Ok(_)) => self.short += 1,
            Ok(Err(_)) | Err(_) => self.failed += 1,
        }
    }
}

pub struct Listener<S> {
    listener: TcpListener,
    storage: Arc<S>,
    config: Arc<TransferConfig>,
    log: ReceiverLog,
}

impl<S> Listener<S>
where
    S: Storage + 'static,
{
    /// Bind `listen_host:port` with address reuse and the configured backlog.
    /// A failure here is written to the log feed as a server error.
    pub async fn bind(config: TransferConfig, storage: S, log: ReceiverLog) -> Result<Self, TransferError> {
        let (listener, local_addr) = match open_socket(&config).await {
            Ok(bound) => bound,
            Err(e) => {
                log.error(format!("Server error: {}", e));
                return Err(e);
            }
        };

        log.info(format!("Server listening on {}", local_addr));

        Ok(Self {
            listener,
            storage: Arc::new(storage),
            config: Arc::new(config),
            log,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `cancel` fires or accepting itself fails. In-flight
    /// transfers are waited for, not cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<ListenerSummary, TransferError> {
        self.serve(cancel, CancellationToken::new()).await
    }

    /// Run the accept loop on its own task.
    pub fn spawn(self) -> std::io::Result<ListenerHandle> {
        let local_addr = self.local_addr()?;
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let join = tokio::spawn(self.serve(shutdown.clone(), abort.clone()));

        Ok(ListenerHandle {
            local_addr,
            shutdown,
            abort,
            join,
        })
    }

    async fn serve(
        self,
        shutdown: CancellationToken,
        abort: CancellationToken,
    ) -> Result<ListenerSummary, TransferError> {
        let mut workers = JoinSet::new();
        let mut summary = ListenerSummary::default();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        summary.accepted += 1;
                        self.log.info(format!("Connection from {}", peer));

                        let worker = ReceiveWorker::new(
                            Arc::clone(&self.storage),
                            Arc::clone(&self.config),
                            self.log.clone(),
                            abort.child_token(),
                        );
                        workers.spawn(worker.run(stream, peer));
                    }
                    Err(e) => {
                        self.log.error(format!("Server error: {}", e));
                        // In-flight transfers are left to finish on their own
                        workers.detach_all();
                        return Err(e.into());
                    }
                },
                Some(done) = workers.join_next(), if !workers.is_empty() => summary.record(done),
            }
        }

        if !workers.is_empty() {
            self.log.info(format!("Listener stopped, waiting for {} transfer(s)", workers.len()));
        }
        while let Some(done) = workers.join_next().await {
            summary.record(done);
        }

        self.log.info("Listener shut down");
        Ok(summary)
    }
}

async fn open_socket(config: &TransferConfig) -> Result<(TcpListener, SocketAddr), TransferError> {
    let addr = tokio::net::lookup_host((config.listen_host.as_str(), config.port))
        .await?
        .next()
        .ok_or_else(|| TransferError::InvalidTarget(format!("{}:{}", config.listen_host, config.port)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(config.backlog)?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

/// Handle to a spawned listener.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    abort: CancellationToken,
    join: JoinHandle<Result<ListenerSummary, TransferError>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancelling this token cancels in-flight transfers, including during a
    /// pending [`shutdown`](Self::shutdown).
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Stop accepting, let in-flight transfers finish, then return.
    pub async fn shutdown(self) -> Result<ListenerSummary, TransferError> {
        self.shutdown.cancel();
        self.wait().await
    }

    /// Stop accepting and cancel in-flight transfers.
    pub async fn abort(self) -> Result<ListenerSummary, TransferError> {
        self.abort.cancel();
        self.shutdown.cancel();
        self.wait().await
    }

    pub async fn wait(self) -> Result<ListenerSummary, TransferError> {
        match self.join.await {
            Ok(res) => res,
            Err(e) => Err(TransferError::Aborted(e.to_string())),
        }
    }
}

//! fanout core - one file, many receivers
//!
//! Sender side: a [`Dispatcher`] turns a [`TransferRequest`] into one
//! [`TransferSession`] task per target and reports through a progress channel.
//! Receiver side: a [`Listener`] runs one [`ReceiveWorker`] task per accepted
//! connection and writes through a [`storage::Storage`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod net;
pub mod progress;
pub mod session;
pub mod target;
pub mod worker;

// Re-export commonly used types
pub use config::TransferConfig;
pub use dispatcher::{Dispatch, Dispatcher, SessionHandle, TransferRequest};
pub use error::TransferError;
pub use handshake::{Ack, WireFormat};
pub use listener::{Listener, ListenerHandle, ListenerSummary};
pub use progress::{
    progress_channel, ProgressRx, ProgressTx, ProgressUpdate, ReceiverLog, SessionEvent, SessionState,
    RECEIVER_LOG_TARGET,
};
pub use session::{SessionReport, TransferSession};
pub use target::Target;
pub use worker::{IncomingTransfer, ReceiveWorker};

use crate::lock::LockTarget;
use crate::txn::TxnId;
use std::io;
use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("io error: {0}")]
    IO(Arc<io::Error>),
    #[error("config error: {0}")]
    Config(String),
    #[error("client error: {0}")]
    Client(String),
    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid lock level: {0}")]
    InvalidLockLevel(String),
    #[error("cannot acquire {target}: ancestor {blocked_at} is queued")]
    AncestorAcquisitionFailed {
        target: LockTarget,
        blocked_at: LockTarget,
    },
    #[error("txn {txn_id} aborted as deadlock victim (cycle {cycle:?})")]
    Deadlock { txn_id: TxnId, cycle: Vec<TxnId> },
    #[error("txn {0} has been aborted")]
    TxnAborted(TxnId),
    #[error("txn {0} timed out waiting for locks")]
    LockTimeout(TxnId),

    #[error("translate error: {0}")]
    Translate(String),
    #[error("storage {storage} failed: {reason}")]
    StorageExecution { storage: String, reason: String },
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::IO(Arc::new(value))
    }
}

impl Error {
    /// Whether this error means the transaction was killed rather than
    /// failing on its own.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Deadlock { .. } | Error::TxnAborted(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

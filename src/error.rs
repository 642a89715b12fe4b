use thiserror::Error;

use crate::transaction::TransactionId;

pub type VellumResult<T, E = VellumError> = Result<T, E>;

/// Reason a transaction was aborted by the lock manager or the deadlock
/// detector. Carried inside [`VellumError::TransactionAborted`] so callers can
/// distinguish policy violations from deadlock victims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    Deadlock,
}

#[derive(Debug, Error)]
pub enum VellumError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Invalid page: {0}")]
    InvalidPage(String),

    #[error("Transaction {txn_id} aborted: {reason:?}")]
    TransactionAborted {
        txn_id: TransactionId,
        reason: AbortReason,
    },
}

impl VellumError {
    /// The abort reason if this error is an abort, `None` otherwise.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            VellumError::TransactionAborted { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

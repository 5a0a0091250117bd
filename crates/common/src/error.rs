//! Caller-facing error taxonomy
//!
//! Serde-serializable because owners return these to remote callers over the
//! fabric.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for lock service operations
pub type Result<T> = std::result::Result<T, LockError>;

/// Errors surfaced to lock service callers
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LockError {
    /// FailFast policy and a conflicting holder exists
    #[error("lock conflict, would block")]
    WouldBlock,

    /// The caller's wait was canceled before the lock was granted
    #[error("lock request canceled")]
    Canceled,

    /// This transaction was chosen as the victim of a deadlock cycle
    #[error("deadlock detected")]
    DeadlockDetected,

    /// The table's bind moved to another owner or epoch; re-resolve and retry
    #[error("lock table bind changed")]
    BindChanged,

    /// Malformed request (empty keys, range end before start, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Peer RPC failure; the allocator will re-bind a dead owner
    #[error("remote lock table error: {0}")]
    Remote(String),

    /// The local service has been shut down
    #[error("lock service stopped")]
    ServiceStopped,
}

impl LockError {
    /// Whether the caller should re-resolve the bind and retry.
    ///
    /// `Canceled` and `DeadlockDetected` are terminal for the request: the
    /// transaction layer owns the decision to retry, never the lock manager.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::WouldBlock | LockError::BindChanged | LockError::Remote(_)
        )
    }
}

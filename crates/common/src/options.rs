//! Lock request options and results

use crate::Bind;
use latchkey_clock::Timestamp;
use serde::{Deserialize, Serialize};

/// Requested lock mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Single holder, conflicts with everything
    #[default]
    Exclusive,
    /// Any number of shared holders, conflicts with exclusive
    Shared,
}

impl LockMode {
    /// Whether a holder in `self` mode admits another holder in `other` mode.
    pub fn compatible_with(&self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// Key granularity of a lock request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    /// Each key is a single row key
    #[default]
    Row,
    /// Keys come in pairs forming inclusive `[start, end]` ranges
    Range,
}

/// What to do when the request conflicts with a current holder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitPolicy {
    /// Queue behind the conflict and block until granted
    #[default]
    Wait,
    /// Return `WouldBlock` immediately without enqueueing
    FailFast,
}

/// Per-request options supplied by the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    pub granularity: Granularity,
    pub mode: LockMode,
    pub policy: WaitPolicy,
}

/// Result of a successful lock acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResult {
    /// The bind the grant happened under
    pub bind: Bind,
    /// Ordering hint: an immediate grant carries the oracle's current time,
    /// a contended grant carries the releasing transaction's commit
    /// timestamp. The caller orders its own commit after this.
    pub timestamp: Timestamp,
}

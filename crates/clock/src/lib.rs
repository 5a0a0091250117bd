//! Hybrid logical timestamps for commit ordering.
//!
//! The lock manager never gates grants on time; timestamps are only attached
//! to release events so a woken waiter can order its own commit after the
//! releasing transaction's without an extra round trip.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hybrid timestamp with total ordering.
///
/// Ordering is physical time (microseconds since Unix epoch) first, then the
/// logical counter for ties within the same microsecond.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Timestamp {
    /// Physical time component (microseconds since Unix epoch)
    pub physical: u64,
    /// Logical counter for uniqueness within the same physical time
    pub logical: u32,
}

impl Timestamp {
    /// The zero timestamp, used as "no timestamp supplied".
    pub const ZERO: Timestamp = Timestamp {
        physical: 0,
        logical: 0,
    };

    /// Create a new timestamp.
    pub const fn new(physical: u64, logical: u32) -> Self {
        Self { physical, logical }
    }

    /// Whether this is the zero timestamp.
    pub fn is_zero(&self) -> bool {
        self.physical == 0 && self.logical == 0
    }

    /// The immediately following timestamp.
    pub fn next(&self) -> Self {
        Self {
            physical: self.physical,
            logical: self.logical + 1,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.physical, self.logical)
    }
}

/// The external timestamp collaborator.
///
/// `now` must be monotonically non-decreasing; `advance_to` folds an observed
/// commit timestamp into the clock so later `now` calls order after it.
pub trait TimestampOracle: Send + Sync {
    /// Current timestamp, never earlier than any previously returned one.
    fn now(&self) -> Timestamp;

    /// Advance the clock to at least `ts`.
    fn advance_to(&self, ts: Timestamp);
}

/// Atomics-based hybrid logical clock.
pub struct HlcOracle {
    last_physical: AtomicU64,
    logical: AtomicU32,
}

impl HlcOracle {
    pub fn new() -> Self {
        Self {
            last_physical: AtomicU64::new(0),
            logical: AtomicU32::new(0),
        }
    }

    fn wall_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

impl Default for HlcOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampOracle for HlcOracle {
    fn now(&self) -> Timestamp {
        let physical = Self::wall_micros();
        let last = self.last_physical.load(Ordering::SeqCst);

        if physical > last {
            self.last_physical.store(physical, Ordering::SeqCst);
            self.logical.store(0, Ordering::SeqCst);
            Timestamp::new(physical, 0)
        } else {
            // Wall clock has not moved past the last observation, tick the
            // logical counter instead.
            let logical = self.logical.fetch_add(1, Ordering::SeqCst) + 1;
            Timestamp::new(last, logical)
        }
    }

    fn advance_to(&self, ts: Timestamp) {
        let mut last = self.last_physical.load(Ordering::SeqCst);
        while ts.physical > last {
            match self.last_physical.compare_exchange(
                last,
                ts.physical,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.logical.store(ts.logical, Ordering::SeqCst);
                    return;
                }
                Err(observed) => last = observed,
            }
        }
        if ts.physical == last {
            self.logical.fetch_max(ts.logical, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        let ts1 = Timestamp::new(100, 0);
        let ts2 = Timestamp::new(100, 1);
        let ts3 = Timestamp::new(101, 0);

        assert!(ts1 < ts2);
        assert!(ts2 < ts3);
        assert!(ts1 < ts3);
    }

    #[test]
    fn test_zero() {
        assert!(Timestamp::ZERO.is_zero());
        assert!(!Timestamp::new(1, 0).is_zero());
        assert!(Timestamp::ZERO < Timestamp::new(0, 1));
    }

    #[test]
    fn test_oracle_monotonic() {
        let oracle = HlcOracle::new();

        let mut last = oracle.now();
        for _ in 0..1000 {
            let ts = oracle.now();
            assert!(ts > last, "oracle timestamps must be strictly increasing");
            last = ts;
        }
    }

    #[test]
    fn test_advance_to() {
        let oracle = HlcOracle::new();

        let far_future = Timestamp::new(u64::MAX / 2, 7);
        oracle.advance_to(far_future);

        let ts = oracle.now();
        assert!(ts > far_future, "now must order after an observed commit");
    }

    #[test]
    fn test_advance_to_past_is_noop() {
        let oracle = HlcOracle::new();
        let current = oracle.now();

        oracle.advance_to(Timestamp::new(1, 0));
        assert!(oracle.now() > current);
    }
}

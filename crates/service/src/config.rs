//! Lock service configuration

use std::time::Duration;

/// Per-service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the keeper refreshes the service's allocator lease.
    pub keep_alive_interval: Duration,

    /// Timeout for peer requests (lock, unlock, waits-for snapshots).
    pub remote_timeout: Duration,

    /// How many times a request re-resolves the bind after a
    /// `BindChanged`/remote failure before surfacing the error.
    pub max_resolve_retries: usize,

    /// Period of the deadlock detector's rescan. Bounds how long a cycle
    /// formed after the initial check can go unnoticed.
    pub deadlock_check_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(1),
            remote_timeout: Duration::from_secs(5),
            max_resolve_retries: 8,
            deadlock_check_interval: Duration::from_millis(100),
        }
    }
}

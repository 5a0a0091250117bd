//! Lock table allocator: the global binding authority
//!
//! Assigns each table's lock state to one service, leases the assignment
//! against keep-alives, and supersedes it (epoch + 1) once the owner goes
//! quiet past the bind timeout. Constructed once per process and handed to
//! every service that needs it; no global state.

use latchkey_common::Bind;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Allocator configuration
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// How long a service may go without a keep-alive before its binds are
    /// superseded. This doubles as the grace period.
    pub bind_timeout: Duration,

    /// How often the background scan looks for expired services.
    pub check_interval: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            bind_timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(1),
        }
    }
}

/// Lease state for one service
struct Lease {
    last_keep_alive: Instant,
    /// Set once the service misses its lease; the next keep-alive consumes
    /// the flag and returns false so the service invalidates its tables.
    expired: bool,
}

/// A table's bind plus whether it is still honored. Expiring a service
/// invalidates its binds immediately; the epoch survives so the successor
/// bumps from it.
struct BindEntry {
    bind: Bind,
    valid: bool,
}

struct AllocatorState {
    bindings: HashMap<u64, BindEntry>,
    services: HashMap<String, Lease>,
}

impl AllocatorState {
    fn disable_binds(&mut self, service_id: &str) {
        for entry in self.bindings.values_mut() {
            if entry.bind.service_id == service_id {
                entry.valid = false;
            }
        }
    }
}

/// Global authority over table-to-service bindings
pub struct LockTableAllocator {
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LockTableAllocator {
    pub fn new(config: AllocatorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(AllocatorState {
                bindings: HashMap::new(),
                services: HashMap::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the background expiry scan (call once).
    pub fn start(self: &Arc<Self>) {
        let allocator = self.clone();
        let check_interval = self.config.check_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                interval.tick().await;
                allocator.scan_expired();
            }
        });
        self.tasks.lock().push(task);
    }

    /// Shutdown the allocator, aborting background tasks.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Resolve the current bind for a table, creating one if the table is
    /// unbound or its owner has expired.
    ///
    /// First request for an unbound table binds it to the requester at epoch
    /// 0 (requester affinity). A table whose owner expired is re-bound to the
    /// requester at epoch + 1.
    pub fn get_bind(&self, requester: &str, table: u64) -> Bind {
        let mut state = self.state.lock();

        state
            .services
            .entry(requester.to_string())
            .or_insert_with(|| Lease {
                last_keep_alive: Instant::now(),
                expired: false,
            });

        if let Some(entry) = state.bindings.get(&table) {
            let owner_alive = state
                .services
                .get(&entry.bind.service_id)
                .map(|l| !l.expired && l.last_keep_alive.elapsed() < self.config.bind_timeout)
                .unwrap_or(false);
            if entry.valid && owner_alive {
                return entry.bind.clone();
            }

            let superseded = Bind::new(table, requester, entry.bind.epoch + 1);
            tracing::info!(
                "rebinding table {}: {} -> {}",
                table,
                entry.bind,
                superseded
            );
            state.bindings.insert(
                table,
                BindEntry {
                    bind: superseded.clone(),
                    valid: true,
                },
            );
            return superseded;
        }

        let bind = Bind::new(table, requester, 0);
        tracing::debug!("binding {}", bind);
        state.bindings.insert(
            table,
            BindEntry {
                bind: bind.clone(),
                valid: true,
            },
        );
        bind
    }

    /// Refresh a service's lease.
    ///
    /// Returns false once after the service has been expired: the signal for
    /// the service to invalidate its local tables and fail queued waiters
    /// with `BindChanged`. The lease is fresh again afterwards.
    pub fn keep_alive(&self, service_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.services.get_mut(service_id) {
            Some(lease) => {
                lease.last_keep_alive = Instant::now();
                if lease.expired {
                    lease.expired = false;
                    return false;
                }
                true
            }
            None => {
                state.services.insert(
                    service_id.to_string(),
                    Lease {
                        last_keep_alive: Instant::now(),
                        expired: false,
                    },
                );
                true
            }
        }
    }

    /// Force a service's lease to expire, as the scan would after a missed
    /// bind timeout. Its binds stop being honored immediately and are
    /// superseded on the next resolve.
    pub fn expire_service(&self, service_id: &str) {
        let mut state = self.state.lock();
        if let Some(lease) = state.services.get_mut(service_id) {
            if !lease.expired {
                tracing::info!("service {} expired", service_id);
                lease.expired = true;
                state.disable_binds(service_id);
            }
        }
    }

    /// Services with a live lease. The deadlock detector's peer list.
    pub fn active_services(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .services
            .iter()
            .filter(|(_, l)| !l.expired && l.last_keep_alive.elapsed() < self.config.bind_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Current bind for a table, if any.
    pub fn table_bind(&self, table: u64) -> Option<Bind> {
        self.state.lock().bindings.get(&table).map(|e| e.bind.clone())
    }

    fn scan_expired(&self) {
        let mut state = self.state.lock();
        let bind_timeout = self.config.bind_timeout;
        let quiet: Vec<String> = state
            .services
            .iter()
            .filter(|(_, l)| !l.expired && l.last_keep_alive.elapsed() >= bind_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in quiet {
            tracing::warn!("service {} missed its lease, expiring", id);
            if let Some(lease) = state.services.get_mut(&id) {
                lease.expired = true;
            }
            state.disable_binds(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator() -> Arc<LockTableAllocator> {
        LockTableAllocator::new(AllocatorConfig {
            bind_timeout: Duration::from_secs(10),
            check_interval: Duration::from_millis(50),
        })
    }

    #[test]
    fn test_first_bind_goes_to_requester() {
        let alloc = test_allocator();
        let bind = alloc.get_bind("s1", 7);
        assert_eq!(bind, Bind::new(7, "s1", 0));

        // Another requester sees the same bind while the owner is live.
        let bind = alloc.get_bind("s2", 7);
        assert_eq!(bind, Bind::new(7, "s1", 0));
    }

    #[test]
    fn test_rebind_bumps_epoch() {
        let alloc = test_allocator();
        assert_eq!(alloc.get_bind("s1", 7), Bind::new(7, "s1", 0));

        alloc.expire_service("s1");
        let bind = alloc.get_bind("s2", 7);
        assert_eq!(bind, Bind::new(7, "s2", 1));
        assert_eq!(alloc.table_bind(7), Some(bind));
    }

    #[test]
    fn test_expired_binds_stay_invalid_after_readmission() {
        let alloc = test_allocator();
        assert_eq!(alloc.get_bind("s1", 7), Bind::new(7, "s1", 0));
        alloc.expire_service("s1");

        // The owner comes back before anyone re-resolves.
        assert!(!alloc.keep_alive("s1"));
        assert!(alloc.keep_alive("s1"));

        // Its old bind is still superseded.
        assert_eq!(alloc.get_bind("s2", 7), Bind::new(7, "s2", 1));
    }

    #[test]
    fn test_keep_alive_reports_expiry_once() {
        let alloc = test_allocator();
        assert!(alloc.keep_alive("s1"));

        alloc.expire_service("s1");
        assert!(!alloc.keep_alive("s1"));
        // Consumed: the service is admitted again.
        assert!(alloc.keep_alive("s1"));
    }

    #[test]
    fn test_active_services() {
        let alloc = test_allocator();
        alloc.keep_alive("s1");
        alloc.keep_alive("s2");
        alloc.expire_service("s2");

        let active = alloc.active_services();
        assert_eq!(active, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_scan_expires_quiet_services() {
        let alloc = LockTableAllocator::new(AllocatorConfig {
            bind_timeout: Duration::from_millis(50),
            check_interval: Duration::from_millis(10),
        });
        alloc.start();

        assert!(alloc.keep_alive("s1"));
        tokio::time::sleep(Duration::from_millis(150)).await;

        // The scan expired us while we were quiet.
        assert!(!alloc.keep_alive("s1"));
        alloc.shutdown();
    }
}

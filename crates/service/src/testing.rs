//! Test harness: whole clusters on one in-process fabric
//!
//! Spins up an allocator and N services wired to the same fabric, with
//! intervals tightened so lease expiry and deadlock detection are visible
//! within test timescales.

use crate::config::Config;
use crate::service::LockService;
use latchkey_allocator::{AllocatorConfig, LockTableAllocator};
use latchkey_clock::HlcOracle;
use latchkey_fabric::{Fabric, FabricClient};
use std::sync::Arc;
use std::time::Duration;

/// A running cluster of lock services sharing one allocator and fabric
pub struct TestCluster {
    pub fabric: Arc<Fabric>,
    pub allocator: Arc<LockTableAllocator>,
    pub services: Vec<Arc<LockService>>,
}

impl TestCluster {
    /// Start a cluster with fast default intervals.
    pub fn start(service_ids: &[&str]) -> Self {
        Self::start_with(
            service_ids,
            AllocatorConfig {
                bind_timeout: Duration::from_secs(10),
                check_interval: Duration::from_millis(50),
            },
            Config {
                keep_alive_interval: Duration::from_millis(20),
                remote_timeout: Duration::from_secs(1),
                deadlock_check_interval: Duration::from_millis(20),
                ..Config::default()
            },
        )
    }

    pub fn start_with(
        service_ids: &[&str],
        allocator_config: AllocatorConfig,
        config: Config,
    ) -> Self {
        init_tracing();

        let fabric = Arc::new(Fabric::new());
        let allocator = LockTableAllocator::new(allocator_config);
        allocator.start();

        let services = service_ids
            .iter()
            .map(|id| {
                let service = LockService::new(
                    *id,
                    config.clone(),
                    FabricClient::new(id.to_string(), fabric.clone()),
                    allocator.clone(),
                    Arc::new(HlcOracle::new()),
                );
                service.start();
                service
            })
            .collect();

        Self {
            fabric,
            allocator,
            services,
        }
    }

    pub fn service(&self, index: usize) -> &Arc<LockService> {
        &self.services[index]
    }

    pub fn shutdown(&self) {
        for service in &self.services {
            service.shutdown();
        }
        self.allocator.shutdown();
    }
}

/// Poll until at least `count` live waiters are queued on entries overlapping
/// `key` of `table` on `service`. Panics after 5 seconds.
pub async fn wait_waiters(service: &LockService, table: u64, key: &[u8], count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while service.waiter_count(table, key) < count {
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for {} waiters on table {} key {:?}",
                count, table, key
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

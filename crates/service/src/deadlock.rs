//! Cross-node deadlock detection
//!
//! Walks the waits-for relation from every locally blocked transaction,
//! querying peers for edges it cannot see. Snapshot-then-traverse: local
//! edges are copied out under a brief store lock and every remote call
//! happens with no lock held, so the detector can never deadlock the lock
//! manager on itself.

use latchkey_allocator::LockTableAllocator;
use latchkey_common::TxnId;
use latchkey_fabric::FabricClient;
use latchkey_protocol::{lock_subject, PeerRequest, PeerResponse};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Bound on waits-for traversal depth per scan.
const MAX_TRAVERSAL_DEPTH: usize = 32;

/// Detector for one service's locally blocked transactions
pub struct DeadlockDetector {
    service_id: String,
    allocator: Arc<LockTableAllocator>,
    client: FabricClient,
    remote_timeout: Duration,
}

impl DeadlockDetector {
    pub fn new(
        service_id: String,
        allocator: Arc<LockTableAllocator>,
        client: FabricClient,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            service_id,
            allocator,
            client,
            remote_timeout,
        }
    }

    /// Run one scan. `local_edges` snapshots the waits-for edges of this
    /// service's tables; it is called again for the verification pass so a
    /// cycle broken mid-scan is never acted on (no false positives).
    ///
    /// Returns the victims to abort: for each verified cycle, the
    /// transaction with the largest ID. Every node applies the same pure
    /// rule, so both ends of a cross-node cycle agree without coordination;
    /// only the node hosting the victim's waiter actually aborts it.
    pub async fn scan<F>(&self, local_edges: F) -> Vec<TxnId>
    where
        F: Fn() -> Vec<(TxnId, TxnId)>,
    {
        let peers = self.peers();
        let adjacency = build_adjacency(local_edges());
        let origins: Vec<TxnId> = adjacency.keys().cloned().collect();

        let mut victims = Vec::new();
        for origin in origins {
            if self.find_cycle(&origin, &adjacency, &peers).await.is_none() {
                continue;
            }

            // Re-verify against a fresh snapshot before condemning anyone.
            let fresh = build_adjacency(local_edges());
            if let Some(cycle) = self.find_cycle(&origin, &fresh, &peers).await {
                let victim = cycle.iter().max().cloned().unwrap_or(origin);
                tracing::warn!(
                    "deadlock cycle of {} txns, victim {}",
                    cycle.len(),
                    victim
                );
                if !victims.contains(&victim) {
                    victims.push(victim);
                }
            }
        }
        victims
    }

    /// Breadth-first walk of the waits-for relation from `origin`, following
    /// remote edges through peers. Returns the transactions on a path back
    /// to `origin`, if one exists within the depth bound.
    async fn find_cycle(
        &self,
        origin: &TxnId,
        local: &HashMap<TxnId, Vec<TxnId>>,
        peers: &[String],
    ) -> Option<Vec<TxnId>> {
        let mut remote_cache: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
        let mut parents: HashMap<TxnId, TxnId> = HashMap::new();
        let mut visited: HashSet<TxnId> = HashSet::from([origin.clone()]);
        let mut queue: VecDeque<(TxnId, usize)> = VecDeque::from([(origin.clone(), 0)]);

        while let Some((txn, depth)) = queue.pop_front() {
            if depth >= MAX_TRAVERSAL_DEPTH {
                continue;
            }

            let targets = match local.get(&txn) {
                Some(targets) => targets.clone(),
                None => match remote_cache.get(&txn) {
                    Some(targets) => targets.clone(),
                    None => {
                        let targets = self.remote_waiting_list(&txn, peers).await;
                        remote_cache.insert(txn.clone(), targets.clone());
                        targets
                    }
                },
            };

            for target in targets {
                if &target == origin {
                    // Walk the parent chain back to the origin.
                    let mut cycle = vec![txn.clone()];
                    let mut current = txn.clone();
                    while let Some(parent) = parents.get(&current) {
                        cycle.push(parent.clone());
                        current = parent.clone();
                    }
                    return Some(cycle);
                }
                if visited.insert(target.clone()) {
                    parents.insert(target.clone(), txn.clone());
                    queue.push_back((target, depth + 1));
                }
            }
        }
        None
    }

    /// Live peers at the start of a scan; the whole scan traverses one
    /// consistent membership view.
    fn peers(&self) -> Vec<String> {
        let mut peers = self.allocator.active_services();
        peers.retain(|p| *p != self.service_id);
        peers
    }

    /// Ask every live peer which transactions `txn` is waiting for on their
    /// tables. A peer that fails to answer contributes no edges; that is a
    /// transient false negative the next rescan repairs.
    async fn remote_waiting_list(&self, txn: &TxnId, peers: &[String]) -> Vec<TxnId> {
        let mut targets = Vec::new();
        for peer in peers {
            let request = PeerRequest::WaitingList {
                txn_id: txn.clone(),
            };
            let reply = self
                .client
                .request(
                    &lock_subject(peer),
                    request.into_message(),
                    self.remote_timeout.as_millis() as u64,
                )
                .await;
            match reply.map(|msg| PeerResponse::from_message(&msg)) {
                Ok(Ok(PeerResponse::WaitingList { waiting_for })) => {
                    for target in waiting_for {
                        if !targets.contains(&target) {
                            targets.push(target);
                        }
                    }
                }
                other => {
                    tracing::debug!("waits-for query to {} failed: {:?}", peer, other.err());
                }
            }
        }
        targets
    }
}

fn build_adjacency(edges: Vec<(TxnId, TxnId)>) -> HashMap<TxnId, Vec<TxnId>> {
    let mut adjacency: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
    for (from, to) in edges {
        let targets = adjacency.entry(from).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
    }
    adjacency
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_allocator::AllocatorConfig;
    use latchkey_fabric::Fabric;

    fn detector() -> DeadlockDetector {
        let allocator = LockTableAllocator::new(AllocatorConfig::default());
        let fabric = Arc::new(Fabric::new());
        DeadlockDetector::new(
            "s1".to_string(),
            allocator,
            FabricClient::new("s1".to_string(), fabric),
            Duration::from_millis(100),
        )
    }

    fn txn(name: &str) -> TxnId {
        TxnId::from(name)
    }

    #[tokio::test]
    async fn test_detects_local_cycle() {
        let d = detector();
        let edges = vec![
            (txn("txn1"), txn("txn2")),
            (txn("txn2"), txn("txn3")),
            (txn("txn3"), txn("txn1")),
        ];

        let victims = d.scan(|| edges.clone()).await;
        // Every origin finds the same cycle; one victim, the largest ID.
        assert_eq!(victims, vec![txn("txn3")]);
    }

    #[tokio::test]
    async fn test_no_cycle_no_victim() {
        let d = detector();
        let edges = vec![(txn("txn1"), txn("txn2")), (txn("txn2"), txn("txn3"))];
        assert!(d.scan(|| edges.clone()).await.is_empty());
    }

    #[tokio::test]
    async fn test_broken_cycle_not_condemned() {
        let d = detector();
        // First snapshot shows a cycle, the verification snapshot does not.
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let victims = d
            .scan(|| {
                if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    vec![(txn("txn1"), txn("txn2")), (txn("txn2"), txn("txn1"))]
                } else {
                    vec![(txn("txn1"), txn("txn2"))]
                }
            })
            .await;
        assert!(victims.is_empty());
    }

    #[tokio::test]
    async fn test_two_party_cycle_victim_is_larger() {
        let d = detector();
        let edges = vec![(txn("txn1"), txn("txn2")), (txn("txn2"), txn("txn1"))];
        assert_eq!(d.scan(|| edges.clone()).await, vec![txn("txn2")]);
    }
}

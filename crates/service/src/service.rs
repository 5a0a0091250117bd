//! The lock service: routing, peer serving, lease keeping, detection
//!
//! One `LockService` per node. It resolves each table's bind through the
//! allocator, serves lock traffic for tables bound to it, forwards the rest
//! to their owners over the fabric, and runs the background tasks that keep
//! the whole thing honest: the lease keeper and the deadlock detector.

use crate::config::Config;
use crate::deadlock::DeadlockDetector;
use crate::local::LocalLockTable;
use crate::remote::RemoteLockTable;
use crate::store::KeyRange;
use crate::waiter::WaitState;
use dashmap::DashMap;
use latchkey_allocator::LockTableAllocator;
use latchkey_clock::{Timestamp, TimestampOracle};
use latchkey_common::{
    Granularity, LockError, LockOptions, LockResult, Result, TxnId,
};
use latchkey_fabric::{FabricClient, Message};
use latchkey_protocol::{lock_subject, PeerRequest, PeerResponse};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Where lock traffic for a table goes
#[derive(Clone)]
enum TableRoute {
    Local(Arc<LocalLockTable>),
    Remote(Arc<RemoteLockTable>),
}

/// One node's lock service
pub struct LockService {
    service_id: String,
    config: Config,
    client: FabricClient,
    allocator: Arc<LockTableAllocator>,
    oracle: Arc<dyn TimestampOracle>,

    /// Resolved routes, invalidated on bind changes and lease expiry.
    tables: DashMap<u64, TableRoute>,

    /// Tables each transaction touched through this service, for unlock.
    footprint: DashMap<TxnId, HashSet<u64>>,

    block_hint_tx: mpsc::UnboundedSender<TxnId>,
    /// Taken by the detector task on start.
    block_hint_rx: Mutex<Option<mpsc::UnboundedReceiver<TxnId>>>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl LockService {
    pub fn new(
        service_id: impl Into<String>,
        config: Config,
        client: FabricClient,
        allocator: Arc<LockTableAllocator>,
        oracle: Arc<dyn TimestampOracle>,
    ) -> Arc<Self> {
        let (block_hint_tx, block_hint_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            service_id: service_id.into(),
            config,
            client,
            allocator,
            oracle,
            tables: DashMap::new(),
            footprint: DashMap::new(),
            block_hint_tx,
            block_hint_rx: Mutex::new(Some(block_hint_rx)),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Start the peer handler, the lease keeper, and the deadlock detector
    /// (call once).
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        // Peer requests for tables bound to this service.
        let mut handler_rx = self.client.register_handler(&lock_subject(&self.service_id));
        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            while let Some((msg, reply)) = handler_rx.recv().await {
                let Some(service) = weak.upgrade() else { break };
                tokio::spawn(async move {
                    service.handle_peer(msg, reply).await;
                });
            }
        }));

        // Lease keeper. A false keep-alive means the allocator already
        // superseded our binds; every local table is now stale.
        let weak = Arc::downgrade(self);
        let keep_alive_interval = self.config.keep_alive_interval;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(keep_alive_interval);
            loop {
                interval.tick().await;
                let Some(service) = weak.upgrade() else { break };
                if !service.allocator.keep_alive(&service.service_id) {
                    tracing::warn!(
                        "service {} lease expired, invalidating local tables",
                        service.service_id
                    );
                    service.invalidate_tables(WaitState::Stale);
                }
            }
        }));

        // Deadlock detector: rescan on a timer and on every fresh block.
        let detector = DeadlockDetector::new(
            self.service_id.clone(),
            self.allocator.clone(),
            self.client.clone(),
            self.config.remote_timeout,
        );
        let mut hint_rx = self
            .block_hint_rx
            .lock()
            .take()
            .expect("detector already started");
        let weak = Arc::downgrade(self);
        let check_interval = self.config.deadlock_check_interval;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    hint = hint_rx.recv() => {
                        if hint.is_none() {
                            break;
                        }
                    }
                }
                let Some(service) = weak.upgrade() else { break };
                let victims = detector.scan(|| service.local_edges()).await;
                for victim in victims {
                    service.abort_local(&victim);
                }
            }
        }));
    }

    /// Stop serving. Queued waiters fail with `Canceled`; held locks vanish
    /// with the in-memory state.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("lock service {} shutting down", self.service_id);
        self.client
            .fabric()
            .deregister_handler(&lock_subject(&self.service_id));
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.invalidate_tables(WaitState::Canceled);
        self.footprint.clear();
    }

    /// Acquire locks on `keys` of `table` for `txn`.
    ///
    /// Resolves the table's bind, forwarding to the owner if it is another
    /// service. A `BindChanged` or remote failure drops the cached route and
    /// retries against the freshly resolved owner, a bounded number of times.
    pub async fn lock(
        &self,
        table: u64,
        keys: Vec<Vec<u8>>,
        txn: TxnId,
        options: LockOptions,
    ) -> Result<LockResult> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(LockError::ServiceStopped);
        }
        let ranges = parse_keys(&keys, options.granularity)?;

        let mut last_err = LockError::BindChanged;
        for _ in 0..self.config.max_resolve_retries {
            let result = match self.resolve(table) {
                TableRoute::Local(t) => t.lock(txn.clone(), ranges.clone(), options).await,
                TableRoute::Remote(r) => r.lock(txn.clone(), keys.clone(), options).await,
            };
            match result {
                Ok(result) => {
                    self.footprint
                        .entry(txn)
                        .or_default()
                        .insert(table);
                    return Ok(result);
                }
                Err(err @ (LockError::BindChanged | LockError::Remote(_))) => {
                    tracing::debug!(
                        "lock on table {} failed ({}), re-resolving",
                        table,
                        err
                    );
                    self.tables.remove(&table);
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Release every lock `txn` acquired through this service.
    ///
    /// `commit_ts` is handed to woken waiters as their ordering hint; pass
    /// `Timestamp::ZERO` for aborts. Unlocking a transaction that holds
    /// nothing is a no-op.
    pub async fn unlock(&self, txn: TxnId, commit_ts: Timestamp) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(LockError::ServiceStopped);
        }
        let tables: Vec<u64> = self
            .footprint
            .remove(&txn)
            .map(|(_, tables)| tables.into_iter().collect())
            .unwrap_or_default();

        for table in tables {
            match self.resolve(table) {
                TableRoute::Local(t) => t.unlock(&txn, commit_ts),
                TableRoute::Remote(r) => {
                    if let Err(err) = r.unlock(txn.clone(), commit_ts).await {
                        // The owner is gone; its lock state went with it and
                        // a fresh owner starts empty. Nothing left to release.
                        tracing::debug!(
                            "remote unlock on table {} failed: {}",
                            table,
                            err
                        );
                        self.tables.remove(&table);
                    }
                }
            }
        }
        Ok(())
    }

    /// Live waiters on entries overlapping a row key of `table`. Zero unless
    /// the table is bound here.
    pub fn waiter_count(&self, table: u64, key: &[u8]) -> usize {
        match self.tables.get(&table).map(|r| r.value().clone()) {
            Some(TableRoute::Local(t)) => t.waiter_count(key),
            _ => 0,
        }
    }

    /// Live waiters across a whole locally bound table.
    pub fn waiter_count_total(&self, table: u64) -> usize {
        match self.tables.get(&table).map(|r| r.value().clone()) {
            Some(TableRoute::Local(t)) => t.waiter_count_total(),
            _ => 0,
        }
    }

    /// Store entries of a locally bound table. Observability and tests.
    pub fn store_len(&self, table: u64) -> usize {
        match self.tables.get(&table).map(|r| r.value().clone()) {
            Some(TableRoute::Local(t)) => t.store_len(),
            _ => 0,
        }
    }

    fn resolve(&self, table: u64) -> TableRoute {
        if let Some(route) = self.tables.get(&table) {
            return route.clone();
        }
        let bind = self.allocator.get_bind(&self.service_id, table);
        let route = if bind.service_id == self.service_id {
            TableRoute::Local(LocalLockTable::new(
                bind,
                self.oracle.clone(),
                self.block_hint_tx.clone(),
            ))
        } else {
            TableRoute::Remote(Arc::new(RemoteLockTable::new(
                bind,
                self.client.clone(),
                self.config.remote_timeout,
            )))
        };
        // A racing resolve may have inserted first; everyone uses that one.
        self.tables.entry(table).or_insert(route).clone()
    }

    fn local_tables(&self) -> Vec<Arc<LocalLockTable>> {
        self.tables
            .iter()
            .filter_map(|entry| match entry.value() {
                TableRoute::Local(t) => Some(t.clone()),
                TableRoute::Remote(_) => None,
            })
            .collect()
    }

    /// Waits-for edges across every locally bound table.
    fn local_edges(&self) -> Vec<(TxnId, TxnId)> {
        let mut edges = Vec::new();
        for table in self.local_tables() {
            table.waits_for_edges(&mut edges);
        }
        edges
    }

    /// Abort a deadlock victim's waits, if any are queued here.
    fn abort_local(&self, victim: &TxnId) {
        for table in self.local_tables() {
            if table.abort_txn(victim) {
                tracing::warn!("aborted deadlock victim {}", victim);
            }
        }
    }

    fn invalidate_tables(&self, reason: WaitState) {
        for table in self.local_tables() {
            table.close(reason);
        }
        // Remote routes may point at superseded binds too.
        self.tables.clear();
    }

    async fn handle_peer(self: Arc<Self>, msg: Message, reply: oneshot::Sender<Message>) {
        let response = match PeerRequest::from_message(&msg) {
            Err(err) => PeerResponse::Error(LockError::InvalidArgument(err.to_string())),
            Ok(request) => self.peer_response(request).await,
        };
        // A caller that timed out dropped its end; nothing to do.
        let _ = reply.send(response.into_message());
    }

    async fn peer_response(&self, request: PeerRequest) -> PeerResponse {
        if self.stopped.load(Ordering::SeqCst) {
            return PeerResponse::Error(LockError::ServiceStopped);
        }
        match request {
            PeerRequest::Lock {
                bind,
                txn_id,
                keys,
                options,
            } => {
                let table = match self.resolve(bind.table) {
                    // The caller must present the epoch we serve under.
                    TableRoute::Local(t) if t.bind() == bind => t,
                    _ => return PeerResponse::Error(LockError::BindChanged),
                };
                let ranges = match parse_keys(&keys, options.granularity) {
                    Ok(ranges) => ranges,
                    Err(err) => return PeerResponse::Error(err),
                };
                match table.lock(txn_id, ranges, options).await {
                    Ok(result) => PeerResponse::Lock(result),
                    Err(err) => PeerResponse::Error(err),
                }
            }
            PeerRequest::Unlock { txn_id, commit_ts } => {
                for table in self.local_tables() {
                    table.unlock(&txn_id, commit_ts);
                }
                PeerResponse::Unlock
            }
            PeerRequest::WaitingList { txn_id } => {
                let mut waiting_for = Vec::new();
                for (from, to) in self.local_edges() {
                    if from == txn_id && !waiting_for.contains(&to) {
                        waiting_for.push(to);
                    }
                }
                PeerResponse::WaitingList { waiting_for }
            }
        }
    }
}

impl Drop for LockService {
    fn drop(&mut self) {
        self.client
            .fabric()
            .deregister_handler(&lock_subject(&self.service_id));
    }
}

/// Validate raw keys and shape them by granularity: one range per key for
/// rows, one per consecutive `[start, end]` pair for ranges.
fn parse_keys(keys: &[Vec<u8>], granularity: Granularity) -> Result<Vec<KeyRange>> {
    if keys.is_empty() {
        return Err(LockError::InvalidArgument("no keys".to_string()));
    }
    if keys.iter().any(|k| k.is_empty()) {
        return Err(LockError::InvalidArgument("empty key".to_string()));
    }
    match granularity {
        Granularity::Row => Ok(keys.iter().cloned().map(KeyRange::row).collect()),
        Granularity::Range => {
            if keys.len() % 2 != 0 {
                return Err(LockError::InvalidArgument(
                    "range keys come in start/end pairs".to_string(),
                ));
            }
            let mut ranges = Vec::with_capacity(keys.len() / 2);
            for pair in keys.chunks(2) {
                if pair[0] > pair[1] {
                    return Err(LockError::InvalidArgument(
                        "range end precedes start".to_string(),
                    ));
                }
                ranges.push(KeyRange::range(pair[0].clone(), pair[1].clone()));
            }
            Ok(ranges)
        }
    }
}

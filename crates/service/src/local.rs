//! Local lock table: the blocking/waking protocol for one bound table
//!
//! All mutable state sits behind one mutex per table; unrelated tables never
//! contend. Grants are all-or-none with respect to observers: a blocked
//! request is visible only as a waiter, never as a partial holder.

use crate::store::{KeyRange, LockStore, Promotion};
use crate::waiter::{WaitState, Waiter};
use latchkey_clock::{Timestamp, TimestampOracle};
use latchkey_common::{Bind, LockError, LockOptions, LockResult, Result, TxnId, WaitPolicy};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

struct TableState {
    store: LockStore,
    closed: bool,
}

/// Lock table for one table bound to this service
pub struct LocalLockTable {
    bind: Bind,
    oracle: Arc<dyn TimestampOracle>,
    /// Nudges the deadlock detector whenever a request parks.
    block_hint: mpsc::UnboundedSender<TxnId>,
    state: Mutex<TableState>,
}

impl LocalLockTable {
    pub fn new(
        bind: Bind,
        oracle: Arc<dyn TimestampOracle>,
        block_hint: mpsc::UnboundedSender<TxnId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind,
            oracle,
            block_hint,
            state: Mutex::new(TableState {
                store: LockStore::new(),
                closed: false,
            }),
        })
    }

    /// The bind this table serves under.
    pub fn bind(&self) -> Bind {
        self.bind.clone()
    }

    /// Acquire all `keys` for `txn`, atomically with respect to observers.
    ///
    /// Blocks under the `Wait` policy until granted, canceled (the future is
    /// dropped), superseded by a rebind, or chosen as a deadlock victim.
    pub async fn lock(
        &self,
        txn: TxnId,
        keys: Vec<KeyRange>,
        options: LockOptions,
    ) -> Result<LockResult> {
        let (waiter, created) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(LockError::BindChanged);
            }

            let conflicts = state.store.conflicting(&keys, &txn, options.mode);
            if conflicts.is_empty() {
                for key in &keys {
                    state.store.grant(key, options.mode, &txn);
                }
                return Ok(LockResult {
                    bind: self.bind.clone(),
                    timestamp: self.oracle.now(),
                });
            }

            if options.policy == WaitPolicy::FailFast {
                return Err(LockError::WouldBlock);
            }

            // A txn re-requesting what it is already queued for shares the
            // pending waiter; the queues never grow.
            match state.store.find_waiter(&txn, options.mode, &keys) {
                Some(waiter) => (waiter, false),
                None => {
                    let waiter = Waiter::new(txn, options.mode, keys);
                    for key in &conflicts {
                        state.store.enqueue(key, &waiter);
                    }
                    (waiter, true)
                }
            }
        };

        if created {
            // Let the detector check the new edge before we park; the
            // periodic rescan covers cycles that form later.
            let _ = self.block_hint.send(waiter.txn_id().clone());
        }

        // Only the call that created the waiter owns its cancellation; a
        // dropped re-request must not fail the first.
        let guard = WaitGuard {
            table: self,
            waiter: waiter.clone(),
            armed: created,
        };
        let outcome = waiter.wait().await;
        guard.disarm();

        match outcome {
            WaitState::Granted(ts) => Ok(LockResult {
                bind: self.bind.clone(),
                timestamp: ts,
            }),
            WaitState::Deadlocked => Err(LockError::DeadlockDetected),
            WaitState::Stale => Err(LockError::BindChanged),
            WaitState::Canceled => Err(LockError::Canceled),
            WaitState::Waiting => unreachable!("wait returned while still waiting"),
        }
    }

    /// Release every lock `txn` holds here and promote unblocked waiters.
    ///
    /// Woken waiters receive `commit_ts` as their ordering hint so they can
    /// order their own commits after the releaser's.
    pub fn unlock(&self, txn: &TxnId, commit_ts: Timestamp) {
        if !commit_ts.is_zero() {
            self.oracle.advance_to(commit_ts);
        }

        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.store.release_txn(txn);

        let hint = if commit_ts.is_zero() {
            self.oracle.now()
        } else {
            commit_ts
        };
        Self::promote(&mut state.store, hint);
        state.store.gc();
    }

    /// Fail every queued waiter with `reason` and drop all lock state.
    ///
    /// `Stale` on rebind, `Canceled` on service shutdown. In-memory lock
    /// state is never transplanted to the new owner; callers re-resolve and
    /// re-submit.
    pub fn close(&self, reason: WaitState) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for waiter in state.store.waiters() {
            waiter.try_finish(reason);
        }
        state.store = LockStore::new();
    }

    /// Abort `txn`'s pending waits as a deadlock victim. Returns whether a
    /// waiter was actually aborted here.
    pub fn abort_txn(&self, txn: &TxnId) -> bool {
        let mut state = self.state.lock();
        let mut aborted = false;
        for waiter in state.store.waiters() {
            if waiter.txn_id() == txn && waiter.try_finish(WaitState::Deadlocked) {
                state.store.remove_waiter(&waiter);
                aborted = true;
            }
        }
        if aborted {
            // The victim's queue slots may have been the only thing blocking
            // the waiters behind it.
            let hint = self.oracle.now();
            Self::promote(&mut state.store, hint);
            state.store.gc();
        }
        aborted
    }

    /// Copy this table's waits-for edges into `edges`.
    pub fn waits_for_edges(&self, edges: &mut Vec<(TxnId, TxnId)>) {
        self.state.lock().store.waits_for_edges(edges);
    }

    /// Live waiters queued on entries overlapping a row key.
    pub fn waiter_count(&self, key: &[u8]) -> usize {
        self.state.lock().store.waiter_count(key)
    }

    /// Live waiters across the whole table.
    pub fn waiter_count_total(&self) -> usize {
        self.state.lock().store.waiter_count_total()
    }

    /// Number of store entries. Observability and tests.
    pub fn store_len(&self) -> usize {
        self.state.lock().store.len()
    }

    /// Grant every waiter whose whole request became compatible, FIFO per
    /// queue, co-granting consecutive Shared waiters.
    fn promote(store: &mut LockStore, hint: Timestamp) {
        loop {
            match store.next_promotion() {
                Promotion::Grant(waiter) => {
                    store.remove_waiter(&waiter);
                    for key in waiter.keys() {
                        store.grant(key, waiter.mode(), waiter.txn_id());
                    }
                    // Transitions are serialized by the table lock, so the
                    // waiter is still waiting here.
                    let woken = waiter.try_finish(WaitState::Granted(hint));
                    debug_assert!(woken, "promotion raced an external transition");
                }
                Promotion::Enqueue(waiter, keys) => {
                    for key in &keys {
                        store.enqueue(key, &waiter);
                    }
                }
                Promotion::None => break,
            }
        }
    }
}

/// Cleans up after a `lock` future that was dropped mid-wait.
///
/// Runs under the table lock, so it is atomic against promotion: either the
/// cancellation wins and every queue entry is removed, or a grant won and
/// the freshly granted holds are released and re-promoted. Either way a
/// canceled request leaves no trace.
struct WaitGuard<'a> {
    table: &'a LocalLockTable,
    waiter: Arc<Waiter>,
    armed: bool,
}

impl WaitGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.table.state.lock();
        if self.waiter.try_finish(WaitState::Canceled) {
            state.store.remove_waiter(&self.waiter);
        } else if let WaitState::Granted(_) = self.waiter.state() {
            // The grant raced our cancellation; give the locks back.
            for key in self.waiter.keys() {
                state.store.ungrant(key, self.waiter.txn_id());
            }
        } else {
            return;
        }
        let hint = self.table.oracle.now();
        LocalLockTable::promote(&mut state.store, hint);
        state.store.gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_clock::HlcOracle;
    use latchkey_common::{Granularity, LockMode};
    use std::time::Duration;

    fn test_table() -> Arc<LocalLockTable> {
        // Detector hints go nowhere in these tests.
        let (tx, _rx) = mpsc::unbounded_channel();
        LocalLockTable::new(Bind::new(0, "s1", 0), Arc::new(HlcOracle::new()), tx)
    }

    fn exclusive_wait() -> LockOptions {
        LockOptions {
            granularity: Granularity::Row,
            mode: LockMode::Exclusive,
            policy: WaitPolicy::Wait,
        }
    }

    #[tokio::test]
    async fn test_grant_and_block() {
        let table = test_table();
        let key = vec![KeyRange::row(vec![1])];

        table
            .lock(TxnId::from("txn1"), key.clone(), exclusive_wait())
            .await
            .unwrap();

        let blocked = tokio::spawn({
            let table = table.clone();
            let key = key.clone();
            async move { table.lock(TxnId::from("txn2"), key, exclusive_wait()).await }
        });

        while table.waiter_count(&[1]) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        table.unlock(&TxnId::from("txn1"), Timestamp::ZERO);
        let res = blocked.await.unwrap().unwrap();
        assert!(!res.timestamp.is_zero());
    }

    #[tokio::test]
    async fn test_fail_fast() {
        let table = test_table();
        let key = vec![KeyRange::row(vec![1])];

        table
            .lock(TxnId::from("txn1"), key.clone(), exclusive_wait())
            .await
            .unwrap();

        let mut options = exclusive_wait();
        options.policy = WaitPolicy::FailFast;
        let err = table
            .lock(TxnId::from("txn2"), key, options)
            .await
            .unwrap_err();
        assert_eq!(err, LockError::WouldBlock);
        assert_eq!(table.waiter_count(&[1]), 0);
    }

    #[tokio::test]
    async fn test_reentrant_keeps_store_flat() {
        let table = test_table();
        for _ in 0..10 {
            table
                .lock(
                    TxnId::from("txn1"),
                    vec![KeyRange::row(vec![1])],
                    exclusive_wait(),
                )
                .await
                .unwrap();
            assert_eq!(table.store_len(), 1);
        }
    }

    #[tokio::test]
    async fn test_multi_key_creates_one_entry_per_key() {
        let table = test_table();
        let keys: Vec<KeyRange> = (1u8..=6).map(|k| KeyRange::row(vec![k])).collect();
        table
            .lock(TxnId::from("txn1"), keys, exclusive_wait())
            .await
            .unwrap();
        assert_eq!(table.store_len(), 6);
    }

    #[tokio::test]
    async fn test_rerequest_while_queued_shares_waiter() {
        let table = test_table();
        let key = vec![KeyRange::row(vec![1])];

        table
            .lock(TxnId::from("txn1"), key.clone(), exclusive_wait())
            .await
            .unwrap();

        let first = tokio::spawn({
            let table = table.clone();
            let key = key.clone();
            async move { table.lock(TxnId::from("txn2"), key, exclusive_wait()).await }
        });
        while table.waiter_count(&[1]) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The same txn asks again while queued; the queue must not grow.
        let second = tokio::spawn({
            let table = table.clone();
            let key = key.clone();
            async move { table.lock(TxnId::from("txn2"), key, exclusive_wait()).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(table.waiter_count(&[1]), 1);

        // One grant satisfies both calls.
        table.unlock(&TxnId::from("txn1"), Timestamp::ZERO);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_leaves_no_trace() {
        let table = test_table();
        let key = vec![KeyRange::row(vec![1])];

        table
            .lock(TxnId::from("txn1"), key.clone(), exclusive_wait())
            .await
            .unwrap();

        let blocked = table.lock(TxnId::from("txn2"), key.clone(), exclusive_wait());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), blocked)
                .await
                .is_err()
        );
        assert_eq!(table.waiter_count(&[1]), 0);

        // The same keys behave as if the canceled request never existed.
        table.unlock(&TxnId::from("txn1"), Timestamp::ZERO);
        table
            .lock(TxnId::from("txn3"), key, exclusive_wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_timestamp_hint_flows_to_waiter() {
        let table = test_table();
        let key = vec![KeyRange::row(vec![1])];
        let commit = Timestamp::new(12345, 0);

        table
            .lock(TxnId::from("txn1"), key.clone(), exclusive_wait())
            .await
            .unwrap();

        let blocked = tokio::spawn({
            let table = table.clone();
            let key = key.clone();
            async move { table.lock(TxnId::from("txn2"), key, exclusive_wait()).await }
        });

        while table.waiter_count(&[1]) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        table.unlock(&TxnId::from("txn1"), commit);
        let res = blocked.await.unwrap().unwrap();
        assert_eq!(res.timestamp, commit);
    }

    #[tokio::test]
    async fn test_exclusive_promoted_into_shared_entry_excludes_shared() {
        let table = test_table();
        let key = vec![KeyRange::row(vec![1])];
        let shared = LockOptions {
            mode: LockMode::Shared,
            ..exclusive_wait()
        };

        table
            .lock(TxnId::from("txn1"), key.clone(), shared)
            .await
            .unwrap();

        let blocked = tokio::spawn({
            let table = table.clone();
            let key = key.clone();
            async move { table.lock(TxnId::from("txn2"), key, exclusive_wait()).await }
        });

        while table.waiter_count(&[1]) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // txn2 is promoted into the entry txn1 created as Shared.
        table.unlock(&TxnId::from("txn1"), Timestamp::ZERO);
        blocked.await.unwrap().unwrap();

        // The entry now holds an exclusive grantee; a shared request from a
        // third txn must not slip in beside it.
        let shared_fail_fast = LockOptions {
            policy: WaitPolicy::FailFast,
            ..shared
        };
        let err = table
            .lock(TxnId::from("txn3"), key, shared_fail_fast)
            .await
            .unwrap_err();
        assert_eq!(err, LockError::WouldBlock);
    }

    #[tokio::test]
    async fn test_range_overlap_blocks_row() {
        let table = test_table();
        table
            .lock(
                TxnId::from("txn1"),
                vec![KeyRange::range(vec![1], vec![2])],
                exclusive_wait(),
            )
            .await
            .unwrap();

        // Disjoint range grants immediately.
        table
            .lock(
                TxnId::from("txn2"),
                vec![KeyRange::range(vec![3], vec![4])],
                exclusive_wait(),
            )
            .await
            .unwrap();

        // Row inside the first range blocks.
        let blocked = table.lock(
            TxnId::from("txn3"),
            vec![KeyRange::row(vec![1])],
            exclusive_wait(),
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), blocked)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_close_fails_waiters_with_reason() {
        let table = test_table();
        let key = vec![KeyRange::row(vec![1])];

        table
            .lock(TxnId::from("txn1"), key.clone(), exclusive_wait())
            .await
            .unwrap();

        let blocked = tokio::spawn({
            let table = table.clone();
            let key = key.clone();
            async move { table.lock(TxnId::from("txn2"), key, exclusive_wait()).await }
        });

        while table.waiter_count(&[1]) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        table.close(WaitState::Stale);
        assert_eq!(blocked.await.unwrap().unwrap_err(), LockError::BindChanged);

        // A closed table rejects new requests outright.
        let err = table
            .lock(TxnId::from("txn3"), vec![KeyRange::row(vec![2])], exclusive_wait())
            .await
            .unwrap_err();
        assert_eq!(err, LockError::BindChanged);
    }

    #[tokio::test]
    async fn test_all_or_none_under_contention() {
        let table = test_table();

        // txn1 holds key 2; txn2 wants keys 1..=3 and must not be visible
        // as a holder of 1 or 3 while blocked on 2.
        table
            .lock(TxnId::from("txn1"), vec![KeyRange::row(vec![2])], exclusive_wait())
            .await
            .unwrap();

        let blocked = tokio::spawn({
            let table = table.clone();
            async move {
                table
                    .lock(
                        TxnId::from("txn2"),
                        vec![
                            KeyRange::row(vec![1]),
                            KeyRange::row(vec![2]),
                            KeyRange::row(vec![3]),
                        ],
                        exclusive_wait(),
                    )
                    .await
            }
        });

        while table.waiter_count(&[2]) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Keys 1 and 3 are still free for others.
        table
            .lock(TxnId::from("txn3"), vec![KeyRange::row(vec![1])], exclusive_wait())
            .await
            .unwrap();
        table.unlock(&TxnId::from("txn3"), Timestamp::ZERO);

        table.unlock(&TxnId::from("txn1"), Timestamp::ZERO);
        blocked.await.unwrap().unwrap();
        table.unlock(&TxnId::from("txn2"), Timestamp::ZERO);
        assert_eq!(table.store_len(), 0);
    }
}

//! Lock store: ordered map from key or range to holders and waiter queue
//!
//! Pure data structure, no I/O and no locking of its own; the owning table
//! serializes access. Rows are ranges whose start equals their end, so row
//! and range locks share one store and one overlap scan.

use crate::waiter::Waiter;
use latchkey_common::{LockMode, TxnId};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;

/// A lock key: a single row (`start == end`) or an inclusive byte range.
///
/// Ordered by `(start, end)` byte-lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    /// A single row key.
    pub fn row(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        Self {
            start: key.clone(),
            end: key,
        }
    }

    /// An inclusive `[start, end]` range. The caller validates `start <= end`.
    pub fn range(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn is_row(&self) -> bool {
        self.start == self.end
    }

    /// Inclusive overlap; a row key conflicts with a range iff it falls
    /// inside it.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Lock state for one key or range
pub struct LockEntry {
    /// Mode all current holders share
    pub mode: LockMode,
    /// Granted transactions. Multiple distinct holders only in Shared mode.
    pub holders: Vec<TxnId>,
    /// FIFO queue of pending requests. A multi-key request appears in the
    /// queue of every entry it conflicts with.
    pub waiters: VecDeque<Arc<Waiter>>,
}

impl LockEntry {
    fn new(mode: LockMode, txn: TxnId) -> Self {
        Self {
            mode,
            holders: vec![txn],
            waiters: VecDeque::new(),
        }
    }

    pub fn held_by(&self, txn: &TxnId) -> bool {
        self.holders.contains(txn)
    }

    /// Whether a request in `mode` by `txn` conflicts with this entry.
    ///
    /// Re-entrant acquisition by a current holder never conflicts. Any live
    /// waiter queued here conflicts regardless of modes: a late arrival must
    /// not jump the queue, only consecutive queued Shared requests are
    /// granted together at promotion time.
    pub fn conflicts_with(&self, txn: &TxnId, mode: LockMode) -> bool {
        if self.held_by(txn) {
            return false;
        }
        if self.waiters.iter().any(|w| w.is_waiting()) {
            return true;
        }
        if self.holders.is_empty() {
            return false;
        }
        !self.mode.compatible_with(mode)
    }

    fn first_live_waiter(&self) -> Option<&Arc<Waiter>> {
        self.waiters.iter().find(|w| w.is_waiting())
    }
}

/// Outcome of looking for the next promotable waiter
pub enum Promotion {
    /// This waiter's whole request is grantable now.
    Grant(Arc<Waiter>),
    /// One of this waiter's keys became contended while it slept; it must
    /// join these entries' queues and keep waiting.
    Enqueue(Arc<Waiter>, Vec<KeyRange>),
    /// Nothing to promote.
    None,
}

/// Ordered map of lock entries for one table
#[derive(Default)]
pub struct LockStore {
    entries: BTreeMap<KeyRange, LockEntry>,
    /// Count of non-row entries, gating the overlap scan's fast path.
    range_entries: usize,
}

impl LockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries (granted keys plus contended keys).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries overlapping `probe`, in key order.
    ///
    /// Entries are sorted by start, so the scan stops at the first entry
    /// starting past the probe's end. With no range entries in the store a
    /// row entry starting before the probe cannot overlap it either, so the
    /// scan also skips straight to the probe's start.
    pub fn overlapping<'a>(
        &'a self,
        probe: &'a KeyRange,
    ) -> impl Iterator<Item = (&'a KeyRange, &'a LockEntry)> {
        let lower = if self.range_entries == 0 {
            Bound::Included(KeyRange::row(probe.start.clone()))
        } else {
            Bound::Unbounded
        };
        self.entries
            .range((lower, Bound::Unbounded))
            .take_while(move |(range, _)| range.start <= probe.end)
            .filter(move |(range, _)| range.overlaps(probe))
    }

    /// Keys of entries conflicting with a request over `keys`.
    pub fn conflicting(&self, keys: &[KeyRange], txn: &TxnId, mode: LockMode) -> Vec<KeyRange> {
        let mut out = Vec::new();
        for key in keys {
            for (range, entry) in self.overlapping(key) {
                if entry.conflicts_with(txn, mode) && !out.contains(range) {
                    out.push(range.clone());
                }
            }
        }
        out
    }

    /// Add `txn` as a holder of `key`, creating the entry if needed.
    ///
    /// Re-entrant grants are no-ops: holding the exact key, or any entry
    /// covering it, does not grow the store. The caller has already
    /// established compatibility.
    pub fn grant(&mut self, key: &KeyRange, mode: LockMode, txn: &TxnId) {
        if let Some(entry) = self.entries.get_mut(key) {
            // A drained entry takes the mode of its next holder; the old
            // label must not outlive the holders it described.
            if entry.holders.is_empty() {
                entry.mode = mode;
            }
            if !entry.held_by(txn) {
                entry.holders.push(txn.clone());
            }
            return;
        }
        if self.overlapping(key).any(|(_, e)| e.held_by(txn)) {
            return;
        }
        if !key.is_row() {
            self.range_entries += 1;
        }
        self.entries.insert(key.clone(), LockEntry::new(mode, txn.clone()));
    }

    /// Remove `txn` from the holders of the exact entry for `key`.
    ///
    /// Mirror of `grant` for rolling back a grant that raced cancellation;
    /// holds the transaction acquired earlier on overlapping entries stay.
    pub fn ungrant(&mut self, key: &KeyRange, txn: &TxnId) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.holders.retain(|h| h != txn);
        }
    }

    /// Append a waiter to an entry's queue if it is not already in it.
    pub fn enqueue(&mut self, key: &KeyRange, waiter: &Arc<Waiter>) {
        if let Some(entry) = self.entries.get_mut(key) {
            if !entry.waiters.iter().any(|w| Arc::ptr_eq(w, waiter)) {
                entry.waiters.push_back(waiter.clone());
            }
        }
    }

    /// A live waiter of `txn` whose grant would satisfy a new request for
    /// `keys` in `mode`: same keys, and same mode or an exclusive wait
    /// (which covers a shared re-request). Lets a re-requesting txn share
    /// its pending waiter instead of growing the queues.
    pub fn find_waiter(
        &self,
        txn: &TxnId,
        mode: LockMode,
        keys: &[KeyRange],
    ) -> Option<Arc<Waiter>> {
        self.waiters().into_iter().find(|w| {
            w.is_waiting()
                && w.txn_id() == txn
                && w.keys() == keys
                && (w.mode() == mode || w.mode() == LockMode::Exclusive)
        })
    }

    /// Remove a waiter from every queue it joined.
    pub fn remove_waiter(&mut self, waiter: &Arc<Waiter>) {
        for entry in self.entries.values_mut() {
            entry.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
        }
    }

    /// Remove `txn` from every holder set. Returns whether anything changed.
    pub fn release_txn(&mut self, txn: &TxnId) -> bool {
        let mut changed = false;
        for entry in self.entries.values_mut() {
            let before = entry.holders.len();
            entry.holders.retain(|h| h != txn);
            changed |= entry.holders.len() != before;
        }
        changed
    }

    /// Find the next promotable waiter.
    ///
    /// Candidates are the first live waiter of each entry, FIFO. A candidate
    /// is grantable when every one of its keys is: holders compatible and no
    /// live waiter ahead of it on any entry it joined. A key that gained
    /// incompatible holders while the candidate slept yields `Enqueue`.
    pub fn next_promotion(&self) -> Promotion {
        let mut seen: Vec<*const Waiter> = Vec::new();

        for entry in self.entries.values() {
            let Some(candidate) = entry.first_live_waiter() else {
                continue;
            };
            let ptr = Arc::as_ptr(candidate);
            if seen.contains(&ptr) {
                continue;
            }
            seen.push(ptr);

            let mut must_join: Vec<KeyRange> = Vec::new();
            let mut blocked = false;

            'keys: for key in candidate.keys() {
                for (range, other) in self.overlapping(key) {
                    let queued = other.waiters.iter().any(|w| Arc::ptr_eq(w, candidate));

                    let holders_ok = other.holders.is_empty()
                        || other.held_by(candidate.txn_id())
                        || other.mode.compatible_with(candidate.mode());
                    if !holders_ok {
                        if !queued && !must_join.contains(range) {
                            must_join.push(range.clone());
                        } else {
                            blocked = true;
                            break 'keys;
                        }
                        continue;
                    }

                    // FIFO: anyone live ahead of the candidate goes first.
                    if queued {
                        let ahead = other
                            .waiters
                            .iter()
                            .take_while(|w| !Arc::ptr_eq(w, candidate))
                            .any(|w| w.is_waiting());
                        if ahead {
                            blocked = true;
                            break 'keys;
                        }
                    }
                }
            }

            if blocked {
                continue;
            }
            if !must_join.is_empty() {
                return Promotion::Enqueue(candidate.clone(), must_join);
            }
            return Promotion::Grant(candidate.clone());
        }

        Promotion::None
    }

    /// Drop waiters that are no longer waiting and entries that are empty.
    pub fn gc(&mut self) {
        for entry in self.entries.values_mut() {
            entry.waiters.retain(|w| w.is_waiting());
        }
        let range_entries = &mut self.range_entries;
        self.entries.retain(|key, e| {
            let keep = !e.holders.is_empty() || !e.waiters.is_empty();
            if !keep && !key.is_row() {
                *range_entries -= 1;
            }
            keep
        });
    }

    /// Every waiter currently queued anywhere in the store, deduplicated.
    pub fn waiters(&self) -> Vec<Arc<Waiter>> {
        let mut out: Vec<Arc<Waiter>> = Vec::new();
        for entry in self.entries.values() {
            for waiter in &entry.waiters {
                if !out.iter().any(|w| Arc::ptr_eq(w, waiter)) {
                    out.push(waiter.clone());
                }
            }
        }
        out
    }

    /// Live waiters queued on entries overlapping a row key, deduplicated.
    pub fn waiter_count(&self, key: &[u8]) -> usize {
        let probe = KeyRange::row(key.to_vec());
        let mut seen: Vec<*const Waiter> = Vec::new();
        for (_, entry) in self.overlapping(&probe) {
            for waiter in &entry.waiters {
                let ptr = Arc::as_ptr(waiter);
                if waiter.is_waiting() && !seen.contains(&ptr) {
                    seen.push(ptr);
                }
            }
        }
        seen.len()
    }

    /// Total live waiters across the store, deduplicated.
    pub fn waiter_count_total(&self) -> usize {
        self.waiters().iter().filter(|w| w.is_waiting()).count()
    }

    /// Waits-for edges for every live waiter: waiter -> each holder of, and
    /// each earlier live waiter on, every entry it is queued behind.
    pub fn waits_for_edges(&self, edges: &mut Vec<(TxnId, TxnId)>) {
        for entry in self.entries.values() {
            let mut ahead: Vec<&TxnId> = Vec::new();
            for waiter in &entry.waiters {
                if !waiter.is_waiting() {
                    continue;
                }
                let from = waiter.txn_id();
                for holder in &entry.holders {
                    if holder != from {
                        push_edge(edges, from, holder);
                    }
                }
                for earlier in &ahead {
                    if *earlier != from {
                        push_edge(edges, from, earlier);
                    }
                }
                ahead.push(from);
            }
        }
    }
}

fn push_edge(edges: &mut Vec<(TxnId, TxnId)>, from: &TxnId, to: &TxnId) {
    let edge = (from.clone(), to.clone());
    if !edges.contains(&edge) {
        edges.push(edge);
    }
}

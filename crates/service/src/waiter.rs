//! Blocked lock requests and their wakeup protocol
//!
//! A waiter is shared between every queue its request joined. Exactly one
//! transition out of `Waiting` ever happens; losers of the race observe the
//! winner's state. All transitions are made while holding the owning table's
//! store lock, which serializes grants against cancellation.

use crate::store::KeyRange;
use latchkey_clock::Timestamp;
use latchkey_common::{LockMode, TxnId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// State of a blocked request.
///
/// `Waiting` transitions once into one of the terminal states and is then
/// stable for the lifetime of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Still queued.
    Waiting,
    /// Granted; carries the ordering hint derived from the release event.
    Granted(Timestamp),
    /// Chosen as the victim of a deadlock cycle.
    Deadlocked,
    /// The table's bind was superseded; retry against the new owner.
    Stale,
    /// Canceled by the caller or by service shutdown.
    Canceled,
}

/// A blocked multi-key lock request
pub struct Waiter {
    txn_id: TxnId,
    mode: LockMode,
    keys: Vec<KeyRange>,
    state: Mutex<WaitState>,
    notify: Notify,
}

impl Waiter {
    pub fn new(txn_id: TxnId, mode: LockMode, keys: Vec<KeyRange>) -> Arc<Self> {
        Arc::new(Self {
            txn_id,
            mode,
            keys,
            state: Mutex::new(WaitState::Waiting),
            notify: Notify::new(),
        })
    }

    pub fn txn_id(&self) -> &TxnId {
        &self.txn_id
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn keys(&self) -> &[KeyRange] {
        &self.keys
    }

    pub fn state(&self) -> WaitState {
        *self.state.lock()
    }

    pub fn is_waiting(&self) -> bool {
        matches!(*self.state.lock(), WaitState::Waiting)
    }

    /// Transition out of `Waiting`. Returns false if some other actor won
    /// the race; the caller must then respect the winner's state.
    ///
    /// Wakes every consumer: a re-request by the same transaction shares
    /// this waiter instead of queueing a second one.
    pub fn try_finish(&self, next: WaitState) -> bool {
        debug_assert!(next != WaitState::Waiting);
        let mut state = self.state.lock();
        if *state != WaitState::Waiting {
            return false;
        }
        *state = next;
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Suspend until the state leaves `Waiting`.
    pub async fn wait(&self) -> WaitState {
        loop {
            // Register for the wakeup before re-checking state, otherwise a
            // notify between check and await is lost.
            let notified = self.notify.notified();
            let state = self.state();
            if state != WaitState::Waiting {
                return state;
            }
            notified.await;
        }
    }
}

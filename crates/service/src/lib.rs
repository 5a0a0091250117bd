//! Distributed lock manager
//!
//! Each node runs one [`LockService`]. Every lock table is bound to exactly
//! one service by the allocator; locks on tables bound elsewhere are
//! forwarded to their owner over the fabric. Waiters queue FIFO per lock
//! entry, a background detector resolves cross-node deadlocks, and lease
//! expiry invalidates a node's tables rather than migrating their state.

pub mod config;
pub mod deadlock;
pub mod local;
pub mod remote;
pub mod service;
pub mod store;
pub mod testing;
pub mod waiter;

pub use config::Config;
pub use local::LocalLockTable;
pub use remote::RemoteLockTable;
pub use service::LockService;
pub use store::KeyRange;

pub use latchkey_common::{
    Bind, Granularity, LockError, LockMode, LockOptions, LockResult, Result, TxnId, WaitPolicy,
};

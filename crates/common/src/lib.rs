//! Common types for the latchkey lock service
//!
//! This crate defines:
//! - Transaction IDs (opaque byte strings with a total order)
//! - Table ownership binds (owner + epoch)
//! - Lock request options and results
//! - The caller-facing error taxonomy

mod bind;
mod error;
mod options;
mod txn_id;

pub use bind::Bind;
pub use error::{LockError, Result};
pub use options::{Granularity, LockMode, LockOptions, LockResult, WaitPolicy};
pub use txn_id::TxnId;

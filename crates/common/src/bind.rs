//! Table ownership binds
//!
//! A bind assigns one table's lock state to one service, versioned by an
//! epoch so a superseded owner can never act as the source of truth.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ownership assignment of a table to a service at a given epoch.
///
/// System-wide, at most one live bind with the highest epoch exists per
/// table. A request presenting a stale epoch is rejected with `BindChanged`
/// and the caller re-resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bind {
    /// Table whose lock state this bind covers
    pub table: u64,
    /// Service that owns the table's lock state
    pub service_id: String,
    /// Version of the assignment, bumped on every re-bind
    pub epoch: u64,
}

impl Bind {
    pub fn new(table: u64, service_id: impl Into<String>, epoch: u64) -> Self {
        Self {
            table,
            service_id: service_id.into(),
            epoch,
        }
    }

    /// Whether `other` describes a different assignment of the same table.
    pub fn changed(&self, other: &Bind) -> bool {
        self.table == other.table
            && (self.epoch != other.epoch || self.service_id != other.service_id)
    }
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table {} @ {}#{}", self.table, self.service_id, self.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed() {
        let b = Bind::new(1, "s1", 0);

        assert!(!b.changed(&Bind::new(1, "s1", 0)));
        assert!(b.changed(&Bind::new(1, "s1", 1)));
        assert!(b.changed(&Bind::new(1, "s2", 0)));
        // A different table is not a change of this bind.
        assert!(!b.changed(&Bind::new(2, "s2", 3)));
    }
}

//! Transaction identifier
//!
//! An opaque byte string assigned by the transaction layer. Equality is
//! byte-equality and the lexicographic order doubles as the deterministic,
//! symmetric tie-break rule for deadlock victim selection: both ends of a
//! cycle compute the same victim without coordinating.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque transaction identifier with a total (lexicographic) order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(Vec<u8>);

impl TxnId {
    /// Create from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for TxnId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for TxnId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for TxnId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_equality() {
        assert_eq!(TxnId::from("txn1"), TxnId::new(b"txn1".to_vec()));
        assert_ne!(TxnId::from("txn1"), TxnId::from("txn2"));
    }

    #[test]
    fn test_lexicographic_order() {
        assert!(TxnId::from("txn1") < TxnId::from("txn2"));
        assert!(TxnId::new(vec![1]) < TxnId::new(vec![1, 0]));
        assert!(TxnId::new(vec![1, 2]) < TxnId::new(vec![2]));
    }

    #[test]
    fn test_display_hex() {
        assert_eq!(TxnId::new(vec![0xab, 0x01]).to_string(), "ab01");
    }
}

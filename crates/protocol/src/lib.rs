//! Typed peer messages for service-to-service communication
//!
//! Owners serve lock traffic for their bound tables; peers reach them over
//! the fabric on a per-service subject. Bodies are serde_json, matching the
//! rest of the system's wire plumbing.

use latchkey_clock::Timestamp;
use latchkey_common::{Bind, LockError, LockOptions, LockResult, TxnId};
use latchkey_fabric::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request sent to the owner of a table (or, for `WaitingList`, to any peer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Acquire locks on the owner. `bind` carries the epoch the caller
    /// resolved; the owner rejects stale epochs with `BindChanged`.
    Lock {
        bind: Bind,
        txn_id: TxnId,
        keys: Vec<Vec<u8>>,
        options: LockOptions,
    },

    /// Release every lock the transaction holds on the owner's tables.
    Unlock { txn_id: TxnId, commit_ts: Timestamp },

    /// Deadlock traversal: which transactions is `txn_id` waiting for, as
    /// far as this peer's tables know. Answered from a fresh snapshot.
    WaitingList { txn_id: TxnId },
}

/// Reply to a `PeerRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerResponse {
    Lock(LockResult),
    Unlock,
    WaitingList { waiting_for: Vec<TxnId> },
    Error(LockError),
}

/// Subject a service's peer handler listens on
pub fn lock_subject(service_id: &str) -> String {
    format!("lockservice.{}", service_id)
}

/// Errors decoding a peer message
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed peer message: {0}")]
    Malformed(String),
}

impl PeerRequest {
    pub fn into_message(self) -> Message {
        // Serialization of these enums cannot fail.
        Message::new(serde_json::to_vec(&self).expect("serializable request"))
    }

    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        serde_json::from_slice(&msg.body).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

impl PeerResponse {
    pub fn into_message(self) -> Message {
        Message::new(serde_json::to_vec(&self).expect("serializable response"))
    }

    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        serde_json::from_slice(&msg.body).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_request_roundtrip() {
        let req = PeerRequest::Lock {
            bind: Bind::new(7, "s1", 2),
            txn_id: TxnId::from("txn1"),
            keys: vec![vec![1], vec![2]],
            options: LockOptions::default(),
        };

        let msg = req.clone().into_message();
        match PeerRequest::from_message(&msg).unwrap() {
            PeerRequest::Lock { bind, txn_id, keys, .. } => {
                assert_eq!(bind, Bind::new(7, "s1", 2));
                assert_eq!(txn_id, TxnId::from("txn1"));
                assert_eq!(keys, vec![vec![1], vec![2]]);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_error_response_roundtrip() {
        let resp = PeerResponse::Error(LockError::BindChanged);
        let msg = resp.into_message();
        match PeerResponse::from_message(&msg).unwrap() {
            PeerResponse::Error(err) => assert_eq!(err, LockError::BindChanged),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_body() {
        let msg = Message::new(b"not json".to_vec());
        assert!(PeerRequest::from_message(&msg).is_err());
    }

    #[test]
    fn test_lock_subject() {
        assert_eq!(lock_subject("s1"), "lockservice.s1");
    }
}

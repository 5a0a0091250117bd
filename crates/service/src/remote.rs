//! Remote lock table: forwards requests to the table's owner over the fabric

use latchkey_clock::Timestamp;
use latchkey_common::{Bind, LockError, LockOptions, LockResult, Result, TxnId};
use latchkey_fabric::FabricClient;
use latchkey_protocol::{lock_subject, PeerRequest, PeerResponse};
use std::time::Duration;

/// Stub for a table owned by another service
pub struct RemoteLockTable {
    bind: Bind,
    client: FabricClient,
    timeout: Duration,
}

impl RemoteLockTable {
    pub fn new(bind: Bind, client: FabricClient, timeout: Duration) -> Self {
        Self {
            bind,
            client,
            timeout,
        }
    }

    pub fn bind(&self) -> Bind {
        self.bind.clone()
    }

    /// Forward a lock request to the owner, presenting our resolved bind.
    pub async fn lock(
        &self,
        txn: TxnId,
        keys: Vec<Vec<u8>>,
        options: LockOptions,
    ) -> Result<LockResult> {
        let request = PeerRequest::Lock {
            bind: self.bind.clone(),
            txn_id: txn,
            keys,
            options,
        };
        match self.roundtrip(request).await? {
            PeerResponse::Lock(result) => Ok(result),
            PeerResponse::Error(err) => Err(err),
            other => Err(LockError::Remote(format!(
                "unexpected lock response: {:?}",
                other
            ))),
        }
    }

    /// Ask the owner to release everything `txn` holds there.
    pub async fn unlock(&self, txn: TxnId, commit_ts: Timestamp) -> Result<()> {
        let request = PeerRequest::Unlock {
            txn_id: txn,
            commit_ts,
        };
        match self.roundtrip(request).await? {
            PeerResponse::Unlock => Ok(()),
            PeerResponse::Error(err) => Err(err),
            other => Err(LockError::Remote(format!(
                "unexpected unlock response: {:?}",
                other
            ))),
        }
    }

    async fn roundtrip(&self, request: PeerRequest) -> Result<PeerResponse> {
        let subject = lock_subject(&self.bind.service_id);
        let reply = self
            .client
            .request(&subject, request.into_message(), self.timeout.as_millis() as u64)
            .await
            .map_err(|e| LockError::Remote(e.to_string()))?;
        PeerResponse::from_message(&reply).map_err(|e| LockError::Remote(e.to_string()))
    }
}

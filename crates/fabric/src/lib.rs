//! In-process message fabric for node-to-node communication
//!
//! Provides pub/sub subjects with wildcard matching plus request/reply with
//! per-request timeouts. One `Fabric` is constructed per process and shared
//! by every node living in it, which keeps multi-node-in-one-process tests
//! deterministic. Transport specifics are out of scope for the lock core;
//! this is the process-internal stand-in.

use thiserror::Error;

pub mod client;
pub mod fabric;
pub mod message;

pub use client::{FabricClient, Subscription};
pub use fabric::Fabric;
pub use message::Message;

/// Fabric errors
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("No responders for subject: {0}")]
    NoResponders(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, FabricError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pub_sub() {
        let fabric = Arc::new(Fabric::new());
        let client = FabricClient::new("n1".to_string(), fabric.clone());

        let mut sub = client.subscribe("lock.subject").await;

        let message = Message::new(b"hello".to_vec());
        client.publish("lock.subject", vec![message]).await;

        let received = sub.recv().await.unwrap();
        assert_eq!(received.body, b"hello");
    }

    #[tokio::test]
    async fn test_request_reply() {
        let fabric = Arc::new(Fabric::new());
        let client = FabricClient::new("n1".to_string(), fabric.clone());

        tokio::spawn({
            let fabric = fabric.clone();
            async move {
                let mut handler = fabric.register_handler("echo");
                while let Some((msg, reply_tx)) = handler.recv().await {
                    let reply = Message::new(msg.body.clone());
                    let _ = reply_tx.send(reply);
                }
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let request = Message::new(b"ping".to_vec());
        let reply = client.request("echo", request, 1000).await.unwrap();
        assert_eq!(reply.body, b"ping");
    }

    #[tokio::test]
    async fn test_request_no_responders() {
        let fabric = Arc::new(Fabric::new());
        let client = FabricClient::new("n1".to_string(), fabric);

        let request = Message::new(b"ping".to_vec());
        let err = client.request("nobody.home", request, 100).await.unwrap_err();
        assert!(matches!(err, FabricError::NoResponders(_)));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let fabric = Arc::new(Fabric::new());
        let client = FabricClient::new("n1".to_string(), fabric.clone());

        // Handler that never replies.
        let _handler = fabric.register_handler("slow");

        let request = Message::new(b"ping".to_vec());
        let err = client.request("slow", request, 50).await.unwrap_err();
        assert!(matches!(err, FabricError::Timeout));
    }

    #[tokio::test]
    async fn test_wildcard_subscriptions() {
        let fabric = Arc::new(Fabric::new());
        let client = FabricClient::new("n1".to_string(), fabric.clone());

        let mut sub = client.subscribe("lock.*").await;

        client
            .publish("lock.s1", vec![Message::new(b"foo".to_vec())])
            .await;
        client
            .publish("lock.s2", vec![Message::new(b"bar".to_vec())])
            .await;
        client
            .publish("other.s1", vec![Message::new(b"baz".to_vec())])
            .await;

        assert_eq!(sub.recv().await.unwrap().body, b"foo");
        assert_eq!(sub.recv().await.unwrap().body, b"bar");
        assert!(sub.try_recv().is_none());
    }
}

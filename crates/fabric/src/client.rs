//! Per-node handle onto the shared fabric

use crate::{Fabric, Message, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Client for one node's use of the shared fabric
#[derive(Clone)]
pub struct FabricClient {
    /// Node ID
    node_id: String,

    /// Reference to the shared fabric
    fabric: Arc<Fabric>,
}

impl FabricClient {
    /// Create a new client
    pub fn new(node_id: String, fabric: Arc<Fabric>) -> Self {
        Self { node_id, fabric }
    }

    /// Get the node ID of this client
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The underlying fabric
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    /// Publish messages to a subject
    pub async fn publish<M>(&self, subject: &str, messages: Vec<M>)
    where
        M: Into<Message>,
    {
        let messages: Vec<Message> = messages.into_iter().map(Into::into).collect();
        self.fabric.publish(subject, messages);
    }

    /// Subscribe to a subject pattern
    pub async fn subscribe(&self, subject_pattern: &str) -> Subscription {
        Subscription {
            receiver: self.fabric.subscribe(subject_pattern),
        }
    }

    /// Register as the request handler for a subject
    pub fn register_handler(
        &self,
        subject: &str,
    ) -> mpsc::UnboundedReceiver<(Message, tokio::sync::oneshot::Sender<Message>)> {
        self.fabric.register_handler(subject)
    }

    /// Send a request and wait for a reply
    pub async fn request(
        &self,
        subject: &str,
        message: impl Into<Message>,
        timeout_ms: u64,
    ) -> Result<Message> {
        self.fabric.request(subject, message.into(), timeout_ms).await
    }
}

/// Stream of messages from a pub/sub subscription
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Receive the next message
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Try to receive without blocking
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

impl futures::Stream for Subscription {
    type Item = Message;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

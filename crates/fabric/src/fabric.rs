//! Core fabric implementation
//!
//! Routes published messages to matching subscriptions and requests to the
//! single registered handler per subject.

use crate::{FabricError, Message, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Type alias for request handler channels
type RequestHandler = mpsc::UnboundedSender<(Message, oneshot::Sender<Message>)>;

/// In-process message fabric shared by all nodes of one process
pub struct Fabric {
    /// Pub/sub subscriptions, keyed by subject pattern
    subscriptions: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,

    /// Request/reply handlers, keyed by exact subject
    request_handlers: Mutex<HashMap<String, RequestHandler>>,
}

impl Fabric {
    /// Create a new fabric
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            request_handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Publish messages to a subject (pub/sub, fire and forget)
    pub fn publish(&self, subject: &str, messages: Vec<Message>) {
        let subs = self.subscriptions.lock();
        for (pattern, subscribers) in subs.iter() {
            if subject_matches(subject, pattern) {
                for sub in subscribers {
                    for msg in &messages {
                        let _ = sub.send(msg.clone());
                    }
                }
            }
        }
        // No one listening is valid in pub/sub.
    }

    /// Subscribe to a subject pattern
    pub fn subscribe(&self, subject_pattern: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .entry(subject_pattern.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Register the request handler for a subject, replacing any previous one
    pub fn register_handler(
        &self,
        subject: &str,
    ) -> mpsc::UnboundedReceiver<(Message, oneshot::Sender<Message>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.request_handlers.lock().insert(subject.to_string(), tx);
        rx
    }

    /// Remove the request handler for a subject
    pub fn deregister_handler(&self, subject: &str) {
        self.request_handlers.lock().remove(subject);
    }

    /// Send a request and wait for a reply
    pub async fn request(
        &self,
        subject: &str,
        message: Message,
        timeout_ms: u64,
    ) -> Result<Message> {
        let reply_rx = {
            let handlers = self.request_handlers.lock();
            match handlers.get(subject) {
                Some(handler) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if handler.send((message, reply_tx)).is_err() {
                        return Err(FabricError::ChannelClosed);
                    }
                    reply_rx
                }
                None => return Err(FabricError::NoResponders(subject.to_string())),
            }
        };

        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(FabricError::ChannelClosed),
            Err(_) => Err(FabricError::Timeout),
        }
    }

}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a subject matches a pattern
///
/// `*` matches exactly one dot-separated token, `>` matches the rest.
fn subject_matches(subject: &str, pattern: &str) -> bool {
    let subject_parts: Vec<&str> = subject.split('.').collect();
    let pattern_parts: Vec<&str> = pattern.split('.').collect();

    let mut s_idx = 0;
    let mut p_idx = 0;

    while s_idx < subject_parts.len() && p_idx < pattern_parts.len() {
        let pattern_part = pattern_parts[p_idx];

        if pattern_part == ">" {
            return true;
        } else if pattern_part == "*" || pattern_part == subject_parts[s_idx] {
            s_idx += 1;
            p_idx += 1;
        } else {
            return false;
        }
    }

    s_idx == subject_parts.len() && p_idx == pattern_parts.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("lock.s1", "lock.s1"));
        assert!(subject_matches("lock.s1", "lock.*"));
        assert!(subject_matches("lock.s1.req", "lock.>"));
        assert!(!subject_matches("lock.s1", "lock.s2"));
        assert!(!subject_matches("lock.s1.req", "lock.*"));
        assert!(!subject_matches("lock", "lock.*"));
    }
}

//! Message type carried by the fabric

use serde::{Deserialize, Serialize};

/// Message that flows through the fabric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message body (serialized data)
    pub body: Vec<u8>,
}

impl Message {
    /// Create a message from a body
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }
}

impl From<Vec<u8>> for Message {
    fn from(body: Vec<u8>) -> Self {
        Message::new(body)
    }
}

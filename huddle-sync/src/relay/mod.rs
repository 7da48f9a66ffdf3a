//! WebSocket topic relay.
//!
//! Peers that cannot reach each other directly connect to a relay and
//! exchange frames through it.
//!
//! ```text
//! RelayTransport A ──┐                       ┌──► RelayTransport B
//!                    ├── RelayServer ── topic ┤
//! RelayTransport C ──┘   (per-topic fan-out) └──► RelayTransport D
//! ```
//!
//! The relay only routes: it never decodes envelopes or holds document state.
//! Each topic is a tokio broadcast channel, so a subscriber that falls behind
//! loses frames instead of stalling the publisher.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

use crate::transport::{TransportError, DEFAULT_SUBSCRIPTION_CAPACITY};

pub use client::RelayTransport;
pub use server::{RelayHandle, RelayServer, RelayStats};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per topic before lagging subscribers drop
    pub topic_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4444".to_string(),
            topic_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port on loopback.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            topic_capacity: 64,
        }
    }
}

/// Frames exchanged between relay clients and the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, payload: Vec<u8> },
    Ping(u64),
    Pong(u64),
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransportError::Frame(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| TransportError::Frame(e.to_string()))?;
        Ok(frame)
    }
}

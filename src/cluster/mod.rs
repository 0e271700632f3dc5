//! Cluster Module
//!
//! Peer identities, the per-node connection registry and the
//! lifecycle events a node publishes.

mod identity;
mod registry;

use std::sync::Arc;

pub use identity::{PeerIdentity, MAX_HOST_LEN};
pub use registry::{ConnectionRegistry, ConnectionState};

use crate::error::Error;

/// Notifications published by a node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// This node finished bootstrapping and announced itself
    Ready,
    /// An outbound connection to a peer was established
    PeerConnected(PeerIdentity),
    /// An outbound connection to a peer was lost
    PeerDisconnected(PeerIdentity),
    /// A background failure (dial, catch-up, reconciliation)
    Error(Arc<Error>),
}

impl NodeEvent {
    /// Get the event name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeEvent::Ready => "Ready",
            NodeEvent::PeerConnected(_) => "PeerConnected",
            NodeEvent::PeerDisconnected(_) => "PeerDisconnected",
            NodeEvent::Error(_) => "Error",
        }
    }
}

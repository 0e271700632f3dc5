//! Connection Registry
//!
//! Tracks the configured, connected and ready peer sets of one node.
//! All lookups go through `PeerIdentity` values, never object identity.
//!
//! The ready set is always a subset of the connected set. A peer can
//! announce readiness over its own outbound connection before this node's
//! dial back has completed; such announcements are held until `register`
//! and dropped again when the dial fails or the connection goes away.
//! Locks are taken in the order connections, announced, ready.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::PeerIdentity;
use crate::replication::PeerService;

/// Connection lifecycle of a configured peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No outbound connection
    Disconnected,
    /// Outbound dial in progress
    Dialing,
    /// Outbound connection established
    Connected,
    /// Connected and the peer has announced readiness to us
    Ready,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Dialing => write!(f, "DIALING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Ready => write!(f, "READY"),
        }
    }
}

/// Per-node registry of peer connections
pub struct ConnectionRegistry {
    /// This node's identity
    local: PeerIdentity,
    /// Configured peers in configuration order
    configured: RwLock<Vec<PeerIdentity>>,
    /// Peers with a dial in progress
    dialing: RwLock<HashSet<PeerIdentity>>,
    /// Outbound connections
    connections: RwLock<HashMap<PeerIdentity, Arc<dyn PeerService>>>,
    /// Announcements received while no outbound connection existed
    announced: RwLock<HashSet<PeerIdentity>>,
    /// Connected peers that announced readiness
    ready: RwLock<HashSet<PeerIdentity>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new(local: PeerIdentity) -> Self {
        Self {
            local,
            configured: RwLock::new(Vec::new()),
            dialing: RwLock::new(HashSet::new()),
            connections: RwLock::new(HashMap::new()),
            announced: RwLock::new(HashSet::new()),
            ready: RwLock::new(HashSet::new()),
        }
    }

    /// This node's identity
    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    /// Add a peer to the configured set.
    ///
    /// Returns false when the peer is already configured or is this node.
    pub async fn configure(&self, peer: &PeerIdentity) -> bool {
        if *peer == self.local {
            return false;
        }
        let mut configured = self.configured.write().await;
        if configured.contains(peer) {
            return false;
        }
        configured.push(peer.clone());
        true
    }

    /// Check whether a peer is configured
    pub async fn is_configured(&self, peer: &PeerIdentity) -> bool {
        self.configured.read().await.contains(peer)
    }

    /// Snapshot of the configured peers
    pub async fn configured(&self) -> Vec<PeerIdentity> {
        self.configured.read().await.clone()
    }

    /// Mark a dial as in progress
    pub async fn set_dialing(&self, peer: &PeerIdentity) {
        self.dialing.write().await.insert(peer.clone());
    }

    /// Record a dial that failed before connecting.
    ///
    /// Any readiness heard from the peer is forgotten: writes must not
    /// target a peer this node cannot reach.
    pub async fn dial_failed(&self, peer: &PeerIdentity) {
        self.dialing.write().await.remove(peer);
        let connections = self.connections.read().await;
        if !connections.contains_key(peer) {
            self.announced.write().await.remove(peer);
            self.ready.write().await.remove(peer);
        }
    }

    /// Register an established outbound connection.
    ///
    /// Returns true when a held readiness announcement made the peer ready.
    pub async fn register(&self, peer: &PeerIdentity, remote: Arc<dyn PeerService>) -> bool {
        self.dialing.write().await.remove(peer);
        let mut connections = self.connections.write().await;
        connections.insert(peer.clone(), remote);
        if self.announced.write().await.remove(peer) {
            self.ready.write().await.insert(peer.clone());
            return true;
        }
        false
    }

    /// Drop a peer from the connected and ready sets
    pub async fn disconnect(&self, peer: &PeerIdentity) -> bool {
        self.dialing.write().await.remove(peer);
        let mut connections = self.connections.write().await;
        self.announced.write().await.remove(peer);
        self.ready.write().await.remove(peer);
        connections.remove(peer).is_some()
    }

    /// Outbound connection to a peer, if established
    pub async fn connection(&self, peer: &PeerIdentity) -> Option<Arc<dyn PeerService>> {
        self.connections.read().await.get(peer).cloned()
    }

    /// Check whether a peer has an established outbound connection
    pub async fn is_connected(&self, peer: &PeerIdentity) -> bool {
        self.connections.read().await.contains_key(peer)
    }

    /// Connected peers with their connections
    pub async fn connected(&self) -> Vec<(PeerIdentity, Arc<dyn PeerService>)> {
        let configured = self.configured.read().await;
        let connections = self.connections.read().await;
        configured
            .iter()
            .filter_map(|p| connections.get(p).map(|c| (p.clone(), Arc::clone(c))))
            .collect()
    }

    /// Record a readiness announcement.
    ///
    /// Returns true when the peer joined the ready set. Announcements from
    /// peers outside the configured set are ignored, since this node would
    /// never dial them; announcements from peers without an outbound
    /// connection are held until `register`.
    pub async fn mark_ready(&self, peer: &PeerIdentity) -> bool {
        if !self.is_configured(peer).await {
            tracing::debug!("Ignoring readiness from unconfigured peer {}", peer);
            return false;
        }
        let connections = self.connections.read().await;
        if !connections.contains_key(peer) {
            tracing::debug!("Holding readiness from {} until connected", peer);
            self.announced.write().await.insert(peer.clone());
            return false;
        }
        self.ready.write().await.insert(peer.clone())
    }

    /// Connected peers that announced readiness, in configuration order
    pub async fn ready_peers(&self) -> Vec<PeerIdentity> {
        let configured = self.configured.read().await;
        let ready = self.ready.read().await;
        configured
            .iter()
            .filter(|p| ready.contains(*p))
            .cloned()
            .collect()
    }

    /// Lifecycle state of a peer
    pub async fn state(&self, peer: &PeerIdentity) -> ConnectionState {
        if self.connections.read().await.contains_key(peer) {
            if self.ready.read().await.contains(peer) {
                ConnectionState::Ready
            } else {
                ConnectionState::Connected
            }
        } else if self.dialing.read().await.contains(peer) {
            ConnectionState::Dialing
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Lifecycle state of every configured peer
    pub async fn states(&self) -> Vec<(PeerIdentity, ConnectionState)> {
        let mut states = Vec::new();
        for peer in self.configured().await {
            let state = self.state(&peer).await;
            states.push((peer, state));
        }
        states
    }

    /// Drop every connection
    pub async fn clear(&self) {
        self.dialing.write().await.clear();
        self.announced.write().await.clear();
        self.ready.write().await.clear();
        self.connections.write().await.clear();
    }
}

//! Peer Service
//!
//! The method set every node exposes to its peers. The same trait is
//! implemented by the local handler and by the remote end of a channel,
//! so a node coordinates and participates through one interface.

use crate::cluster::PeerIdentity;
use crate::error::Result;

use super::Operation;

/// Symmetric peer-to-peer method set
#[async_trait::async_trait]
pub trait PeerService: Send + Sync {
    /// Durably record a prepare copy of `op`, tagged with `peer`
    async fn quorum(&self, op: Operation, peer: PeerIdentity) -> Result<()>;

    /// Apply `op` and drop the staged records it cleared
    async fn commit(&self, op: Operation, peer: PeerIdentity) -> Result<()>;

    /// `peer` announces it is ready; returns the callee's own readiness
    async fn ready(&self, peer: PeerIdentity) -> Result<bool>;

    /// Stream the committed keyspace back to `peer` as commits
    async fn sync_peer(&self, peer: PeerIdentity) -> Result<()>;
}

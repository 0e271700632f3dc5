//! Replication Module
//!
//! The staged write protocol, catch-up of reconnecting peers and full
//! reconciliation of empty nodes.

mod operation;
mod service;
mod locks;
mod session;
mod catchup;
mod reconcile;

pub use operation::Operation;
pub use service::PeerService;
pub use locks::{KeyGuard, KeyLocks};
pub use session::{Phase, ReplicationSession, Replicator};
pub use catchup::pending;

//! WolfKV - Multi-master Replicated Key-Value Store
//!
//! Turns an embedded, ordered key-value engine into a multi-master store.
//! A write issued at any node is staged locally, then driven through a
//! quorum and commit round on every ready peer before it completes.
//!
//! # Architecture
//!
//! Every node is both coordinator and participant. Peers talk over one
//! symmetric channel per connection, each side exposing the same
//! Quorum / Commit / Ready / SyncPeer methods.
//!
//! # Features
//!
//! - Staged records as a durable per-peer replay log
//! - Catch-up replay of the backlog when a peer reconnects
//! - Full reconciliation of empty nodes from a live peer
//! - Per-key serialization of overlapping writes
//! - SQLite-backed local store with per-key expiry
//! - HTTP API for reads, writes and status

pub mod config;
pub mod error;
pub mod store;
pub mod staging;
pub mod cluster;
pub mod replication;
pub mod network;
pub mod node;
pub mod api;

pub use config::WolfKvConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{ConnectionState, NodeEvent, PeerIdentity};
    pub use crate::config::{ClusterConfig, ReplicationMode, WolfKvConfig};
    pub use crate::error::{Error, Result};
    pub use crate::node::{Node, ReplicatedStore};
    pub use crate::replication::{Operation, PeerService};
    pub use crate::store::{MemoryStore, Mutation, SqliteStore, Store, WriteOptions};
}

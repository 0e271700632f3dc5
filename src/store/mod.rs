//! Local Store Module
//!
//! The embedded, ordered key-value engine that a node replicates.
//! Replication only needs get/put/delete/batch and ordered range scans,
//! so the engine sits behind the `Store` trait.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Key prefix reserved for the engine's expiry housekeeping
pub const HOUSEKEEPING_PREFIX: &[u8] = b"\xffttl\xff";

/// Check whether a key lives in the housekeeping namespace
pub fn is_housekeeping(key: &[u8]) -> bool {
    key.starts_with(HOUSEKEEPING_PREFIX)
}

/// A lazy, one-shot, ordered sequence of (key, value) pairs
pub type KvStream = BoxStream<'static, Result<(Vec<u8>, Vec<u8>)>>;

/// Options applied to a write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Expire written keys after this long
    pub ttl: Option<Duration>,
}

impl WriteOptions {
    /// Options with an expiry
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }

    /// Absolute expiry in unix milliseconds
    pub(crate) fn expires_at(&self) -> Option<i64> {
        self.ttl
            .map(|ttl| now_millis().saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64))
    }
}

/// A single put or delete inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Mutation {
    /// Create a put
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Mutation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a delete
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Mutation::Delete { key: key.into() }
    }

    /// The key this mutation touches
    pub fn key(&self) -> &[u8] {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } => key,
        }
    }
}

/// Ordered key-value storage engine
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Read a key
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write a key
    async fn put(&self, key: &[u8], value: &[u8], options: &WriteOptions) -> Result<()>;

    /// Remove a key
    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Apply mutations atomically, in order
    async fn batch(&self, ops: Vec<Mutation>, options: &WriteOptions) -> Result<()>;

    /// Scan `[lower, upper)` in ascending byte order; no upper bound when `None`
    async fn range(&self, lower: &[u8], upper: Option<&[u8]>) -> Result<KvStream>;

    /// Check whether the store holds no live keys at all
    async fn is_empty(&self) -> Result<bool>;

    /// Remove expired keys, returning how many were dropped
    async fn purge_expired(&self) -> Result<usize>;
}

/// Drain a range scan into memory
pub async fn scan(
    store: &dyn Store,
    lower: &[u8],
    upper: Option<&[u8]>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    store.range(lower, upper).await?.try_collect().await
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

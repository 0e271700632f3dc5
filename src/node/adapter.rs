//! Local Store Adapter
//!
//! Client-facing store whose writes run the replication protocol before
//! completing. Reads and scans go straight to the local engine. Keys in the
//! housekeeping namespace bypass replication entirely.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::replication::{Operation, Replicator};
use crate::staging;
use crate::store::{self, KvStream, Mutation, WriteOptions};

/// Replicated view of the local store
#[derive(Clone)]
pub struct ReplicatedStore {
    replicator: Arc<Replicator>,
}

impl ReplicatedStore {
    pub(crate) fn new(replicator: Arc<Replicator>) -> Self {
        Self { replicator }
    }

    /// Read a committed key
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        self.replicator.store().get(key.as_ref()).await
    }

    /// Write a key on every target peer, then locally
    pub async fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.put_with(key, value, WriteOptions::default()).await
    }

    /// Write a key with options (e.g. expiry)
    pub async fn put_with(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        options: WriteOptions,
    ) -> Result<()> {
        let (key, value) = (key.as_ref(), value.as_ref());
        if store::is_housekeeping(key) {
            return self.replicator.store().put(key, value, &options).await;
        }
        check_key(key)?;

        self.replicator
            .replicate(Operation::Put {
                key: key.to_vec(),
                value: value.to_vec(),
                options,
            })
            .await
    }

    /// Remove a key on every target peer, then locally
    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let key = key.as_ref();
        if store::is_housekeeping(key) {
            return self.replicator.store().delete(key).await;
        }
        check_key(key)?;

        self.replicator.replicate(Operation::delete(key)).await
    }

    /// Apply an ordered batch as one replicated operation
    pub async fn batch(&self, ops: Vec<Mutation>) -> Result<()> {
        self.batch_with(ops, WriteOptions::default()).await
    }

    /// Apply an ordered batch with options
    pub async fn batch_with(&self, ops: Vec<Mutation>, options: WriteOptions) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let housekeeping = ops.iter().filter(|m| store::is_housekeeping(m.key())).count();
        if housekeeping == ops.len() {
            return self.replicator.store().batch(ops, &options).await;
        }
        if housekeeping > 0 {
            return Err(Error::InvalidOperation(
                "batch mixes housekeeping and replicated keys".into(),
            ));
        }
        for m in &ops {
            check_key(m.key())?;
        }

        self.replicator.replicate(Operation::Batch { ops, options }).await
    }

    /// Scan `[lower, upper)` of the local store
    pub async fn range(&self, lower: &[u8], upper: Option<&[u8]>) -> Result<KvStream> {
        self.replicator.store().range(lower, upper).await
    }
}

/// Reject keys the protocol cannot replicate
fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidOperation("key cannot be empty".into()));
    }
    if staging::is_staged(key) {
        return Err(Error::InvalidOperation(
            "key lies in the reserved staging namespace".into(),
        ));
    }
    Ok(())
}

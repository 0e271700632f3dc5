//! Catch-up Sync
//!
//! Replays the staged backlog of a peer that just connected. The backlog is
//! already durable locally, so quorum is skipped and the records go out as
//! direct commits, split so each batch stays well under the frame limit.

use futures::TryStreamExt;

use super::{Operation, PeerService, Replicator};
use crate::cluster::PeerIdentity;
use crate::error::Result;
use crate::network::MAX_FRAME_SIZE;
use crate::staging::{self, StagedValue};
use crate::store::{Mutation, WriteOptions};

/// Encoded size a single catch-up batch aims to stay under
pub const CATCH_UP_BATCH_BYTES: u64 = MAX_FRAME_SIZE as u64 / 2;

impl Replicator {
    /// Push every staged record tagged for `peer` through `remote`.
    ///
    /// Returns the number of records replayed.
    pub async fn catch_up(&self, peer: &PeerIdentity, remote: &dyn PeerService) -> Result<usize> {
        self.catch_up_batched(peer, remote, CATCH_UP_BATCH_BYTES).await
    }

    /// Replay the backlog in batches of at most `budget` encoded bytes.
    ///
    /// Each batch is confirmed as soon as the peer accepts it, so a failure
    /// part way through only leaves the remaining records staged. A record
    /// larger than `budget` goes out alone.
    pub(crate) async fn catch_up_batched(
        &self,
        peer: &PeerIdentity,
        remote: &dyn PeerService,
        budget: u64,
    ) -> Result<usize> {
        let keys = self.backlog_keys(peer).await?;
        if keys.is_empty() {
            tracing::debug!("No backlog for {}", peer);
            return Ok(0);
        }

        let _guard = self.locks().lock(keys.iter().map(Vec::as_slice)).await;

        // Sessions that held these keys may have confirmed them meanwhile
        let mut ops = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.store().get(&staging::encode(peer, &key)).await? {
                ops.push(StagedValue::decode(&raw)?.into_mutation(key));
            }
        }
        if ops.is_empty() {
            return Ok(0);
        }

        let count = ops.len();
        tracing::info!("Catching up {} with {} staged records", peer, count);

        let mut batch = Vec::new();
        let mut batch_bytes = 0;
        let mut batches = 0;
        for mutation in ops {
            let size = bincode::serialized_size(&mutation)?;
            if !batch.is_empty() && batch_bytes + size > budget {
                self.replay(peer, remote, std::mem::take(&mut batch)).await?;
                batch_bytes = 0;
                batches += 1;
            }
            batch_bytes += size;
            batch.push(mutation);
        }
        self.replay(peer, remote, batch).await?;
        batches += 1;

        tracing::debug!("Replayed {} records to {} in {} batches", count, peer, batches);
        Ok(count)
    }

    async fn replay(
        &self,
        peer: &PeerIdentity,
        remote: &dyn PeerService,
        batch: Vec<Mutation>,
    ) -> Result<()> {
        let op = Operation::batch(batch);
        remote.commit(op.clone(), peer.clone()).await?;
        self.confirm(&op, std::slice::from_ref(peer)).await
    }

    /// Original keys of every staged record tagged for `peer`
    async fn backlog_keys(&self, peer: &PeerIdentity) -> Result<Vec<Vec<u8>>> {
        let (lower, upper) = staging::peer_range(peer);
        self.store()
            .range(&lower, upper.as_deref())
            .await?
            .and_then(|(staged, _)| async move { staging::decode(&staged).map(|(_, key)| key) })
            .try_collect()
            .await
    }
}

/// Mutations a catch-up batch would replay, in key order
pub async fn pending(replicator: &Replicator, peer: &PeerIdentity) -> Result<Vec<Mutation>> {
    let (lower, upper) = staging::peer_range(peer);
    let records = crate::store::scan(replicator.store().as_ref(), &lower, upper.as_deref()).await?;
    records
        .into_iter()
        .map(|(staged, raw)| {
            let (_, key) = staging::decode(&staged)?;
            Ok(StagedValue::decode(&raw)?.into_mutation(key))
        })
        .collect()
}

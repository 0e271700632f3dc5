//! Full Reconciliation
//!
//! An empty node bootstraps by asking one peer to stream its whole committed
//! keyspace back as individual commits.

use futures::StreamExt;

use super::{Operation, PeerService, Replicator};
use crate::cluster::PeerIdentity;
use crate::error::{Error, Result};
use crate::staging;
use crate::store;

impl Replicator {
    /// Serving side of SyncPeer: wait for a connection back to `caller`,
    /// then commit every live record to it. Returns the number sent.
    pub async fn serve_sync(&self, caller: &PeerIdentity) -> Result<usize> {
        tracing::info!("Serving full sync to {}", caller);

        let remote = loop {
            if self.is_closed() {
                return Err(Error::ShuttingDown);
            }
            if let Some(remote) = self.registry().connection(caller).await {
                break remote;
            }
            tokio::time::sleep(self.config().sync_poll_interval).await;
        };

        let mut records = self.store().range(&[], None).await?;
        let mut sent = 0;
        while let Some(record) = records.next().await {
            let (key, value) = record?;
            if staging::is_staged(&key) || store::is_housekeeping(&key) {
                continue;
            }
            remote.commit(Operation::put(key, value), caller.clone()).await?;
            sent += 1;
        }

        tracing::info!("Full sync to {} complete: {} records", caller, sent);
        Ok(sent)
    }

    /// Bootstrapping side: ask `remote` to stream its keyspace to this node
    pub async fn reconcile(&self, source: &PeerIdentity, remote: &dyn PeerService) -> Result<()> {
        tracing::info!("Reconciling from {}", source);
        remote.sync_peer(self.local().clone()).await
    }
}

//! Write Staging & Commit Protocol
//!
//! Every client write runs as one session:
//!
//! 1. **Stage**: one local batch writes a staged record for this node and for
//!    every configured peer, reachable or not.
//! 2. **Quorum**: each target peer writes its own prepare record.
//! 3. **Commit**: each target peer applies the mutation and drops its staged records.
//! 4. **Local commit**: this node applies the same commit to itself.
//! 5. **Confirm**: this node drops the staged records of every peer that committed.
//!
//! A failure at any step is returned to the caller. Peers that already
//! advanced are not rolled back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};

use super::{KeyLocks, Operation, PeerService};
use crate::cluster::{ConnectionRegistry, PeerIdentity};
use crate::config::{ClusterConfig, ReplicationMode};
use crate::error::{Error, Result};
use crate::staging;
use crate::store::{Store, WriteOptions};

/// Remote phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Quorum,
    Commit,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Quorum => write!(f, "QUORUM"),
            Phase::Commit => write!(f, "COMMIT"),
        }
    }
}

/// In-flight coordination state of one operation
pub struct ReplicationSession {
    op: Operation,
    /// Target snapshot taken at session start
    targets: Vec<PeerIdentity>,
    phase: Phase,
    acks: usize,
}

impl ReplicationSession {
    fn new(op: Operation, targets: Vec<PeerIdentity>) -> Self {
        Self {
            op,
            targets,
            phase: Phase::Quorum,
            acks: 0,
        }
    }

    /// Drive the quorum and commit phases; returns the peers that committed
    async fn run(&mut self, replicator: &Replicator) -> Result<Vec<PeerIdentity>> {
        for phase in [Phase::Quorum, Phase::Commit] {
            self.phase = phase;
            self.acks = self.run_phase(replicator).await?;
            tracing::debug!(
                "{} phase complete: {}/{} peers acknowledged",
                self.phase,
                self.acks,
                self.targets.len()
            );
        }
        Ok(self.targets.clone())
    }

    async fn run_phase(&self, replicator: &Replicator) -> Result<usize> {
        let mut calls: FuturesUnordered<_> = self
            .targets
            .iter()
            .map(|peer| replicator.call_phase(self.phase, &self.op, peer))
            .collect();

        let mut acks = 0;
        while let Some(result) = calls.next().await {
            result?;
            acks += 1;
        }
        Ok(acks)
    }
}

/// Replication engine shared by the node, its handlers and its sync tasks
pub struct Replicator {
    local: PeerIdentity,
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    config: ClusterConfig,
    locks: KeyLocks,
    closed: AtomicBool,
}

impl Replicator {
    /// Create a replicator over a local store
    pub fn new(store: Arc<dyn Store>, registry: Arc<ConnectionRegistry>, config: ClusterConfig) -> Self {
        Self {
            local: registry.local().clone(),
            store,
            registry,
            config,
            locks: KeyLocks::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub(crate) fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Stop background polling loops
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run the full write protocol for one client operation
    pub async fn replicate(&self, op: Operation) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ShuttingDown);
        }

        let _guard = self.locks.lock(op.keys()).await;
        tracing::debug!("Replicating {} from {}", op.type_name(), self.local);

        self.stage(&op).await?;

        let targets = self.targets().await;
        if targets.is_empty() {
            tracing::trace!("No target peers, committing locally only");
            return self.apply_commit(&op, &self.local).await;
        }

        let mut session = ReplicationSession::new(op, targets);
        let committed = session.run(self).await?;

        self.apply_commit(&session.op, &self.local).await?;
        self.confirm(&session.op, &committed).await
    }

    /// Peers a new session replicates to
    async fn targets(&self) -> Vec<PeerIdentity> {
        match self.config.mode {
            ReplicationMode::Semisync => self.registry.ready_peers().await,
            ReplicationMode::Sync => self.registry.configured().await,
        }
    }

    /// Write staged copies for this node and every configured peer
    pub async fn stage(&self, op: &Operation) -> Result<()> {
        let mutations = op.mutations();
        let mut staged = staging::stage(&self.local, &mutations)?;
        for peer in self.registry.configured().await {
            staged.extend(staging::stage(&peer, &mutations)?);
        }
        self.store.batch(staged, &WriteOptions::default()).await
    }

    /// Receiving side of Quorum: record a prepare copy tagged with `peer`
    pub async fn apply_quorum(&self, op: &Operation, peer: &PeerIdentity) -> Result<()> {
        tracing::debug!("Quorum phase for {} at {}", op.type_name(), peer);
        let staged = staging::stage(peer, &op.mutations())?;
        self.store.batch(staged, &WriteOptions::default()).await
    }

    /// Receiving side of Commit: apply the mutation and drop the staged
    /// records tagged with this node and with `peer`
    pub async fn apply_commit(&self, op: &Operation, peer: &PeerIdentity) -> Result<()> {
        tracing::debug!("Commit phase for {} at {}", op.type_name(), peer);

        let keys = op.keys();
        let mut batch = op.mutations();
        batch.extend(staging::unstage(&self.local, keys.iter().copied()));
        if *peer != self.local {
            batch.extend(staging::unstage(peer, keys.iter().copied()));
        }

        let options = self.commit_options(op);
        self.store.batch(batch, &options).await
    }

    /// Options for a commit, falling back to the default expiry
    fn commit_options(&self, op: &Operation) -> WriteOptions {
        match op.options() {
            Some(options) if options.ttl.is_some() => options.clone(),
            _ => WriteOptions {
                ttl: self.config.default_ttl,
            },
        }
    }

    /// Drop this node's staged records for peers that committed
    pub async fn confirm(&self, op: &Operation, peers: &[PeerIdentity]) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }

        let keys = op.keys();
        let deletes = peers
            .iter()
            .flat_map(|peer| staging::unstage(peer, keys.iter().copied()))
            .collect();
        self.store.batch(deletes, &WriteOptions::default()).await
    }

    async fn call_phase(&self, phase: Phase, op: &Operation, peer: &PeerIdentity) -> Result<()> {
        let remote = self.resolve_remote(peer).await?;
        tracing::trace!("{} phase: calling {}", phase, peer);
        match phase {
            Phase::Quorum => remote.quorum(op.clone(), peer.clone()).await,
            Phase::Commit => remote.commit(op.clone(), peer.clone()).await,
        }
    }

    /// Wait for an outbound connection to `peer`.
    ///
    /// Polls every `retry_interval`; gives up after `fail_after` attempts.
    pub async fn resolve_remote(&self, peer: &PeerIdentity) -> Result<Arc<dyn PeerService>> {
        let mut attempts = 0u32;
        loop {
            if let Some(remote) = self.registry.connection(peer).await {
                return Ok(remote);
            }

            attempts += 1;
            if attempts >= self.config.fail_after {
                tracing::warn!("Peer {} unreachable after {} attempts", peer, attempts);
                return Err(Error::ConnectionFailed {
                    peer: peer.clone(),
                    attempts,
                });
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{scan, MemoryStore, Mutation};
    use std::time::Duration;

    pub(crate) fn peer(port: u16) -> PeerIdentity {
        PeerIdentity::new("localhost", port)
    }

    pub(crate) fn test_config(port: u16, peers: &[u16]) -> ClusterConfig {
        let mut config = ClusterConfig::new("localhost", port);
        config.peers = peers.iter().map(|p| peer(*p)).collect();
        config.fail_after = 5;
        config.retry_interval = Duration::from_millis(1);
        config
    }

    pub(crate) async fn replicator(config: ClusterConfig) -> (Arc<Replicator>, MemoryStore) {
        let store = MemoryStore::new();
        let registry = Arc::new(ConnectionRegistry::new(config.identity.clone()));
        for p in &config.peers {
            registry.configure(p).await;
        }
        let replicator = Arc::new(Replicator::new(Arc::new(store.clone()), registry, config));
        (replicator, store)
    }

    /// In-process peer: a replicator answering calls directly
    pub(crate) struct LocalPeer(pub Arc<Replicator>);

    #[async_trait::async_trait]
    impl PeerService for LocalPeer {
        async fn quorum(&self, op: Operation, peer: PeerIdentity) -> Result<()> {
            self.0.apply_quorum(&op, &peer).await
        }
        async fn commit(&self, op: Operation, peer: PeerIdentity) -> Result<()> {
            self.0.apply_commit(&op, &peer).await
        }
        async fn ready(&self, _peer: PeerIdentity) -> Result<bool> {
            Ok(true)
        }
        async fn sync_peer(&self, peer: PeerIdentity) -> Result<()> {
            self.0.serve_sync(&peer).await.map(|_| ())
        }
    }

    /// Peer whose handlers always fail
    struct FailingPeer;

    #[async_trait::async_trait]
    impl PeerService for FailingPeer {
        async fn quorum(&self, _op: Operation, _peer: PeerIdentity) -> Result<()> {
            Err(Error::Storage("disk full".into()))
        }
        async fn commit(&self, _op: Operation, _peer: PeerIdentity) -> Result<()> {
            Err(Error::Storage("disk full".into()))
        }
        async fn ready(&self, _peer: PeerIdentity) -> Result<bool> {
            Ok(true)
        }
        async fn sync_peer(&self, _peer: PeerIdentity) -> Result<()> {
            Ok(())
        }
    }

    async fn staged_keys(store: &MemoryStore) -> Vec<(PeerIdentity, Vec<u8>)> {
        scan(store, staging::STAGING_MARKER, staging::prefix_end(staging::STAGING_MARKER).as_deref())
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| staging::decode(&k).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_stage_covers_local_and_all_configured() {
        let (a, store) = replicator(test_config(3000, &[3001, 3002])).await;
        a.stage(&Operation::put("k", "v")).await.unwrap();

        let tags: Vec<_> = staged_keys(&store).await.into_iter().map(|(p, _)| p).collect();
        assert_eq!(tags.len(), 3);
        for port in [3000, 3001, 3002] {
            assert!(tags.contains(&peer(port)));
        }
        // Stage never touches the committed keyspace
        assert_eq!(store.get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_no_ready_peers_commits_locally_and_keeps_backlog() {
        let (a, store) = replicator(test_config(3000, &[3001])).await;
        a.replicate(Operation::put("k", "v")).await.unwrap();

        assert_eq!(store.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(staged_keys(&store).await, vec![(peer(3001), b"k".to_vec())]);
    }

    #[tokio::test]
    async fn test_full_session_replicates_and_cleans_up() {
        let (a, a_store) = replicator(test_config(3000, &[3001, 3002])).await;
        let (b, b_store) = replicator(test_config(3001, &[3000, 3002])).await;
        let (c, c_store) = replicator(test_config(3002, &[3000, 3001])).await;

        for (p, r) in [(3001, &b), (3002, &c)] {
            a.registry().register(&peer(p), Arc::new(LocalPeer(Arc::clone(r)))).await;
            a.registry().mark_ready(&peer(p)).await;
        }

        a.replicate(Operation::batch(vec![
            Mutation::put("X_1", "one"),
            Mutation::put("X_2", "two"),
            Mutation::delete("X_3"),
        ]))
        .await
        .unwrap();

        for store in [&a_store, &b_store, &c_store] {
            assert_eq!(store.get(b"X_1").await.unwrap(), Some(b"one".to_vec()));
            assert_eq!(store.get(b"X_2").await.unwrap(), Some(b"two".to_vec()));
            assert!(staged_keys(store).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_delete_replicates() {
        let (a, a_store) = replicator(test_config(3000, &[3001])).await;
        let (b, b_store) = replicator(test_config(3001, &[3000])).await;
        a.registry().register(&peer(3001), Arc::new(LocalPeer(Arc::clone(&b)))).await;
        a.registry().mark_ready(&peer(3001)).await;

        b_store.put(b"k", b"old", &WriteOptions::default()).await.unwrap();
        a_store.put(b"k", b"old", &WriteOptions::default()).await.unwrap();

        a.replicate(Operation::delete("k")).await.unwrap();
        assert_eq!(a_store.get(b"k").await.unwrap(), None);
        assert_eq!(b_store.get(b"k").await.unwrap(), None);
        assert!(staged_keys(&a_store).await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_after_fail_after_attempts() {
        let mut config = test_config(3000, &[3999]);
        config.mode = ReplicationMode::Sync;
        let (a, store) = replicator(config).await;

        let err = a.replicate(Operation::put("k", "v")).await.unwrap_err();
        match &err {
            Error::ConnectionFailed { peer: p, attempts } => {
                assert_eq!(*p, peer(3999));
                assert_eq!(*attempts, 5);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(err.to_string(), "Connection failed to localhost:3999");

        // Staged intent survives, nothing committed locally
        assert_eq!(store.get(b"k").await.unwrap(), None);
        assert_eq!(staged_keys(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn test_announced_but_unconnected_peer_not_targeted() {
        let (a, store) = replicator(test_config(3000, &[3001])).await;

        // Readiness heard before the outbound connection exists
        a.registry().mark_ready(&peer(3001)).await;
        a.replicate(Operation::put("k", "v")).await.unwrap();

        assert_eq!(store.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(staged_keys(&store).await, vec![(peer(3001), b"k".to_vec())]);
    }

    #[tokio::test]
    async fn test_sync_mode_targets_unconnected_configured_peers() {
        let mut config = test_config(3000, &[3998]);
        config.mode = ReplicationMode::Sync;
        let (a, _) = replicator(config).await;

        let err = a.replicate(Operation::put("k", "v")).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_late_connection_is_picked_up_while_polling() {
        let mut config = test_config(3000, &[3001]);
        config.fail_after = 1000;
        let (a, a_store) = replicator(config).await;
        let (b, b_store) = replicator(test_config(3001, &[3000])).await;
        a.registry().mark_ready(&peer(3001)).await;

        let connect = {
            let a = Arc::clone(&a);
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                a.registry().register(&peer(3001), Arc::new(LocalPeer(b))).await;
            })
        };

        a.replicate(Operation::put("k", "v")).await.unwrap();
        connect.await.unwrap();
        assert_eq!(a_store.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(b_store.get(b"k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_remote_failure_surfaces_without_local_commit() {
        let (a, store) = replicator(test_config(3000, &[3001])).await;
        a.registry().register(&peer(3001), Arc::new(FailingPeer)).await;
        a.registry().mark_ready(&peer(3001)).await;

        let err = a.replicate(Operation::put("k", "v")).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(store.get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_applies_default_ttl() {
        let mut config = test_config(3000, &[]);
        config.default_ttl = Some(Duration::from_millis(5));
        let (a, store) = replicator(config).await;

        a.replicate(Operation::put("k", "v")).await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_quorum_writes_prepare_record_only() {
        let (b, store) = replicator(test_config(3001, &[3000])).await;
        b.apply_quorum(&Operation::put("k", "v"), &peer(3001)).await.unwrap();

        assert_eq!(store.get(b"k").await.unwrap(), None);
        assert_eq!(staged_keys(&store).await, vec![(peer(3001), b"k".to_vec())]);

        b.apply_commit(&Operation::put("k", "v"), &peer(3001)).await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        assert!(staged_keys(&store).await.is_empty());
    }
}

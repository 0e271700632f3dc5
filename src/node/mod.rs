//! Node
//!
//! A replicated node: the local store, the connection registry and the
//! handshake that decides when this node takes part in writes.
//!
//! A node is ready immediately when it has no peers or already holds data.
//! An empty node with peers first pulls a full copy of the keyspace from
//! the first peer it reaches, then announces itself.

mod adapter;

pub use adapter::ReplicatedStore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::cluster::{ConnectionRegistry, ConnectionState, NodeEvent, PeerIdentity};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::network::{self, NetworkServer, PeerChannel};
use crate::replication::{Operation, PeerService, Replicator};
use crate::store::Store;

const EVENT_CAPACITY: usize = 256;

/// Handle to a running node
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    replicator: Arc<Replicator>,
    events: broadcast::Sender<NodeEvent>,
    ready: watch::Sender<bool>,
    /// Set while this node still needs a full sync from a peer
    needs_reconcile: AtomicBool,
    shutdown: watch::Sender<bool>,
    server: Mutex<Option<Arc<NetworkServer>>>,
    dialers: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node over `store` and start dialing its configured peers
    pub async fn create(store: Arc<dyn Store>, config: ClusterConfig) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ConnectionRegistry::new(config.identity.clone()));
        for peer in &config.peers {
            registry.configure(peer).await;
        }

        let needs_reconcile = !config.peers.is_empty() && store.is_empty().await?;
        let peers = registry.configured().await;
        tracing::info!(
            "Creating node {} with {} peers ({} mode)",
            config.identity,
            peers.len(),
            config.mode
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(NodeInner {
            replicator: Arc::new(Replicator::new(store, registry, config)),
            events,
            ready,
            needs_reconcile: AtomicBool::new(needs_reconcile),
            shutdown,
            server: Mutex::new(None),
            dialers: Mutex::new(Vec::new()),
        });

        if needs_reconcile {
            tracing::info!("Local store is empty, waiting for a peer to sync from");
        } else {
            inner.become_ready().await;
        }

        let node = Self { inner };
        for peer in peers {
            node.spawn_dialer(peer).await;
        }
        Ok(node)
    }

    /// This node's identity
    pub fn identity(&self) -> &PeerIdentity {
        self.inner.replicator.local()
    }

    /// Configure and dial another peer.
    ///
    /// Returns false when the peer was already configured.
    pub async fn add_peer(&self, peer: PeerIdentity) -> Result<bool> {
        peer.validate()?;
        if self.is_closed() {
            return Err(Error::ShuttingDown);
        }
        if !self.inner.registry().configure(&peer).await {
            tracing::debug!("Peer {} already configured", peer);
            return Ok(false);
        }

        tracing::info!("Adding peer {}", peer);
        self.spawn_dialer(peer).await;
        Ok(true)
    }

    /// Subscribe to node events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Node events as a stream
    pub fn events(&self) -> BroadcastStream<NodeEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// Check whether this node has announced itself
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Wait until this node is ready
    pub async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.inner.ready.subscribe();
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if *ready.borrow_and_update() {
                return Ok(());
            }
            if *shutdown.borrow_and_update() {
                return Err(Error::ShuttingDown);
            }
            tokio::select! {
                result = ready.changed() => {
                    if result.is_err() {
                        return Err(Error::ShuttingDown);
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() {
                        return Err(Error::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Peers currently taking part in writes
    pub async fn ready_peers(&self) -> Vec<PeerIdentity> {
        self.inner.registry().ready_peers().await
    }

    /// Lifecycle state of every configured peer
    pub async fn peer_states(&self) -> Vec<(PeerIdentity, ConnectionState)> {
        self.inner.registry().states().await
    }

    /// Store proxy whose writes run the replication protocol
    pub fn store(&self) -> ReplicatedStore {
        ReplicatedStore::new(Arc::clone(&self.inner.replicator))
    }

    /// Serve incoming peer connections until the node is closed
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let server = {
            let mut slot = self.inner.server.lock().await;
            if self.is_closed() {
                return Err(Error::ShuttingDown);
            }
            let service: Arc<dyn PeerService> = self.inner.clone();
            let server = Arc::new(NetworkServer::new(service));
            *slot = Some(Arc::clone(&server));
            server
        };
        server.run(listener).await
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Stop dialing and serving, and drop every connection
    pub async fn close(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        tracing::info!("Closing node {}", self.identity());

        self.inner.replicator.close();
        if let Some(server) = self.inner.server.lock().await.take() {
            server.stop();
        }

        let dialers: Vec<_> = self.inner.dialers.lock().await.drain(..).collect();
        for dialer in dialers {
            if let Err(e) = dialer.await {
                tracing::warn!("Dialer task failed: {}", e);
            }
        }
        self.inner.registry().clear().await;
    }

    async fn spawn_dialer(&self, peer: PeerIdentity) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.dial_loop(peer).await });
        self.inner.dialers.lock().await.push(handle);
    }
}

impl NodeInner {
    fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.replicator.registry()
    }

    fn local(&self) -> &PeerIdentity {
        self.replicator.local()
    }

    fn config(&self) -> &ClusterConfig {
        self.replicator.config()
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn emit(&self, event: NodeEvent) {
        tracing::trace!("Event {}", event.type_name());
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: Error) {
        self.emit(NodeEvent::Error(Arc::new(error)));
    }

    /// Keep an outbound connection to `peer` open until shutdown
    async fn dial_loop(self: Arc<Self>, peer: PeerIdentity) {
        let mut shutdown = self.shutdown.subscribe();

        while !*shutdown.borrow_and_update() {
            self.registry().set_dialing(&peer).await;

            let dialed = tokio::select! {
                result = network::connect(&peer, self.config().connect_timeout) => result,
                _ = shutdown.changed() => break,
            };

            match dialed {
                Ok(stream) => {
                    let service: Arc<dyn PeerService> = self.clone();
                    let channel = PeerChannel::open(stream, peer.clone(), service);
                    self.on_connect(&peer, Arc::clone(&channel)).await;

                    tokio::select! {
                        _ = channel.closed() => {}
                        _ = shutdown.changed() => {}
                    }
                    channel.shutdown();
                    self.on_disconnect(&peer).await;
                }
                Err(e) => {
                    tracing::debug!("Dial {} failed: {}", peer, e);
                    self.registry().dial_failed(&peer).await;
                    if !self.is_shutting_down() {
                        self.emit_error(e);
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
            let delay = self.redial_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::debug!("Dialer for {} stopped", peer);
    }

    fn redial_delay(&self) -> Duration {
        let base = self.config().reconnect_interval;
        let spread = (base.as_millis() as u64) / 4;
        let jitter = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(jitter)
    }

    async fn on_connect(self: &Arc<Self>, peer: &PeerIdentity, channel: Arc<PeerChannel>) {
        tracing::info!("Connected to peer {}", peer);
        if self.registry().register(peer, channel.clone()).await {
            tracing::info!("Peer {} is ready", peer);
        }
        self.emit(NodeEvent::PeerConnected(peer.clone()));

        let inner = Arc::clone(self);
        let peer = peer.clone();
        tokio::spawn(async move { inner.after_connect(peer, channel).await });
    }

    /// Catch-up, reconciliation and readiness for a fresh connection
    async fn after_connect(self: Arc<Self>, peer: PeerIdentity, channel: Arc<PeerChannel>) {
        match self.replicator.catch_up(&peer, channel.as_ref()).await {
            Ok(0) => {}
            Ok(count) => tracing::info!("Replayed {} staged records to {}", count, peer),
            Err(e) => {
                tracing::warn!("Catch-up with {} failed: {}", peer, e);
                self.emit_error(e);
            }
        }

        if self
            .needs_reconcile
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            match self.replicator.reconcile(&peer, channel.as_ref()).await {
                Ok(()) => self.become_ready().await,
                Err(e) => {
                    tracing::warn!("Full sync from {} failed: {}", peer, e);
                    self.needs_reconcile.store(true, Ordering::SeqCst);
                    self.emit_error(e);
                }
            }
            return;
        }

        if self.is_ready() {
            self.announce(&peer, channel.as_ref()).await;
        }
    }

    async fn on_disconnect(&self, peer: &PeerIdentity) {
        if !self.registry().disconnect(peer).await {
            return;
        }
        tracing::info!("Disconnected from peer {}", peer);
        self.emit(NodeEvent::PeerDisconnected(peer.clone()));
        if !self.is_shutting_down() {
            self.emit_error(Error::Disconnected(peer.clone()));
        }
    }

    /// Mark this node ready and announce it to every connected peer
    async fn become_ready(&self) {
        if self.ready.send_replace(true) {
            return;
        }
        tracing::info!("Node {} is ready", self.local());
        self.emit(NodeEvent::Ready);

        for (peer, remote) in self.registry().connected().await {
            self.announce(&peer, remote.as_ref()).await;
        }
    }

    /// Tell `peer` this node is ready; adopt its readiness in return
    async fn announce(&self, peer: &PeerIdentity, remote: &dyn PeerService) {
        match remote.ready(self.local().clone()).await {
            Ok(true) => {
                self.registry().mark_ready(peer).await;
            }
            Ok(false) => tracing::debug!("Peer {} is not ready yet", peer),
            Err(e) => {
                tracing::warn!("Ready announcement to {} failed: {}", peer, e);
                self.emit_error(e);
            }
        }
    }
}

#[async_trait::async_trait]
impl PeerService for NodeInner {
    async fn quorum(&self, op: Operation, peer: PeerIdentity) -> Result<()> {
        self.replicator.apply_quorum(&op, &peer).await
    }

    async fn commit(&self, op: Operation, peer: PeerIdentity) -> Result<()> {
        self.replicator.apply_commit(&op, &peer).await
    }

    async fn ready(&self, peer: PeerIdentity) -> Result<bool> {
        if self.registry().mark_ready(&peer).await {
            tracing::info!("Peer {} is ready", peer);
        }
        Ok(self.is_ready())
    }

    async fn sync_peer(&self, peer: PeerIdentity) -> Result<()> {
        if !self.registry().is_configured(&peer).await {
            return Err(Error::InvalidOperation(format!(
                "{} is not a configured peer of {}",
                peer,
                self.local()
            )));
        }
        self.replicator.serve_sync(&peer).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, WriteOptions};

    fn config(port: u16) -> ClusterConfig {
        ClusterConfig::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_node_without_peers_is_ready() {
        let node = Node::create(Arc::new(MemoryStore::new()), config(4100)).await.unwrap();
        assert!(node.is_ready());
        node.wait_ready().await.unwrap();

        node.store().put("k", "v").await.unwrap();
        assert_eq!(node.store().get(b"k").await.unwrap(), Some(b"v".to_vec()));
        node.close().await;
    }

    #[tokio::test]
    async fn test_empty_node_with_peers_waits_for_sync() {
        let config = config(4101).with_peer(PeerIdentity::new("127.0.0.1", 1));
        let node = Node::create(Arc::new(MemoryStore::new()), config).await.unwrap();
        assert!(!node.is_ready());

        node.close().await;
        assert!(matches!(node.wait_ready().await, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_populated_node_with_peers_is_ready() {
        let store = MemoryStore::new();
        store.put(b"k", b"v", &WriteOptions::default()).await.unwrap();

        let config = config(4102).with_peer(PeerIdentity::new("127.0.0.1", 1));
        let node = Node::create(Arc::new(store), config).await.unwrap();
        assert!(node.is_ready());
        node.close().await;
    }

    #[tokio::test]
    async fn test_add_peer_is_idempotent() {
        let node = Node::create(Arc::new(MemoryStore::new()), config(4103)).await.unwrap();
        let peer = PeerIdentity::new("127.0.0.1", 1);

        assert!(node.add_peer(peer.clone()).await.unwrap());
        assert!(!node.add_peer(peer.clone()).await.unwrap());
        assert!(!node.add_peer(node.identity().clone()).await.unwrap());

        let states = node.peer_states().await;
        assert_eq!(states.len(), 1);
        assert_ne!(states[0].1, ConnectionState::Ready);
        node.close().await;
    }

    #[tokio::test]
    async fn test_ready_from_unconfigured_peer_ignored() {
        let node = Node::create(Arc::new(MemoryStore::new()), config(4104)).await.unwrap();
        let stranger = PeerIdentity::new("127.0.0.1", 9);

        assert!(node.inner.ready(stranger.clone()).await.unwrap());
        assert!(node.ready_peers().await.is_empty());
        assert!(node.inner.sync_peer(stranger).await.is_err());
        node.close().await;
    }

    #[tokio::test]
    async fn test_dial_failure_emits_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = config(4105).with_peer(PeerIdentity::new("127.0.0.1", port));
        config.reconnect_interval = Duration::from_millis(20);

        let node = Node::create(Arc::new(MemoryStore::new()), config).await.unwrap();
        let mut events = node.subscribe();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, NodeEvent::Error(_)));
        node.close().await;
    }
}

//! Network Server
//!
//! Accepts connections from other nodes and serves the local peer
//! service on each of them.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};

use super::PeerChannel;
use crate::cluster::PeerIdentity;
use crate::error::Result;
use crate::replication::PeerService;

/// Network server for cluster communication
pub struct NetworkServer {
    /// Handler for incoming calls
    service: Arc<dyn PeerService>,
    /// Inbound channels still open
    channels: Mutex<Vec<Arc<PeerChannel>>>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(service: Arc<dyn PeerService>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            service,
            channels: Mutex::new(Vec::new()),
            shutdown: shutdown_tx,
        }
    }

    /// Accept connections until stopped
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Network server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            if let Err(e) = socket.set_nodelay(true) {
                                tracing::debug!("Failed to set nodelay for {}: {}", addr, e);
                            }
                            tracing::debug!("Accepted connection from {}", addr);

                            let label = PeerIdentity::new(addr.ip().to_string(), addr.port());
                            let channel = PeerChannel::open(socket, label, Arc::clone(&self.service));

                            let mut channels = self.channels.lock().await;
                            channels.retain(|c| !c.is_closed());
                            channels.push(channel);
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        for channel in self.channels.lock().await.drain(..) {
            channel.shutdown();
        }
        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server and close inbound channels
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Number of open inbound channels
    pub async fn connection_count(&self) -> usize {
        let mut channels = self.channels.lock().await;
        channels.retain(|c| !c.is_closed());
        channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::network::connect;
    use crate::replication::Operation;
    use std::time::Duration;

    struct ReadyService;

    #[async_trait::async_trait]
    impl PeerService for ReadyService {
        async fn quorum(&self, _op: Operation, _peer: PeerIdentity) -> Result<()> {
            Ok(())
        }
        async fn commit(&self, _op: Operation, _peer: PeerIdentity) -> Result<()> {
            Ok(())
        }
        async fn ready(&self, _peer: PeerIdentity) -> Result<bool> {
            Ok(true)
        }
        async fn sync_peer(&self, _peer: PeerIdentity) -> Result<()> {
            Err(Error::InvalidOperation("not serving".into()))
        }
    }

    #[tokio::test]
    async fn test_serve_and_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = PeerIdentity::new("127.0.0.1", listener.local_addr().unwrap().port());

        let server = Arc::new(NetworkServer::new(Arc::new(ReadyService)));
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run(listener).await })
        };

        let stream = connect(&target, Duration::from_secs(5)).await.unwrap();
        let channel = PeerChannel::open(stream, target.clone(), Arc::new(ReadyService));
        assert!(channel.ready(target.clone()).await.unwrap());
        assert_eq!(server.connection_count().await, 1);

        server.stop();
        running.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), channel.closed())
            .await
            .unwrap();
    }
}

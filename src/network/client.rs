//! Network Client
//!
//! Outbound dialing to peer nodes.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cluster::PeerIdentity;
use crate::error::{Error, Result};

/// Dial a peer
pub async fn connect(peer: &PeerIdentity, connect_timeout: Duration) -> Result<TcpStream> {
    let result = timeout(connect_timeout, TcpStream::connect(peer.address())).await;

    match result {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::Network(format!("Dial {} failed: {}", peer, e))),
        Err(_) => Err(Error::Network(format!("Dial {} timed out", peer))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect(&PeerIdentity::new("127.0.0.1", port), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connection_failure() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = connect(&PeerIdentity::new("127.0.0.1", port), Duration::from_millis(500)).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}

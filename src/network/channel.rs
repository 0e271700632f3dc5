//! Peer Channel
//!
//! A symmetric procedure channel over one TCP stream. Either end may send
//! requests; incoming requests are dispatched to the local `PeerService`
//! and answered on the same stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use super::protocol::{Call, Frame, Reply, RequestId};
use super::{read_frame, write_frame, MAX_FRAME_SIZE};
use crate::cluster::PeerIdentity;
use crate::error::{Error, Result};
use crate::replication::{Operation, PeerService};

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>>;

/// One end of a peer connection
pub struct PeerChannel {
    /// Remote end, as dialed or as seen on the socket
    peer: PeerIdentity,
    next_id: AtomicU64,
    pending: Pending,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: Arc<watch::Sender<bool>>,
}

impl PeerChannel {
    /// Start serving `stream`, dispatching incoming calls to `service`
    pub fn open(stream: TcpStream, peer: PeerIdentity, service: Arc<dyn PeerService>) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let channel = Arc::new(Self {
            peer,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound,
            closed: Arc::new(closed),
        });

        tokio::spawn(write_loop(
            writer,
            queue,
            Arc::clone(&channel.pending),
            Arc::clone(&channel.closed),
            channel.peer.clone(),
        ));
        tokio::spawn(read_loop(
            reader,
            service,
            channel.outbound.clone(),
            Arc::clone(&channel.pending),
            Arc::clone(&channel.closed),
            channel.peer.clone(),
        ));

        channel
    }

    /// Remote end of this channel
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Check whether the stream has ended
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the stream ends
    pub async fn closed(&self) {
        wait_closed(&mut self.closed.subscribe()).await;
    }

    /// Close the stream and fail every pending call
    pub fn shutdown(&self) {
        self.closed.send_replace(true);
    }

    /// Send a request and wait for its reply
    pub async fn call(&self, call: Call) -> Result<Reply> {
        if self.is_closed() {
            return Err(Error::Disconnected(self.peer.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Request { id, call };

        // Refused here so the writer never meets a frame the peer would reject
        let size = frame.encoded_len()?;
        if size > MAX_FRAME_SIZE as u64 {
            return Err(Error::Network(format!(
                "{} to {} is {} bytes, over the {} byte frame limit",
                frame.type_name(),
                self.peer,
                size,
                MAX_FRAME_SIZE
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        // The reader drains pending calls only after marking the channel closed
        if self.is_closed() {
            self.pending.lock().await.remove(&id);
            return Err(Error::Disconnected(self.peer.clone()));
        }

        tracing::trace!("Sending {} #{} to {}", frame.type_name(), id, self.peer);
        if self.outbound.send(frame).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::Disconnected(self.peer.clone()));
        }

        rx.await.map_err(|_| Error::Disconnected(self.peer.clone()))
    }

    /// Expect an acknowledgment
    async fn call_ack(&self, call: Call) -> Result<()> {
        match self.call(call).await? {
            Reply::Ack => Ok(()),
            reply => Err(self.reply_error(reply)),
        }
    }

    fn reply_error(&self, reply: Reply) -> Error {
        match reply {
            Reply::Error(message) => Error::Remote {
                peer: self.peer.clone(),
                message,
            },
            other => Error::Network(format!("Unexpected reply {:?} from {}", other, self.peer)),
        }
    }
}

impl Drop for PeerChannel {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

#[async_trait::async_trait]
impl PeerService for PeerChannel {
    async fn quorum(&self, op: Operation, peer: PeerIdentity) -> Result<()> {
        self.call_ack(Call::Quorum { op, peer }).await
    }

    async fn commit(&self, op: Operation, peer: PeerIdentity) -> Result<()> {
        self.call_ack(Call::Commit { op, peer }).await
    }

    async fn ready(&self, peer: PeerIdentity) -> Result<bool> {
        match self.call(Call::Ready { peer }).await? {
            Reply::Ready(ready) => Ok(ready),
            reply => Err(self.reply_error(reply)),
        }
    }

    async fn sync_peer(&self, peer: PeerIdentity) -> Result<()> {
        self.call_ack(Call::SyncPeer { peer }).await
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    pending: Pending,
    closed: Arc<watch::Sender<bool>>,
    peer: PeerIdentity,
) {
    let mut shutdown = closed.subscribe();

    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::warn!("Write to {} failed: {}", peer, e);
                    // A partial frame leaves the stream unusable in both directions
                    closed.send_replace(true);
                    pending.lock().await.clear();
                    break;
                }
            }
            _ = wait_closed(&mut shutdown) => break,
        }
    }
    tracing::trace!("Writer for {} stopped", peer);
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    service: Arc<dyn PeerService>,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Pending,
    closed: Arc<watch::Sender<bool>>,
    peer: PeerIdentity,
) {
    let mut shutdown = closed.subscribe();

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = wait_closed(&mut shutdown) => break,
        };

        match frame {
            Ok(Frame::Request { id, call }) => {
                tracing::trace!("Received {} #{} from {}", call.type_name(), id, peer);
                let service = Arc::clone(&service);
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let reply = dispatch(service.as_ref(), call).await;
                    let _ = outbound.send(Frame::Response { id, reply });
                });
            }
            Ok(Frame::Response { id, reply }) => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(reply);
                } else {
                    tracing::debug!("Dropping reply to unknown request #{} from {}", id, peer);
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Connection to {} closed", peer);
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading from {}: {}", peer, e);
                break;
            }
        }
    }

    closed.send_replace(true);
    // Dropping the senders fails every waiting call
    pending.lock().await.clear();
}

/// Run one incoming call against the local service
async fn dispatch(service: &dyn PeerService, call: Call) -> Reply {
    let result = match call {
        Call::Quorum { op, peer } => service.quorum(op, peer).await.map(|_| Reply::Ack),
        Call::Commit { op, peer } => service.commit(op, peer).await.map(|_| Reply::Ack),
        Call::Ready { peer } => service.ready(peer).await.map(Reply::Ready),
        Call::SyncPeer { peer } => service.sync_peer(peer).await.map(|_| Reply::Ack),
    };
    result.unwrap_or_else(|e| Reply::Error(e.to_string()))
}

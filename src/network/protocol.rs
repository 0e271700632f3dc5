//! Peer Wire Protocol
//!
//! Defines the frames exchanged over a peer channel. Both ends send
//! requests and responses over the same stream.

use serde::{Deserialize, Serialize};

use crate::cluster::PeerIdentity;
use crate::replication::Operation;

/// Request correlation id, unique per channel direction
pub type RequestId = u64;

/// One frame on a peer channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Invoke a method on the remote node
    Request { id: RequestId, call: Call },
    /// Result of an earlier request
    Response { id: RequestId, reply: Reply },
}

/// Methods every node exposes to its peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Call {
    Quorum { op: Operation, peer: PeerIdentity },
    Commit { op: Operation, peer: PeerIdentity },
    Ready { peer: PeerIdentity },
    SyncPeer { peer: PeerIdentity },
}

/// Outcome of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ack,
    /// The callee's own readiness
    Ready(bool),
    /// Handler failure, rendered as text
    Error(String),
}

impl Frame {
    /// Serialize frame to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Size of the serialized frame body, without encoding it
    pub fn encoded_len(&self) -> Result<u64, bincode::Error> {
        bincode::serialized_size(self)
    }

    /// Deserialize frame from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the frame type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Request { call, .. } => call.type_name(),
            Frame::Response { .. } => "Response",
        }
    }
}

impl Call {
    /// Get the call name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Call::Quorum { .. } => "Quorum",
            Call::Commit { .. } => "Commit",
            Call::Ready { .. } => "Ready",
            Call::SyncPeer { .. } => "SyncPeer",
        }
    }
}

/// Frame header for length-prefixed frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let frame = Frame::Request {
            id: 7,
            call: Call::Commit {
                op: Operation::put("k", "v"),
                peer: PeerIdentity::new("localhost", 3001),
            },
        };

        let bytes = frame.serialize().unwrap();
        match Frame::deserialize(&bytes).unwrap() {
            Frame::Request { id, call: Call::Commit { op, peer } } => {
                assert_eq!(id, 7);
                assert_eq!(op, Operation::put("k", "v"));
                assert_eq!(peer.port, 3001);
            }
            other => panic!("Wrong frame type: {:?}", other),
        }
        assert_eq!(frame.type_name(), "Commit");
    }

    #[test]
    fn test_frame_header() {
        let data = b"test frame data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header, restored);
        assert_eq!(restored.length as usize, data.len());
    }
}

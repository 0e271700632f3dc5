//! Network Module
//!
//! Framed TCP channels between nodes.

pub mod protocol;
mod channel;
mod client;
mod server;

pub use channel::PeerChannel;
pub use client::connect;
pub use protocol::{Call, Frame, FrameHeader, Reply};
pub use server::NetworkServer;

use crate::error::{Error, Result};

/// Largest frame body accepted from a peer
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a framed message from a reader
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Frame checksum mismatch".into()));
    }

    Ok(Frame::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = frame.serialize()?;
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_io() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::Response {
            id: 3,
            reply: Reply::Ready(true),
        };

        write_frame(&mut a, &frame).await.unwrap();
        match read_frame(&mut b).await.unwrap() {
            Frame::Response { id, reply } => {
                assert_eq!(id, 3);
                assert_eq!(reply, Reply::Ready(true));
            }
            other => panic!("Wrong frame type: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = Frame::Response { id: 1, reply: Reply::Ack }.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 1;
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_frame(&mut b).await, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let header = FrameHeader {
            length: MAX_FRAME_SIZE + 1,
            checksum: 0,
        };
        a.write_all(&header.to_bytes()).await.unwrap();

        assert!(matches!(read_frame(&mut b).await, Err(Error::Network(_))));
    }
}

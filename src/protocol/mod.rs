//! Wire protocol for broker tunnels
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+----------------+
//! |    Length (2B, BE)      |  Type  | Payload |
//! +--------+--------+--------+----------------+
//! ```
//!
//! Frame types:
//! - 0: data payload (IP packet)
//! - 1: hello handshake message
//!
//! Unknown types must be skipped by the receiver, never answered with a
//! disconnect: the length prefix tells it how much to consume.

mod hello;

pub use hello::{
    AccessInfo, DnsInfo, Extension, ExtensionProducer, ExtensionSet, Hello, EXT_ACCESS_INFO,
    EXT_DNS_INFO, HELLO_HEADER_SIZE, HELLO_VERSION,
};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_FRAME_SIZE;

/// Data payload frame (an IP packet)
pub const PACKET_TYPE_DATA: u8 = 0;
/// Hello handshake frame
pub const PACKET_TYPE_HELLO: u8 = 1;

/// Length prefix plus type byte
pub const FRAME_HEADER_SIZE: usize = 3;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too large ({0})")]
    FrameTooLarge(usize),

    #[error("buffer too small ({buffer}): packet size is {packet}")]
    BufferTooSmall { buffer: usize, packet: usize },

    #[error("stream ended inside a frame ({length} bytes declared)")]
    TruncatedFrame { length: usize },

    #[error("hello packet too short ({len} expected {expected})")]
    HelloTooShort { len: usize, expected: usize },

    #[error("hello extension {id} overruns packet ({declared} declared, {remaining} remaining)")]
    ExtensionOverrun {
        id: u16,
        declared: usize,
        remaining: usize,
    },

    #[error("invalid hello field: {0}")]
    InvalidHello(&'static str),

    #[error("unexpected packet {0} instead of hello handshake")]
    UnexpectedPacket(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one frame into `buf`, returning its type and payload length.
///
/// Reads are fully buffered: short reads loop until the 3-byte prefix and
/// then the payload are complete. A declared length larger than `buf` is
/// fatal to the connection. A stream ending before the prefix surfaces as
/// plain EOF (normal closure); one ending inside the payload is a
/// truncated frame.
pub async fn read_frame<R>(reader: &mut R, buf: &mut [u8]) -> Result<(u8, usize), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut prefix).await?;

    let length = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
    let ty = prefix[2];
    if length > buf.len() {
        return Err(ProtocolError::BufferTooSmall {
            buffer: buf.len(),
            packet: length,
        });
    }
    reader.read_exact(&mut buf[..length]).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::TruncatedFrame { length }
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok((ty, length))
}

/// Write one frame: length prefix, type byte, payload.
///
/// The caller serializes writes per connection, so the frame hits the wire
/// as one unit in write order.
pub async fn write_frame<W>(writer: &mut W, ty: u8, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    // Coalesce prefix + payload into a single write
    let mut wire = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    wire.push(ty);
    wire.extend_from_slice(payload);
    writer.write_all(&wire).await?;
    Ok(())
}

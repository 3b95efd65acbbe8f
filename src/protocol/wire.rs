//! Frame format for v2 messages.
//!
//! Frames are `[2 bytes magic][2 bytes big-endian length][payload]`. The
//! magic doubles as the protocol-detection marker: a legacy RSA block is
//! indistinguishable from random bytes and never starts with it.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{BallotError, ProtocolErrorKind};

/// Magic opening every v2 frame.
pub const V2_MAGIC: u16 = 0x733A;

/// Maximum accepted frame payload. v2 messages are a few hundred bytes;
/// anything near the u16 framing limit is garbage or abuse.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8192;

/// Read the remainder of a v2 frame after the magic has been consumed.
///
/// Returns the raw payload bytes. A peer close mid-frame is reported as
/// `ConnectionClosed`.
pub async fn read_frame_body<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, BallotError>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 2];
    read_fully(reader, &mut len_buf).await?;

    let len = u16::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(BallotError::Protocol {
            kind: ProtocolErrorKind::MessageTooLarge {
                size: len,
                max: max_size,
            },
        });
    }

    let mut buf = vec![0u8; len];
    read_fully(reader, &mut buf).await?;
    Ok(buf)
}

/// Write a complete v2 frame (magic, length, payload).
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), BallotError>
where
    W: AsyncWriteExt + Unpin,
{
    debug_assert!(payload.len() <= u16::MAX as usize);

    writer.write_all(&V2_MAGIC.to_be_bytes()).await?;
    writer.write_all(&(payload.len() as u16).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), BallotError>
where
    R: AsyncReadExt + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(BallotError::Protocol {
            kind: ProtocolErrorKind::ConnectionClosed,
        }),
        Err(e) => Err(BallotError::Io(e)),
    }
}

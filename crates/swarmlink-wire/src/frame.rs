//! Length-prefixed framing.
//!
//! Every frame is a 4-byte big-endian length header followed by that many
//! bytes of JSON envelope body. Frames above the configured maximum are
//! refused on both ends.

use crate::error::{WireError, WireResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Prefix `body` with its 4-byte big-endian length.
pub fn encode_frame(body: &[u8], max: u32) -> WireResult<Vec<u8>> {
    let size = body.len() as u64;
    if size > max as u64 {
        return Err(WireError::FrameTooLarge { size, max });
    }
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(body);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max: u32) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(body, max)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame body.
///
/// A clean EOF before the header is reported as `ConnectionClosed`.
pub async fn read_frame<R>(reader: &mut R, max: u32) -> WireResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max {
        return Err(WireError::FrameTooLarge {
            size: len as u64,
            max,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

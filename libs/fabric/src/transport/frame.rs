use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use circuit_core::{Error, Result};

use crate::codec::Codec;

/// Largest frame body accepted (100MB)
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Broker wire protocol
///
/// Payloads are envelopes already serialized by the client, so the broker
/// routes them without decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Client → broker: start receiving a channel
    Subscribe { channel: String },

    /// Client → broker: fan a payload out to a channel
    Publish { channel: String, payload: String },

    /// Broker → client: a payload published to a subscribed channel
    Deliver { channel: String, payload: String },
}

/// Write a frame with a 4-byte big-endian length prefix
pub async fn write_frame<W, C>(writer: &mut W, codec: &C, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
    C: Codec,
{
    let bytes = codec.encode(frame)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::InvalidFrame(format!(
            "Message too large: {} bytes",
            bytes.len()
        )));
    }

    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
pub async fn read_frame<R, C>(reader: &mut R, codec: &C) -> Result<Frame>
where
    R: AsyncRead + Unpin,
    C: Codec,
{
    let len = reader.read_u32().await.map_err(closed_on_eof)? as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::InvalidFrame(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(closed_on_eof)?;

    codec.decode(&buf)
}

fn closed_on_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        e.into()
    }
}

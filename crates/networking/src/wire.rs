//! Wire framing: control messages and payload streams.
//!
//! Every unit on the wire starts with a one-byte discriminator. A
//! control frame carries a length-prefixed bincode [`ControlMessage`].
//! A stream frame has no length of its own; the consumer knows how
//! many bytes follow from the `size` of the preceding
//! [`ControlMessage::StoreBlob`] on the same connection.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{NetworkError, NetworkResult};

/// Frame discriminator: a control message follows.
pub const FRAME_CONTROL: u8 = 0;
/// Frame discriminator: raw payload bytes follow.
pub const FRAME_STREAM: u8 = 1;

/// Upper bound on a control frame body. Payloads travel as stream
/// frames, so control messages stay small.
pub const MAX_CONTROL_LEN: u32 = 64 * 1024;

/// Unit of payload streaming.
pub const STREAM_CHUNK_LEN: usize = 32 * 1024;

/// Control messages exchanged between peers. Encoding is bincode;
/// framing is a length prefix inside a control frame.
///
/// `StoreBlob` is always followed by a stream frame of exactly `size`
/// bytes on the same connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Announce a blob; `size` bytes of encrypted payload follow.
    StoreBlob { key: String, size: u64 },
    /// Ask every peer holding `key` to send it back.
    RequestBlob { key: String },
}

impl ControlMessage {
    pub fn key(&self) -> &str {
        match self {
            ControlMessage::StoreBlob { key, .. } => key,
            ControlMessage::RequestBlob { key } => key,
        }
    }
}

/// Write a complete control frame. Returns the number of bytes put on
/// the wire.
pub async fn write_control<W>(writer: &mut W, message: &ControlMessage) -> NetworkResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = bincode::serialize(message)?;
    let len = body.len() as u32;
    if len > MAX_CONTROL_LEN {
        return Err(NetworkError::OversizedControl {
            size: len,
            limit: MAX_CONTROL_LEN,
        });
    }

    writer.write_u8(FRAME_CONTROL).await?;
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    Ok(1 + 4 + body.len() as u64)
}

/// Read a control frame body, the discriminator already consumed.
/// Returns the message and the number of bytes read.
pub async fn read_control<R>(reader: &mut R) -> NetworkResult<(ControlMessage, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32().await?;
    if len > MAX_CONTROL_LEN {
        return Err(NetworkError::OversizedControl {
            size: len,
            limit: MAX_CONTROL_LEN,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let message = bincode::deserialize(&body)?;
    Ok((message, 4 + len as u64))
}

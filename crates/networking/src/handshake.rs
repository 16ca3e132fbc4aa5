//! Connection handshake.
//!
//! Immediately after connect, both sides send a fixed 6-byte token:
//! 4 magic bytes, the protocol version and a capability bitset. Each
//! side validates the other's token before any payload moves; a bad
//! magic, a version mismatch or a timeout drops the connection without
//! registering the peer.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

pub const PROTOCOL_MAGIC: [u8; 4] = *b"MVLT";
pub const PROTOCOL_VERSION: u8 = 1;

/// Capability bit: the node persists blobs announced to it.
pub const CAP_STORE: u8 = 0b0000_0001;
/// Capability bit: the node answers blob requests.
pub const CAP_SERVE: u8 = 0b0000_0010;

const LOCAL_CAPABILITIES: u8 = CAP_STORE | CAP_SERVE;
const TOKEN_LEN: usize = 6;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur during the handshake
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad protocol magic {actual:02x?}")]
    BadMagic { actual: [u8; 4] },

    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u8, remote: u8 },

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
}

/// The validated remote side of a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Greeting {
    pub version: u8,
    pub capabilities: u8,
}

/// Run the mutual handshake. Both sides send their token first, then
/// validate the other's; the exchange is symmetric, so dialer and
/// acceptor call the same function.
pub async fn exchange(stream: &mut TcpStream) -> Result<Greeting, HandshakeError> {
    match time::timeout(HANDSHAKE_TIMEOUT, exchange_inner(stream)).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout(HANDSHAKE_TIMEOUT)),
    }
}

async fn exchange_inner(stream: &mut TcpStream) -> Result<Greeting, HandshakeError> {
    let mut token = [0u8; TOKEN_LEN];
    token[..4].copy_from_slice(&PROTOCOL_MAGIC);
    token[4] = PROTOCOL_VERSION;
    token[5] = LOCAL_CAPABILITIES;
    stream.write_all(&token).await?;
    stream.flush().await?;

    let mut remote = [0u8; TOKEN_LEN];
    stream.read_exact(&mut remote).await?;

    if remote[..4] != PROTOCOL_MAGIC {
        let mut actual = [0u8; 4];
        actual.copy_from_slice(&remote[..4]);
        return Err(HandshakeError::BadMagic { actual });
    }
    if remote[4] != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: remote[4],
        });
    }

    Ok(Greeting {
        version: remote[4],
        capabilities: remote[5],
    })
}

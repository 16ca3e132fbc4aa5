//! Peer transport for the meshvault mesh
//!
//! This crate owns everything between two cooperating nodes' sockets:
//! - TCP listen/accept/dial with a minimal mutual handshake
//! - a framing discipline separating control messages from raw payload
//!   streams on the same connection
//! - per-connection read loops feeding a single shared inbound queue
//! - the concurrency-safe registry of connected peers
//!
//! A decode failure or disconnect degrades only the offending
//! connection; the rest of the mesh keeps running.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub mod handshake;
pub mod peer;
pub mod registry;
pub mod transport;
pub mod wire;

pub use handshake::{HandshakeError, PROTOCOL_MAGIC, PROTOCOL_VERSION};
pub use peer::{Peer, PeerState};
pub use registry::PeerRegistry;
pub use transport::{BlobBody, Inbound, TcpTransport, TransportOptions};
pub use wire::ControlMessage;

/// Errors that can occur in networking operations
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to dial {addr}: {source}")]
    Dial { addr: SocketAddr, source: io::Error },

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("failed to decode control frame: {0}")]
    Decode(#[from] bincode::Error),

    #[error("control frame of {size} bytes exceeds limit of {limit}")]
    OversizedControl { size: u32, limit: u32 },

    #[error("unknown frame discriminator {0:#04x}")]
    UnknownFrame(u8),

    #[error("stream frame arrived without a preceding announcement")]
    UnexpectedStream,

    #[error("announced payload stream did not follow its control frame")]
    MissingStream,

    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type for networking operations
pub type NetworkResult<T> = Result<T, NetworkError>;

//! A live peer connection.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use crate::wire::{self, ControlMessage, FRAME_STREAM};
use crate::{NetworkError, NetworkResult};

/// Connection lifecycle. `Handshaking` may go straight to `Closed` on
/// rejection; `Connected` peers move through `Closing` once their read
/// task winds down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    Dialing = 0,
    Handshaking = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PeerState::Dialing,
            1 => PeerState::Handshaking,
            2 => PeerState::Connected,
            3 => PeerState::Closing,
            _ => PeerState::Closed,
        }
    }
}

/// One live bidirectional connection to a remote node.
///
/// The write half sits behind a mutex held across a whole logical unit
/// (a control frame, or a control frame plus its payload stream), so
/// concurrent senders can never interleave bytes within a frame
/// sequence. The read half lives in the connection's read loop.
pub struct Peer {
    addr: SocketAddr,
    outbound: bool,
    capabilities: u8,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    state: AtomicU8,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Peer {
    pub(crate) fn new(
        addr: SocketAddr,
        outbound: bool,
        capabilities: u8,
        writer: OwnedWriteHalf,
    ) -> Self {
        Self {
            addr,
            outbound,
            capabilities,
            writer: Mutex::new(BufWriter::new(writer)),
            state: AtomicU8::new(PeerState::Handshaking as u8),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Remote address. For accepted connections this is the peer's
    /// ephemeral port, which also keys the registry.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether this side initiated the connection.
    pub fn outbound(&self) -> bool {
        self.outbound
    }

    /// Capability bits the peer advertised during the handshake.
    pub fn capabilities(&self) -> u8 {
        self.capabilities
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub(crate) fn record_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Send a bare control frame.
    pub async fn send_control(&self, message: &ControlMessage) -> NetworkResult<()> {
        let mut writer = self.writer.lock().await;
        let n = wire::write_control(&mut *writer, message).await?;
        writer.flush().await?;
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }

    /// Send a control frame immediately followed by a stream frame of
    /// exactly `size` bytes read from `body`. The writer lock is held
    /// for the whole sequence.
    pub async fn send_blob<R>(
        &self,
        message: &ControlMessage,
        body: &mut R,
        size: u64,
    ) -> NetworkResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut writer = self.writer.lock().await;
        let mut sent = wire::write_control(&mut *writer, message).await?;

        writer.write_u8(FRAME_STREAM).await?;
        sent += 1;

        let copied = tokio::io::copy(&mut body.take(size), &mut *writer).await?;
        if copied != size {
            // The announced size is already on the wire; a short body
            // leaves the stream unframeable for the receiver.
            return Err(NetworkError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("blob body ended after {copied} of {size} bytes"),
            )));
        }
        writer.flush().await?;

        sent += copied;
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        Ok(sent)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("outbound", &self.outbound)
            .field("state", &self.state())
            .finish()
    }
}

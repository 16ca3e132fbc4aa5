//! TCP transport: accept, dial and per-connection read loops.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::handshake;
use crate::peer::{Peer, PeerState};
use crate::registry::PeerRegistry;
use crate::wire::{self, ControlMessage, FRAME_CONTROL, FRAME_STREAM, STREAM_CHUNK_LEN};
use crate::{NetworkError, NetworkResult};

/// Transport options
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub listen_addr: SocketAddr,
    /// Capacity of the shared inbound queue.
    pub inbound_capacity: usize,
}

impl TransportOptions {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            inbound_capacity: 64,
        }
    }
}

/// The payload announced by a `StoreBlob` control frame, streamed out
/// of the originating connection in bounded chunks.
///
/// The read loop forwards exactly `size` bytes through this handle and
/// only then parses the next frame, so per-peer ordering holds and
/// payload bytes are never mistaken for frame headers. Dropping the
/// handle early makes the read loop drain and discard the remainder.
pub struct BlobBody {
    size: u64,
    chunks: mpsc::Receiver<io::Result<Vec<u8>>>,
}

impl BlobBody {
    /// Total payload size announced by the sender.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Receive the next payload chunk. Returns `None` once the stream
    /// is exhausted; an `Err` chunk means the originating connection
    /// failed mid-stream.
    pub async fn chunk(&mut self) -> Option<io::Result<Vec<u8>>> {
        self.chunks.recv().await
    }
}

/// A decoded control message on the shared inbound queue.
pub struct Inbound {
    pub from: SocketAddr,
    pub message: ControlMessage,
    /// Present when the message announces a trailing payload stream.
    pub body: Option<BlobBody>,
}

/// TCP transport for a single node.
///
/// Owns the accept task and one read-loop task per connection, all
/// feeding the inbound queue handed out by [`bind`](Self::bind).
/// Shutdown is signalled through a watch flag; read loops stop after
/// the frame they are currently processing.
pub struct TcpTransport {
    local_addr: SocketAddr,
    registry: Arc<PeerRegistry>,
    inbound_tx: mpsc::Sender<Inbound>,
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    /// Bind the listen address and start accepting. Failure to bind is
    /// fatal to the node. Returns the transport and the receiving end
    /// of the inbound queue.
    pub async fn bind(
        options: TransportOptions,
    ) -> NetworkResult<(Arc<Self>, mpsc::Receiver<Inbound>)> {
        let listener = TcpListener::bind(options.listen_addr)
            .await
            .map_err(|source| NetworkError::Bind {
                addr: options.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_capacity);
        let (shutdown, _) = watch::channel(false);

        let transport = Arc::new(Self {
            local_addr,
            registry: Arc::new(PeerRegistry::new()),
            inbound_tx,
            shutdown,
        });

        tokio::spawn(transport.clone().accept_loop(listener));
        info!(addr = %local_addr, "transport listening");

        Ok((transport, inbound_rx))
    }

    /// Address the listener actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Watch the shutdown flag; flips to `true` once
    /// [`shutdown`](Self::shutdown) is called.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal every task owned by this transport to stop after its
    /// current frame.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Connect to a known peer and run the handshake from the
    /// initiating side. Returns the existing handle if the address is
    /// already connected.
    pub async fn dial(self: &Arc<Self>, addr: SocketAddr) -> NetworkResult<Arc<Peer>> {
        if let Some(existing) = self.registry.get(&addr).await {
            return Ok(existing);
        }

        debug!(%addr, "dialing peer");
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| NetworkError::Dial { addr, source })?;
        self.clone().establish(stream, addr, true).await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted connection");
                        let transport = self.clone();
                        tokio::spawn(async move {
                            let _ = transport.establish(stream, addr, false).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        debug!("accept loop stopped");
    }

    /// Handshake a fresh connection and, on success, register the peer
    /// and start its read loop. Rejection closes the connection without
    /// registering anything.
    async fn establish(
        self: Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
        outbound: bool,
    ) -> NetworkResult<Arc<Peer>> {
        let greeting = match handshake::exchange(&mut stream).await {
            Ok(greeting) => greeting,
            Err(e) => {
                warn!(%addr, error = %e, "handshake rejected");
                return Err(e.into());
            }
        };
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        let peer = Arc::new(Peer::new(addr, outbound, greeting.capabilities, write_half));
        peer.set_state(PeerState::Connected);
        self.registry.add(peer.clone()).await;
        info!(%addr, outbound, "peer connected");

        tokio::spawn(
            self.clone()
                .read_loop(peer.clone(), BufReader::new(read_half)),
        );
        Ok(peer)
    }

    async fn read_loop(self: Arc<Self>, peer: Arc<Peer>, mut reader: BufReader<OwnedReadHalf>) {
        let mut shutdown = self.shutdown.subscribe();
        match self.drive_connection(&peer, &mut reader, &mut shutdown).await {
            Ok(()) => debug!(peer = %peer.addr(), "connection closed"),
            Err(e) => warn!(peer = %peer.addr(), error = %e, "dropping peer"),
        }
        peer.set_state(PeerState::Closing);
        self.registry.remove(&peer.addr()).await;
        peer.set_state(PeerState::Closed);
    }

    /// Sequentially decode frames until the connection ends, a frame is
    /// malformed, or shutdown is requested. Errors here cost only this
    /// connection.
    async fn drive_connection(
        &self,
        peer: &Arc<Peer>,
        reader: &mut BufReader<OwnedReadHalf>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> NetworkResult<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let discriminator = tokio::select! {
                _ = shutdown.changed() => continue,
                read = reader.read_u8() => match read {
                    Ok(d) => d,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(e.into()),
                },
            };

            match discriminator {
                FRAME_CONTROL => {
                    let (message, frame_len) = wire::read_control(reader).await?;
                    peer.record_received(1 + frame_len);
                    self.route(peer, reader, message).await?;
                }
                FRAME_STREAM => return Err(NetworkError::UnexpectedStream),
                other => return Err(NetworkError::UnknownFrame(other)),
            }
        }
    }

    async fn route(
        &self,
        peer: &Arc<Peer>,
        reader: &mut BufReader<OwnedReadHalf>,
        message: ControlMessage,
    ) -> NetworkResult<()> {
        let from = peer.addr();
        match message {
            ControlMessage::StoreBlob { ref key, size } => {
                // The announced payload must follow as a stream frame.
                let discriminator = reader.read_u8().await?;
                if discriminator != FRAME_STREAM {
                    return Err(NetworkError::MissingStream);
                }
                peer.record_received(1);

                let (chunk_tx, chunk_rx) = mpsc::channel(8);
                let delivered = self
                    .inbound_tx
                    .send(Inbound {
                        from,
                        message: message.clone(),
                        body: Some(BlobBody {
                            size,
                            chunks: chunk_rx,
                        }),
                    })
                    .await
                    .is_ok();
                if !delivered {
                    debug!(%key, %from, "inbound queue closed; discarding payload");
                }
                self.forward_payload(peer, reader, size, delivered.then_some(chunk_tx))
                    .await?;
            }
            ControlMessage::RequestBlob { .. } => {
                if self
                    .inbound_tx
                    .send(Inbound {
                        from,
                        message,
                        body: None,
                    })
                    .await
                    .is_err()
                {
                    debug!(%from, "inbound queue closed; dropping message");
                }
            }
        }
        Ok(())
    }

    /// Copy exactly `size` payload bytes from the connection into the
    /// consumer's channel. With no consumer the bytes are still read
    /// and discarded so the frame boundary stays intact.
    async fn forward_payload(
        &self,
        peer: &Arc<Peer>,
        reader: &mut BufReader<OwnedReadHalf>,
        size: u64,
        mut sink: Option<mpsc::Sender<io::Result<Vec<u8>>>>,
    ) -> NetworkResult<()> {
        let mut remaining = size;
        while remaining > 0 {
            let len = remaining.min(STREAM_CHUNK_LEN as u64) as usize;
            let mut chunk = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut chunk).await {
                if let Some(tx) = sink.take() {
                    let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string()))).await;
                }
                return Err(e.into());
            }
            peer.record_received(len as u64);
            remaining -= len as u64;

            if let Some(tx) = &sink {
                if tx.send(Ok(chunk)).await.is_err() {
                    sink = None;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{PROTOCOL_MAGIC, PROTOCOL_VERSION};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time;

    async fn start_node() -> (Arc<TcpTransport>, mpsc::Receiver<Inbound>) {
        TcpTransport::bind(TransportOptions::new("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap()
    }

    async fn wait_for_peers(transport: &Arc<TcpTransport>, expected: usize) {
        for _ in 0..200 {
            if transport.registry().len().await == expected {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "registry never reached {expected} peers, has {}",
            transport.registry().len().await
        );
    }

    #[tokio::test]
    async fn dial_registers_the_peer_on_both_sides() {
        let (a, _a_inbound) = start_node().await;
        let (b, _b_inbound) = start_node().await;

        let peer = a.dial(b.local_addr()).await.unwrap();
        assert_eq!(peer.state(), PeerState::Connected);
        assert!(peer.outbound());
        assert_eq!(a.registry().len().await, 1);

        wait_for_peers(&b, 1).await;
    }

    #[tokio::test]
    async fn control_messages_reach_the_consumer() {
        let (a, _a_inbound) = start_node().await;
        let (b, mut b_inbound) = start_node().await;

        let peer = a.dial(b.local_addr()).await.unwrap();
        let request = ControlMessage::RequestBlob {
            key: "wanted".to_string(),
        };
        peer.send_control(&request).await.unwrap();

        let inbound = time::timeout(Duration::from_secs(2), b_inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.message, request);
        assert!(inbound.body.is_none());
    }

    #[tokio::test]
    async fn blob_payload_streams_through_the_queue() {
        let (a, _a_inbound) = start_node().await;
        let (b, mut b_inbound) = start_node().await;

        let peer = a.dial(b.local_addr()).await.unwrap();
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
        let announce = ControlMessage::StoreBlob {
            key: "big".to_string(),
            size: payload.len() as u64,
        };
        peer.send_blob(&announce, &mut payload.as_slice(), payload.len() as u64)
            .await
            .unwrap();

        let inbound = time::timeout(Duration::from_secs(2), b_inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.message, announce);

        let mut body = inbound.body.unwrap();
        assert_eq!(body.size(), payload.len() as u64);
        let mut received = Vec::new();
        while let Some(chunk) = body.chunk().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn messages_from_one_peer_stay_ordered() {
        let (a, _a_inbound) = start_node().await;
        let (b, mut b_inbound) = start_node().await;

        let peer = a.dial(b.local_addr()).await.unwrap();
        for i in 0..10 {
            peer.send_control(&ControlMessage::RequestBlob {
                key: format!("key-{i}"),
            })
            .await
            .unwrap();
        }

        for i in 0..10 {
            let inbound = time::timeout(Duration::from_secs(2), b_inbound.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(inbound.message.key(), format!("key-{i}"));
        }
    }

    #[tokio::test]
    async fn version_mismatch_never_registers() {
        let (node, _inbound) = start_node().await;

        let mut rogue = TcpStream::connect(node.local_addr()).await.unwrap();
        let mut token = [0u8; 6];
        token[..4].copy_from_slice(&PROTOCOL_MAGIC);
        token[4] = PROTOCOL_VERSION + 9;
        rogue.write_all(&token).await.unwrap();

        // The node sends its own greeting, then closes on the mismatch.
        let mut greeting = [0u8; 6];
        rogue.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting[..4], &PROTOCOL_MAGIC);

        let closed = time::timeout(Duration::from_secs(2), rogue.read_u8())
            .await
            .unwrap();
        assert!(closed.is_err());
        assert_eq!(node.registry().len().await, 0);
    }

    #[tokio::test]
    async fn garbage_frame_drops_only_that_connection() {
        let (node, mut inbound) = start_node().await;

        // A well-behaved peer.
        let (good, _good_inbound) = start_node().await;
        let good_peer = good.dial(node.local_addr()).await.unwrap();

        // A peer that handshakes fine, then talks nonsense.
        let mut rogue = TcpStream::connect(node.local_addr()).await.unwrap();
        let mut token = [0u8; 6];
        token[..4].copy_from_slice(&PROTOCOL_MAGIC);
        token[4] = PROTOCOL_VERSION;
        rogue.write_all(&token).await.unwrap();
        let mut greeting = [0u8; 6];
        rogue.read_exact(&mut greeting).await.unwrap();
        wait_for_peers(&node, 2).await;

        rogue.write_u8(0xFF).await.unwrap();
        rogue.flush().await.unwrap();
        wait_for_peers(&node, 1).await;

        // The surviving connection still works.
        good_peer
            .send_control(&ControlMessage::RequestBlob {
                key: "still-alive".to_string(),
            })
            .await
            .unwrap();
        let message = time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.message.key(), "still-alive");
    }

    #[tokio::test]
    async fn shutdown_stops_the_read_loops() {
        let (a, _a_inbound) = start_node().await;
        let (b, _b_inbound) = start_node().await;

        let peer = a.dial(b.local_addr()).await.unwrap();
        b.shutdown();
        assert!(b.is_shutting_down());

        // b dropping its side of the socket ends a's read loop too.
        for _ in 0..200 {
            if peer.state() == PeerState::Closed {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(peer.state(), PeerState::Closed);
        assert_eq!(a.registry().len().await, 0);
    }
}

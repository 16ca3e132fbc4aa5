//! Replication orchestrator for meshvault
//!
//! The [`FileServer`] is the node's externally visible surface. A store
//! encrypts into the local blob store first, then best-effort floods
//! the encrypted bytes to every connected peer. A retrieve serves from
//! local storage when possible and otherwise asks the mesh, caching
//! whatever arrives. One dispatch task drains the inbound queue that
//! every peer connection feeds.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time;
use tracing::{debug, info, warn};

use meshvault_crypto::{decrypt_stream, encrypt_stream, CryptoError, Secret};
use meshvault_networking::{
    BlobBody, ControlMessage, Inbound, NetworkError, TcpTransport, TransportOptions,
};
use meshvault_storage::{BlobStore, StorageError, StoreOptions};

mod locks;

use locks::KeyLocks;

/// Errors surfaced by the file server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("replicated blob for {key} truncated: expected {expected} bytes, received {received}")]
    TruncatedBlob {
        key: String,
        expected: u64,
        received: u64,
    },

    #[error("server is shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Whether the error means the key simply does not exist, locally
    /// or anywhere on the mesh within the fetch bound.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ServerError::NotFound { .. } | ServerError::Storage(StorageError::NotFound { .. })
        )
    }
}

/// Result type for file server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// File server options
#[derive(Debug, Clone)]
pub struct FileServerOptions {
    pub listen_addr: SocketAddr,
    pub storage_root: PathBuf,
    /// Peers dialed at startup; failures are logged, not fatal.
    pub bootstrap_peers: Vec<SocketAddr>,
    /// How long a retrieve waits for the first peer to answer.
    pub fetch_timeout: Duration,
}

impl Default for FileServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4000".parse().expect("static default address"),
            storage_root: PathBuf::from("meshvault_data"),
            bootstrap_peers: Vec::new(),
            fetch_timeout: Duration::from_secs(4),
        }
    }
}

/// One storage node: local encrypted blob store plus mesh replication.
pub struct FileServer {
    store: BlobStore,
    secret: Secret,
    transport: Arc<TcpTransport>,
    key_locks: KeyLocks,
    fetch_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
    fetch_timeout: Duration,
}

impl FileServer {
    /// Bind the transport, dial bootstrap peers and start the dispatch
    /// task. Binding failure is fatal.
    pub async fn start(options: FileServerOptions, secret: Secret) -> ServerResult<Arc<Self>> {
        let store = BlobStore::new(StoreOptions {
            root: options.storage_root.clone(),
        });
        let (transport, inbound) =
            TcpTransport::bind(TransportOptions::new(options.listen_addr)).await?;

        let server = Arc::new(Self {
            store,
            secret,
            transport: transport.clone(),
            key_locks: KeyLocks::new(),
            fetch_waiters: Mutex::new(HashMap::new()),
            fetch_timeout: options.fetch_timeout,
        });

        for addr in &options.bootstrap_peers {
            match transport.dial(*addr).await {
                Ok(_) => info!(peer = %addr, "joined bootstrap peer"),
                Err(e) => warn!(peer = %addr, error = %e, "failed to reach bootstrap peer"),
            }
        }

        tokio::spawn(server.clone().dispatch(inbound));
        info!(addr = %transport.local_addr(), "file server started");
        Ok(server)
    }

    /// Address the node is reachable on.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Dial an additional peer after startup.
    pub async fn connect(&self, addr: SocketAddr) -> ServerResult<()> {
        self.transport.dial(addr).await?;
        Ok(())
    }

    pub async fn peer_count(&self) -> usize {
        self.transport.registry().len().await
    }

    /// Whether the key is present in local storage.
    pub async fn has(&self, key: &str) -> ServerResult<bool> {
        Ok(self.store.has(key).await?)
    }

    /// Remove the key from local storage only; replicas elsewhere are
    /// untouched.
    pub async fn delete(&self, key: &str) -> ServerResult<()> {
        Ok(self.store.delete(key).await?)
    }

    /// Encrypt and persist `data` under `key`, then flood the encrypted
    /// bytes to every connected peer. Local durability decides the
    /// outcome; per-peer replication failures are logged and skipped.
    /// Returns the stored (encrypted) size.
    pub async fn store<R>(&self, key: &str, data: &mut R) -> ServerResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.transport.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }

        let stored = {
            let _guard = self.key_locks.acquire(key).await;
            let mut pending = self.store.create(key).await?;
            let stored = encrypt_stream(&self.secret, data, &mut pending).await?;
            pending.commit().await?;
            stored
        };
        debug!(key, bytes = stored, "stored blob locally");

        self.replicate(key, stored).await;
        Ok(stored)
    }

    /// Stream the plaintext for `key` into `dst`. Local-first; a miss
    /// triggers a mesh-wide request bounded by the fetch timeout, and
    /// whatever arrives stays cached locally for the next call.
    /// Returns the plaintext size.
    pub async fn retrieve<W>(&self, key: &str, dst: &mut W) -> ServerResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.transport.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }

        if !self.store.has(key).await? {
            self.fetch_from_mesh(key).await?;
        }

        let (_, mut blob) = self.store.read(key).await?;
        let written = decrypt_stream(&self.secret, &mut blob, dst).await?;
        Ok(written)
    }

    /// Signal shutdown. Peer read loops stop after their current frame;
    /// in-flight calls fail fast or run out their bounded waits.
    pub fn shutdown(&self) {
        info!("file server shutting down");
        self.transport.shutdown();
    }

    /// Broadcast a `RequestBlob` and wait for the first peer to push
    /// the blob back. Times out into `NotFound`.
    async fn fetch_from_mesh(&self, key: &str) -> ServerResult<()> {
        let peers = self.transport.registry().all().await;
        if peers.is_empty() {
            return Err(ServerError::NotFound {
                key: key.to_string(),
            });
        }

        debug!(key, "blob missing locally, querying the mesh");
        let arrival = self.subscribe_arrival(key).await;
        // A replica may have landed between the miss and the
        // subscription; without this recheck that arrival is missed.
        if self.store.has(key).await? {
            return Ok(());
        }
        let request = ControlMessage::RequestBlob {
            key: key.to_string(),
        };
        for peer in peers {
            if let Err(e) = peer.send_control(&request).await {
                warn!(key, peer = %peer.addr(), error = %e, "blob request failed");
            }
        }

        match time::timeout(self.fetch_timeout, arrival).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                debug!(key, "no peer supplied the blob in time");
                Err(ServerError::NotFound {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Send the encrypted blob to every connected peer. Best effort.
    async fn replicate(&self, key: &str, size: u64) {
        let peers = self.transport.registry().all().await;
        if peers.is_empty() {
            return;
        }

        let announce = ControlMessage::StoreBlob {
            key: key.to_string(),
            size,
        };
        for peer in peers {
            // Each peer gets its own read of the committed blob.
            let mut blob = match self.store.read(key).await {
                Ok((_, blob)) => blob,
                Err(e) => {
                    warn!(key, error = %e, "cannot reopen blob for replication");
                    return;
                }
            };
            match peer.send_blob(&announce, &mut blob, size).await {
                Ok(_) => debug!(key, peer = %peer.addr(), bytes = size, "replicated blob"),
                Err(e) => warn!(key, peer = %peer.addr(), error = %e, "replication failed"),
            }
        }
    }

    /// Single consumer of the inbound queue fed by all peer read loops.
    async fn dispatch(self: Arc<Self>, mut inbound: mpsc::Receiver<Inbound>) {
        let mut shutdown = self.transport.subscribe_shutdown();
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                event = inbound.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event.message {
                ControlMessage::StoreBlob { ref key, size } => {
                    let Some(body) = event.body else {
                        warn!(%key, from = %event.from, "store announcement without payload");
                        continue;
                    };
                    if let Err(e) = self.accept_blob(key, size, body).await {
                        warn!(%key, from = %event.from, error = %e, "failed to accept replicated blob");
                    }
                }
                ControlMessage::RequestBlob { ref key } => {
                    if let Err(e) = self.serve_blob(key, event.from).await {
                        warn!(%key, to = %event.from, error = %e, "failed to serve blob");
                    }
                }
            }
        }
        debug!("dispatch loop stopped");
    }

    /// Persist a peer-announced blob. The bytes are already encrypted
    /// and go into the store as-is; a short stream aborts the write
    /// without publishing anything.
    async fn accept_blob(&self, key: &str, size: u64, mut body: BlobBody) -> ServerResult<()> {
        let _guard = self.key_locks.acquire(key).await;
        let mut pending = self.store.create(key).await?;

        let mut received = 0u64;
        while let Some(chunk) = body.chunk().await {
            let chunk = chunk.map_err(NetworkError::Io)?;
            pending
                .write_all(&chunk)
                .await
                .map_err(StorageError::from)?;
            received += chunk.len() as u64;
        }
        if received != size {
            return Err(ServerError::TruncatedBlob {
                key: key.to_string(),
                expected: size,
                received,
            });
        }

        pending.commit().await?;
        debug!(key, bytes = size, "accepted replicated blob");
        self.complete_arrival(key).await;
        Ok(())
    }

    /// Answer a peer's request with the blob, if we hold it.
    async fn serve_blob(&self, key: &str, from: SocketAddr) -> ServerResult<()> {
        if !self.store.has(key).await? {
            debug!(key, peer = %from, "requested blob not held locally");
            return Ok(());
        }
        let Some(peer) = self.transport.registry().get(&from).await else {
            // Peer vanished between request and reply.
            return Ok(());
        };

        let (size, mut blob) = self.store.read(key).await?;
        let announce = ControlMessage::StoreBlob {
            key: key.to_string(),
            size,
        };
        peer.send_blob(&announce, &mut blob, size).await?;
        debug!(key, peer = %from, bytes = size, "served blob to peer");
        Ok(())
    }

    async fn subscribe_arrival(&self, key: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.fetch_waiters.lock().await;
        waiters.entry(key.to_string()).or_default().push(tx);
        rx
    }

    async fn complete_arrival(&self, key: &str) {
        let mut waiters = self.fetch_waiters.lock().await;
        if let Some(pending) = waiters.remove(key) {
            for waiter in pending {
                let _ = waiter.send(());
            }
        }
    }
}

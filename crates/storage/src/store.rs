//! Filesystem-backed blob store.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::path::KeyPath;
use crate::{StorageError, StorageResult};

// Distinguishes temp files of concurrent writers within one process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Blob store options
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Root directory all blobs live under.
    pub root: PathBuf,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("meshvault_data"),
        }
    }
}

/// Durable, deduplicated blob storage under a sharded directory layout.
///
/// Writes go through a temp file and an atomic rename, so a reader never
/// observes a partially written blob. Writing a key twice overwrites;
/// the last completed write wins. Concurrent writers to the *same* key
/// are not serialized here; that is the caller's responsibility.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(options: StoreOptions) -> Self {
        Self { root: options.root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(KeyPath::for_key(key).relative())
    }

    /// Whether a blob exists for `key`. Filesystem faults are reported,
    /// not swallowed.
    pub async fn has(&self, key: &str) -> StorageResult<bool> {
        match fs::metadata(self.blob_path(key)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a pending write for `key`, creating shard directories as
    /// needed. The blob becomes visible only when the returned
    /// [`PendingBlob`] is committed.
    pub async fn create(&self, key: &str) -> StorageResult<PendingBlob> {
        let key_path = KeyPath::for_key(key);
        let dir = self.root.join(&key_path.directory);
        fs::create_dir_all(&dir).await?;

        let tmp_name = format!(
            ".{}.{}-{}.tmp",
            key_path.filename,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
        );
        let tmp_path = dir.join(tmp_name);
        let file = fs::File::create(&tmp_path).await?;

        Ok(PendingBlob {
            file,
            tmp_path,
            final_path: dir.join(&key_path.filename),
            committed: false,
        })
    }

    /// Stream `reader` to completion into the blob for `key` and publish
    /// it atomically. Returns the number of bytes written.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> StorageResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut pending = self.create(key).await?;
        let written = tokio::io::copy(reader, &mut pending).await?;
        pending.commit().await?;
        debug!(key, bytes = written, "wrote blob");
        Ok(written)
    }

    /// Open the blob for `key`, returning its size and a stream
    /// positioned at the start of the stored bytes.
    pub async fn read(&self, key: &str) -> StorageResult<(u64, fs::File)> {
        match fs::File::open(self.blob_path(key)).await {
            Ok(file) => {
                let size = file.metadata().await?.len();
                Ok((size, file))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the blob for `key`. Empty shard directories are left in
    /// place.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.blob_path(key)).await {
            Ok(()) => {
                debug!(key, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the entire storage root. Teardown only.
    pub async fn clear(&self) -> StorageResult<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// An in-progress blob write.
///
/// Bytes are accumulated in a uniquely named temp file beside the final
/// path. [`commit`](Self::commit) flushes and renames it into place;
/// dropping without committing removes the temp file.
pub struct PendingBlob {
    file: fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl PendingBlob {
    /// Flush, sync and atomically publish the blob at its final path.
    pub async fn commit(mut self) -> StorageResult<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        fs::rename(&self.tmp_path, &self.final_path).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PendingBlob {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

impl AsyncWrite for PendingBlob {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    fn store_in(dir: &tempfile::TempDir) -> BlobStore {
        BlobStore::new(StoreOptions {
            root: dir.path().join("blobs"),
        })
    }

    async fn read_all(store: &BlobStore, key: &str) -> Vec<u8> {
        let (size, mut file) = store.read(key).await.unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).await.unwrap();
        assert_eq!(size as usize, data.len());
        data
    }

    fn count_files(root: &Path) -> usize {
        let mut stack = vec![root.to_path_buf()];
        let mut count = 0;
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let entry = entry.unwrap();
                if entry.file_type().unwrap().is_dir() {
                    stack.push(entry.path());
                } else {
                    count += 1;
                }
            }
        }
        count
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        let data = b"hello blob".to_vec();
        let written = store.write("greeting", &mut data.as_slice()).await.unwrap();

        assert_eq!(written as usize, data.len());
        assert!(store.has("greeting").await.unwrap());
        assert_eq!(read_all(&store, "greeting").await, data);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        assert!(!store.has("nope").await.unwrap());
        assert!(matches!(
            store.read("nope").await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete("nope").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn overwrite_supersedes_without_duplicating() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        store.write("k", &mut b"first".as_slice()).await.unwrap();
        store.write("k", &mut b"second".as_slice()).await.unwrap();

        assert_eq!(read_all(&store, "k").await, b"second");
        assert_eq!(count_files(store.root()), 1);
    }

    #[tokio::test]
    async fn delete_removes_the_blob() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        store.write("k", &mut b"data".as_slice()).await.unwrap();
        store.delete("k").await.unwrap();

        assert!(!store.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn clear_removes_the_root() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        store.write("a", &mut b"1".as_slice()).await.unwrap();
        store.write("b", &mut b"2".as_slice()).await.unwrap();
        store.clear().await.unwrap();

        assert!(!store.root().exists());
        // Clearing an absent root is fine.
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_pending_blob_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        let mut pending = store.create("k").await.unwrap();
        pending.write_all(b"partial").await.unwrap();
        drop(pending);

        assert!(!store.has("k").await.unwrap());
        assert_eq!(count_files(store.root()), 0);
    }

    #[tokio::test]
    async fn racing_writers_leave_one_complete_blob() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(store_in(&dir));

        let inputs: Vec<Vec<u8>> = (0u8..8).map(|i| vec![i; 4096]).collect();
        let mut tasks = Vec::new();
        for input in inputs.clone() {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.write("contested", &mut input.as_slice()).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let survivor = read_all(&store, "contested").await;
        assert_eq!(survivor.len(), 4096);
        assert!(inputs.contains(&survivor));
        assert_eq!(count_files(store.root()), 1);
    }
}

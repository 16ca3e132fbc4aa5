//! Content-addressable storage for meshvault
//!
//! This crate persists opaque byte blobs under content-derived paths:
//! - deterministic digest-based path sharding
//! - atomic publish via temp file + rename
//! - streaming reads and writes
//!
//! Blobs are stored exactly as handed over; encryption happens above
//! this layer. A file's presence at its derived path is the sole
//! existence signal; there is no index or manifest.

use std::io;
use thiserror::Error;

pub mod path;
pub mod store;

pub use path::{KeyPath, SHARD_SEGMENT_LEN};
pub use store::{BlobStore, PendingBlob, StoreOptions};

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

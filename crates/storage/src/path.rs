//! Digest-derived blob paths.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

/// Number of hex characters per shard directory segment.
pub const SHARD_SEGMENT_LEN: usize = 5;

/// The on-disk location of a blob, derived purely from its logical key.
///
/// The key is hashed with SHA-1; the 40-character hex digest is split
/// into nested directory segments of [`SHARD_SEGMENT_LEN`] characters,
/// and the full digest serves as the filename. Identical keys map to
/// identical paths on every node; there is no per-node salt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    /// Sharded directory part, relative to the store root.
    pub directory: PathBuf,
    /// Full hex digest, used as the filename.
    pub filename: String,
}

impl KeyPath {
    pub fn for_key(key: &str) -> Self {
        let digest = Sha1::digest(key.as_bytes());
        let digest_hex = hex::encode(digest);

        let mut directory = PathBuf::new();
        for segment in 0..digest_hex.len() / SHARD_SEGMENT_LEN {
            let from = segment * SHARD_SEGMENT_LEN;
            directory.push(&digest_hex[from..from + SHARD_SEGMENT_LEN]);
        }

        Self {
            directory,
            filename: digest_hex,
        }
    }

    /// Full blob path relative to the store root.
    pub fn relative(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_deterministic() {
        let a = KeyPath::for_key("hello.txt");
        let b = KeyPath::for_key("hello.txt");
        assert_eq!(a, b);

        let c = KeyPath::for_key("other.txt");
        assert_ne!(a, c);
    }

    #[test]
    fn path_shards_the_digest() {
        // sha1("hello.txt")
        let digest = "3857b672471862eab426eba0622e44bd2cedbd5d";
        let path = KeyPath::for_key("hello.txt");

        assert_eq!(path.filename, digest);
        assert_eq!(
            path.directory,
            PathBuf::from("3857b/67247/1862e/ab426/eba06/22e44/bd2ce/dbd5d")
        );
        assert_eq!(path.relative(), path.directory.join(digest));
    }

    #[test]
    fn segments_have_fixed_length() {
        let path = KeyPath::for_key("anything");
        for component in path.directory.components() {
            assert_eq!(component.as_os_str().len(), SHARD_SEGMENT_LEN);
        }
    }
}

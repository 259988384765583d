//! Content-addressed blob store on the local filesystem.
//!
//! Blobs live at `<root>/sha256/<aa>/<bb>/<hash>`. Every write lands in
//! `<root>/tmp/` first and is renamed into place, so a blob is either fully
//! present or absent.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use gleaner_shared::{ContentHash, GleanerError, Result};
use tokio::fs;
use uuid::Uuid;

/// Handle to a content store rooted at a directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) a content store at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [root.join("sha256"), root.join("tmp")] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| GleanerError::ContentStore(format!("{}: {e}", dir.display())))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `bytes`, returning their hash and whether they were newly written.
    ///
    /// Idempotent: storing the same bytes twice leaves exactly one blob.
    pub async fn put(&self, bytes: &[u8]) -> Result<(ContentHash, bool)> {
        let owned = bytes.to_vec();
        let (hash, owned) = tokio::task::spawn_blocking(move || {
            let hash = ContentHash::compute(&owned);
            (hash, owned)
        })
        .await
        .map_err(|e| GleanerError::ContentStore(format!("hashing task failed: {e}")))?;

        let path = self.blob_path(&hash);
        if fs::try_exists(&path).await.map_err(|e| store_err(&path, e))? {
            return Ok((hash, false));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| store_err(parent, e))?;
        }

        let tmp = self.root.join("tmp").join(Uuid::now_v7().to_string());
        fs::write(&tmp, &owned)
            .await
            .map_err(|e| store_err(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(store_err(&path, e));
        }

        tracing::debug!(hash = %hash, len = owned.len(), "stored blob");
        Ok((hash, true))
    }

    /// Read a blob, re-verifying its hash.
    pub async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let path = self.blob_path(hash);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(GleanerError::not_found("blob", hash.as_str()));
            }
            Err(e) => return Err(store_err(&path, e)),
        };

        let (actual, bytes) = tokio::task::spawn_blocking(move || {
            let actual = ContentHash::compute(&bytes);
            (actual, bytes)
        })
        .await
        .map_err(|e| GleanerError::ContentStore(format!("hashing task failed: {e}")))?;

        if &actual != hash {
            return Err(GleanerError::ContentStore(format!(
                "blob {hash} is corrupt (hashes to {actual})"
            )));
        }
        Ok(bytes)
    }

    pub async fn exists(&self, hash: &ContentHash) -> Result<bool> {
        let path = self.blob_path(hash);
        fs::try_exists(&path)
            .await
            .map_err(|e| store_err(&path, e))
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let h = hash.as_str();
        self.root
            .join("sha256")
            .join(&h[0..2])
            .join(&h[2..4])
            .join(h)
    }
}

fn store_err(path: &Path, e: std::io::Error) -> GleanerError {
    GleanerError::ContentStore(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> ContentStore {
        let root = std::env::temp_dir().join(format!("gleaner_blobs_{}", Uuid::now_v7()));
        ContentStore::open(root).await.expect("open store")
    }

    fn count_blobs(dir: &Path) -> usize {
        let mut n = 0;
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                n += count_blobs(&path);
            } else {
                n += 1;
            }
        }
        n
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let store = test_store().await;

        let (h1, new1) = store.put(b"<html>hello</html>").await.unwrap();
        let (h2, new2) = store.put(b"<html>hello</html>").await.unwrap();

        assert_eq!(h1, h2);
        assert!(new1);
        assert!(!new2);
        assert_eq!(count_blobs(&store.root().join("sha256")), 1);
        assert_eq!(count_blobs(&store.root().join("tmp")), 0);
    }

    #[tokio::test]
    async fn layout_is_sharded_by_prefix() {
        let store = test_store().await;
        let (hash, _) = store.put(b"hello world").await.unwrap();
        let h = hash.as_str();
        let expected = store
            .root()
            .join("sha256")
            .join(&h[..2])
            .join(&h[2..4])
            .join(h);
        assert!(expected.is_file());
        assert!(store.exists(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn get_roundtrip_and_missing() {
        let store = test_store().await;
        let (hash, _) = store.put(b"payload").await.unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), b"payload");

        let missing = ContentHash::compute(b"never stored");
        assert!(!store.exists(&missing).await.unwrap());
        let err = store.get(&missing).await.unwrap_err();
        assert!(matches!(err, GleanerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn get_detects_corruption() {
        let store = test_store().await;
        let (hash, _) = store.put(b"original").await.unwrap();
        std::fs::write(store.blob_path(&hash), b"tampered").unwrap();

        let err = store.get(&hash).await.unwrap_err();
        assert!(matches!(err, GleanerError::ContentStore(_)));
        assert!(err.is_fatal());
    }
}

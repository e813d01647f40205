//! Content-addressed blob storage on disk
//!
//! Uploaded bytes land in a pending area keyed by blob id and only move to
//! the certified area, together with a metadata sidecar, once the owner
//! certifies them. Readers only ever see certified blobs.
//!
//! ```text
//! <root>/pending/<id[0..2]>/<id>
//! <root>/certified/<id[0..2]>/<id>
//! <root>/certified/<id[0..2]>/<id>.meta.json
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use super::BlobId;
use crate::clock::UnixSecs;
use crate::error::{PressError, Result};
use crate::identity::Address;

const META_EXTENSION: &str = "meta.json";

/// Result of storing pending bytes
#[derive(Debug, Clone)]
pub struct StoreResult {
    pub blob_id: BlobId,
    pub size_bytes: u64,
    /// Same bytes were already pending or certified
    pub already_existed: bool,
}

/// Sidecar written when a blob is certified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub blob_id: BlobId,
    pub owner: Address,
    pub size_bytes: u64,
    /// Storage is paid through this epoch (inclusive)
    pub end_epoch: u64,
    pub deletable: bool,
    pub certified_at: UnixSecs,
}

/// Blob storage manager
pub struct BlobStore {
    root_dir: PathBuf,
}

impl BlobStore {
    /// Create a new blob store at the given directory
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();

        fs::create_dir_all(root_dir.join("pending")).await?;
        fs::create_dir_all(root_dir.join("certified")).await?;

        info!(path = %root_dir.display(), "Initialized blob store");

        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// `sha256-<hex>` digest, used for per-entry hashes
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("sha256-{}", hex::encode(hasher.finalize()))
    }

    fn shard(blob_id: &BlobId) -> &str {
        let id = blob_id.as_str();
        &id[..2.min(id.len())]
    }

    fn pending_path(&self, blob_id: &BlobId) -> PathBuf {
        self.root_dir
            .join("pending")
            .join(Self::shard(blob_id))
            .join(blob_id.as_str())
    }

    fn certified_path(&self, blob_id: &BlobId) -> PathBuf {
        self.root_dir
            .join("certified")
            .join(Self::shard(blob_id))
            .join(blob_id.as_str())
    }

    fn metadata_path(&self, blob_id: &BlobId) -> PathBuf {
        self.certified_path(blob_id).with_extension(META_EXTENSION)
    }

    /// Store uploaded bytes as pending. Idempotent for identical bytes.
    pub async fn put_pending(&self, blob_id: &BlobId, data: &[u8]) -> Result<StoreResult> {
        let computed = BlobId::for_bytes(data);
        if &computed != blob_id {
            return Err(PressError::HashMismatch {
                expected: blob_id.to_string(),
                actual: computed.to_string(),
            });
        }

        let pending = self.pending_path(blob_id);
        if fs::metadata(&pending).await.is_ok() || self.exists(blob_id).await {
            debug!(blob_id = %blob_id, "Blob already stored");
            return Ok(StoreResult {
                blob_id: blob_id.clone(),
                size_bytes: data.len() as u64,
                already_existed: true,
            });
        }

        if let Some(parent) = pending.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&pending, data).await?;

        debug!(blob_id = %blob_id, size = data.len(), "Stored pending blob");

        Ok(StoreResult {
            blob_id: blob_id.clone(),
            size_bytes: data.len() as u64,
            already_existed: false,
        })
    }

    /// Promote a pending blob to certified and write its metadata
    pub async fn certify(&self, metadata: &BlobMetadata) -> Result<()> {
        let blob_id = &metadata.blob_id;
        let pending = self.pending_path(blob_id);
        let certified = self.certified_path(blob_id);

        if let Some(parent) = certified.parent() {
            fs::create_dir_all(parent).await?;
        }

        if fs::metadata(&pending).await.is_ok() {
            fs::rename(&pending, &certified).await?;
        } else if fs::metadata(&certified).await.is_err() {
            return Err(PressError::ContentNotFound {
                blob_id: blob_id.clone(),
                identifier: None,
            });
        }

        let json = serde_json::to_vec_pretty(metadata)?;
        fs::write(self.metadata_path(blob_id), json).await?;

        info!(
            blob_id = %blob_id,
            owner = %metadata.owner,
            size = metadata.size_bytes,
            end_epoch = metadata.end_epoch,
            "Certified blob"
        );
        Ok(())
    }

    /// Check if a certified blob exists
    pub async fn exists(&self, blob_id: &BlobId) -> bool {
        fs::metadata(self.certified_path(blob_id)).await.is_ok()
    }

    /// Retrieve a certified blob, verifying its content address
    pub async fn get(&self, blob_id: &BlobId) -> Result<Vec<u8>> {
        let path = self.certified_path(blob_id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PressError::ContentNotFound {
                    blob_id: blob_id.clone(),
                    identifier: None,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let computed = BlobId::for_bytes(&data);
        if &computed != blob_id {
            warn!(blob_id = %blob_id, actual = %computed, "Stored blob failed hash check");
            return Err(PressError::HashMismatch {
                expected: blob_id.to_string(),
                actual: computed.to_string(),
            });
        }

        Ok(data)
    }

    pub async fn metadata(&self, blob_id: &BlobId) -> Result<BlobMetadata> {
        match fs::read(self.metadata_path(blob_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PressError::ContentNotFound {
                blob_id: blob_id.clone(),
                identifier: None,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Metadata of every certified blob
    pub async fn list(&self) -> Result<Vec<BlobMetadata>> {
        let mut out = Vec::new();
        let certified_dir = self.root_dir.join("certified");

        let mut shards = fs::read_dir(&certified_dir).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if !path.to_string_lossy().ends_with(META_EXTENSION) {
                    continue;
                }
                let bytes = fs::read(&path).await?;
                match serde_json::from_slice::<BlobMetadata>(&bytes) {
                    Ok(meta) => out.push(meta),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable blob metadata"),
                }
            }
        }

        out.sort_by(|a, b| a.blob_id.cmp(&b.blob_id));
        Ok(out)
    }

    /// Remove a certified blob and its metadata. Ownership and the
    /// deletable flag are the backend's concern.
    pub async fn delete(&self, blob_id: &BlobId) -> Result<()> {
        match fs::remove_file(self.certified_path(blob_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PressError::ContentNotFound {
                    blob_id: blob_id.clone(),
                    identifier: None,
                })
            }
            Err(e) => return Err(e.into()),
        }
        fs::remove_file(self.metadata_path(blob_id)).await?;
        info!(blob_id = %blob_id, "Deleted blob");
        Ok(())
    }

    /// Get storage statistics
    pub async fn stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats::default();

        for (area, certified) in [("certified", true), ("pending", false)] {
            let Ok(mut shards) = fs::read_dir(self.root_dir.join(area)).await else {
                continue;
            };
            while let Ok(Some(shard)) = shards.next_entry().await {
                let Ok(mut files) = fs::read_dir(shard.path()).await else {
                    continue;
                };
                while let Ok(Some(file)) = files.next_entry().await {
                    let path = file.path();
                    if path.to_string_lossy().ends_with(META_EXTENSION) {
                        continue;
                    }
                    let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
                    if certified {
                        stats.certified_blobs += 1;
                        stats.total_bytes += size;
                    } else {
                        stats.pending_blobs += 1;
                        stats.pending_bytes += size;
                    }
                }
            }
        }

        Ok(stats)
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub certified_blobs: u64,
    pub total_bytes: u64,
    /// Uploaded but never certified; orphans of abandoned uploads
    pub pending_blobs: u64,
    pub pending_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LocalSigner, Signer};
    use tempfile::TempDir;

    fn metadata(blob_id: &BlobId, size: u64) -> BlobMetadata {
        BlobMetadata {
            blob_id: blob_id.clone(),
            owner: LocalSigner::generate().address(),
            size_bytes: size,
            end_epoch: 5,
            deletable: false,
            certified_at: UnixSecs(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn test_delete_removes_blob_and_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let data = b"short-lived";
        let blob_id = BlobId::for_bytes(data);
        store.put_pending(&blob_id, data).await.unwrap();
        store.certify(&metadata(&blob_id, data.len() as u64)).await.unwrap();

        store.delete(&blob_id).await.unwrap();
        assert!(!store.exists(&blob_id).await);
        assert!(matches!(
            store.metadata(&blob_id).await,
            Err(PressError::ContentNotFound { .. })
        ));
        assert!(matches!(
            store.delete(&blob_id).await,
            Err(PressError::ContentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_pending_is_invisible_until_certified() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let data = b"sealed article";
        let blob_id = BlobId::for_bytes(data);
        let result = store.put_pending(&blob_id, data).await.unwrap();
        assert!(!result.already_existed);

        assert!(!store.exists(&blob_id).await);
        assert!(matches!(
            store.get(&blob_id).await,
            Err(PressError::ContentNotFound { identifier: None, .. })
        ));

        store.certify(&metadata(&blob_id, data.len() as u64)).await.unwrap();
        assert_eq!(store.get(&blob_id).await.unwrap(), data);
        assert_eq!(store.metadata(&blob_id).await.unwrap().end_epoch, 5);
    }

    #[tokio::test]
    async fn test_idempotent_put() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let data = b"Duplicate test";
        let blob_id = BlobId::for_bytes(data);
        let first = store.put_pending(&blob_id, data).await.unwrap();
        let second = store.put_pending(&blob_id, data).await.unwrap();

        assert!(!first.already_existed);
        assert!(second.already_existed);
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_address() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let err = store.put_pending(&BlobId::for_bytes(b"a"), b"b").await.unwrap_err();
        assert!(matches!(err, PressError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_stats_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let certified = BlobId::for_bytes(b"12345");
        store.put_pending(&certified, b"12345").await.unwrap();
        store.certify(&metadata(&certified, 5)).await.unwrap();

        let orphan = BlobId::for_bytes(b"abc");
        store.put_pending(&orphan, b"abc").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.certified_blobs, 1);
        assert_eq!(stats.total_bytes, 5);
        assert_eq!(stats.pending_blobs, 1);
        assert_eq!(stats.pending_bytes, 3);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].blob_id, certified);
    }

    #[test]
    fn test_compute_hash() {
        let hash = BlobStore::compute_hash(b"test");
        assert!(hash.starts_with("sha256-"));
        assert_eq!(hash.len(), 7 + 64);
    }
}

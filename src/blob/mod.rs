//! Blob Pipeline
//!
//! Encrypted article bodies live in content-addressed blobs. A blob is a
//! container of one or more named entries; publishers pack several articles
//! into one blob and readers pull out a single entry by identifier.
//!
//! ## Upload
//!
//! ```text
//! encode ──► register (owner signs) ──► upload (retried) ──► certify (owner signs) ──► BlobId
//!               │ rejected
//!               ▼
//!           abandoned; start again from encode
//! ```
//!
//! The blob id is only handed out once certification succeeds, so nothing
//! can reference a blob that might not be durable.
//!
//! ## Retrieval
//!
//! `fetch(blob_id)` → `locate(container, identifier)` → `extract(handle)`.
//! The container index is parsed lazily on first `locate` and cached per blob.

mod backend;
mod container;
mod pipeline;
mod store;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub use backend::{
    BlobBackend, CertificationRequest, CertifiedBlob, DeletionRequest, LocalBlobBackend, RegistrationReceipt,
    RegistrationRequest, SignedCertification, SignedDeletion, SignedRegistration,
};
pub use container::{parse_index, ContainerBuilder, ContainerEntry, ContainerIndex, CONTAINER_MAGIC};
pub use pipeline::{BlobContainer, BlobPipeline, ContentHandle, EncodedBlob, Upload};
pub use store::{BlobMetadata, BlobStore, StorageStats, StoreResult};

/// Content address of a certified blob.
///
/// URL-safe base64 (no padding) of the SHA-256 of the container bytes, so it
/// is usable as a filename and in URLs without escaping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    /// Derive the id of `bytes`
    pub fn for_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(URL_SAFE_NO_PAD.encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BlobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checkpoint reached by one upload attempt.
///
/// Encoding happens before an attempt exists; its output is an
/// [`EncodedBlob`], and [`BlobPipeline::register`] opens the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    /// Registration request built, waiting for the owner's signature
    AwaitingRegistration,
    /// Storage accepted the signed registration
    Registered,
    /// Bytes stored, waiting for the owner's certification signature
    Uploaded,
    /// Durable; the blob id may now be referenced
    Certified,
    /// Registration was rejected. The attempt is dead.
    Abandoned,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadPhase::AwaitingRegistration => "awaiting_registration",
            UploadPhase::Registered => "registered",
            UploadPhase::Uploaded => "uploaded",
            UploadPhase::Certified => "certified",
            UploadPhase::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_id_is_url_safe() {
        let id = BlobId::for_bytes(b"container bytes");
        assert_eq!(id.as_str().len(), 43);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(id, BlobId::for_bytes(b"container bytes"));
        assert_ne!(id, BlobId::for_bytes(b"other bytes"));
    }
}

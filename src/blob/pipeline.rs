//! Upload state machine and retrieval path

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::{
    BlobBackend, CertificationRequest, CertifiedBlob, DeletionRequest, RegistrationReceipt, RegistrationRequest,
    SignedCertification, SignedDeletion, SignedRegistration,
};
use super::container::{parse_index, ContainerBuilder, ContainerEntry, ContainerIndex};
use super::store::BlobStore;
use super::{BlobId, UploadPhase};
use crate::error::{PressError, Result};
use crate::identity::{encode_signature, Address, Signer};
use crate::retry::{retry_transient, RetryPolicy};

use ed25519_dalek::Signature;

/// Container indexes kept in memory per pipeline
pub const INDEX_CACHE_CAPACITY: usize = 1024;

/// Container bytes ready for registration
#[derive(Debug, Clone)]
pub struct EncodedBlob {
    bytes: Arc<Vec<u8>>,
    blob_id: BlobId,
    index: ContainerIndex,
}

impl EncodedBlob {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.index.identifiers()
    }
}

/// One upload attempt.
///
/// Phases only move forward. A rejected registration abandons the attempt;
/// the caller starts over with a fresh [`BlobPipeline::register`].
#[derive(Debug)]
pub struct Upload {
    encoded: EncodedBlob,
    phase: UploadPhase,
    request: RegistrationRequest,
    receipt: Option<RegistrationReceipt>,
    certified: Option<CertifiedBlob>,
}

impl Upload {
    pub fn attempt_id(&self) -> &str {
        &self.request.attempt_id
    }

    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    pub fn owner(&self) -> &Address {
        &self.request.owner
    }

    /// The registration the owner must sign
    pub fn registration_request(&self) -> &RegistrationRequest {
        &self.request
    }

    /// Only available once certified
    pub fn blob_id(&self) -> Option<&BlobId> {
        self.certified.as_ref().map(|c| &c.blob_id)
    }

    pub fn certified(&self) -> Option<&CertifiedBlob> {
        self.certified.as_ref()
    }

    fn expect_phase(&self, expected: UploadPhase) -> Result<()> {
        if self.phase != expected {
            return Err(PressError::PhaseOrder {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }
}

/// A fetched container, index not yet parsed
#[derive(Debug, Clone)]
pub struct BlobContainer {
    blob_id: BlobId,
    bytes: Arc<Vec<u8>>,
}

impl BlobContainer {
    pub fn blob_id(&self) -> &BlobId {
        &self.blob_id
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Position of one entry inside a fetched container
#[derive(Debug, Clone)]
pub struct ContentHandle {
    blob_id: BlobId,
    entry: ContainerEntry,
    start: usize,
    bytes: Arc<Vec<u8>>,
}

impl ContentHandle {
    pub fn blob_id(&self) -> &BlobId {
        &self.blob_id
    }

    pub fn identifier(&self) -> &str {
        &self.entry.identifier
    }

    pub fn length(&self) -> u64 {
        self.entry.length
    }
}

pub struct BlobPipeline {
    backend: Arc<dyn BlobBackend>,
    policy: RetryPolicy,
    index_cache: DashMap<BlobId, Arc<ContainerIndex>>,
    index_capacity: usize,
}

impl BlobPipeline {
    pub fn new(backend: Arc<dyn BlobBackend>, policy: RetryPolicy) -> Self {
        Self::with_index_capacity(backend, policy, INDEX_CACHE_CAPACITY)
    }

    pub fn with_index_capacity(backend: Arc<dyn BlobBackend>, policy: RetryPolicy, capacity: usize) -> Self {
        Self {
            backend,
            policy,
            index_cache: DashMap::new(),
            index_capacity: capacity.max(1),
        }
    }

    /// Number of cached container indexes
    pub fn cached_indexes(&self) -> usize {
        self.index_cache.len()
    }

    fn cache_index(&self, blob_id: BlobId, index: Arc<ContainerIndex>) {
        if !self.index_cache.contains_key(&blob_id) && self.index_cache.len() >= self.index_capacity {
            // Indexes are cheap to re-parse; drop any one to make room
            let victim = self.index_cache.iter().next().map(|entry| entry.key().clone());
            if let Some(victim) = victim {
                self.index_cache.remove(&victim);
                debug!(blob_id = %victim, "Evicted container index");
            }
        }
        self.index_cache.insert(blob_id, index);
    }

    // ==================== Upload ====================

    /// Pack entries into a container. Pure and deterministic.
    pub fn encode<I, S>(entries: I) -> Result<EncodedBlob>
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: Into<String>,
    {
        let mut builder = ContainerBuilder::new();
        for (identifier, bytes) in entries {
            builder.add(identifier, bytes)?;
        }
        let (bytes, index) = builder.build()?;
        let blob_id = BlobId::for_bytes(&bytes);

        debug!(size = bytes.len(), entries = index.entries.len(), "Encoded blob container");

        Ok(EncodedBlob {
            bytes: Arc::new(bytes),
            blob_id,
            index,
        })
    }

    /// Start an attempt: build the registration the owner has to sign
    pub fn register(&self, encoded: EncodedBlob, owner: Address, epochs: u32, deletable: bool) -> Upload {
        let request = RegistrationRequest {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            blob_id: encoded.blob_id.clone(),
            size_bytes: encoded.size_bytes(),
            owner,
            epochs,
            deletable,
        };

        debug!(attempt_id = %request.attempt_id, owner = %request.owner, "Upload awaiting registration signature");

        Upload {
            encoded,
            phase: UploadPhase::AwaitingRegistration,
            request,
            receipt: None,
            certified: None,
        }
    }

    /// Submit the signed registration. Never retried; a failure abandons the attempt.
    pub async fn submit_registration(&self, upload: &mut Upload, signature: &Signature) -> Result<()> {
        upload.expect_phase(UploadPhase::AwaitingRegistration)?;

        let signed = SignedRegistration {
            request: upload.request.clone(),
            signature: encode_signature(signature),
        };

        match self.backend.register(&signed).await {
            Ok(receipt) => {
                info!(
                    attempt_id = %upload.attempt_id(),
                    registration_id = %receipt.registration_id,
                    end_epoch = receipt.end_epoch,
                    "Blob registered"
                );
                upload.receipt = Some(receipt);
                upload.phase = UploadPhase::Registered;
                Ok(())
            }
            Err(e) => {
                warn!(attempt_id = %upload.attempt_id(), error = %e, "Registration failed, abandoning upload");
                upload.phase = UploadPhase::Abandoned;
                Err(e)
            }
        }
    }

    /// Push the bytes, retrying unreachable nodes with backoff
    pub async fn upload(&self, upload: &mut Upload) -> Result<()> {
        upload.expect_phase(UploadPhase::Registered)?;
        let receipt = upload
            .receipt
            .clone()
            .ok_or_else(|| PressError::Internal("registered upload without receipt".into()))?;
        let bytes = upload.encoded.bytes.clone();
        let backend = &self.backend;

        retry_transient(&self.policy, "upload", || {
            let receipt = &receipt;
            let bytes = &bytes;
            async move { backend.upload(receipt, bytes).await }
        })
        .await?;

        upload.phase = UploadPhase::Uploaded;
        info!(
            attempt_id = %upload.attempt_id(),
            size = upload.encoded.size_bytes(),
            "Blob uploaded"
        );
        Ok(())
    }

    /// The certification the owner has to sign
    pub fn certification_request(&self, upload: &Upload) -> Result<CertificationRequest> {
        upload.expect_phase(UploadPhase::Uploaded)?;
        let receipt = upload
            .receipt
            .as_ref()
            .ok_or_else(|| PressError::Internal("uploaded blob without receipt".into()))?;
        Ok(CertificationRequest {
            registration_id: receipt.registration_id.clone(),
            blob_id: receipt.blob_id.clone(),
            owner: receipt.owner.clone(),
        })
    }

    /// Submit the signed certification. On success the blob id is released.
    pub async fn certify(&self, upload: &mut Upload, signature: &Signature) -> Result<BlobId> {
        let request = self.certification_request(upload)?;
        let signed = SignedCertification {
            request,
            signature: encode_signature(signature),
        };

        let certified = self.backend.certify(&signed).await?;
        let blob_id = certified.blob_id.clone();

        self.cache_index(blob_id.clone(), Arc::new(upload.encoded.index.clone()));
        upload.certified = Some(certified);
        upload.phase = UploadPhase::Certified;

        info!(attempt_id = %upload.attempt_id(), blob_id = %blob_id, "Blob certified");
        Ok(blob_id)
    }

    /// Drive every phase with `signer` approving both signatures
    pub async fn store(
        &self,
        encoded: EncodedBlob,
        signer: &dyn Signer,
        epochs: u32,
        deletable: bool,
    ) -> Result<CertifiedBlob> {
        let mut upload = self.register(encoded, signer.address(), epochs, deletable);

        let signature = signer.sign(&upload.registration_request().signing_bytes()).await?;
        self.submit_registration(&mut upload, &signature).await?;

        self.upload(&mut upload).await?;

        let request = self.certification_request(&upload)?;
        let signature = signer.sign(&request.signing_bytes()).await?;
        self.certify(&mut upload, &signature).await?;

        upload
            .certified
            .ok_or_else(|| PressError::Internal("certified upload without blob".into()))
    }

    /// Remove a blob that was registered as deletable
    pub async fn delete(&self, blob_id: &BlobId, owner: &dyn Signer) -> Result<()> {
        let request = DeletionRequest {
            blob_id: blob_id.clone(),
            owner: owner.address(),
        };
        let signature = owner.sign(&request.signing_bytes()).await?;
        self.backend
            .delete(&SignedDeletion {
                request,
                signature: encode_signature(&signature),
            })
            .await?;

        self.index_cache.remove(blob_id);
        info!(blob_id = %blob_id, owner = %owner.address(), "Blob deleted");
        Ok(())
    }

    // ==================== Retrieval ====================

    pub async fn fetch(&self, blob_id: &BlobId) -> Result<BlobContainer> {
        let backend = &self.backend;
        let bytes = retry_transient(&self.policy, "fetch", || async move { backend.fetch(blob_id).await }).await?;

        let computed = BlobId::for_bytes(&bytes);
        if &computed != blob_id {
            return Err(PressError::HashMismatch {
                expected: blob_id.to_string(),
                actual: computed.to_string(),
            });
        }

        debug!(blob_id = %blob_id, size = bytes.len(), "Fetched blob");
        Ok(BlobContainer {
            blob_id: blob_id.clone(),
            bytes: Arc::new(bytes),
        })
    }

    /// Find an entry by exact identifier
    pub fn locate(&self, container: &BlobContainer, identifier: &str) -> Result<ContentHandle> {
        let index = self.index(container)?;

        let entry = index.find(identifier).cloned().ok_or_else(|| PressError::ContentNotFound {
            blob_id: container.blob_id.clone(),
            identifier: Some(identifier.to_string()),
        })?;

        let start = index.data_offset + entry.offset as usize;
        Ok(ContentHandle {
            blob_id: container.blob_id.clone(),
            entry,
            start,
            bytes: container.bytes.clone(),
        })
    }

    /// Copy out the entry bytes after checking their hash
    pub fn extract(&self, handle: &ContentHandle) -> Result<Vec<u8>> {
        let end = handle.start + handle.entry.length as usize;
        let data = handle.bytes.get(handle.start..end).ok_or_else(|| {
            PressError::MalformedContainer(format!("entry {} lies outside the container", handle.entry.identifier))
        })?;

        let actual = BlobStore::compute_hash(data);
        if actual != handle.entry.hash {
            warn!(blob_id = %handle.blob_id, identifier = %handle.entry.identifier, "Entry failed hash check");
            return Err(PressError::HashMismatch {
                expected: handle.entry.hash.clone(),
                actual,
            });
        }
        Ok(data.to_vec())
    }

    /// fetch, locate and extract in one go
    pub async fn read(&self, blob_id: &BlobId, identifier: &str) -> Result<Vec<u8>> {
        let container = self.fetch(blob_id).await?;
        let handle = self.locate(&container, identifier)?;
        self.extract(&handle)
    }

    /// Index entries of a fetched container
    pub fn entries(&self, container: &BlobContainer) -> Result<Vec<ContainerEntry>> {
        Ok(self.index(container)?.entries.clone())
    }

    /// Whether the index of `blob_id` is cached
    pub fn is_index_cached(&self, blob_id: &BlobId) -> bool {
        self.index_cache.contains_key(blob_id)
    }

    fn index(&self, container: &BlobContainer) -> Result<Arc<ContainerIndex>> {
        if let Some(index) = self.index_cache.get(&container.blob_id) {
            return Ok(index.value().clone());
        }
        let index = Arc::new(parse_index(&container.bytes)?);
        self.cache_index(container.blob_id.clone(), index.clone());
        debug!(blob_id = %container.blob_id, entries = index.entries.len(), "Parsed container index");
        Ok(index)
    }
}

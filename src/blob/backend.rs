//! Storage backend
//!
//! The pipeline talks to storage through [`BlobBackend`]. Registration and
//! certification carry the owner's signature; the backend checks it against
//! the owner address before accepting either.
//!
//! [`LocalBlobBackend`] is the in-process implementation over an on-disk
//! [`BlobStore`]. It tracks a storage epoch so registrations expire, and can
//! be told to fail upcoming data-plane calls to exercise retry paths.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::store::{BlobMetadata, BlobStore};
use super::BlobId;
use crate::clock::UnixSecs;
use crate::error::{PressError, Result};
use crate::identity::Address;

/// Unsigned registration for one upload attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub attempt_id: String,
    pub blob_id: BlobId,
    pub size_bytes: u64,
    pub owner: Address,
    pub epochs: u32,
    pub deletable: bool,
}

impl RegistrationRequest {
    /// Bytes the owner signs
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "gated-press/register/v1\n{}\n{}\n{}\n{}\n{}\n{}",
            self.attempt_id, self.blob_id, self.size_bytes, self.owner, self.epochs, self.deletable
        )
        .into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRegistration {
    pub request: RegistrationRequest,
    /// Hex ed25519 signature over [`RegistrationRequest::signing_bytes`]
    pub signature: String,
}

/// Storage's acknowledgement of a registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReceipt {
    pub registration_id: String,
    pub blob_id: BlobId,
    pub owner: Address,
    pub size_bytes: u64,
    pub end_epoch: u64,
    pub deletable: bool,
}

/// Unsigned certification of an uploaded blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificationRequest {
    pub registration_id: String,
    pub blob_id: BlobId,
    pub owner: Address,
}

impl CertificationRequest {
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "gated-press/certify/v1\n{}\n{}\n{}",
            self.registration_id, self.blob_id, self.owner
        )
        .into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCertification {
    pub request: CertificationRequest,
    pub signature: String,
}

/// Owner's request to remove a deletable blob before its epochs run out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRequest {
    pub blob_id: BlobId,
    pub owner: Address,
}

impl DeletionRequest {
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!("gated-press/delete/v1\n{}\n{}", self.blob_id, self.owner).into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDeletion {
    pub request: DeletionRequest,
    pub signature: String,
}

/// A durable blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedBlob {
    pub blob_id: BlobId,
    pub owner: Address,
    pub size_bytes: u64,
    pub end_epoch: u64,
    pub deletable: bool,
}

#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn register(&self, registration: &SignedRegistration) -> Result<RegistrationReceipt>;

    async fn upload(&self, receipt: &RegistrationReceipt, bytes: &[u8]) -> Result<()>;

    async fn certify(&self, certification: &SignedCertification) -> Result<CertifiedBlob>;

    /// Raw container bytes of a certified, unexpired blob
    async fn fetch(&self, blob_id: &BlobId) -> Result<Vec<u8>>;

    /// Remove a blob registered as deletable. Owner-signed.
    async fn delete(&self, deletion: &SignedDeletion) -> Result<()>;
}

struct Registration {
    receipt: RegistrationReceipt,
    uploaded: bool,
}

/// Backend over a local [`BlobStore`]
pub struct LocalBlobBackend {
    store: BlobStore,
    registrations: DashMap<String, Registration>,
    current_epoch: AtomicU64,
    pending_faults: AtomicU32,
    signed_faults: AtomicU32,
}

impl LocalBlobBackend {
    pub fn new(store: BlobStore) -> Self {
        Self {
            store,
            registrations: DashMap::new(),
            current_epoch: AtomicU64::new(0),
            pending_faults: AtomicU32::new(0),
            signed_faults: AtomicU32::new(0),
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::SeqCst)
    }

    /// Move storage time forward; blobs past their end epoch stop being served
    pub fn advance_epoch(&self, epochs: u64) {
        let now = self.current_epoch.fetch_add(epochs, Ordering::SeqCst) + epochs;
        info!(epoch = now, "Storage epoch advanced");
    }

    /// Make the next `count` upload or fetch calls fail as unreachable
    pub fn fail_next(&self, count: u32) {
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` register or certify calls fail as unreachable
    pub fn fail_next_signed(&self, count: u32) {
        self.signed_faults.store(count, Ordering::SeqCst);
    }

    /// Registrations accepted but not yet certified
    pub fn open_registrations(&self) -> usize {
        self.registrations.len()
    }

    fn injected_fault(&self, operation: &str) -> Result<()> {
        Self::take_fault(&self.pending_faults, operation)
    }

    fn injected_signed_fault(&self, operation: &str) -> Result<()> {
        Self::take_fault(&self.signed_faults, operation)
    }

    fn take_fault(counter: &AtomicU32, operation: &str) -> Result<()> {
        let took = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            debug!(operation = operation, "Injected storage fault");
            return Err(PressError::NodeUnavailable(format!("{operation}: storage node unreachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobBackend for LocalBlobBackend {
    async fn register(&self, registration: &SignedRegistration) -> Result<RegistrationReceipt> {
        self.injected_signed_fault("register")?;
        let request = &registration.request;

        request
            .owner
            .verify(&request.signing_bytes(), &registration.signature)
            .map_err(|e| PressError::RegistrationRejected(e.to_string()))?;
        if request.epochs == 0 {
            return Err(PressError::RegistrationRejected("epochs must be at least 1".into()));
        }

        let receipt = RegistrationReceipt {
            registration_id: request.attempt_id.clone(),
            blob_id: request.blob_id.clone(),
            owner: request.owner.clone(),
            size_bytes: request.size_bytes,
            end_epoch: self.current_epoch() + u64::from(request.epochs),
            deletable: request.deletable,
        };

        self.registrations.insert(
            receipt.registration_id.clone(),
            Registration {
                receipt: receipt.clone(),
                uploaded: false,
            },
        );

        debug!(
            registration_id = %receipt.registration_id,
            owner = %receipt.owner,
            end_epoch = receipt.end_epoch,
            "Registration accepted"
        );
        Ok(receipt)
    }

    async fn upload(&self, receipt: &RegistrationReceipt, bytes: &[u8]) -> Result<()> {
        self.injected_fault("upload")?;

        if !self.registrations.contains_key(&receipt.registration_id) {
            return Err(PressError::RegistrationRejected(format!(
                "unknown registration {}",
                receipt.registration_id
            )));
        }
        if bytes.len() as u64 != receipt.size_bytes {
            return Err(PressError::RegistrationRejected(format!(
                "registered {} bytes, uploaded {}",
                receipt.size_bytes,
                bytes.len()
            )));
        }

        self.store.put_pending(&receipt.blob_id, bytes).await?;

        if let Some(mut registration) = self.registrations.get_mut(&receipt.registration_id) {
            registration.uploaded = true;
        }
        Ok(())
    }

    async fn certify(&self, certification: &SignedCertification) -> Result<CertifiedBlob> {
        self.injected_signed_fault("certify")?;
        let request = &certification.request;

        let receipt = match self.registrations.get(&request.registration_id) {
            Some(r) if !r.uploaded => {
                return Err(PressError::RegistrationRejected(format!(
                    "registration {} has no uploaded bytes",
                    request.registration_id
                )))
            }
            Some(r) => r.receipt.clone(),
            None => {
                return Err(PressError::RegistrationRejected(format!(
                    "unknown registration {}",
                    request.registration_id
                )))
            }
        };

        if receipt.owner != request.owner || receipt.blob_id != request.blob_id {
            return Err(PressError::RegistrationRejected(
                "certification does not match registration".into(),
            ));
        }
        receipt.owner.verify(&request.signing_bytes(), &certification.signature)?;

        let metadata = BlobMetadata {
            blob_id: receipt.blob_id.clone(),
            owner: receipt.owner.clone(),
            size_bytes: receipt.size_bytes,
            end_epoch: receipt.end_epoch,
            deletable: receipt.deletable,
            certified_at: UnixSecs::now(),
        };
        self.store.certify(&metadata).await?;
        self.registrations.remove(&request.registration_id);

        Ok(CertifiedBlob {
            blob_id: receipt.blob_id,
            owner: receipt.owner,
            size_bytes: receipt.size_bytes,
            end_epoch: receipt.end_epoch,
            deletable: receipt.deletable,
        })
    }

    async fn fetch(&self, blob_id: &BlobId) -> Result<Vec<u8>> {
        self.injected_fault("fetch")?;

        let metadata = self.store.metadata(blob_id).await?;
        if metadata.end_epoch < self.current_epoch() {
            warn!(blob_id = %blob_id, end_epoch = metadata.end_epoch, "Blob storage expired");
            return Err(PressError::ContentNotFound {
                blob_id: blob_id.clone(),
                identifier: None,
            });
        }
        self.store.get(blob_id).await
    }

    async fn delete(&self, deletion: &SignedDeletion) -> Result<()> {
        let request = &deletion.request;
        let metadata = self.store.metadata(&request.blob_id).await?;

        if metadata.owner != request.owner {
            return Err(PressError::InvalidSignature(format!(
                "{} does not own blob {}",
                request.owner, request.blob_id
            )));
        }
        metadata.owner.verify(&request.signing_bytes(), &deletion.signature)?;
        if !metadata.deletable {
            warn!(blob_id = %request.blob_id, "Refusing to delete permanent blob");
            return Err(PressError::NotDeletable(request.blob_id.clone()));
        }

        self.store.delete(&request.blob_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{encode_signature, LocalSigner, Signer};
    use tempfile::TempDir;

    async fn backend(dir: &TempDir) -> LocalBlobBackend {
        LocalBlobBackend::new(BlobStore::new(dir.path()).await.unwrap())
    }

    async fn signed_registration(signer: &LocalSigner, bytes: &[u8]) -> SignedRegistration {
        registration_with(signer, bytes, false).await
    }

    async fn registration_with(signer: &LocalSigner, bytes: &[u8], deletable: bool) -> SignedRegistration {
        let request = RegistrationRequest {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            blob_id: BlobId::for_bytes(bytes),
            size_bytes: bytes.len() as u64,
            owner: signer.address(),
            epochs: 2,
            deletable,
        };
        let signature = signer.sign(&request.signing_bytes()).await.unwrap();
        SignedRegistration {
            request,
            signature: encode_signature(&signature),
        }
    }

    #[tokio::test]
    async fn test_register_rejects_foreign_signature() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir).await;
        let owner = LocalSigner::generate();
        let imposter = LocalSigner::generate();

        let mut registration = signed_registration(&owner, b"bytes").await;
        let forged = imposter.sign(&registration.request.signing_bytes()).await.unwrap();
        registration.signature = encode_signature(&forged);

        let err = backend.register(&registration).await.unwrap_err();
        assert!(matches!(err, PressError::RegistrationRejected(_)));
        assert_eq!(backend.open_registrations(), 0);
    }

    #[tokio::test]
    async fn test_certify_requires_upload_and_expires_by_epoch() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir).await;
        let owner = LocalSigner::generate();
        let bytes = b"container".to_vec();

        let receipt = backend.register(&signed_registration(&owner, &bytes).await).await.unwrap();
        let request = CertificationRequest {
            registration_id: receipt.registration_id.clone(),
            blob_id: receipt.blob_id.clone(),
            owner: owner.address(),
        };
        let signature = encode_signature(&owner.sign(&request.signing_bytes()).await.unwrap());
        let certification = SignedCertification { request, signature };

        assert!(matches!(
            backend.certify(&certification).await,
            Err(PressError::RegistrationRejected(_))
        ));

        backend.upload(&receipt, &bytes).await.unwrap();
        let certified = backend.certify(&certification).await.unwrap();
        assert_eq!(certified.end_epoch, 2);
        assert_eq!(backend.fetch(&certified.blob_id).await.unwrap(), bytes);

        backend.advance_epoch(3);
        assert!(matches!(
            backend.fetch(&certified.blob_id).await,
            Err(PressError::ContentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fail_next_counts_down() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir).await;
        backend.fail_next(2);

        let id = BlobId::for_bytes(b"missing");
        assert!(matches!(backend.fetch(&id).await, Err(PressError::NodeUnavailable(_))));
        assert!(matches!(backend.fetch(&id).await, Err(PressError::NodeUnavailable(_))));
        assert!(matches!(backend.fetch(&id).await, Err(PressError::ContentNotFound { .. })));
    }

    async fn certified_blob(backend: &LocalBlobBackend, owner: &LocalSigner, bytes: &[u8], deletable: bool) -> BlobId {
        let receipt = backend
            .register(&registration_with(owner, bytes, deletable).await)
            .await
            .unwrap();
        backend.upload(&receipt, bytes).await.unwrap();
        let request = CertificationRequest {
            registration_id: receipt.registration_id,
            blob_id: receipt.blob_id,
            owner: owner.address(),
        };
        let signature = encode_signature(&owner.sign(&request.signing_bytes()).await.unwrap());
        backend
            .certify(&SignedCertification { request, signature })
            .await
            .unwrap()
            .blob_id
    }

    async fn signed_deletion(signer: &LocalSigner, blob_id: &BlobId) -> SignedDeletion {
        let request = DeletionRequest {
            blob_id: blob_id.clone(),
            owner: signer.address(),
        };
        let signature = encode_signature(&signer.sign(&request.signing_bytes()).await.unwrap());
        SignedDeletion { request, signature }
    }

    #[tokio::test]
    async fn test_delete_honours_owner_and_deletable_flag() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir).await;
        let owner = LocalSigner::generate();
        let stranger = LocalSigner::generate();

        let permanent = certified_blob(&backend, &owner, b"permanent", false).await;
        assert!(matches!(
            backend.delete(&signed_deletion(&owner, &permanent).await).await,
            Err(PressError::NotDeletable(_))
        ));
        assert!(backend.fetch(&permanent).await.is_ok());

        let scratch = certified_blob(&backend, &owner, b"scratch", true).await;
        assert!(matches!(
            backend.delete(&signed_deletion(&stranger, &scratch).await).await,
            Err(PressError::InvalidSignature(_))
        ));

        backend.delete(&signed_deletion(&owner, &scratch).await).await.unwrap();
        assert!(matches!(
            backend.fetch(&scratch).await,
            Err(PressError::ContentNotFound { .. })
        ));
    }
}

//! Error types for gated-press

use thiserror::Error;

use crate::access::{Denial, KeyDenial};
use crate::blob::{BlobId, UploadPhase};
use crate::clock::UnixSecs;
use crate::entitlement::{ObjectId, Tier};

pub type Result<T> = std::result::Result<T, PressError>;

#[derive(Error, Debug)]
pub enum PressError {
    #[error("Invalid pricing: premium price {premium} is below basic price {basic}")]
    InvalidPricing { basic: u64, premium: u64 },

    #[error("Unauthorized: capability for publication {cap_publication} does not govern {target}")]
    Unauthorized {
        cap_publication: ObjectId,
        target: ObjectId,
    },

    #[error("Tier unavailable: {tier} tier is disabled for publication {publication_id}")]
    TierUnavailable { publication_id: ObjectId, tier: Tier },

    #[error("Insufficient payment for {tier} tier: required {required}, paid {paid}")]
    InsufficientPayment { tier: Tier, required: u64, paid: u64 },

    #[error("Tier mismatch: renewing a {tier} subscription requires {required}, paid {paid}")]
    TierMismatch { tier: Tier, required: u64, paid: u64 },

    #[error("Article already archived: {0}")]
    AlreadyArchived(ObjectId),

    #[error("Blob {0} was not registered as deletable")]
    NotDeletable(BlobId),

    /// The object is absent from the indexed view. May be read-after-write lag.
    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("Content not found in blob {blob_id}{}", identifier.as_ref().map(|i| format!(" (identifier {i})")).unwrap_or_default())]
    ContentNotFound {
        blob_id: BlobId,
        identifier: Option<String>,
    },

    /// A single storage node call failed. Retried by the pipeline.
    #[error("Storage node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("Storage unavailable after {attempts} attempts: {reason}")]
    StorageUnavailable { attempts: u32, reason: String },

    #[error("No valid entitlement: {0}")]
    NoValidEntitlement(Box<Denial>),

    #[error("Key denied: {0}")]
    KeyDenied(KeyDenial),

    #[error("Session expired at {}", expired_at.to_rfc3339())]
    SessionExpired { expired_at: UnixSecs },

    #[error("Session not ready: {0}")]
    SessionNotReady(String),

    #[error("Signature rejected by signer: {0}")]
    SignatureRejected(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Upload phase out of order: expected {expected}, upload is {actual}")]
    PhaseOrder {
        expected: UploadPhase,
        actual: UploadPhase,
    },

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Flat classification of [`PressError`] for callers that only need to branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Pricing, payment or capability checks. Never retried.
    Validation,
    /// Visibility lag or a flaky storage node. Retried locally.
    Transient,
    /// Retry budget spent or content genuinely absent.
    Terminal,
    /// Access was refused by the resolver or the key service.
    Access,
    /// Signing or session problems that need the user.
    Authorization,
    /// Caller drove the upload state machine wrongly.
    Protocol,
    Internal,
}

impl PressError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PressError::InvalidPricing { .. }
            | PressError::Unauthorized { .. }
            | PressError::TierUnavailable { .. }
            | PressError::InsufficientPayment { .. }
            | PressError::TierMismatch { .. }
            | PressError::AlreadyArchived(_)
            | PressError::NotDeletable(_) => ErrorKind::Validation,
            PressError::ObjectNotFound(_) | PressError::NodeUnavailable(_) => ErrorKind::Transient,
            PressError::ContentNotFound { .. }
            | PressError::StorageUnavailable { .. }
            | PressError::HashMismatch { .. }
            | PressError::MalformedContainer(_) => ErrorKind::Terminal,
            PressError::NoValidEntitlement(_) | PressError::KeyDenied(_) => ErrorKind::Access,
            PressError::SessionExpired { .. }
            | PressError::SessionNotReady(_)
            | PressError::SignatureRejected(_)
            | PressError::InvalidSignature(_) => ErrorKind::Authorization,
            PressError::PhaseOrder { .. } | PressError::RegistrationRejected(_) => ErrorKind::Protocol,
            PressError::Config(_)
            | PressError::Io(_)
            | PressError::Json(_)
            | PressError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a local retry can make this error go away
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// The resolver's denial, if this is an entitlement failure
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            PressError::NoValidEntitlement(denial) => Some(&**denial),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for PressError {
    fn from(e: toml::de::Error) -> Self {
        PressError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for PressError {
    fn from(e: toml::ser::Error) -> Self {
        PressError::Config(e.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for PressError {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        PressError::InvalidSignature(e.to_string())
    }
}

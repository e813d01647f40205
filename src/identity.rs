//! Identities and signing
//!
//! Every actor (publisher, reader, blob owner) is an ed25519 key. The
//! [`Address`] is the hex-encoded verifying key, so any signature can be
//! checked against an address without a separate key lookup.
//!
//! Signing goes through the [`Signer`] trait because in practice it is
//! user-interactive: a wallet prompts, and the user may refuse. A refusal
//! surfaces as [`PressError::SignatureRejected`] and is never retried behind
//! the user's back.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::info;

use crate::error::{PressError, Result};

/// Ledger identity of an actor
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(format!("0x{}", hex::encode(key.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the verifying key this address encodes
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let hex_part = self.0.strip_prefix("0x").unwrap_or(&self.0);
        let bytes = hex::decode(hex_part)
            .map_err(|e| PressError::InvalidSignature(format!("address {} is not hex: {e}", self.0)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PressError::InvalidSignature(format!("address {} is not a 32-byte key", self.0)))?;
        Ok(VerifyingKey::from_bytes(&bytes)?)
    }

    /// Verify a hex-encoded signature over `message` by this address
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> Result<()> {
        let key = self.verifying_key()?;
        let signature = decode_signature(signature_hex)?;
        key.verify(message, &signature)
            .map_err(|e| PressError::InvalidSignature(format!("signature by {} does not verify: {e}", self.0)))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn encode_signature(signature: &Signature) -> String {
    hex::encode(signature.to_bytes())
}

pub fn decode_signature(signature_hex: &str) -> Result<Signature> {
    let bytes = hex::decode(signature_hex)
        .map_err(|e| PressError::InvalidSignature(format!("signature is not hex: {e}")))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| PressError::InvalidSignature("signature must be 64 bytes".into()))?;
    Ok(Signature::from_bytes(&bytes))
}

/// Something that can authorize requests on behalf of an address
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    /// Sign `message`. May suspend while the user confirms.
    async fn sign(&self, message: &[u8]) -> Result<Signature>;
}

/// In-process ed25519 key
pub struct LocalSigner {
    key: SigningKey,
}

impl LocalSigner {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Load a hex seed from `path`, creating one if the file does not exist
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let bytes = hex::decode(content.trim())
                .map_err(|e| PressError::Config(format!("key file {} is not hex: {e}", path.display())))?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|_| PressError::Config(format!("key file {} must hold 32 bytes", path.display())))?;
            return Ok(Self::from_seed(seed));
        }

        let signer = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(signer.key.to_bytes()))?;
        info!(path = %path.display(), address = %signer.address(), "Generated owner key");

        Ok(signer)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn address(&self) -> Address {
        Address::from_verifying_key(&self.key.verifying_key())
    }

    async fn sign(&self, message: &[u8]) -> Result<Signature> {
        Ok(self.key.sign(message))
    }
}

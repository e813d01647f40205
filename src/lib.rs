//! gated-press - Entitlement-gated content pipeline
//!
//! Readers get time- and tier-scoped access to encrypted articles. The
//! ledger records who may read what; ciphertext lives in content-addressed
//! blob storage; key servers release decryption key shares only after
//! re-checking entitlement themselves.
//!
//! ## Architecture
//!
//! - **Entitlement Store** (`entitlement`): publications, publisher
//!   capabilities, subscriptions, read tokens, articles and stats as ledger
//!   objects
//! - **Blob Pipeline** (`blob`): encode → register → upload → certify, and
//!   fetch → locate → extract
//! - **Access Resolver** (`access`): free tier, subscription or read token,
//!   then threshold key release
//! - **Session Manager** (`session`): time-boxed reader-signed credential
//!
//! ## Data Flow
//!
//! ```text
//! publisher encrypts ─► Blob Pipeline ─► blob id ─► Entitlement Store (Article)
//!
//! reader ─► Access Resolver ─► Entitlement Store
//!               │ granted
//!               ▼
//!          Session Manager ─► key servers ─► shares
//!               │
//!               ▼
//!          Blob Pipeline (fetch/locate/extract) ─► caller decrypts
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/gated-press/
//! ├── blobs/
//! │   ├── pending/       # Uploaded, not yet certified
//! │   └── certified/     # First 2 chars of blob id as subdirs
//! ├── owner.key          # ed25519 seed used to sign uploads
//! └── config.toml
//! ```

pub mod access;
pub mod blob;
pub mod clock;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod publisher;
pub mod reader;
pub mod retry;
pub mod session;

// Re-exports
pub use access::{AccessResolver, Denial, EntitlementPath, EntitlementProof, KeyReleaseClient, LocalKeyServer};
pub use blob::{BlobId, BlobPipeline, BlobStore, LocalBlobBackend};
pub use clock::{Clock, ManualClock, SystemClock, UnixMillis, UnixSecs};
pub use config::Config;
pub use entitlement::{EntitlementStore, NewPublication, Tier};
pub use error::{ErrorKind, PressError, Result};
pub use identity::{Address, LocalSigner, Signer};
pub use ledger::Ledger;
pub use publisher::{Publisher, SealedArticle};
pub use reader::{ArticleReader, OpenedArticle};
pub use session::{SessionKey, SessionManager, SessionStatus};

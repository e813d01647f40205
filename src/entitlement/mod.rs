//! Entitlement Store
//!
//! Publications, the capability that governs them, subscriptions, read
//! tokens, articles and per-publication stats, persisted as ledger objects.
//!
//! ## Rules enforced here
//!
//! - Only the holder of a publication's [`PublisherCap`] can change it or
//!   publish into it.
//! - `premium_price >= basic_price`, checked on create and on every update.
//! - Archival is one-way and never deletes the article.
//! - Every successful transition emits exactly one [`LedgerEvent`].

mod events;
mod model;
mod store;

pub use events::{EventLog, LedgerEvent};
pub use model::{
    validate_pricing, Article, ArticleDraft, CapRecord, KeyId, ObjectId, Publication, PublicationStats, PublisherCap,
    ReadToken, SubscriptionNft, Tier,
};
pub use store::{EntitlementConfig, EntitlementStore, NewPublication};

//! Entitlement records
//!
//! Plain data plus the invariant checks that belong to a single record.
//! Cross-record rules (capability matching, payments, counters) live in
//! [`super::store`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::blob::BlobId;
use crate::clock::UnixSecs;
use crate::error::{PressError, Result};
use crate::identity::Address;

/// Ledger object identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Fresh random identifier
    pub fn generate() -> Self {
        Self(format!("0x{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of the encryption key group an article was sealed under
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Access level shared by articles and subscriptions.
///
/// Totally ordered: `Free < Basic < Premium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Tier {
    Free = 0,
    Basic = 1,
    Premium = 2,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Basic, Tier::Premium];

    /// A subscription at `self` grants access to content at `required`
    pub fn satisfies(self, required: Tier) -> bool {
        self >= required
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Basic => write!(f, "basic"),
            Tier::Premium => write!(f, "premium"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = PressError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "premium" => Ok(Tier::Premium),
            other => Err(PressError::Config(format!("unknown tier: {other}"))),
        }
    }
}

/// A publication and its pricing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub id: ObjectId,
    pub name: String,
    pub description: String,
    pub creator: Address,
    pub free_tier_enabled: bool,
    pub basic_price: u64,
    pub premium_price: u64,
    pub article_count: u64,
}

impl Publication {
    /// Price of one subscription period at `tier`
    pub fn price_for(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Free => 0,
            Tier::Basic => self.basic_price,
            Tier::Premium => self.premium_price,
        }
    }

    /// Price of a read token for an article at `tier`.
    ///
    /// The subscription price of the tier, prorated to the token lifetime and
    /// rounded up. A free article with the free tier switched off is priced
    /// like a basic one.
    pub fn read_token_price(&self, tier: Tier, token_ttl_secs: u64, period_secs: u64) -> u64 {
        let base = match tier {
            Tier::Free if self.free_tier_enabled => return 0,
            Tier::Free => self.basic_price,
            other => self.price_for(other),
        };
        if base == 0 || period_secs == 0 {
            return 0;
        }
        let prorated = (base as u128 * token_ttl_secs as u128).div_ceil(period_secs as u128);
        prorated.min(u64::MAX as u128) as u64
    }
}

/// Premium must never be cheaper than basic
pub fn validate_pricing(basic_price: u64, premium_price: u64) -> Result<()> {
    if premium_price < basic_price {
        return Err(PressError::InvalidPricing {
            basic: basic_price,
            premium: premium_price,
        });
    }
    Ok(())
}

/// Sole authorization to mutate a publication.
///
/// Not `Clone` and not constructible outside this crate: the only way to get
/// one is from [`super::EntitlementStore::create_publication`], which hands it
/// to the creator exactly once.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct PublisherCap {
    id: ObjectId,
    publication_id: ObjectId,
}

impl PublisherCap {
    pub(crate) fn mint(publication_id: ObjectId) -> Self {
        Self {
            id: ObjectId::generate(),
            publication_id,
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn publication_id(&self) -> &ObjectId {
        &self.publication_id
    }

    /// Reject use against any publication other than the one this cap governs
    pub fn authorize(&self, target: &ObjectId) -> Result<()> {
        if &self.publication_id != target {
            return Err(PressError::Unauthorized {
                cap_publication: self.publication_id.clone(),
                target: target.clone(),
            });
        }
        Ok(())
    }

    /// Ledger view of this cap. Lets indexers see who holds which cap
    /// without ever producing a second usable handle.
    pub(crate) fn record(&self, holder: &Address) -> CapRecord {
        CapRecord {
            id: self.id.clone(),
            publication_id: self.publication_id.clone(),
            holder: holder.clone(),
        }
    }
}

/// Inert, serializable description of a [`PublisherCap`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapRecord {
    pub id: ObjectId,
    pub publication_id: ObjectId,
    pub holder: Address,
}

/// A reader's subscription to a publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionNft {
    pub id: ObjectId,
    pub publication_id: ObjectId,
    pub tier: Tier,
    pub subscribed_at: UnixSecs,
    pub expires_at: UnixSecs,
    pub subscriber: Address,
}

impl SubscriptionNft {
    pub fn is_expired(&self, now: UnixSecs) -> bool {
        now > self.expires_at
    }

    /// Active and at least as high as `required`
    pub fn grants(&self, required: Tier, now: UnixSecs) -> bool {
        !self.is_expired(now) && self.tier.satisfies(required)
    }
}

/// Short-lived pay-per-article grant.
///
/// Reusable until it expires; there is no consumption flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadToken {
    pub id: ObjectId,
    pub article_id: ObjectId,
    pub reader: Address,
    pub created_at: UnixSecs,
    pub expires_at: UnixSecs,
}

impl ReadToken {
    pub fn is_expired(&self, now: UnixSecs) -> bool {
        now > self.expires_at
    }
}

/// An encrypted article. The excerpt is always public.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: ObjectId,
    pub publication_id: ObjectId,
    pub title: String,
    pub excerpt: String,
    blob_id: BlobId,
    key_id: KeyId,
    content_identifier: String,
    pub tier: Tier,
    pub published_at: UnixSecs,
    is_archived: bool,
}

impl Article {
    pub(crate) fn new(publication_id: ObjectId, draft: ArticleDraft, published_at: UnixSecs) -> Self {
        Self {
            id: ObjectId::generate(),
            publication_id,
            title: draft.title,
            excerpt: draft.excerpt,
            blob_id: draft.blob_id,
            key_id: draft.key_id,
            content_identifier: draft.content_identifier,
            tier: draft.tier,
            published_at,
            is_archived: false,
        }
    }

    /// Blob holding the ciphertext. Fixed at publish time.
    pub fn blob_id(&self) -> &BlobId {
        &self.blob_id
    }

    /// Key group the ciphertext was sealed under. Fixed at publish time.
    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Entry name of the ciphertext inside the blob container
    pub fn content_identifier(&self) -> &str {
        &self.content_identifier
    }

    pub fn is_archived(&self) -> bool {
        self.is_archived
    }

    /// One-way transition
    pub(crate) fn archive(&mut self) -> Result<()> {
        if self.is_archived {
            return Err(PressError::AlreadyArchived(self.id.clone()));
        }
        self.is_archived = true;
        Ok(())
    }
}

/// Everything a publisher supplies to publish an article
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleDraft {
    pub title: String,
    pub excerpt: String,
    pub blob_id: BlobId,
    pub key_id: KeyId,
    pub content_identifier: String,
    pub tier: Tier,
}

/// Aggregate counters for a publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationStats {
    pub id: ObjectId,
    pub publication_id: ObjectId,
    pub free_subscriptions: u64,
    pub basic_subscriptions: u64,
    pub premium_subscriptions: u64,
    pub read_tokens_issued: u64,
    pub total_revenue: u64,
    pub total_views: u64,
}

impl PublicationStats {
    pub(crate) fn new(publication_id: ObjectId) -> Self {
        Self {
            id: ObjectId::generate(),
            publication_id,
            free_subscriptions: 0,
            basic_subscriptions: 0,
            premium_subscriptions: 0,
            read_tokens_issued: 0,
            total_revenue: 0,
            total_views: 0,
        }
    }

    /// Subscriptions ever sold at `tier`
    pub fn subscriptions(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Free => self.free_subscriptions,
            Tier::Basic => self.basic_subscriptions,
            Tier::Premium => self.premium_subscriptions,
        }
    }

    pub(crate) fn record_subscription(&mut self, tier: Tier, payment: u64) {
        match tier {
            Tier::Free => self.free_subscriptions += 1,
            Tier::Basic => self.basic_subscriptions += 1,
            Tier::Premium => self.premium_subscriptions += 1,
        }
        self.total_revenue = self.total_revenue.saturating_add(payment);
    }

    pub(crate) fn record_revenue(&mut self, payment: u64) {
        self.total_revenue = self.total_revenue.saturating_add(payment);
    }

    pub(crate) fn record_read_token(&mut self, payment: u64) {
        self.read_tokens_issued += 1;
        self.total_revenue = self.total_revenue.saturating_add(payment);
    }

    pub(crate) fn record_view(&mut self) {
        self.total_views += 1;
    }
}

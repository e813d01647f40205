//! Entitlement Store
//!
//! Executes the capability-gated and payment-gated transitions on top of the
//! [`Ledger`]. Each operation behaves like one ledger transaction: it reads
//! the latest versions of its inputs, checks every invariant before writing
//! anything, writes, and then emits exactly one event.
//!
//! Mutations are serialized through a single transaction lock so counters
//! (`article_count`, stats) never lose updates. Reads for callers go
//! through the lagged view and may be stale; see [`crate::retry::poll_visible`].

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::events::LedgerEvent;
use super::model::{
    validate_pricing, Article, ArticleDraft, ObjectId, Publication, PublicationStats, PublisherCap, ReadToken,
    SubscriptionNft, Tier,
};
use crate::access::{self, Denial, EntitlementPath, EntitlementProof, PathCheck};
use crate::clock::{Clock, UnixSecs};
use crate::config::{DEFAULT_READ_TOKEN_TTL_SECS, DEFAULT_SUBSCRIPTION_PERIOD_SECS};
use crate::error::{PressError, Result};
use crate::identity::Address;
use crate::ledger::{Ledger, LedgerObject};

/// Entitlement periods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitlementConfig {
    pub subscription_period_secs: u64,
    pub read_token_ttl_secs: u64,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            subscription_period_secs: DEFAULT_SUBSCRIPTION_PERIOD_SECS,
            read_token_ttl_secs: DEFAULT_READ_TOKEN_TTL_SECS,
        }
    }
}

/// Parameters for a new publication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPublication {
    pub name: String,
    pub description: String,
    pub basic_price: u64,
    pub premium_price: u64,
    pub free_tier_enabled: bool,
}

pub struct EntitlementStore {
    ledger: Arc<Ledger>,
    clock: Arc<dyn Clock>,
    config: EntitlementConfig,
    /// publication id -> stats id
    stats_index: DashMap<ObjectId, ObjectId>,
    tx_lock: Mutex<()>,
}

impl EntitlementStore {
    pub fn new(ledger: Arc<Ledger>, clock: Arc<dyn Clock>, config: EntitlementConfig) -> Self {
        Self {
            ledger,
            clock,
            config,
            stats_index: DashMap::new(),
            tx_lock: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn config(&self) -> EntitlementConfig {
        self.config
    }

    pub fn now(&self) -> UnixSecs {
        self.clock.now()
    }

    // ==================== Publisher operations ====================

    /// Create a publication, its stats record and the single cap governing it
    pub async fn create_publication(
        &self,
        creator: &Address,
        params: NewPublication,
    ) -> Result<(Publication, PublisherCap)> {
        validate_pricing(params.basic_price, params.premium_price)?;

        let _tx = self.tx_lock.lock().await;

        let publication = Publication {
            id: ObjectId::generate(),
            name: params.name,
            description: params.description,
            creator: creator.clone(),
            free_tier_enabled: params.free_tier_enabled,
            basic_price: params.basic_price,
            premium_price: params.premium_price,
            article_count: 0,
        };
        let cap = PublisherCap::mint(publication.id.clone());
        let stats = PublicationStats::new(publication.id.clone());

        self.stats_index.insert(publication.id.clone(), stats.id.clone());
        self.ledger.write(LedgerObject::Publication(publication.clone()));
        self.ledger.write(LedgerObject::PublisherCap(cap.record(creator)));
        self.ledger.write(LedgerObject::Stats(stats));

        self.ledger.events().emit(LedgerEvent::PublicationCreated {
            publication_id: publication.id.clone(),
            creator: creator.clone(),
            name: publication.name.clone(),
            basic_price: publication.basic_price,
            premium_price: publication.premium_price,
            free_tier_enabled: publication.free_tier_enabled,
        });

        info!(
            publication_id = %publication.id,
            creator = %creator,
            basic_price = publication.basic_price,
            premium_price = publication.premium_price,
            free_tier = publication.free_tier_enabled,
            "Publication created"
        );

        Ok((publication, cap))
    }

    /// Replace both prices. A rejected update leaves the old prices in place.
    pub async fn update_pricing(
        &self,
        cap: &PublisherCap,
        publication_id: &ObjectId,
        basic_price: u64,
        premium_price: u64,
    ) -> Result<Publication> {
        cap.authorize(publication_id)?;
        validate_pricing(basic_price, premium_price)?;

        let _tx = self.tx_lock.lock().await;
        let mut publication = self.latest_publication(publication_id)?;
        publication.basic_price = basic_price;
        publication.premium_price = premium_price;
        self.ledger.write(LedgerObject::Publication(publication.clone()));

        self.ledger.events().emit(LedgerEvent::PricingUpdated {
            publication_id: publication_id.clone(),
            basic_price,
            premium_price,
        });

        info!(
            publication_id = %publication_id,
            basic_price = basic_price,
            premium_price = premium_price,
            "Pricing updated"
        );
        Ok(publication)
    }

    pub async fn toggle_free_tier(
        &self,
        cap: &PublisherCap,
        publication_id: &ObjectId,
        enabled: bool,
    ) -> Result<Publication> {
        cap.authorize(publication_id)?;

        let _tx = self.tx_lock.lock().await;
        let mut publication = self.latest_publication(publication_id)?;
        publication.free_tier_enabled = enabled;
        self.ledger.write(LedgerObject::Publication(publication.clone()));

        self.ledger.events().emit(LedgerEvent::FreeTierToggled {
            publication_id: publication_id.clone(),
            enabled,
        });

        info!(publication_id = %publication_id, enabled = enabled, "Free tier toggled");
        Ok(publication)
    }

    /// Record a certified blob as a new article of the publication
    pub async fn publish_article(
        &self,
        cap: &PublisherCap,
        publication_id: &ObjectId,
        draft: ArticleDraft,
    ) -> Result<Article> {
        cap.authorize(publication_id)?;

        let _tx = self.tx_lock.lock().await;
        let mut publication = self.latest_publication(publication_id)?;
        let article = Article::new(publication_id.clone(), draft, self.clock.now());

        publication.article_count += 1;
        self.ledger.write(LedgerObject::Article(article.clone()));
        self.ledger.write(LedgerObject::Publication(publication));

        self.ledger.events().emit(LedgerEvent::ArticlePublished {
            article_id: article.id.clone(),
            publication_id: publication_id.clone(),
            title: article.title.clone(),
            blob_id: article.blob_id().clone(),
            tier: article.tier,
            published_at: article.published_at,
        });

        info!(
            article_id = %article.id,
            publication_id = %publication_id,
            blob_id = %article.blob_id(),
            tier = %article.tier,
            "Article published"
        );
        Ok(article)
    }

    /// Edit the public metadata of an article. Blob and key stay fixed.
    pub async fn update_article(
        &self,
        cap: &PublisherCap,
        article_id: &ObjectId,
        title: &str,
        excerpt: &str,
    ) -> Result<Article> {
        let _tx = self.tx_lock.lock().await;
        let mut article = self.latest_article(article_id)?;
        cap.authorize(&article.publication_id)?;

        article.title = title.to_string();
        article.excerpt = excerpt.to_string();
        self.ledger.write(LedgerObject::Article(article.clone()));

        self.ledger.events().emit(LedgerEvent::ArticleUpdated {
            article_id: article_id.clone(),
            title: article.title.clone(),
        });

        debug!(article_id = %article_id, "Article updated");
        Ok(article)
    }

    /// Archive an article. A second call fails with `AlreadyArchived`.
    pub async fn archive_article(&self, cap: &PublisherCap, article_id: &ObjectId) -> Result<Article> {
        let _tx = self.tx_lock.lock().await;
        let mut article = self.latest_article(article_id)?;
        cap.authorize(&article.publication_id)?;

        if let Err(e) = article.archive() {
            warn!(article_id = %article_id, "Article already archived");
            return Err(e);
        }
        self.ledger.write(LedgerObject::Article(article.clone()));

        self.ledger.events().emit(LedgerEvent::ArticleArchived {
            article_id: article_id.clone(),
            publication_id: article.publication_id.clone(),
        });

        info!(article_id = %article_id, "Article archived");
        Ok(article)
    }

    // ==================== Reader operations ====================

    pub async fn purchase_subscription(
        &self,
        subscriber: &Address,
        publication_id: &ObjectId,
        tier: Tier,
        payment: u64,
    ) -> Result<SubscriptionNft> {
        let _tx = self.tx_lock.lock().await;
        let publication = self.latest_publication(publication_id)?;

        if tier == Tier::Free && !publication.free_tier_enabled {
            return Err(PressError::TierUnavailable {
                publication_id: publication_id.clone(),
                tier,
            });
        }
        let required = publication.price_for(tier);
        if payment < required {
            return Err(PressError::InsufficientPayment {
                tier,
                required,
                paid: payment,
            });
        }

        let now = self.clock.now();
        let subscription = SubscriptionNft {
            id: ObjectId::generate(),
            publication_id: publication_id.clone(),
            tier,
            subscribed_at: now,
            expires_at: now.plus(self.config.subscription_period_secs),
            subscriber: subscriber.clone(),
        };

        let mut stats = self.latest_stats(publication_id)?;
        stats.record_subscription(tier, payment);

        self.ledger.write(LedgerObject::Subscription(subscription.clone()));
        self.ledger.write(LedgerObject::Stats(stats));

        self.ledger.events().emit(LedgerEvent::SubscriptionCreated {
            subscription_id: subscription.id.clone(),
            publication_id: publication_id.clone(),
            subscriber: subscriber.clone(),
            tier,
            expires_at: subscription.expires_at,
            payment,
        });

        info!(
            subscription_id = %subscription.id,
            publication_id = %publication_id,
            subscriber = %subscriber,
            tier = %tier,
            expires_at = %subscription.expires_at.to_rfc3339(),
            "Subscription purchased"
        );
        Ok(subscription)
    }

    /// Extend a subscription by one period at its own tier.
    ///
    /// The new period starts at the old expiry, or now if that has already
    /// passed, so `expires_at` always strictly increases.
    pub async fn renew_subscription(&self, subscription: &SubscriptionNft, payment: u64) -> Result<SubscriptionNft> {
        let _tx = self.tx_lock.lock().await;
        let mut current = self
            .ledger
            .read_latest(&subscription.id)
            .and_then(LedgerObject::into_subscription)
            .ok_or_else(|| PressError::ObjectNotFound(subscription.id.clone()))?;
        let publication = self.latest_publication(&current.publication_id)?;

        if current.tier == Tier::Free && !publication.free_tier_enabled {
            return Err(PressError::TierUnavailable {
                publication_id: publication.id.clone(),
                tier: current.tier,
            });
        }
        let required = publication.price_for(current.tier);
        if payment < required {
            return Err(PressError::TierMismatch {
                tier: current.tier,
                required,
                paid: payment,
            });
        }

        let now = self.clock.now();
        let base = current.expires_at.max(now);
        current.expires_at = base.plus(self.config.subscription_period_secs);

        let mut stats = self.latest_stats(&current.publication_id)?;
        stats.record_revenue(payment);

        self.ledger.write(LedgerObject::Subscription(current.clone()));
        self.ledger.write(LedgerObject::Stats(stats));

        self.ledger.events().emit(LedgerEvent::SubscriptionRenewed {
            subscription_id: current.id.clone(),
            publication_id: current.publication_id.clone(),
            expires_at: current.expires_at,
            payment,
        });

        info!(
            subscription_id = %current.id,
            tier = %current.tier,
            expires_at = %current.expires_at.to_rfc3339(),
            "Subscription renewed"
        );
        Ok(current)
    }

    /// Sell a short-lived read token for one article
    pub async fn issue_read_token(&self, reader: &Address, article_id: &ObjectId, payment: u64) -> Result<ReadToken> {
        let _tx = self.tx_lock.lock().await;
        let article = self.latest_article(article_id)?;
        let publication = self.latest_publication(&article.publication_id)?;

        let required = publication.read_token_price(
            article.tier,
            self.config.read_token_ttl_secs,
            self.config.subscription_period_secs,
        );
        if payment < required {
            return Err(PressError::InsufficientPayment {
                tier: article.tier,
                required,
                paid: payment,
            });
        }

        let now = self.clock.now();
        let token = ReadToken {
            id: ObjectId::generate(),
            article_id: article_id.clone(),
            reader: reader.clone(),
            created_at: now,
            expires_at: now.plus(self.config.read_token_ttl_secs),
        };

        let mut stats = self.latest_stats(&article.publication_id)?;
        stats.record_read_token(payment);

        self.ledger.write(LedgerObject::ReadToken(token.clone()));
        self.ledger.write(LedgerObject::Stats(stats));

        self.ledger.events().emit(LedgerEvent::ReadTokenGenerated {
            token_id: token.id.clone(),
            article_id: article_id.clone(),
            reader: reader.clone(),
            expires_at: token.expires_at,
            payment,
        });

        info!(
            token_id = %token.id,
            article_id = %article_id,
            reader = %reader,
            expires_at = %token.expires_at.to_rfc3339(),
            "Read token issued"
        );
        Ok(token)
    }

    /// Count a successful read
    pub async fn record_view(&self, article_id: &ObjectId) -> Result<()> {
        let _tx = self.tx_lock.lock().await;
        let article = self.latest_article(article_id)?;
        let mut stats = self.latest_stats(&article.publication_id)?;
        stats.record_view();
        self.ledger.write(LedgerObject::Stats(stats));
        debug!(article_id = %article_id, "View recorded");
        Ok(())
    }

    // ==================== Indexed reads (may lag) ====================

    pub fn publication(&self, id: &ObjectId) -> Result<Publication> {
        self.ledger
            .get_object(id)
            .and_then(LedgerObject::into_publication)
            .ok_or_else(|| PressError::ObjectNotFound(id.clone()))
    }

    pub fn article(&self, id: &ObjectId) -> Result<Article> {
        self.ledger
            .get_object(id)
            .and_then(LedgerObject::into_article)
            .ok_or_else(|| PressError::ObjectNotFound(id.clone()))
    }

    pub fn stats(&self, publication_id: &ObjectId) -> Result<PublicationStats> {
        let stats_id = self
            .stats_index
            .get(publication_id)
            .map(|id| id.value().clone())
            .ok_or_else(|| PressError::ObjectNotFound(publication_id.clone()))?;
        self.ledger
            .get_object(&stats_id)
            .and_then(LedgerObject::into_stats)
            .ok_or(PressError::ObjectNotFound(stats_id))
    }

    /// Visible, non-archived articles of a publication, newest first
    pub fn list_articles(&self, publication_id: &ObjectId) -> Vec<Article> {
        let mut articles: Vec<Article> = self
            .ledger
            .visible_where(|o| matches!(o, LedgerObject::Article(a) if &a.publication_id == publication_id))
            .into_iter()
            .filter_map(LedgerObject::into_article)
            .filter(|a| !a.is_archived())
            .collect();
        articles.sort_by(|a, b| b.published_at.cmp(&a.published_at).then_with(|| a.id.cmp(&b.id)));
        articles
    }

    /// Visible subscriptions `reader` holds for a publication
    pub fn subscriptions_of(&self, reader: &Address, publication_id: &ObjectId) -> Vec<SubscriptionNft> {
        self.ledger
            .owned_by(reader)
            .into_iter()
            .filter_map(LedgerObject::into_subscription)
            .filter(|s| &s.publication_id == publication_id)
            .collect()
    }

    /// Visible read tokens `reader` holds for an article
    pub fn read_tokens_of(&self, reader: &Address, article_id: &ObjectId) -> Vec<ReadToken> {
        self.ledger
            .owned_by(reader)
            .into_iter()
            .filter_map(LedgerObject::into_read_token)
            .filter(|t| &t.article_id == article_id)
            .collect()
    }

    // ==================== Proof verification (authoritative) ====================

    /// Re-check a specific entitlement proof against the latest ledger state.
    ///
    /// This is what the key service trusts; the resolver's own decision is
    /// not consulted.
    pub fn verify_entitlement(
        &self,
        reader: &Address,
        article_id: &ObjectId,
        proof: &EntitlementProof,
        now: UnixSecs,
    ) -> Result<EntitlementPath> {
        let article = self.latest_article(article_id)?;
        let publication = self.latest_publication(&article.publication_id)?;

        let outcome = match proof {
            EntitlementProof::FreeTier {
                article_id: proof_article,
            } => {
                if proof_article != article_id {
                    Err(access::CheckFailure::ProofForOtherArticle {
                        object_id: proof_article.clone(),
                    })
                } else {
                    access::check_free(&publication, &article)
                }
            }
            EntitlementProof::Subscription { subscription_id } => {
                match self
                    .ledger
                    .read_latest(subscription_id)
                    .and_then(LedgerObject::into_subscription)
                {
                    None => Err(access::CheckFailure::ProofNotFound {
                        object_id: subscription_id.clone(),
                    }),
                    Some(sub) if &sub.subscriber != reader => Err(access::CheckFailure::NotOwner {
                        object_id: subscription_id.clone(),
                    }),
                    Some(sub) => access::check_subscription(&sub, &article, now),
                }
            }
            EntitlementProof::ReadToken { token_id } => {
                match self.ledger.read_latest(token_id).and_then(LedgerObject::into_read_token) {
                    None => Err(access::CheckFailure::ProofNotFound {
                        object_id: token_id.clone(),
                    }),
                    Some(token) if &token.reader != reader => Err(access::CheckFailure::NotOwner {
                        object_id: token_id.clone(),
                    }),
                    Some(token) => access::check_read_token(&token, &article, now),
                }
            }
        };

        match outcome {
            Ok(()) => Ok(proof.path()),
            Err(failure) => Err(PressError::NoValidEntitlement(Box::new(Denial {
                reader: reader.clone(),
                article_id: article_id.clone(),
                publication_id: article.publication_id.clone(),
                required_tier: article.tier,
                checks: vec![PathCheck {
                    path: proof.path(),
                    failure,
                }],
            }))),
        }
    }

    // ==================== Authoritative helpers ====================

    fn latest_publication(&self, id: &ObjectId) -> Result<Publication> {
        self.ledger
            .read_latest(id)
            .and_then(LedgerObject::into_publication)
            .ok_or_else(|| PressError::ObjectNotFound(id.clone()))
    }

    pub(crate) fn latest_article(&self, id: &ObjectId) -> Result<Article> {
        self.ledger
            .read_latest(id)
            .and_then(LedgerObject::into_article)
            .ok_or_else(|| PressError::ObjectNotFound(id.clone()))
    }

    fn latest_stats(&self, publication_id: &ObjectId) -> Result<PublicationStats> {
        if let Some(stats_id) = self.stats_index.get(publication_id) {
            if let Some(stats) = self.ledger.read_latest(&stats_id).and_then(LedgerObject::into_stats) {
                return Ok(stats);
            }
        }
        // Index is rebuilt from the ledger if this store did not create the publication
        self.ledger
            .latest_where(|o| matches!(o, LedgerObject::Stats(s) if &s.publication_id == publication_id))
            .into_iter()
            .find_map(LedgerObject::into_stats)
            .map(|stats| {
                self.stats_index.insert(publication_id.clone(), stats.id.clone());
                stats
            })
            .ok_or_else(|| PressError::ObjectNotFound(publication_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::{LocalSigner, Signer};

    const START: UnixSecs = UnixSecs(1_700_000_000);

    struct Fixture {
        store: EntitlementStore,
        clock: Arc<ManualClock>,
        creator: Address,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(START));
        let store = EntitlementStore::new(Arc::new(Ledger::immediate()), clock.clone(), EntitlementConfig::default());
        Fixture {
            store,
            clock,
            creator: LocalSigner::generate().address(),
        }
    }

    fn params(basic: u64, premium: u64, free: bool) -> NewPublication {
        NewPublication {
            name: "Dispatches".into(),
            description: "Weekly notes".into(),
            basic_price: basic,
            premium_price: premium,
            free_tier_enabled: free,
        }
    }

    fn draft(tier: Tier) -> ArticleDraft {
        ArticleDraft {
            title: "On capabilities".into(),
            excerpt: "Possession is authorization.".into(),
            blob_id: crate::blob::BlobId::from("blob-1"),
            key_id: crate::entitlement::KeyId::new("key-1"),
            content_identifier: "on-capabilities".into(),
            tier,
        }
    }

    #[tokio::test]
    async fn test_create_publication_rejects_inverted_pricing() {
        let f = fixture();
        let err = f.store.create_publication(&f.creator, params(5, 1, false)).await.unwrap_err();
        assert!(matches!(err, PressError::InvalidPricing { basic: 5, premium: 1 }));
        assert!(f.store.ledger().events().history().is_empty());
    }

    #[tokio::test]
    async fn test_update_pricing_keeps_old_prices_on_rejection() {
        let f = fixture();
        let (publication, cap) = f.store.create_publication(&f.creator, params(10, 20, false)).await.unwrap();

        let err = f.store.update_pricing(&cap, &publication.id, 30, 25).await.unwrap_err();
        assert!(matches!(err, PressError::InvalidPricing { .. }));
        let current = f.store.publication(&publication.id).unwrap();
        assert_eq!((current.basic_price, current.premium_price), (10, 20));

        let updated = f.store.update_pricing(&cap, &publication.id, 30, 30).await.unwrap();
        assert_eq!((updated.basic_price, updated.premium_price), (30, 30));
        assert_eq!(f.store.ledger().events().count("PricingUpdated"), 1);
    }

    #[tokio::test]
    async fn test_foreign_cap_is_unauthorized() {
        let f = fixture();
        let (first, _first_cap) = f.store.create_publication(&f.creator, params(1, 2, false)).await.unwrap();
        let (_second, second_cap) = f.store.create_publication(&f.creator, params(1, 2, false)).await.unwrap();

        let err = f.store.update_pricing(&second_cap, &first.id, 3, 4).await.unwrap_err();
        assert!(matches!(err, PressError::Unauthorized { .. }));

        let err = f.store.publish_article(&second_cap, &first.id, draft(Tier::Basic)).await.unwrap_err();
        assert!(matches!(err, PressError::Unauthorized { .. }));

        let err = f.store.toggle_free_tier(&second_cap, &first.id, true).await.unwrap_err();
        assert!(matches!(err, PressError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_publish_increments_article_count() {
        let f = fixture();
        let (publication, cap) = f.store.create_publication(&f.creator, params(1, 2, false)).await.unwrap();

        let article = f.store.publish_article(&cap, &publication.id, draft(Tier::Premium)).await.unwrap();
        f.store.publish_article(&cap, &publication.id, draft(Tier::Basic)).await.unwrap();

        assert_eq!(f.store.publication(&publication.id).unwrap().article_count, 2);
        assert_eq!(article.published_at, START);
        assert_eq!(article.blob_id().as_str(), "blob-1");
        assert_eq!(f.store.ledger().events().count("ArticlePublished"), 2);
    }

    #[tokio::test]
    async fn test_archive_twice_reports_already_archived() {
        let f = fixture();
        let (publication, cap) = f.store.create_publication(&f.creator, params(1, 2, false)).await.unwrap();
        let article = f.store.publish_article(&cap, &publication.id, draft(Tier::Basic)).await.unwrap();

        let archived = f.store.archive_article(&cap, &article.id).await.unwrap();
        assert!(archived.is_archived());

        let err = f.store.archive_article(&cap, &article.id).await.unwrap_err();
        assert!(matches!(err, PressError::AlreadyArchived(ref id) if id == &article.id));

        assert!(f.store.article(&article.id).unwrap().is_archived());
        assert_eq!(f.store.ledger().events().count("ArticleArchived"), 1);
        assert!(f.store.list_articles(&publication.id).is_empty());
        // archived articles stay published
        assert_eq!(f.store.publication(&publication.id).unwrap().article_count, 1);
    }

    #[tokio::test]
    async fn test_update_article_keeps_blob_and_key() {
        let f = fixture();
        let (publication, cap) = f.store.create_publication(&f.creator, params(1, 2, false)).await.unwrap();
        let article = f.store.publish_article(&cap, &publication.id, draft(Tier::Basic)).await.unwrap();

        let updated = f.store.update_article(&cap, &article.id, "Revised", "New excerpt").await.unwrap();
        assert_eq!(updated.title, "Revised");
        assert_eq!(updated.blob_id(), article.blob_id());
        assert_eq!(updated.key_id(), article.key_id());
    }

    #[tokio::test]
    async fn test_free_tier_requires_enabled_flag() {
        let f = fixture();
        let reader = LocalSigner::generate().address();
        let (publication, cap) = f.store.create_publication(&f.creator, params(1, 2, false)).await.unwrap();

        let err = f
            .store
            .purchase_subscription(&reader, &publication.id, Tier::Free, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, PressError::TierUnavailable { tier: Tier::Free, .. }));

        f.store.toggle_free_tier(&cap, &publication.id, true).await.unwrap();
        let sub = f
            .store
            .purchase_subscription(&reader, &publication.id, Tier::Free, 0)
            .await
            .unwrap();
        assert_eq!(sub.tier, Tier::Free);
        assert_eq!(f.store.stats(&publication.id).unwrap().free_subscriptions, 1);
    }

    #[tokio::test]
    async fn test_renewal_extends_strictly_and_checks_own_tier_price() {
        let f = fixture();
        let reader = LocalSigner::generate().address();
        let (publication, _cap) = f.store.create_publication(&f.creator, params(100, 500, false)).await.unwrap();
        let sub = f
            .store
            .purchase_subscription(&reader, &publication.id, Tier::Premium, 500)
            .await
            .unwrap();

        let err = f.store.renew_subscription(&sub, 100).await.unwrap_err();
        assert!(matches!(
            err,
            PressError::TierMismatch {
                tier: Tier::Premium,
                required: 500,
                paid: 100
            }
        ));

        let renewed = f.store.renew_subscription(&sub, 500).await.unwrap();
        assert_eq!(renewed.tier, Tier::Premium);
        assert_eq!(
            renewed.expires_at,
            sub.expires_at.plus(DEFAULT_SUBSCRIPTION_PERIOD_SECS)
        );

        // lapsed subscriptions restart from now
        f.clock.advance(10 * DEFAULT_SUBSCRIPTION_PERIOD_SECS);
        let lapsed = f.store.renew_subscription(&renewed, 500).await.unwrap();
        assert!(lapsed.expires_at > renewed.expires_at);
        assert!(!lapsed.is_expired(f.clock.now()));

        let stats = f.store.stats(&publication.id).unwrap();
        assert_eq!(stats.premium_subscriptions, 1);
        assert_eq!(stats.total_revenue, 1_500);
        assert_eq!(f.store.ledger().events().count("SubscriptionRenewed"), 2);
    }

    #[tokio::test]
    async fn test_read_token_is_short_lived_and_priced() {
        let f = fixture();
        let reader = LocalSigner::generate().address();
        let (publication, cap) = f.store.create_publication(&f.creator, params(3_000, 9_000, false)).await.unwrap();
        let article = f.store.publish_article(&cap, &publication.id, draft(Tier::Premium)).await.unwrap();

        let err = f.store.issue_read_token(&reader, &article.id, 299).await.unwrap_err();
        assert!(matches!(err, PressError::InsufficientPayment { required: 300, .. }));

        let token = f.store.issue_read_token(&reader, &article.id, 300).await.unwrap();
        assert_eq!(token.expires_at, START.plus(DEFAULT_READ_TOKEN_TTL_SECS));
        assert_eq!(f.store.read_tokens_of(&reader, &article.id).len(), 1);
        assert_eq!(f.store.stats(&publication.id).unwrap().read_tokens_issued, 1);
    }

    #[tokio::test]
    async fn test_verify_entitlement_rejects_borrowed_subscription() {
        let f = fixture();
        let owner = LocalSigner::generate().address();
        let borrower = LocalSigner::generate().address();
        let (publication, cap) = f.store.create_publication(&f.creator, params(1, 2, false)).await.unwrap();
        let article = f.store.publish_article(&cap, &publication.id, draft(Tier::Basic)).await.unwrap();
        let sub = f
            .store
            .purchase_subscription(&owner, &publication.id, Tier::Basic, 1)
            .await
            .unwrap();

        let proof = EntitlementProof::Subscription {
            subscription_id: sub.id.clone(),
        };
        assert_eq!(
            f.store.verify_entitlement(&owner, &article.id, &proof, f.clock.now()).unwrap(),
            EntitlementPath::Subscription
        );

        let err = f
            .store
            .verify_entitlement(&borrower, &article.id, &proof, f.clock.now())
            .unwrap_err();
        let denial = err.denial().unwrap();
        assert!(matches!(denial.checks[0].failure, access::CheckFailure::NotOwner { .. }));
    }

    #[tokio::test]
    async fn test_record_view_counts() {
        let f = fixture();
        let (publication, cap) = f.store.create_publication(&f.creator, params(1, 2, false)).await.unwrap();
        let article = f.store.publish_article(&cap, &publication.id, draft(Tier::Basic)).await.unwrap();

        f.store.record_view(&article.id).await.unwrap();
        f.store.record_view(&article.id).await.unwrap();
        assert_eq!(f.store.stats(&publication.id).unwrap().total_views, 2);
    }
}

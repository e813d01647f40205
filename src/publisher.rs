//! Publisher flow: store ciphertext, then record articles
//!
//! Encryption happens before this point. The publisher hands over sealed
//! bytes plus the key group they were sealed under; this module gets them
//! certified in blob storage and only then writes the articles that point
//! at them.

use std::sync::Arc;
use tracing::info;

use crate::blob::{BlobPipeline, CertifiedBlob};
use crate::entitlement::{
    Article, ArticleDraft, EntitlementStore, KeyId, NewPublication, ObjectId, Publication, PublisherCap, Tier,
};
use crate::error::{PressError, Result};
use crate::identity::Signer;

/// One sealed article ready to publish
#[derive(Debug, Clone)]
pub struct SealedArticle {
    pub title: String,
    pub excerpt: String,
    pub tier: Tier,
    pub key_id: KeyId,
    /// Entry name inside the blob container. Must be unique per batch.
    pub identifier: String,
    pub ciphertext: Vec<u8>,
}

pub struct Publisher {
    store: Arc<EntitlementStore>,
    pipeline: Arc<BlobPipeline>,
    signer: Arc<dyn Signer>,
    epochs: u32,
    deletable: bool,
}

impl Publisher {
    pub fn new(
        store: Arc<EntitlementStore>,
        pipeline: Arc<BlobPipeline>,
        signer: Arc<dyn Signer>,
        epochs: u32,
        deletable: bool,
    ) -> Self {
        Self {
            store,
            pipeline,
            signer,
            epochs,
            deletable,
        }
    }

    pub async fn create_publication(&self, params: NewPublication) -> Result<(Publication, PublisherCap)> {
        self.store.create_publication(&self.signer.address(), params).await
    }

    pub async fn publish(&self, cap: &PublisherCap, publication_id: &ObjectId, article: SealedArticle) -> Result<Article> {
        self.publish_many(cap, publication_id, vec![article])
            .await?
            .pop()
            .ok_or_else(|| PressError::Internal("publish produced no article".into()))
    }

    /// Pack several articles into one blob, then record each of them.
    ///
    /// Nothing is written to the ledger unless the blob is certified.
    pub async fn publish_many(
        &self,
        cap: &PublisherCap,
        publication_id: &ObjectId,
        articles: Vec<SealedArticle>,
    ) -> Result<Vec<Article>> {
        cap.authorize(publication_id)?;

        let encoded = BlobPipeline::encode(
            articles
                .iter()
                .map(|a| (a.identifier.clone(), a.ciphertext.clone())),
        )?;
        let certified: CertifiedBlob = self
            .pipeline
            .store(encoded, self.signer.as_ref(), self.epochs, self.deletable)
            .await?;

        let mut published = Vec::with_capacity(articles.len());
        for article in articles {
            let draft = ArticleDraft {
                title: article.title,
                excerpt: article.excerpt,
                blob_id: certified.blob_id.clone(),
                key_id: article.key_id,
                content_identifier: article.identifier,
                tier: article.tier,
            };
            published.push(self.store.publish_article(cap, publication_id, draft).await?);
        }

        info!(
            publication_id = %publication_id,
            blob_id = %certified.blob_id,
            articles = published.len(),
            "Published articles"
        );
        Ok(published)
    }
}

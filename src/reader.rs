//! Reader flow: resolve, release key, fetch ciphertext
//!
//! Decryption is left to the caller, which receives the sealed bytes
//! together with the released key shares.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::access::{AccessAttempt, AccessResolver, EntitlementPath, KeyRelease};
use crate::blob::BlobPipeline;
use crate::clock::Clock;
use crate::entitlement::{Article, ObjectId};
use crate::error::Result;
use crate::session::SessionManager;

/// Everything the caller needs to decrypt an article locally
#[derive(Debug, Clone)]
pub struct OpenedArticle {
    pub article: Article,
    pub path: EntitlementPath,
    pub key: KeyRelease,
    pub ciphertext: Vec<u8>,
}

pub struct ArticleReader {
    resolver: Arc<AccessResolver>,
    pipeline: Arc<BlobPipeline>,
    session: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
}

impl ArticleReader {
    pub fn new(
        resolver: Arc<AccessResolver>,
        pipeline: Arc<BlobPipeline>,
        session: Arc<SessionManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resolver,
            pipeline,
            session,
            clock,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Open an article with the current session.
    ///
    /// Fails with `SessionExpired` or `SessionNotReady` rather than prompting;
    /// call [`SessionManager::initialize`] first.
    pub async fn open(&self, article_id: &ObjectId) -> Result<OpenedArticle> {
        self.open_traced(article_id).await.1
    }

    /// Like [`ArticleReader::open`], also returning the access attempt record
    pub async fn open_traced(&self, article_id: &ObjectId) -> (Option<AccessAttempt>, Result<OpenedArticle>) {
        let session = match self.session.current().await {
            Ok(session) => session,
            Err(e) => return (None, Err(e)),
        };

        let (attempt, outcome) = self.resolver.access(&session, article_id, self.clock.now()).await;
        let (grant, key) = match outcome {
            Ok(granted) => granted,
            Err(e) => return (Some(attempt), Err(e)),
        };

        debug!(
            article_id = %article_id,
            blob_id = %grant.article.blob_id(),
            identifier = %grant.article.content_identifier(),
            "Fetching ciphertext"
        );
        let ciphertext = match self
            .pipeline
            .read(grant.article.blob_id(), grant.article.content_identifier())
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => return (Some(attempt), Err(e)),
        };

        // The key is already out; a lost view count must not withhold the content
        if let Err(e) = self.resolver.store().record_view(article_id).await {
            warn!(article_id = %article_id, error = %e, "Failed to record view");
        }

        info!(
            reader = %session.reader,
            article_id = %article_id,
            path = %grant.path,
            size = ciphertext.len(),
            "Article opened"
        );

        (
            Some(attempt),
            Ok(OpenedArticle {
                article: grant.article,
                path: grant.path,
                key,
                ciphertext,
            }),
        )
    }
}

//! Entitlement resolution and key request

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::key_service::{KeyRelease, KeyReleaseClient, KeyRequest};
use super::{
    check_free, check_read_token, check_subscription, CheckFailure, Denial, EntitlementPath, EntitlementProof,
    PathCheck,
};
use crate::clock::UnixSecs;
use crate::entitlement::{Article, EntitlementStore, ObjectId};
use crate::error::{PressError, Result};
use crate::identity::Address;
use crate::retry::{poll_visible, RetryPolicy};
use crate::session::SessionKey;

/// A positive resolution and the proof that justified it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub reader: Address,
    pub article: Article,
    pub path: EntitlementPath,
    pub proof: EntitlementProof,
    pub resolved_at: UnixSecs,
}

/// Where one access attempt currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    Unresolved,
    Granted(EntitlementPath),
    Denied,
    KeyRequested,
    KeyReleased,
    KeyDenied,
}

impl AccessState {
    fn can_move_to(self, next: AccessState) -> bool {
        use AccessState::*;
        matches!(
            (self, next),
            (Unresolved, Granted(_)) | (Unresolved, Denied) | (Granted(_), KeyRequested) | (KeyRequested, KeyReleased)
                | (KeyRequested, KeyDenied)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AccessState::Denied | AccessState::KeyReleased | AccessState::KeyDenied)
    }
}

/// Record of one reader asking for one article
#[derive(Debug, Clone)]
pub struct AccessAttempt {
    pub reader: Address,
    pub article_id: ObjectId,
    history: Vec<AccessState>,
}

impl AccessAttempt {
    pub fn new(reader: Address, article_id: ObjectId) -> Self {
        Self {
            reader,
            article_id,
            history: vec![AccessState::Unresolved],
        }
    }

    pub fn state(&self) -> AccessState {
        self.history.last().copied().unwrap_or(AccessState::Unresolved)
    }

    /// Every state visited, oldest first
    pub fn history(&self) -> &[AccessState] {
        &self.history
    }

    fn advance(&mut self, next: AccessState) -> Result<()> {
        let current = self.state();
        if !current.can_move_to(next) {
            return Err(PressError::Internal(format!(
                "access attempt cannot move from {current:?} to {next:?}"
            )));
        }
        debug!(reader = %self.reader, article_id = %self.article_id, state = ?next, "Access state changed");
        self.history.push(next);
        Ok(())
    }
}

pub struct AccessResolver {
    store: Arc<EntitlementStore>,
    keys: KeyReleaseClient,
    visibility: RetryPolicy,
}

impl AccessResolver {
    pub fn new(store: Arc<EntitlementStore>, keys: KeyReleaseClient, visibility: RetryPolicy) -> Self {
        Self {
            store,
            keys,
            visibility,
        }
    }

    pub fn store(&self) -> &Arc<EntitlementStore> {
        &self.store
    }

    /// Decide whether `reader` may read `article_id` at `now`.
    ///
    /// Paths are tried in order free, subscription, read token. The first
    /// that passes wins. A denial lists every path and why it failed.
    pub async fn resolve(&self, reader: &Address, article_id: &ObjectId, now: UnixSecs) -> Result<Grant> {
        let store = &self.store;
        let article = poll_visible(&self.visibility, "article", || async move { store.article(article_id) }).await?;
        let publication_id = &article.publication_id;
        let publication =
            poll_visible(&self.visibility, "publication", || async move { store.publication(publication_id) }).await?;

        let mut checks = Vec::new();
        let grant = |path: EntitlementPath, proof: EntitlementProof| {
            info!(
                reader = %reader,
                article_id = %article_id,
                path = %path,
                proof = %proof.object_id(),
                "Access granted"
            );
            Grant {
                reader: reader.clone(),
                article: article.clone(),
                path,
                proof,
                resolved_at: now,
            }
        };

        match check_free(&publication, &article) {
            Ok(()) => {
                return Ok(grant(
                    EntitlementPath::Free,
                    EntitlementProof::FreeTier {
                        article_id: article_id.clone(),
                    },
                ))
            }
            Err(failure) => checks.push(PathCheck {
                path: EntitlementPath::Free,
                failure,
            }),
        }

        // Holdings bought moments ago may still be invisible; keep looking
        // under the visibility budget before denying.
        let max_attempts = self.visibility.max_attempts.max(1);
        let mut attempt = 1;
        let held = loop {
            match self.check_holdings(reader, &article, now) {
                Ok(found) => break Ok(found),
                Err(failed) if attempt >= max_attempts => break Err(failed),
                Err(_) => {
                    let delay = self.visibility.delay_after(attempt);
                    debug!(
                        reader = %reader,
                        article_id = %article_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "No usable holding visible yet, polling"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };
        match held {
            Ok((path, proof)) => return Ok(grant(path, proof)),
            Err(failed) => checks.extend(failed),
        }

        let denial = Denial {
            reader: reader.clone(),
            article_id: article_id.clone(),
            publication_id: publication_id.clone(),
            required_tier: article.tier,
            checks,
        };
        info!(reader = %reader, article_id = %article_id, denial = %denial, "Access denied");
        Err(PressError::NoValidEntitlement(Box::new(denial)))
    }

    /// Subscription then read-token paths against the lagged view
    fn check_holdings(
        &self,
        reader: &Address,
        article: &Article,
        now: UnixSecs,
    ) -> std::result::Result<(EntitlementPath, EntitlementProof), Vec<PathCheck>> {
        let mut checks = Vec::new();

        let subscriptions = self.store.subscriptions_of(reader, &article.publication_id);
        if subscriptions.is_empty() {
            checks.push(PathCheck {
                path: EntitlementPath::Subscription,
                failure: CheckFailure::NoSubscription,
            });
        }
        for subscription in &subscriptions {
            match check_subscription(subscription, article, now) {
                Ok(()) => {
                    return Ok((
                        EntitlementPath::Subscription,
                        EntitlementProof::Subscription {
                            subscription_id: subscription.id.clone(),
                        },
                    ))
                }
                Err(failure) => checks.push(PathCheck {
                    path: EntitlementPath::Subscription,
                    failure,
                }),
            }
        }

        let tokens = self.store.read_tokens_of(reader, &article.id);
        if tokens.is_empty() {
            checks.push(PathCheck {
                path: EntitlementPath::ReadToken,
                failure: CheckFailure::NoReadToken,
            });
        }
        for token in &tokens {
            match check_read_token(token, article, now) {
                Ok(()) => {
                    return Ok((
                        EntitlementPath::ReadToken,
                        EntitlementProof::ReadToken {
                            token_id: token.id.clone(),
                        },
                    ))
                }
                Err(failure) => checks.push(PathCheck {
                    path: EntitlementPath::ReadToken,
                    failure,
                }),
            }
        }

        Err(checks)
    }

    /// Present the grant's proof to the key servers
    pub async fn request_key(&self, grant: &Grant, session: &SessionKey) -> Result<KeyRelease> {
        if session.reader != grant.reader {
            return Err(PressError::SessionNotReady(format!(
                "session belongs to {}, grant to {}",
                session.reader, grant.reader
            )));
        }
        let request = KeyRequest {
            key_id: grant.article.key_id().clone(),
            article_id: grant.article.id.clone(),
            proof: grant.proof.clone(),
            session: session.clone(),
        };
        self.keys.request(&request).await
    }

    /// Resolve and, if granted, request the key, recording every state
    pub async fn access(
        &self,
        session: &SessionKey,
        article_id: &ObjectId,
        now: UnixSecs,
    ) -> (AccessAttempt, Result<(Grant, KeyRelease)>) {
        let mut attempt = AccessAttempt::new(session.reader.clone(), article_id.clone());
        let outcome = self.drive(&mut attempt, session, article_id, now).await;
        if let Err(e) = &outcome {
            warn!(reader = %session.reader, article_id = %article_id, state = ?attempt.state(), error = %e, "Access attempt failed");
        }
        (attempt, outcome)
    }

    async fn drive(
        &self,
        attempt: &mut AccessAttempt,
        session: &SessionKey,
        article_id: &ObjectId,
        now: UnixSecs,
    ) -> Result<(Grant, KeyRelease)> {
        let grant = match self.resolve(&session.reader, article_id, now).await {
            Ok(grant) => grant,
            Err(e @ PressError::NoValidEntitlement(_)) => {
                attempt.advance(AccessState::Denied)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        attempt.advance(AccessState::Granted(grant.path))?;

        attempt.advance(AccessState::KeyRequested)?;
        match self.request_key(&grant, session).await {
            Ok(release) => {
                attempt.advance(AccessState::KeyReleased)?;
                Ok((grant, release))
            }
            Err(e) => {
                attempt.advance(AccessState::KeyDenied)?;
                Err(e)
            }
        }
    }
}

//! Threshold key release
//!
//! Decryption keys are split across several key servers. Each server
//! independently checks the reader's session and entitlement proof against
//! the latest ledger state before returning its share. The client gathers
//! shares until it has `threshold` of them.
//!
//! Any explicit rejection ends the request immediately: a server that sees
//! an entitlement mismatch is not outvoted by the others. Unreachable
//! servers are retried with backoff up to the attempt budget.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::EntitlementProof;
use crate::clock::Clock;
use crate::entitlement::{EntitlementStore, KeyId, ObjectId};
use crate::error::{PressError, Result};
use crate::retry::RetryPolicy;
use crate::session::SessionKey;

/// What a reader presents to every key server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key_id: KeyId,
    pub article_id: ObjectId,
    pub proof: EntitlementProof,
    pub session: SessionKey,
}

/// One server's share of a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare {
    pub server_id: String,
    pub key_id: KeyId,
    /// Hex share material, opaque to this crate
    pub share: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyServerError {
    #[error("key server {0} unavailable")]
    Unavailable(String),

    #[error("key server {server_id} rejected the request: {reason}")]
    Rejected { server_id: String, reason: String },
}

#[async_trait]
pub trait KeyServer: Send + Sync {
    fn server_id(&self) -> &str;

    async fn release(&self, request: &KeyRequest) -> std::result::Result<KeyShare, KeyServerError>;
}

/// Why the key was not released
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyDenial {
    Rejected {
        server_id: String,
        reason: String,
    },
    InsufficientShares {
        received: usize,
        threshold: usize,
        attempts: u32,
    },
}

impl fmt::Display for KeyDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyDenial::Rejected { server_id, reason } => write!(f, "rejected by {server_id}: {reason}"),
            KeyDenial::InsufficientShares {
                received,
                threshold,
                attempts,
            } => write!(
                f,
                "{received} of {threshold} required shares after {attempts} attempts"
            ),
        }
    }
}

/// Enough shares to reconstruct the key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRelease {
    pub key_id: KeyId,
    pub article_id: ObjectId,
    pub threshold: usize,
    /// Sorted by server id
    pub shares: Vec<KeyShare>,
}

pub struct KeyReleaseClient {
    servers: Vec<Arc<dyn KeyServer>>,
    threshold: usize,
    policy: RetryPolicy,
}

impl KeyReleaseClient {
    pub fn new(servers: Vec<Arc<dyn KeyServer>>, threshold: usize, policy: RetryPolicy) -> Result<Self> {
        if threshold == 0 || threshold > servers.len() {
            return Err(PressError::Config(format!(
                "key threshold {threshold} is not reachable with {} servers",
                servers.len()
            )));
        }
        Ok(Self {
            servers,
            threshold,
            policy,
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Collect `threshold` shares or fail with [`PressError::KeyDenied`]
    pub async fn request(&self, request: &KeyRequest) -> Result<KeyRelease> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut shares: BTreeMap<String, KeyShare> = BTreeMap::new();

        for attempt in 1..=max_attempts {
            let pending: Vec<&Arc<dyn KeyServer>> = self
                .servers
                .iter()
                .filter(|s| !shares.contains_key(s.server_id()))
                .collect();

            let results = join_all(pending.iter().map(|server| server.release(request))).await;

            for result in results {
                match result {
                    Ok(share) => {
                        debug!(server_id = %share.server_id, key_id = %share.key_id, "Key share received");
                        shares.insert(share.server_id.clone(), share);
                    }
                    Err(KeyServerError::Rejected { server_id, reason }) => {
                        warn!(
                            server_id = %server_id,
                            article_id = %request.article_id,
                            reason = %reason,
                            "Key server rejected request"
                        );
                        return Err(PressError::KeyDenied(KeyDenial::Rejected { server_id, reason }));
                    }
                    Err(KeyServerError::Unavailable(server_id)) => {
                        debug!(server_id = %server_id, attempt = attempt, "Key server unavailable");
                    }
                }
            }

            if shares.len() >= self.threshold {
                info!(
                    article_id = %request.article_id,
                    key_id = %request.key_id,
                    shares = shares.len(),
                    threshold = self.threshold,
                    "Key released"
                );
                return Ok(KeyRelease {
                    key_id: request.key_id.clone(),
                    article_id: request.article_id.clone(),
                    threshold: self.threshold,
                    shares: shares.into_values().collect(),
                });
            }

            if attempt < max_attempts {
                let delay = self.policy.delay_after(attempt);
                warn!(
                    received = shares.len(),
                    threshold = self.threshold,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Not enough key shares yet, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(PressError::KeyDenied(KeyDenial::InsufficientShares {
            received: shares.len(),
            threshold: self.threshold,
            attempts: max_attempts,
        }))
    }
}

/// In-process key server that checks entitlement against the ledger
pub struct LocalKeyServer {
    server_id: String,
    secret: [u8; 32],
    store: Arc<EntitlementStore>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl LocalKeyServer {
    pub fn new(server_id: impl Into<String>, store: Arc<EntitlementStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            server_id: server_id.into(),
            secret: rand::random(),
            store,
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the server going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn share_for(&self, key_id: &KeyId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(key_id.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn reject(&self, reason: impl Into<String>) -> KeyServerError {
        KeyServerError::Rejected {
            server_id: self.server_id.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl KeyServer for LocalKeyServer {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn release(&self, request: &KeyRequest) -> std::result::Result<KeyShare, KeyServerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(KeyServerError::Unavailable(self.server_id.clone()));
        }

        let now = self.clock.now();
        request
            .session
            .verify(now)
            .map_err(|e| self.reject(format!("session: {e}")))?;

        let reader = &request.session.reader;
        self.store
            .verify_entitlement(reader, &request.article_id, &request.proof, now)
            .map_err(|e| self.reject(e.to_string()))?;

        let article = self
            .store
            .latest_article(&request.article_id)
            .map_err(|e| self.reject(e.to_string()))?;
        if article.key_id() != &request.key_id {
            return Err(self.reject(format!(
                "article {} is not sealed under key {}",
                request.article_id, request.key_id
            )));
        }

        debug!(server_id = %self.server_id, reader = %reader, article_id = %request.article_id, "Releasing key share");

        Ok(KeyShare {
            server_id: self.server_id.clone(),
            key_id: request.key_id.clone(),
            share: self.share_for(&request.key_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, UnixSecs};
    use crate::entitlement::{ArticleDraft, EntitlementConfig, NewPublication, Tier};
    use crate::identity::{LocalSigner, Signer};
    use crate::ledger::Ledger;
    use crate::session::SessionManager;
    use std::time::Duration;

    struct Fixture {
        store: Arc<EntitlementStore>,
        clock: Arc<ManualClock>,
        servers: Vec<Arc<LocalKeyServer>>,
        article_id: ObjectId,
        key_id: KeyId,
        publication_id: ObjectId,
    }

    async fn fixture(tier: Tier) -> Fixture {
        let clock = Arc::new(ManualClock::new(UnixSecs(1_700_000_000)));
        let store = Arc::new(EntitlementStore::new(
            Arc::new(Ledger::immediate()),
            clock.clone(),
            EntitlementConfig::default(),
        ));
        let publisher = LocalSigner::generate();
        let (publication, cap) = store
            .create_publication(
                &publisher.address(),
                NewPublication {
                    name: "Field Notes".into(),
                    description: String::new(),
                    basic_price: 10,
                    premium_price: 20,
                    free_tier_enabled: false,
                },
            )
            .await
            .unwrap();
        let key_id = KeyId::new("key-group-7");
        let article = store
            .publish_article(
                &cap,
                &publication.id,
                ArticleDraft {
                    title: "Notes".into(),
                    excerpt: "Public excerpt".into(),
                    blob_id: crate::blob::BlobId::from("blob"),
                    key_id: key_id.clone(),
                    content_identifier: "notes".into(),
                    tier,
                },
            )
            .await
            .unwrap();

        let servers = (1..=3)
            .map(|i| Arc::new(LocalKeyServer::new(format!("ks-{i}"), store.clone(), clock.clone())))
            .collect();

        Fixture {
            store,
            clock,
            servers,
            article_id: article.id,
            key_id,
            publication_id: publication.id,
        }
    }

    fn client(f: &Fixture, threshold: usize) -> KeyReleaseClient {
        let servers = f.servers.iter().map(|s| s.clone() as Arc<dyn KeyServer>).collect();
        KeyReleaseClient::new(
            servers,
            threshold,
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        )
        .unwrap()
    }

    async fn session(reader: Arc<LocalSigner>, clock: Arc<ManualClock>) -> SessionKey {
        SessionManager::new(reader, clock, 3_600).initialize().await.unwrap()
    }

    #[tokio::test]
    async fn test_entitled_reader_gets_threshold_shares() {
        let f = fixture(Tier::Basic).await;
        let reader = Arc::new(LocalSigner::generate());
        let sub = f
            .store
            .purchase_subscription(&reader.address(), &f.publication_id, Tier::Basic, 10)
            .await
            .unwrap();

        let request = KeyRequest {
            key_id: f.key_id.clone(),
            article_id: f.article_id.clone(),
            proof: EntitlementProof::Subscription {
                subscription_id: sub.id,
            },
            session: session(reader, f.clock.clone()).await,
        };

        f.servers[2].set_available(false);
        let release = client(&f, 2).request(&request).await.unwrap();
        assert_eq!(release.shares.len(), 2);
        assert_eq!(release.shares[0].server_id, "ks-1");
        assert_eq!(release.shares[1].server_id, "ks-2");
    }

    #[tokio::test]
    async fn test_insufficient_shares_after_bounded_attempts() {
        let f = fixture(Tier::Free).await;
        let reader = Arc::new(LocalSigner::generate());
        let token = f.store.issue_read_token(&reader.address(), &f.article_id, 1).await.unwrap();

        let request = KeyRequest {
            key_id: f.key_id.clone(),
            article_id: f.article_id.clone(),
            proof: EntitlementProof::ReadToken { token_id: token.id },
            session: session(reader, f.clock.clone()).await,
        };

        f.servers[1].set_available(false);
        f.servers[2].set_available(false);
        let err = client(&f, 2).request(&request).await.unwrap_err();
        assert!(matches!(
            err,
            PressError::KeyDenied(KeyDenial::InsufficientShares {
                received: 1,
                threshold: 2,
                attempts: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_service_rejects_proof_the_resolver_would_not_check() {
        let f = fixture(Tier::Premium).await;
        let reader = Arc::new(LocalSigner::generate());
        let basic = f
            .store
            .purchase_subscription(&reader.address(), &f.publication_id, Tier::Basic, 10)
            .await
            .unwrap();

        let request = KeyRequest {
            key_id: f.key_id.clone(),
            article_id: f.article_id.clone(),
            proof: EntitlementProof::Subscription {
                subscription_id: basic.id,
            },
            session: session(reader, f.clock.clone()).await,
        };

        let err = client(&f, 1).request(&request).await.unwrap_err();
        assert!(matches!(err, PressError::KeyDenied(KeyDenial::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_wrong_key_id_is_rejected() {
        let f = fixture(Tier::Basic).await;
        let reader = Arc::new(LocalSigner::generate());
        let sub = f
            .store
            .purchase_subscription(&reader.address(), &f.publication_id, Tier::Premium, 20)
            .await
            .unwrap();

        let request = KeyRequest {
            key_id: KeyId::new("someone-elses-key"),
            article_id: f.article_id.clone(),
            proof: EntitlementProof::Subscription {
                subscription_id: sub.id,
            },
            session: session(reader, f.clock.clone()).await,
        };

        assert!(matches!(
            client(&f, 1).request(&request).await,
            Err(PressError::KeyDenied(KeyDenial::Rejected { .. }))
        ));
    }

    #[test]
    fn test_unreachable_threshold_is_config_error() {
        let err = KeyReleaseClient::new(Vec::new(), 1, RetryPolicy::once());
        assert!(matches!(err, Err(PressError::Config(_))));
    }
}

//! Access Resolver
//!
//! Decides whether a reader may decrypt an article, and on which grounds.
//!
//! ```text
//!              ┌──────────────┐
//!              │  Unresolved  │
//!              └──────┬───────┘
//!     free? ──► subscription? ──► read token?
//!        │            │               │
//!        └────────────┴──────┬────────┘
//!                  ┌─────────┴─────────┐
//!                  ▼                   ▼
//!              Granted              Denied (NoValidEntitlement)
//!                  │
//!                  ▼
//!            KeyRequested ──► KeyReleased | KeyDenied
//! ```
//!
//! The local decision is only an optimization. The key service re-checks the
//! specific proof against authoritative ledger state before it releases
//! anything.

mod key_service;
mod resolver;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::clock::UnixSecs;
use crate::entitlement::{Article, ObjectId, Publication, ReadToken, SubscriptionNft, Tier};
use crate::identity::Address;

pub use key_service::{
    KeyDenial, KeyRelease, KeyReleaseClient, KeyRequest, KeyServer, KeyServerError, KeyShare, LocalKeyServer,
};
pub use resolver::{AccessAttempt, AccessResolver, AccessState, Grant};

/// The ground on which access was granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementPath {
    Free,
    Subscription,
    ReadToken,
}

impl fmt::Display for EntitlementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntitlementPath::Free => write!(f, "free"),
            EntitlementPath::Subscription => write!(f, "subscription"),
            EntitlementPath::ReadToken => write!(f, "read_token"),
        }
    }
}

/// The object reference that justified a grant, presented to the key service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum EntitlementProof {
    FreeTier { article_id: ObjectId },
    Subscription { subscription_id: ObjectId },
    ReadToken { token_id: ObjectId },
}

impl EntitlementProof {
    pub fn path(&self) -> EntitlementPath {
        match self {
            EntitlementProof::FreeTier { .. } => EntitlementPath::Free,
            EntitlementProof::Subscription { .. } => EntitlementPath::Subscription,
            EntitlementProof::ReadToken { .. } => EntitlementPath::ReadToken,
        }
    }

    pub fn object_id(&self) -> &ObjectId {
        match self {
            EntitlementProof::FreeTier { article_id } => article_id,
            EntitlementProof::Subscription { subscription_id } => subscription_id,
            EntitlementProof::ReadToken { token_id } => token_id,
        }
    }
}

/// Why one entitlement path did not grant access
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CheckFailure {
    #[error("article is {tier}, not free")]
    NotFreeArticle { tier: Tier },

    #[error("free tier is disabled for this publication")]
    FreeTierDisabled,

    #[error("no subscription to this publication")]
    NoSubscription,

    #[error("subscription {subscription_id} belongs to another publication")]
    WrongPublication { subscription_id: ObjectId },

    #[error("subscription {subscription_id} expired at {}", expired_at.to_rfc3339())]
    SubscriptionExpired {
        subscription_id: ObjectId,
        expired_at: UnixSecs,
    },

    #[error("subscription {subscription_id} is {held}, article requires {required}")]
    TierTooLow {
        subscription_id: ObjectId,
        held: Tier,
        required: Tier,
    },

    #[error("no read token for this article")]
    NoReadToken,

    #[error("read token {token_id} expired at {}", expired_at.to_rfc3339())]
    ReadTokenExpired { token_id: ObjectId, expired_at: UnixSecs },

    #[error("proof {object_id} refers to another article")]
    ProofForOtherArticle { object_id: ObjectId },

    #[error("proof object {object_id} does not exist")]
    ProofNotFound { object_id: ObjectId },

    #[error("proof object {object_id} is owned by someone else")]
    NotOwner { object_id: ObjectId },
}

/// One checked path and its failure reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCheck {
    pub path: EntitlementPath,
    pub failure: CheckFailure,
}

/// What the reader can do to gain access
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Remediation {
    Subscribe { publication_id: ObjectId, tier: Tier },
    Renew { subscription_id: ObjectId },
    Upgrade { subscription_id: ObjectId, to: Tier },
    PurchaseReadToken { article_id: ObjectId },
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remediation::Subscribe { publication_id, tier } => {
                write!(f, "subscribe to {publication_id} at {tier}")
            }
            Remediation::Renew { subscription_id } => write!(f, "renew subscription {subscription_id}"),
            Remediation::Upgrade { subscription_id, to } => {
                write!(f, "upgrade subscription {subscription_id} to {to}")
            }
            Remediation::PurchaseReadToken { article_id } => {
                write!(f, "buy a read token for {article_id}")
            }
        }
    }
}

/// Every path the resolver tried, and why each failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub reader: Address,
    pub article_id: ObjectId,
    pub publication_id: ObjectId,
    pub required_tier: Tier,
    pub checks: Vec<PathCheck>,
}

impl Denial {
    /// Failure recorded for `path`, if it was checked
    pub fn failures(&self, path: EntitlementPath) -> impl Iterator<Item = &CheckFailure> {
        self.checks.iter().filter(move |c| c.path == path).map(|c| &c.failure)
    }

    /// Ways to gain access, most specific first
    pub fn remediation(&self) -> Vec<Remediation> {
        let mut out = Vec::new();

        for check in &self.checks {
            match &check.failure {
                CheckFailure::TierTooLow {
                    subscription_id,
                    required,
                    ..
                } => out.push(Remediation::Upgrade {
                    subscription_id: subscription_id.clone(),
                    to: *required,
                }),
                CheckFailure::SubscriptionExpired { subscription_id, .. } => out.push(Remediation::Renew {
                    subscription_id: subscription_id.clone(),
                }),
                _ => {}
            }
        }

        if out.is_empty() {
            out.push(Remediation::Subscribe {
                publication_id: self.publication_id.clone(),
                tier: self.required_tier.max(Tier::Basic),
            });
        }
        out.push(Remediation::PurchaseReadToken {
            article_id: self.article_id.clone(),
        });
        out
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} may not read {} ({} tier)",
            self.reader, self.article_id, self.required_tier
        )?;
        for check in &self.checks {
            write!(f, "; {}: {}", check.path, check.failure)?;
        }
        Ok(())
    }
}

/// Free path: free article and the publication has the free tier enabled
pub fn check_free(publication: &Publication, article: &Article) -> Result<(), CheckFailure> {
    if article.tier != Tier::Free {
        return Err(CheckFailure::NotFreeArticle { tier: article.tier });
    }
    if !publication.free_tier_enabled {
        return Err(CheckFailure::FreeTierDisabled);
    }
    Ok(())
}

/// Subscription path: same publication, not expired, tier high enough
pub fn check_subscription(
    subscription: &SubscriptionNft,
    article: &Article,
    now: UnixSecs,
) -> Result<(), CheckFailure> {
    if subscription.publication_id != article.publication_id {
        return Err(CheckFailure::WrongPublication {
            subscription_id: subscription.id.clone(),
        });
    }
    if subscription.is_expired(now) {
        return Err(CheckFailure::SubscriptionExpired {
            subscription_id: subscription.id.clone(),
            expired_at: subscription.expires_at,
        });
    }
    if !subscription.tier.satisfies(article.tier) {
        return Err(CheckFailure::TierTooLow {
            subscription_id: subscription.id.clone(),
            held: subscription.tier,
            required: article.tier,
        });
    }
    Ok(())
}

/// Read token path: token for this article, not expired
pub fn check_read_token(token: &ReadToken, article: &Article, now: UnixSecs) -> Result<(), CheckFailure> {
    if token.article_id != article.id {
        return Err(CheckFailure::ProofForOtherArticle {
            object_id: token.id.clone(),
        });
    }
    if token.is_expired(now) {
        return Err(CheckFailure::ReadTokenExpired {
            token_id: token.id.clone(),
            expired_at: token.expires_at,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LocalSigner, Signer};

    fn denial(checks: Vec<PathCheck>) -> Denial {
        Denial {
            reader: LocalSigner::generate().address(),
            article_id: ObjectId::from("0xarticle"),
            publication_id: ObjectId::from("0xpub"),
            required_tier: Tier::Premium,
            checks,
        }
    }

    #[test]
    fn test_remediation_prefers_upgrade() {
        let d = denial(vec![
            PathCheck {
                path: EntitlementPath::Free,
                failure: CheckFailure::NotFreeArticle { tier: Tier::Premium },
            },
            PathCheck {
                path: EntitlementPath::Subscription,
                failure: CheckFailure::TierTooLow {
                    subscription_id: ObjectId::from("0xsub"),
                    held: Tier::Basic,
                    required: Tier::Premium,
                },
            },
            PathCheck {
                path: EntitlementPath::ReadToken,
                failure: CheckFailure::NoReadToken,
            },
        ]);

        let remedies = d.remediation();
        assert_eq!(
            remedies[0],
            Remediation::Upgrade {
                subscription_id: ObjectId::from("0xsub"),
                to: Tier::Premium
            }
        );
        assert!(matches!(remedies.last(), Some(Remediation::PurchaseReadToken { .. })));
    }

    #[test]
    fn test_remediation_without_subscription_suggests_subscribing() {
        let d = denial(vec![PathCheck {
            path: EntitlementPath::Subscription,
            failure: CheckFailure::NoSubscription,
        }]);
        assert_eq!(
            d.remediation()[0],
            Remediation::Subscribe {
                publication_id: ObjectId::from("0xpub"),
                tier: Tier::Premium
            }
        );
    }

    #[test]
    fn test_denial_display_lists_paths() {
        let d = denial(vec![PathCheck {
            path: EntitlementPath::ReadToken,
            failure: CheckFailure::NoReadToken,
        }]);
        let text = d.to_string();
        assert!(text.contains("premium tier"));
        assert!(text.contains("read_token: no read token for this article"));
    }
}

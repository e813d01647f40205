//! Ledger object table
//!
//! An in-process stand-in for the ledger collaborator. It keeps one
//! versioned entry per object and models the two properties the rest of the
//! crate has to cope with:
//!
//! - **Read-after-write lag**: a write becomes visible to [`Ledger::get_object`]
//!   only after the configured lag. Until then readers see the previous
//!   version, or nothing for a brand new object.
//! - **Authoritative reads**: transaction execution (the entitlement store's
//!   mutations, the key service's proof checks) reads the latest version via
//!   [`Ledger::read_latest`], never a stale one.
//!
//! ```text
//! write(v2) ──► [ current: v2, visible_at: t+lag, previous: v1 ]
//!                    │
//!   get_object(t)    ├──► v1   (stale but consistent)
//!   get_object(t+lag)└──► v2
//!   read_latest(t)   ───► v2
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::entitlement::{
    Article, CapRecord, EventLog, ObjectId, Publication, PublicationStats, ReadToken, SubscriptionNft,
};
use crate::identity::Address;

/// Any object the entitlement layer stores on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerObject {
    Publication(Publication),
    PublisherCap(CapRecord),
    Subscription(SubscriptionNft),
    ReadToken(ReadToken),
    Article(Article),
    Stats(PublicationStats),
}

impl LedgerObject {
    pub fn id(&self) -> &ObjectId {
        match self {
            LedgerObject::Publication(o) => &o.id,
            LedgerObject::PublisherCap(o) => &o.id,
            LedgerObject::Subscription(o) => &o.id,
            LedgerObject::ReadToken(o) => &o.id,
            LedgerObject::Article(o) => &o.id,
            LedgerObject::Stats(o) => &o.id,
        }
    }

    /// Address that exclusively owns this object, if any.
    /// Shared objects (publications, articles, stats) have no owner.
    pub fn owner(&self) -> Option<&Address> {
        match self {
            LedgerObject::PublisherCap(o) => Some(&o.holder),
            LedgerObject::Subscription(o) => Some(&o.subscriber),
            LedgerObject::ReadToken(o) => Some(&o.reader),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            LedgerObject::Publication(_) => "publication",
            LedgerObject::PublisherCap(_) => "publisher_cap",
            LedgerObject::Subscription(_) => "subscription",
            LedgerObject::ReadToken(_) => "read_token",
            LedgerObject::Article(_) => "article",
            LedgerObject::Stats(_) => "stats",
        }
    }

    pub fn into_publication(self) -> Option<Publication> {
        match self {
            LedgerObject::Publication(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_subscription(self) -> Option<SubscriptionNft> {
        match self {
            LedgerObject::Subscription(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_read_token(self) -> Option<ReadToken> {
        match self {
            LedgerObject::ReadToken(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_article(self) -> Option<Article> {
        match self {
            LedgerObject::Article(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_stats(self) -> Option<PublicationStats> {
        match self {
            LedgerObject::Stats(o) => Some(o),
            _ => None,
        }
    }
}

struct Versioned {
    current: LedgerObject,
    version: u64,
    visible_at: Instant,
    previous: Option<LedgerObject>,
}

impl Versioned {
    fn visible(&self, now: Instant) -> Option<&LedgerObject> {
        if now >= self.visible_at {
            Some(&self.current)
        } else {
            self.previous.as_ref()
        }
    }
}

/// Versioned object table with visibility lag and an event log
pub struct Ledger {
    objects: DashMap<ObjectId, Versioned>,
    lag: Duration,
    events: EventLog,
}

impl Ledger {
    /// Ledger whose writes become visible after `lag`
    pub fn new(lag: Duration) -> Self {
        Self {
            objects: DashMap::new(),
            lag,
            events: EventLog::new(),
        }
    }

    /// Ledger with no visibility lag
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn lag(&self) -> Duration {
        self.lag
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Create or replace an object. Returns the new version number.
    pub(crate) fn write(&self, object: LedgerObject) -> u64 {
        let now = Instant::now();
        let id = object.id().clone();
        let type_name = object.type_name();

        let version = match self.objects.get_mut(&id) {
            Some(mut entry) => {
                // A still-invisible write stays invisible; readers keep the
                // last version they could already see.
                let previous = entry.visible(now).cloned();
                entry.previous = previous;
                entry.current = object;
                entry.version += 1;
                entry.visible_at = now + self.lag;
                entry.version
            }
            None => {
                self.objects.insert(
                    id.clone(),
                    Versioned {
                        current: object,
                        version: 1,
                        visible_at: now + self.lag,
                        previous: None,
                    },
                );
                1
            }
        };

        debug!(object_id = %id, object_type = type_name, version = version, "Ledger write");
        version
    }

    /// Latest version regardless of visibility
    pub(crate) fn read_latest(&self, id: &ObjectId) -> Option<LedgerObject> {
        self.objects.get(id).map(|entry| entry.current.clone())
    }

    /// Version visible to an outside reader right now
    pub fn get_object(&self, id: &ObjectId) -> Option<LedgerObject> {
        let now = Instant::now();
        self.objects.get(id).and_then(|entry| entry.visible(now).cloned())
    }

    /// Version number of the latest write, visible or not
    pub fn version(&self, id: &ObjectId) -> Option<u64> {
        self.objects.get(id).map(|entry| entry.version)
    }

    /// Visible objects owned by `owner`
    pub fn owned_by(&self, owner: &Address) -> Vec<LedgerObject> {
        self.visible_where(|object| object.owner() == Some(owner))
    }

    /// Visible objects matching `predicate`
    pub fn visible_where<F>(&self, predicate: F) -> Vec<LedgerObject>
    where
        F: Fn(&LedgerObject) -> bool,
    {
        let now = Instant::now();
        self.objects
            .iter()
            .filter_map(|entry| entry.visible(now).filter(|o| predicate(o)).cloned())
            .collect()
    }

    /// Latest objects matching `predicate`, visible or not
    pub(crate) fn latest_where<F>(&self, predicate: F) -> Vec<LedgerObject>
    where
        F: Fn(&LedgerObject) -> bool,
    {
        self.objects
            .iter()
            .filter(|entry| predicate(&entry.current))
            .map(|entry| entry.current.clone())
            .collect()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::immediate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::UnixSecs;
    use crate::entitlement::Tier;
    use crate::identity::{LocalSigner, Signer};

    fn token(reader: &Address, expires_at: u64) -> ReadToken {
        ReadToken {
            id: ObjectId::generate(),
            article_id: ObjectId::from("0xarticle"),
            reader: reader.clone(),
            created_at: UnixSecs(0),
            expires_at: UnixSecs(expires_at),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_object_invisible_until_lag_elapses() {
        let ledger = Ledger::new(Duration::from_secs(2));
        let reader = LocalSigner::generate().address();
        let token = token(&reader, 100);
        let id = token.id.clone();

        ledger.write(LedgerObject::ReadToken(token));

        assert!(ledger.get_object(&id).is_none());
        assert!(ledger.read_latest(&id).is_some());
        assert!(ledger.owned_by(&reader).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(ledger.get_object(&id).is_some());
        assert_eq!(ledger.owned_by(&reader).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_serves_previous_version_during_lag() {
        let ledger = Ledger::new(Duration::from_secs(1));
        let reader = LocalSigner::generate().address();
        let mut sub = SubscriptionNft {
            id: ObjectId::generate(),
            publication_id: ObjectId::from("0xpub"),
            tier: Tier::Basic,
            subscribed_at: UnixSecs(0),
            expires_at: UnixSecs(100),
            subscriber: reader,
        };
        let id = sub.id.clone();

        ledger.write(LedgerObject::Subscription(sub.clone()));
        tokio::time::advance(Duration::from_secs(1)).await;

        sub.expires_at = UnixSecs(200);
        assert_eq!(ledger.write(LedgerObject::Subscription(sub)), 2);

        let stale = ledger.get_object(&id).and_then(LedgerObject::into_subscription).unwrap();
        assert_eq!(stale.expires_at, UnixSecs(100));

        let latest = ledger.read_latest(&id).and_then(LedgerObject::into_subscription).unwrap();
        assert_eq!(latest.expires_at, UnixSecs(200));

        tokio::time::advance(Duration::from_secs(1)).await;
        let fresh = ledger.get_object(&id).and_then(LedgerObject::into_subscription).unwrap();
        assert_eq!(fresh.expires_at, UnixSecs(200));
    }

    #[test]
    fn test_immediate_ledger() {
        let ledger = Ledger::immediate();
        let reader = LocalSigner::generate().address();
        let token = token(&reader, 5);
        let id = token.id.clone();
        ledger.write(LedgerObject::ReadToken(token));

        assert_eq!(ledger.version(&id), Some(1));
        assert!(ledger.get_object(&id).is_some());
    }
}

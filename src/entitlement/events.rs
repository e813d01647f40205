//! Ledger events
//!
//! One event per successful state transition, consumed by downstream
//! indexers. Nothing in this crate indexes them; the log keeps a history
//! for inspection and fans events out to live subscribers.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::trace;

use super::model::{ObjectId, Tier};
use crate::blob::BlobId;
use crate::clock::UnixSecs;
use crate::identity::Address;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "PascalCase")]
pub enum LedgerEvent {
    PublicationCreated {
        publication_id: ObjectId,
        creator: Address,
        name: String,
        basic_price: u64,
        premium_price: u64,
        free_tier_enabled: bool,
    },
    PricingUpdated {
        publication_id: ObjectId,
        basic_price: u64,
        premium_price: u64,
    },
    FreeTierToggled {
        publication_id: ObjectId,
        enabled: bool,
    },
    ArticlePublished {
        article_id: ObjectId,
        publication_id: ObjectId,
        title: String,
        blob_id: BlobId,
        tier: Tier,
        published_at: UnixSecs,
    },
    ArticleUpdated {
        article_id: ObjectId,
        title: String,
    },
    ArticleArchived {
        article_id: ObjectId,
        publication_id: ObjectId,
    },
    SubscriptionCreated {
        subscription_id: ObjectId,
        publication_id: ObjectId,
        subscriber: Address,
        tier: Tier,
        expires_at: UnixSecs,
        payment: u64,
    },
    SubscriptionRenewed {
        subscription_id: ObjectId,
        publication_id: ObjectId,
        expires_at: UnixSecs,
        payment: u64,
    },
    ReadTokenGenerated {
        token_id: ObjectId,
        article_id: ObjectId,
        reader: Address,
        expires_at: UnixSecs,
        payment: u64,
    },
}

impl LedgerEvent {
    /// Event type name as indexers see it
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::PublicationCreated { .. } => "PublicationCreated",
            LedgerEvent::PricingUpdated { .. } => "PricingUpdated",
            LedgerEvent::FreeTierToggled { .. } => "FreeTierToggled",
            LedgerEvent::ArticlePublished { .. } => "ArticlePublished",
            LedgerEvent::ArticleUpdated { .. } => "ArticleUpdated",
            LedgerEvent::ArticleArchived { .. } => "ArticleArchived",
            LedgerEvent::SubscriptionCreated { .. } => "SubscriptionCreated",
            LedgerEvent::SubscriptionRenewed { .. } => "SubscriptionRenewed",
            LedgerEvent::ReadTokenGenerated { .. } => "ReadTokenGenerated",
        }
    }
}

/// Ordered event history with live fan-out.
///
/// Keeps the most recent `capacity` events; older ones are only seen by
/// subscribers that were listening when they were emitted.
pub struct EventLog {
    sender: broadcast::Sender<LedgerEvent>,
    history: Mutex<VecDeque<LedgerEvent>>,
    capacity: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn history_lock(&self) -> MutexGuard<'_, VecDeque<LedgerEvent>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn emit(&self, event: LedgerEvent) {
        trace!(event = event.name(), "Emitting ledger event");
        {
            let mut history = self.history_lock();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    /// Retained events, oldest first
    pub fn history(&self) -> Vec<LedgerEvent> {
        self.history_lock().iter().cloned().collect()
    }

    /// How many retained events have the given type
    pub fn count(&self, name: &str) -> usize {
        self.history_lock().iter().filter(|e| e.name() == name).count()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_history_and_subscribers() {
        let log = EventLog::new();
        let mut rx = log.subscribe();

        log.emit(LedgerEvent::FreeTierToggled {
            publication_id: ObjectId::from("0xpub"),
            enabled: true,
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "FreeTierToggled");
        assert_eq!(log.history().len(), 1);
        assert_eq!(log.count("FreeTierToggled"), 1);
        assert_eq!(log.count("PricingUpdated"), 0);
    }

    #[test]
    fn test_history_keeps_most_recent() {
        let log = EventLog::with_capacity(2);
        for enabled in [true, false, true] {
            log.emit(LedgerEvent::FreeTierToggled {
                publication_id: ObjectId::from("0xpub"),
                enabled,
            });
        }
        log.emit(LedgerEvent::PricingUpdated {
            publication_id: ObjectId::from("0xpub"),
            basic_price: 1,
            premium_price: 2,
        });

        let history = log.history();
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0], LedgerEvent::FreeTierToggled { enabled: true, .. }));
        assert_eq!(history[1].name(), "PricingUpdated");
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = LedgerEvent::PricingUpdated {
            publication_id: ObjectId::from("0xpub"),
            basic_price: 1,
            premium_price: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "PricingUpdated");
        assert_eq!(json["premium_price"], 2);
    }
}

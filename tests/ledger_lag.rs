//! Read-after-write lag between the entitlement store and outside readers
//!
//! Runs on paused tokio time so the visibility polling sleeps complete
//! instantly while the ledger lag is still honoured.

use gated_press::access::KeyServer;
use gated_press::entitlement::{ArticleDraft, KeyId};
use gated_press::retry::RetryPolicy;
use gated_press::*;
use std::sync::Arc;
use std::time::Duration;

const LAG: Duration = Duration::from_secs(2);

fn store_with_lag(clock: Arc<ManualClock>) -> Arc<EntitlementStore> {
    Arc::new(EntitlementStore::new(
        Arc::new(Ledger::new(LAG)),
        clock,
        Config::default().entitlement(),
    ))
}

fn resolver(store: Arc<EntitlementStore>, clock: Arc<ManualClock>, visibility: RetryPolicy) -> AccessResolver {
    let server: Arc<dyn KeyServer> = Arc::new(LocalKeyServer::new("ks-1", store.clone(), clock));
    let keys = KeyReleaseClient::new(vec![server], 1, RetryPolicy::once()).unwrap();
    AccessResolver::new(store, keys, visibility)
}

async fn basic_article(store: &EntitlementStore, publisher: &Address) -> (entitlement::ObjectId, entitlement::ObjectId) {
    let (publication, cap) = store
        .create_publication(
            publisher,
            NewPublication {
                name: "Dispatches".into(),
                description: String::new(),
                basic_price: 10,
                premium_price: 20,
                free_tier_enabled: false,
            },
        )
        .await
        .unwrap();
    let article = store
        .publish_article(
            &cap,
            &publication.id,
            ArticleDraft {
                title: "Fresh".into(),
                excerpt: String::new(),
                blob_id: BlobId::for_bytes(b"container"),
                key_id: KeyId::new("k"),
                content_identifier: "fresh".into(),
                tier: Tier::Basic,
            },
        )
        .await
        .unwrap();
    (publication.id, article.id)
}

/// Lagged reads miss fresh writes; authoritative checks do not
#[tokio::test(start_paused = true)]
async fn test_fresh_writes_are_invisible_until_lag_elapses() {
    let clock = Arc::new(ManualClock::new(UnixSecs(1_000)));
    let store = store_with_lag(clock.clone());
    let publisher = LocalSigner::generate().address();
    let (publication_id, article_id) = basic_article(&store, &publisher).await;

    assert!(matches!(store.article(&article_id), Err(PressError::ObjectNotFound(_))));

    // mutations chain on the latest version even while it is invisible
    let reader = LocalSigner::generate().address();
    let subscription = store
        .purchase_subscription(&reader, &publication_id, Tier::Basic, 10)
        .await
        .unwrap();
    assert!(store.subscriptions_of(&reader, &publication_id).is_empty());
    assert_eq!(
        store
            .verify_entitlement(
                &reader,
                &article_id,
                &EntitlementProof::Subscription {
                    subscription_id: subscription.id.clone()
                },
                clock.now(),
            )
            .unwrap(),
        EntitlementPath::Subscription
    );

    tokio::time::advance(LAG).await;
    assert_eq!(store.article(&article_id).unwrap().title, "Fresh");
    assert_eq!(store.subscriptions_of(&reader, &publication_id).len(), 1);
    assert_eq!(store.publication(&publication_id).unwrap().article_count, 1);
}

/// The resolver polls until the article shows up
#[tokio::test(start_paused = true)]
async fn test_resolver_waits_out_visibility_lag() {
    let clock = Arc::new(ManualClock::new(UnixSecs(1_000)));
    let store = store_with_lag(clock.clone());
    let publisher = LocalSigner::generate().address();
    let (publication_id, article_id) = basic_article(&store, &publisher).await;

    let reader = LocalSigner::generate().address();
    store
        .purchase_subscription(&reader, &publication_id, Tier::Basic, 10)
        .await
        .unwrap();

    let patient = resolver(
        store.clone(),
        clock.clone(),
        RetryPolicy::new(10, Duration::from_millis(250), Duration::from_secs(2)),
    );
    let started = tokio::time::Instant::now();
    let grant = patient.resolve(&reader, &article_id, clock.now()).await.unwrap();
    assert_eq!(grant.path, EntitlementPath::Subscription);
    assert!(started.elapsed() >= LAG);
}

/// A subscription bought after the article is visible is waited for too
#[tokio::test(start_paused = true)]
async fn test_resolver_waits_for_fresh_subscription() {
    let clock = Arc::new(ManualClock::new(UnixSecs(1_000)));
    let store = store_with_lag(clock.clone());
    let publisher = LocalSigner::generate().address();
    let (publication_id, article_id) = basic_article(&store, &publisher).await;
    tokio::time::advance(LAG).await;
    assert!(store.article(&article_id).is_ok());

    let reader = LocalSigner::generate().address();
    let subscription = store
        .purchase_subscription(&reader, &publication_id, Tier::Basic, 10)
        .await
        .unwrap();
    assert!(store.subscriptions_of(&reader, &publication_id).is_empty());

    let patient = resolver(
        store.clone(),
        clock.clone(),
        RetryPolicy::new(10, Duration::from_millis(250), Duration::from_secs(2)),
    );
    let started = tokio::time::Instant::now();
    let grant = patient.resolve(&reader, &article_id, clock.now()).await.unwrap();
    assert_eq!(grant.path, EntitlementPath::Subscription);
    assert_eq!(
        grant.proof,
        EntitlementProof::Subscription {
            subscription_id: subscription.id
        }
    );
    assert!(started.elapsed() >= LAG);
}

/// Same for a read token issued on an already visible article
#[tokio::test(start_paused = true)]
async fn test_resolver_waits_for_fresh_read_token() {
    let clock = Arc::new(ManualClock::new(UnixSecs(1_000)));
    let store = store_with_lag(clock.clone());
    let publisher = LocalSigner::generate().address();
    let (_, article_id) = basic_article(&store, &publisher).await;
    tokio::time::advance(LAG).await;

    let reader = LocalSigner::generate().address();
    store.issue_read_token(&reader, &article_id, 10).await.unwrap();

    let patient = resolver(
        store.clone(),
        clock.clone(),
        RetryPolicy::new(10, Duration::from_millis(250), Duration::from_secs(2)),
    );
    let grant = patient.resolve(&reader, &article_id, clock.now()).await.unwrap();
    assert_eq!(grant.path, EntitlementPath::ReadToken);
}

/// A reader holding nothing is still denied once the budget is spent
#[tokio::test(start_paused = true)]
async fn test_resolver_denies_after_polling_budget() {
    let clock = Arc::new(ManualClock::new(UnixSecs(1_000)));
    let store = store_with_lag(clock.clone());
    let publisher = LocalSigner::generate().address();
    let (_, article_id) = basic_article(&store, &publisher).await;
    tokio::time::advance(LAG).await;

    let patient = resolver(
        store,
        clock.clone(),
        RetryPolicy::new(3, Duration::from_millis(250), Duration::from_secs(2)),
    );
    let reader = LocalSigner::generate().address();
    let err = patient.resolve(&reader, &article_id, clock.now()).await.unwrap_err();
    let denial = err.denial().unwrap();
    assert_eq!(denial.failures(EntitlementPath::Subscription).count(), 1);
    assert_eq!(denial.failures(EntitlementPath::ReadToken).count(), 1);
}

/// Without a polling budget the lag surfaces as ObjectNotFound
#[tokio::test(start_paused = true)]
async fn test_resolver_without_budget_reports_not_found() {
    let clock = Arc::new(ManualClock::new(UnixSecs(1_000)));
    let store = store_with_lag(clock.clone());
    let publisher = LocalSigner::generate().address();
    let (_, article_id) = basic_article(&store, &publisher).await;

    let impatient = resolver(store, clock.clone(), RetryPolicy::once());
    let reader = LocalSigner::generate().address();
    let err = impatient.resolve(&reader, &article_id, clock.now()).await.unwrap_err();
    assert!(matches!(err, PressError::ObjectNotFound(ref id) if *id == article_id));
    assert!(err.is_transient());
}

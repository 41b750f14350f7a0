//! Distributed quota-sharing scenarios, run over an in-process transport so
//! no live Redis is required.

use std::sync::Arc;
use std::time::Duration;

use cratos_ratelimit::coordination::InMemoryTransport;
use cratos_ratelimit::{DistributedQuotaManager, LimiterSettings, Quota, QuotaManager};

fn fast_settings() -> LimiterSettings {
    LimiterSettings {
        dispatch_tick: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(20),
        expiry_multiplier: 3,
        ready_quiescence: Duration::from_millis(20),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn two_peers_split_the_quota_and_a_third_reshapes_it() {
    let transport: Arc<InMemoryTransport> = Arc::new(InMemoryTransport::new());
    let configured = Quota::new()
        .with_rate(4, Duration::from_millis(1000))
        .with_concurrency(2);

    let a = DistributedQuotaManager::new(configured, "group-s5", transport.clone(), fast_settings())
        .await
        .unwrap();
    let b = DistributedQuotaManager::new(configured, "group-s5", transport.clone(), fast_settings())
        .await
        .unwrap();

    a.ready().await;
    b.ready().await;
    settle().await;

    assert_eq!(a.quota().rate, Some(2));
    assert_eq!(a.quota().concurrency, Some(1));
    assert_eq!(b.quota().rate, Some(2));
    assert_eq!(b.quota().concurrency, Some(1));

    let c = DistributedQuotaManager::new(configured, "group-s5", transport.clone(), fast_settings())
        .await
        .unwrap();
    c.ready().await;
    settle().await;

    assert_eq!(a.quota().rate, Some(1));
    assert_eq!(a.quota().concurrency, Some(0));
    assert_eq!(b.quota().rate, Some(1));
    assert_eq!(b.quota().concurrency, Some(0));
    assert_eq!(c.quota().rate, Some(1));
    assert_eq!(c.quota().concurrency, Some(0));
}

#[tokio::test]
async fn survivors_converge_after_a_peer_goes_silent() {
    let transport: Arc<InMemoryTransport> = Arc::new(InMemoryTransport::new());
    let configured = Quota::new()
        .with_rate(6, Duration::from_millis(1000))
        .with_concurrency(3);
    let settings = fast_settings();

    let a = DistributedQuotaManager::new(configured, "group-s6", transport.clone(), settings.clone())
        .await
        .unwrap();
    let b = DistributedQuotaManager::new(configured, "group-s6", transport.clone(), settings.clone())
        .await
        .unwrap();
    let c = DistributedQuotaManager::new(configured, "group-s6", transport.clone(), settings.clone())
        .await
        .unwrap();

    a.ready().await;
    b.ready().await;
    c.ready().await;
    settle().await;

    assert_eq!(a.quota().rate, Some(2));
    assert_eq!(a.quota().concurrency, Some(1));

    // `c` disappears without sending GOODBYE, so survivors only recover via
    // the expiry horizon (heartbeat_interval * expiry_multiplier = 60ms).
    drop(c);
    tokio::time::sleep(settings.expiry_horizon() + Duration::from_millis(100)).await;

    assert_eq!(a.quota().rate, Some(3));
    assert_eq!(a.quota().concurrency, Some(1));
    assert_eq!(b.quota().rate, Some(3));
    assert_eq!(b.quota().concurrency, Some(1));
}

#[tokio::test]
async fn fast_start_runs_at_full_quota_then_downshifts_on_discovery() {
    let transport: Arc<InMemoryTransport> = Arc::new(InMemoryTransport::new());
    let configured = Quota::new().with_concurrency(2).with_fast_start(true);
    let settings = fast_settings();

    let a = DistributedQuotaManager::new(configured, "group-s7", transport.clone(), settings.clone())
        .await
        .unwrap();

    // No peer yet: `a` is READY immediately, at the full configured quota.
    a.ready().await;
    assert_eq!(a.quota().concurrency, Some(2));

    let b = DistributedQuotaManager::new(configured, "group-s7", transport.clone(), settings)
        .await
        .unwrap();
    b.ready().await;
    settle().await;

    assert_eq!(a.quota().concurrency, Some(1));
    assert_eq!(b.quota().concurrency, Some(1));
}

#[tokio::test]
async fn unregister_lets_the_survivor_reclaim_the_departed_share() {
    let transport: Arc<InMemoryTransport> = Arc::new(InMemoryTransport::new());
    let configured = Quota::new().with_concurrency(4);
    let settings = fast_settings();

    let a = DistributedQuotaManager::new(configured, "group-unreg", transport.clone(), settings.clone())
        .await
        .unwrap();
    let b = DistributedQuotaManager::new(configured, "group-unreg", transport.clone(), settings)
        .await
        .unwrap();

    a.ready().await;
    b.ready().await;
    settle().await;
    assert_eq!(a.quota().concurrency, Some(2));

    b.unregister().await;
    settle().await;

    assert_eq!(a.quota().concurrency, Some(4));
}

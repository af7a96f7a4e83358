//! Integration tests for the Redis tier.
//!
//! Tests use testcontainers to spin up a real Redis instance, shared by all
//! tests in this file.

use std::sync::Arc;
use std::time::Duration;

use strata_cache::{
    CacheManager, CachePolicy, CallContext, DistributedTier, LocalTier, LocalTierConfig, Lookup,
    RedisTier, RedisTierConfig, Source, Tier, TierHealth,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let port = container
                .get_host_port_ipv4(6379)
                .await
                .expect("get port");
            (container, format!("redis://127.0.0.1:{port}"))
        })
        .await;
    url.clone()
}

async fn connect() -> RedisTier {
    let config = RedisTierConfig {
        url: redis_url().await,
        pool_size: 4,
        min_idle: 2,
        ..Default::default()
    };
    RedisTier::connect(&config).await.expect("connect to redis")
}

fn unique(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static N: AtomicU64 = AtomicU64::new(0);
    format!("{prefix}:{}:{}", std::process::id(), N.fetch_add(1, Ordering::Relaxed))
}

#[tokio::test]
async fn get_set_delete() {
    let tier = connect().await;
    let ctx = CallContext::background();
    let key = unique("user");

    assert_eq!(tier.get(&ctx, &key).await.unwrap(), Lookup::Miss);

    tier.set(&ctx, &key, Arc::from(&b"alice"[..]), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(
        tier.get(&ctx, &key).await.unwrap(),
        Lookup::Hit(Arc::from(&b"alice"[..]))
    );
    assert!(tier.exists(&ctx, &key).await.unwrap());

    tier.delete(&ctx, &key).await.unwrap();
    assert!(!tier.exists(&ctx, &key).await.unwrap());
    // deleting again is fine
    tier.delete(&ctx, &key).await.unwrap();

    let m = tier.metrics();
    assert_eq!(m.hits, 1);
    assert_eq!(m.misses, 1);
    assert_eq!(m.sets, 1);
}

#[tokio::test]
async fn ttl_is_applied() {
    let tier = connect().await;
    let ctx = CallContext::background();
    let key = unique("short");

    tier.set(&ctx, &key, Arc::from(&b"v"[..]), Duration::from_millis(100))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!tier.exists(&ctx, &key).await.unwrap());
}

#[tokio::test]
async fn set_if_absent_has_a_single_winner() {
    let tier = Arc::new(connect().await);
    let key = unique("email");

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let tier = tier.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tier.set_if_absent(
                    &CallContext::background(),
                    &key,
                    Arc::from(format!("holder-{i}").as_bytes()),
                    Duration::from_secs(30),
                )
                .await
                .unwrap()
            })
        })
        .collect();

    let mut winners = 0;
    for h in handles {
        if h.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn compare_and_delete() {
    let tier = connect().await;
    let ctx = CallContext::background();
    let key = unique("reservation");

    tier.set(&ctx, &key, Arc::from(&b"u1"[..]), Duration::from_secs(30))
        .await
        .unwrap();
    assert!(!tier.delete_if_value(&ctx, &key, b"u2").await.unwrap());
    assert!(tier.delete_if_value(&ctx, &key, b"u1").await.unwrap());
    assert!(!tier.exists(&ctx, &key).await.unwrap());
}

#[tokio::test]
async fn incr_and_expire() {
    let tier = connect().await;
    let ctx = CallContext::background();
    let key = unique("counter");

    assert_eq!(tier.incr(&ctx, &key).await.unwrap(), 1);
    assert_eq!(tier.incr(&ctx, &key).await.unwrap(), 2);
    assert!(tier.expire(&ctx, &key, Duration::from_secs(10)).await.unwrap());
    assert!(!tier.expire(&ctx, &unique("missing"), Duration::from_secs(10)).await.unwrap());
}

#[tokio::test]
async fn health_check_and_close() {
    let tier = connect().await;
    let ctx = CallContext::background();

    tier.health_check(&ctx).await.unwrap();
    tier.close().await.unwrap();
    let err = tier.get(&ctx, "anything").await.unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn manager_over_redis() {
    let local = Arc::new(
        LocalTier::new(
            &LocalTierConfig {
                shards: 4,
                max_entries: 64,
                clean_interval_ms: 0,
                ..Default::default()
            },
            Duration::from_secs(60),
        )
        .unwrap(),
    );
    let manager = CacheManager::builder()
        .policy(CachePolicy::default())
        .local(local.clone())
        .distributed(Arc::new(connect().await))
        .build();
    let ctx = CallContext::background();
    let key = unique("user");

    manager.set(&ctx, &key, b"grace".to_vec()).await.unwrap();
    local.reset();

    let read = manager.get(&ctx, &key).await.unwrap();
    assert_eq!(read.source, Source::Distributed);
    assert!(local.exists(&key));

    let health = manager.health_check(&ctx).await;
    assert_eq!(health[&Tier::Distributed], TierHealth::Healthy);
}

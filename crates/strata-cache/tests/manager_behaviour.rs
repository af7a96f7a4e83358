//! Behaviour of the cache manager across both tiers.
//!
//! The distributed tier is a `MemoryTier` so outages, latency and
//! cancellation can be switched on at will.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use strata_cache::{
    CacheError, CacheManager, CachePolicy, CallContext, DistributedTier, LocalTier,
    LocalTierConfig, MemoryTier,
    ReservationOutage, SideEffectKind, Source, Tier, TierHealth, ValueSource,
    email_reservation_key,
};
use tokio_util::sync::CancellationToken;

fn local_tier(ttl: Duration) -> Arc<LocalTier> {
    let config = LocalTierConfig {
        shards: 8,
        max_entries: 1024,
        clean_interval_ms: 0,
        ..Default::default()
    };
    Arc::new(LocalTier::new(&config, ttl).expect("valid local config"))
}

struct Harness {
    manager: CacheManager,
    local: Arc<LocalTier>,
    distributed: Arc<MemoryTier>,
}

fn harness(policy: CachePolicy) -> Harness {
    let local = local_tier(policy.local_ttl);
    let distributed = Arc::new(MemoryTier::new());
    let manager = CacheManager::builder()
        .policy(policy)
        .local(local.clone())
        .distributed(distributed.clone())
        .build();
    Harness {
        manager,
        local,
        distributed,
    }
}

fn strict() -> CachePolicy {
    CachePolicy {
        graceful_degradation: false,
        ..CachePolicy::default()
    }
}

fn bytes(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

#[tokio::test]
async fn set_then_get_hits_local() {
    let h = harness(CachePolicy::default());
    let ctx = CallContext::background();

    h.manager.set(&ctx, "user:1", bytes("alice")).await.unwrap();
    let read = h.manager.get(&ctx, "user:1").await.unwrap();

    assert_eq!(read.source, Source::Local);
    assert_eq!(read.value.as_deref(), Some(&b"alice"[..]));
    assert!(h.distributed.peek("user:1").is_some());
}

#[tokio::test]
async fn distributed_hit_is_written_back_locally() {
    let h = harness(CachePolicy::default());
    let ctx = CallContext::background();

    // populate only the shared tier, as another instance would
    h.distributed
        .set(&ctx, "user:2", Arc::from(&b"bob"[..]), Duration::from_secs(60))
        .await
        .unwrap();
    assert!(!h.local.exists("user:2"));

    let read = h.manager.get(&ctx, "user:2").await.unwrap();
    assert_eq!(read.source, Source::Distributed);
    assert!(read.advisory.find(SideEffectKind::LocalWriteBack).unwrap().succeeded());
    assert!(h.local.exists("user:2"));

    let again = h.manager.get(&ctx, "user:2").await.unwrap();
    assert_eq!(again.source, Source::Local);
}

#[tokio::test]
async fn local_disabled_reads_from_distributed() {
    let h = harness(CachePolicy {
        enable_local: false,
        ..CachePolicy::default()
    });
    let ctx = CallContext::background();

    h.manager.set(&ctx, "k", bytes("v")).await.unwrap();
    let read = h.manager.get(&ctx, "k").await.unwrap();
    assert_eq!(read.source, Source::Distributed);
    assert!(read.advisory.is_empty());
    assert!(!h.local.exists("k"));
}

#[tokio::test]
async fn absent_key_is_a_miss_not_an_error() {
    let h = harness(strict());
    let read = h
        .manager
        .get(&CallContext::background(), "missing")
        .await
        .unwrap();
    assert_eq!(read.source, Source::Miss);
    assert!(read.value.is_none());
}

#[tokio::test]
async fn outage_degrades_to_miss_when_graceful() {
    let h = harness(CachePolicy::default());
    h.distributed.set_available(false);

    let read = h
        .manager
        .get(&CallContext::background(), "user:3")
        .await
        .unwrap();
    assert_eq!(read.source, Source::Miss);
}

#[tokio::test]
async fn outage_surfaces_when_strict() {
    let h = harness(strict());
    h.distributed.set_available(false);

    let err = h
        .manager
        .get(&CallContext::background(), "user:3")
        .await
        .unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn write_survives_distributed_outage() {
    let h = harness(CachePolicy::default());
    let ctx = CallContext::background();
    h.distributed.set_available(false);

    let advisory = h.manager.set(&ctx, "k", bytes("v")).await.unwrap();
    let tolerated = advisory.find(SideEffectKind::TolerantWrite).unwrap();
    assert_eq!(tolerated.tier, Tier::Distributed);
    assert!(!tolerated.succeeded());

    let read = h.manager.get(&ctx, "k").await.unwrap();
    assert_eq!(read.source, Source::Local);
    assert_eq!(read.value.as_deref(), Some(&b"v"[..]));
}

#[tokio::test]
async fn write_fails_when_every_tier_fails() {
    let h = harness(CachePolicy {
        enable_local: false,
        ..CachePolicy::default()
    });
    h.distributed.set_available(false);

    let err = h
        .manager
        .set(&CallContext::background(), "k", bytes("v"))
        .await
        .unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn strict_write_fails_on_single_tier_failure() {
    let h = harness(strict());
    h.distributed.set_available(false);

    assert!(
        h.manager
            .set(&CallContext::background(), "k", bytes("v"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn without_write_through_only_distributed_is_written() {
    let h = harness(CachePolicy {
        write_through: false,
        ..CachePolicy::default()
    });
    let ctx = CallContext::background();

    h.local.set("k", Arc::from(&b"stale"[..])).unwrap();
    h.manager.set(&ctx, "k", bytes("fresh")).await.unwrap();
    assert!(!h.local.exists("k"));

    let read = h.manager.get(&ctx, "k").await.unwrap();
    assert_eq!(read.source, Source::Distributed);
    assert_eq!(read.value.as_deref(), Some(&b"fresh"[..]));
}

#[tokio::test]
async fn local_entries_expire_after_life_window() {
    let h = harness(CachePolicy {
        enable_distributed: false,
        local_ttl: Duration::from_millis(50),
        ..CachePolicy::default()
    });
    let ctx = CallContext::background();

    h.manager.set(&ctx, "k", bytes("v")).await.unwrap();
    assert!(h.manager.exists(&ctx, "k").await.unwrap());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!h.manager.exists(&ctx, "k").await.unwrap());
}

#[tokio::test]
async fn exists_treats_outage_as_false_when_graceful() {
    let h = harness(CachePolicy::default());
    h.distributed.set_available(false);
    assert!(
        !h.manager
            .exists(&CallContext::background(), "k")
            .await
            .unwrap()
    );

    let h = harness(strict());
    h.distributed.set_available(false);
    assert!(h.manager.exists(&CallContext::background(), "k").await.is_err());
}

#[tokio::test]
async fn get_or_set_fetches_once() {
    let h = harness(CachePolicy::default());
    let ctx = CallContext::background();
    let calls = AtomicUsize::new(0);
    let counter = &calls;

    let fetch = move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, CacheError>(Arc::<[u8]>::from(&b"from-db"[..]))
    };

    let first = h.manager.get_or_set(&ctx, "user:9", fetch).await.unwrap();
    assert_eq!(first.source, ValueSource::Origin);
    assert!(first.advisory.attempted(SideEffectKind::Backfill));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let read = h.manager.get(&ctx, "user:9").await.unwrap();
    assert_eq!(read.value.as_deref(), Some(&b"from-db"[..]));

    let second = h.manager.get_or_set(&ctx, "user:9", fetch).await.unwrap();
    assert_eq!(second.source, ValueSource::Local);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[derive(Debug, PartialEq)]
enum LookupError {
    NotFound,
    Cache(String),
}

impl From<CacheError> for LookupError {
    fn from(e: CacheError) -> Self {
        LookupError::Cache(e.to_string())
    }
}

#[tokio::test]
async fn get_or_set_propagates_fetch_errors_verbatim() {
    let h = harness(CachePolicy::default());
    let ctx = CallContext::background();

    let err = h
        .manager
        .get_or_set(&ctx, "user:404", || async { Err(LookupError::NotFound) })
        .await
        .unwrap_err();
    assert_eq!(err, LookupError::NotFound);
    assert!(!h.manager.exists(&ctx, "user:404").await.unwrap());
}

#[tokio::test]
async fn get_or_set_succeeds_when_backfill_fails() {
    let h = harness(CachePolicy {
        enable_local: false,
        ..CachePolicy::default()
    });
    h.distributed.set_available(false);

    let resolved = h
        .manager
        .get_or_set(&CallContext::background(), "k", || async {
            Ok::<_, CacheError>(Arc::<[u8]>::from(&b"v"[..]))
        })
        .await
        .unwrap();
    assert_eq!(resolved.source, ValueSource::Origin);
    let backfill = resolved.advisory.find(SideEffectKind::Backfill).unwrap();
    assert!(!backfill.succeeded());
}

#[tokio::test]
async fn concurrent_reservations_have_one_winner() {
    let h = Arc::new(harness(CachePolicy::default()));
    let key = email_reservation_key("Race@Example.com");
    let ttl = Duration::from_secs(60);

    let attempts = (0..16).map(|i| {
        let h = h.clone();
        let key = key.clone();
        tokio::spawn(async move {
            h.manager
                .reserve_unique(&CallContext::background(), &key, &format!("holder-{i}"), ttl)
                .await
                .unwrap()
                .reserved
        })
    });
    let mut winners = 0;
    for attempt in attempts.collect::<Vec<_>>() {
        if attempt.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn reservation_is_mirrored_and_released_by_holder_only() {
    let h = harness(CachePolicy::default());
    let ctx = CallContext::background();
    let key = email_reservation_key("ada@example.com");
    let ttl = Duration::from_secs(60);

    let granted = h.manager.reserve_unique(&ctx, &key, "u1", ttl).await.unwrap();
    assert!(granted.reserved);
    assert!(!granted.assumed);
    assert!(granted.advisory.find(SideEffectKind::ReservationMirror).unwrap().succeeded());
    assert!(h.local.exists(&key));

    assert!(!h.manager.release_reservation(&ctx, &key, "u2").await.unwrap());
    assert!(h.manager.release_reservation(&ctx, &key, "u1").await.unwrap());

    let again = h.manager.reserve_unique(&ctx, &key, "u2", ttl).await.unwrap();
    assert!(again.reserved);
}

#[tokio::test]
async fn reservation_outage_fails_open_by_default() {
    let h = harness(CachePolicy::default());
    h.distributed.set_available(false);

    let reservation = h
        .manager
        .reserve_unique(&CallContext::background(), "email:x@y.z", "u1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(reservation.reserved);
    assert!(reservation.assumed);
}

#[tokio::test]
async fn reservation_outage_can_fail_closed() {
    let h = harness(CachePolicy {
        reservation_outage: ReservationOutage::FailClosed,
        ..CachePolicy::default()
    });
    h.distributed.set_available(false);

    let err = h
        .manager
        .reserve_unique(&CallContext::background(), "email:x@y.z", "u1", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn cancellation_surfaces_even_when_graceful() {
    let h = harness(CachePolicy::default());
    h.distributed.set_latency(Duration::from_secs(5));

    let token = CancellationToken::new();
    let ctx = CallContext::background().with_cancel(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let err = h.manager.get(&ctx, "slow").await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(err.is_unavailable());
    canceller.await.unwrap();
}

#[tokio::test]
async fn caller_deadline_bounds_distributed_calls() {
    let h = harness(strict());
    h.distributed.set_latency(Duration::from_secs(5));

    let ctx = CallContext::background().with_timeout(Duration::from_millis(30));
    let started = std::time::Instant::now();
    let err = h.manager.get(&ctx, "slow").await.unwrap_err();

    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn metrics_and_health_cover_both_tiers() {
    let h = harness(CachePolicy::default());
    let ctx = CallContext::background();

    h.manager.set(&ctx, "a", bytes("1")).await.unwrap();
    h.manager.get(&ctx, "a").await.unwrap();
    h.manager.get(&ctx, "b").await.unwrap();

    let report = h.manager.metrics();
    let local = report.tier(Tier::Local).unwrap();
    assert_eq!(local.counters.hits, 1);
    assert_eq!(local.counters.misses, 1);
    assert_eq!(local.entries, Some(1));
    let distributed = report.tier(Tier::Distributed).unwrap();
    assert_eq!(distributed.counters.sets, 1);
    assert_eq!(distributed.counters.misses, 1);

    let health = h.manager.health_check(&ctx).await;
    assert_eq!(health[&Tier::Local], TierHealth::Healthy);
    assert_eq!(health[&Tier::Distributed], TierHealth::Healthy);

    h.distributed.set_available(false);
    let health = h.manager.health_check(&ctx).await;
    assert!(matches!(health[&Tier::Distributed], TierHealth::Unhealthy(_)));
}

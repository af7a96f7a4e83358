//! Process-local implementation of the distributed tier contract.
//!
//! Used for single-instance deployments without Redis and as a controllable
//! backend in tests: it can be switched unavailable and given artificial
//! latency to exercise degradation, deadlines and cancellation.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::DistributedTier;
use crate::context::CallContext;
use crate::error::{CacheError, CacheResult, UnavailableReason};
use crate::metrics::{MetricsSnapshot, TierMetrics};
use crate::outcome::{CacheValue, Lookup, Tier};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(value: CacheValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug)]
pub struct MemoryTier {
    entries: DashMap<String, MemoryEntry>,
    available: AtomicBool,
    closed: AtomicBool,
    latency_us: AtomicU64,
    timeout: Duration,
    metrics: TierMetrics,
    shutdown: CancellationToken,
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Default per-call timeout when the caller gives no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            latency_us: AtomicU64::new(0),
            timeout,
            metrics: TierMetrics::new(Tier::Distributed),
            shutdown: CancellationToken::new(),
        }
    }

    /// Simulates an outage: while unavailable every call fails with a
    /// transport error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delays every call by `latency` before it touches the store.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    /// Number of live keys. Bypasses availability.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads a key directly, bypassing availability and counters.
    pub fn peek(&self, key: &str) -> Option<CacheValue> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| Arc::clone(&e.value))
    }

    /// Drops every key. Bypasses availability.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored keys, expired ones included.
    pub fn stored(&self) -> usize {
        self.entries.len()
    }

    /// Removes expired keys. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Spawns the periodic purge task. Stops on close or when the tier is
    /// dropped.
    pub fn start_cleaner(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let tier: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(tier) = tier.upgrade() else { break };
                        let purged = tier.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged = purged, "purged expired memory tier entries");
                        }
                    }
                }
            }
            tracing::debug!("memory tier cleaner stopped");
        })
    }

    async fn enter(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::unavailable(
                Tier::Distributed,
                UnavailableReason::Closed,
                "memory tier closed",
            ));
        }
        let latency = self.latency_us.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(CacheError::transport(
                Tier::Distributed,
                "memory tier marked unavailable",
            ));
        }
        Ok(())
    }

    async fn run<T, F>(&self, ctx: &CallContext, op: &'static str, key: &str, f: F) -> CacheResult<T>
    where
        F: FnOnce(Instant) -> CacheResult<T> + Send,
    {
        let res = ctx
            .bound(Tier::Distributed, op, self.timeout, async {
                self.enter().await?;
                f(Instant::now())
            })
            .await;
        if let Err(e) = &res {
            self.metrics.record_error(op);
            tracing::debug!(tier = "distributed", op = op, key = %key, error = %e, "memory tier call failed");
        }
        res
    }
}

#[async_trait]
impl DistributedTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, ctx: &CallContext, key: &str) -> CacheResult<Lookup> {
        let lookup = self
            .run(ctx, "get", key, |now| {
                let live = self
                    .entries
                    .get(key)
                    .filter(|e| e.is_live(now))
                    .map(|e| Arc::clone(&e.value));
                Ok(match live {
                    Some(value) => Lookup::Hit(value),
                    None => {
                        self.entries.remove_if(key, |_, e| !e.is_live(now));
                        Lookup::Miss
                    }
                })
            })
            .await?;
        if lookup.is_hit() {
            self.metrics.record_hit();
        } else {
            self.metrics.record_miss();
        }
        Ok(lookup)
    }

    async fn set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: CacheValue,
        ttl: Duration,
    ) -> CacheResult<()> {
        self.run(ctx, "set", key, |_| {
            self.entries
                .insert(key.to_string(), MemoryEntry::new(value, ttl));
            Ok(())
        })
        .await?;
        self.metrics.record_set();
        Ok(())
    }

    async fn set_if_absent(
        &self,
        ctx: &CallContext,
        key: &str,
        value: CacheValue,
        ttl: Duration,
    ) -> CacheResult<bool> {
        let stored = self
            .run(ctx, "set_if_absent", key, |now| {
                Ok(match self.entries.entry(key.to_string()) {
                    Entry::Occupied(mut occupied) => {
                        if occupied.get().is_live(now) {
                            false
                        } else {
                            occupied.insert(MemoryEntry::new(value, ttl));
                            true
                        }
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(MemoryEntry::new(value, ttl));
                        true
                    }
                })
            })
            .await?;
        if stored {
            self.metrics.record_set();
        }
        Ok(stored)
    }

    async fn exists(&self, ctx: &CallContext, key: &str) -> CacheResult<bool> {
        self.run(ctx, "exists", key, |now| {
            Ok(self.entries.get(key).is_some_and(|e| e.is_live(now)))
        })
        .await
    }

    async fn delete(&self, ctx: &CallContext, key: &str) -> CacheResult<()> {
        self.run(ctx, "delete", key, |_| {
            self.entries.remove(key);
            Ok(())
        })
        .await
    }

    async fn delete_if_value(
        &self,
        ctx: &CallContext,
        key: &str,
        expected: &[u8],
    ) -> CacheResult<bool> {
        self.run(ctx, "delete_if_value", key, |now| {
            Ok(self
                .entries
                .remove_if(key, |_, e| e.is_live(now) && &*e.value == expected)
                .is_some())
        })
        .await
    }

    async fn incr(&self, ctx: &CallContext, key: &str) -> CacheResult<i64> {
        self.run(ctx, "incr", key, |now| {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| MemoryEntry {
                    value: Arc::from(&b"0"[..]),
                    expires_at: None,
                });
            if !entry.is_live(now) {
                *entry = MemoryEntry {
                    value: Arc::from(&b"0"[..]),
                    expires_at: None,
                };
            }
            let current: i64 = std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| CacheError::serialization(key, "value is not an integer"))?;
            let next = current
                .checked_add(1)
                .ok_or_else(|| CacheError::serialization(key, "increment would overflow"))?;
            entry.value = Arc::from(next.to_string().as_bytes());
            Ok(next)
        })
        .await
    }

    async fn expire(&self, ctx: &CallContext, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.run(ctx, "expire", key, |now| {
            Ok(match self.entries.get_mut(key) {
                Some(mut e) if e.is_live(now) => {
                    e.expires_at = now.checked_add(ttl);
                    true
                }
                _ => false,
            })
        })
        .await
    }

    async fn health_check(&self, ctx: &CallContext) -> CacheResult<()> {
        ctx.bound(Tier::Distributed, "health_check", self.timeout, self.enter())
            .await
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn close(&self) -> CacheResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        self.entries.clear();
        Ok(())
    }
}

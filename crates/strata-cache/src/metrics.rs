//! Per-tier operation counters.
//!
//! Each tier owns a [`TierMetrics`]. Counters are monotonic for the life of
//! the tier and are also forwarded to the `metrics` facade so an installed
//! exporter (Prometheus in the server) sees them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;

use crate::outcome::Tier;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_SETS_TOTAL: &str = "cache_sets_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";
    pub const CACHE_EVICTIONS_TOTAL: &str = "cache_evictions_total";
    pub const CACHE_DEGRADED_TOTAL: &str = "cache_degraded_total";
}

/// Monotonic counters owned by one tier instance.
#[derive(Debug)]
pub struct TierMetrics {
    tier: Tier,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
}

impl TierMetrics {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_HITS_TOTAL, "tier" => self.tier.as_str()).increment(1);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_MISSES_TOTAL, "tier" => self.tier.as_str()).increment(1);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_SETS_TOTAL, "tier" => self.tier.as_str()).increment(1);
    }

    pub fn record_error(&self, op: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_ERRORS_TOTAL, "tier" => self.tier.as_str(), "op" => op).increment(1);
    }

    pub fn record_evictions(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.evictions.fetch_add(n, Ordering::Relaxed);
        counter!(names::CACHE_EVICTIONS_TOTAL, "tier" => self.tier.as_str()).increment(n);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Records that a tier failure was turned into a miss by policy.
pub(crate) fn record_degraded(tier: Tier, op: &'static str) {
    counter!(names::CACHE_DEGRADED_TOTAL, "tier" => tier.as_str(), "op" => op).increment(1);
}

/// Point-in-time copy of a tier's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
    pub evictions: u64,
}

impl MetricsSnapshot {
    /// Hit rate as a percentage (0.0 - 100.0). Zero when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Counters for one tier as reported by the manager.
#[derive(Debug, Clone, Serialize)]
pub struct TierReport {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub hit_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<usize>,
}

impl TierReport {
    pub fn new(counters: MetricsSnapshot, entries: Option<usize>) -> Self {
        Self {
            hit_rate: counters.hit_rate(),
            counters,
            entries,
        }
    }
}

/// Aggregate report across all enabled tiers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheMetricsReport {
    pub tiers: BTreeMap<Tier, TierReport>,
}

impl CacheMetricsReport {
    pub fn tier(&self, tier: Tier) -> Option<&TierReport> {
        self.tiers.get(&tier)
    }

    /// Hit rate across tiers, counting a lookup once at the tier that answered.
    pub fn overall_hit_rate(&self) -> f64 {
        let hits: u64 = self.tiers.values().map(|r| r.counters.hits).sum();
        // A local miss that falls through to the distributed tier is not a
        // final miss, so only the last tier's misses count.
        let misses = self
            .tiers
            .values()
            .next_back()
            .map_or(0, |r| r.counters.misses);
        MetricsSnapshot {
            hits,
            misses,
            ..Default::default()
        }
        .hit_rate()
    }
}

//! Shared, cross-instance cache tier.
//!
//! [`DistributedTier`] is the seam the manager talks to. Every method takes a
//! [`CallContext`] and is bounded by it; implementations fall back to their
//! own default timeout when the caller supplies no deadline. A missing key is
//! reported as [`Lookup::Miss`] or `false`, never as an error.

mod memory;
mod redis_tier;

pub use memory::MemoryTier;
pub use redis_tier::RedisTier;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::CallContext;
use crate::error::CacheResult;
use crate::metrics::MetricsSnapshot;
use crate::outcome::{CacheValue, Lookup};

#[async_trait]
pub trait DistributedTier: Send + Sync + Debug {
    /// Short backend name for logs and health reports.
    fn name(&self) -> &'static str;

    async fn get(&self, ctx: &CallContext, key: &str) -> CacheResult<Lookup>;

    async fn set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: CacheValue,
        ttl: Duration,
    ) -> CacheResult<()>;

    /// Atomically stores `value` only if `key` is absent.
    ///
    /// Of two concurrent calls for the same key, exactly one returns `true`.
    async fn set_if_absent(
        &self,
        ctx: &CallContext,
        key: &str,
        value: CacheValue,
        ttl: Duration,
    ) -> CacheResult<bool>;

    async fn exists(&self, ctx: &CallContext, key: &str) -> CacheResult<bool>;

    /// Removes `key`. Absent keys are not an error.
    async fn delete(&self, ctx: &CallContext, key: &str) -> CacheResult<()>;

    /// Atomically removes `key` only if it currently holds `expected`.
    async fn delete_if_value(
        &self,
        ctx: &CallContext,
        key: &str,
        expected: &[u8],
    ) -> CacheResult<bool>;

    /// Increments the integer at `key`, creating it at 0 first if absent.
    async fn incr(&self, ctx: &CallContext, key: &str) -> CacheResult<i64>;

    /// Sets a new TTL. Returns `false` if the key does not exist.
    async fn expire(&self, ctx: &CallContext, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Lightweight round-trip probe, independent of the cache counters.
    async fn health_check(&self, ctx: &CallContext) -> CacheResult<()>;

    fn metrics(&self) -> MetricsSnapshot;

    /// Releases connections. Later calls fail with `Unavailable { Closed }`.
    async fn close(&self) -> CacheResult<()>;
}

//! Unified entry point over the local and distributed tiers.
//!
//! ## Lookup order
//!
//! 1. Local tier (microseconds, never fails)
//! 2. Distributed tier (network, bounded by the call context)
//! 3. Caller-supplied fetch from the source of truth (`get_or_set` only)
//!
//! A distributed hit is written back to the local tier. Every tier failure
//! passes through [`CachePolicy`], which decides between degrading to a miss
//! and surfacing the error.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::context::CallContext;
use crate::distributed::DistributedTier;
use crate::error::{CacheError, CacheResult};
use crate::local::LocalTier;
use crate::metrics::{CacheMetricsReport, TierReport};
use crate::outcome::{
    Advisory, CacheRead, CacheValue, Lookup, Resolved, SideEffectKind, Source, Tier, TierHealth,
    ValueSource,
};
use crate::policy::CachePolicy;

/// Builder for [`CacheManager`].
#[derive(Default)]
pub struct CacheManagerBuilder {
    policy: CachePolicy,
    local: Option<Arc<LocalTier>>,
    distributed: Option<Arc<dyn DistributedTier>>,
}

impl CacheManagerBuilder {
    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn local(mut self, tier: Arc<LocalTier>) -> Self {
        self.local = Some(tier);
        self
    }

    pub fn distributed(mut self, tier: Arc<dyn DistributedTier>) -> Self {
        self.distributed = Some(tier);
        self
    }

    /// Attaches `tier` if present. Convenient when the distributed tier failed
    /// to connect and the manager should run without it.
    pub fn maybe_distributed(mut self, tier: Option<Arc<dyn DistributedTier>>) -> Self {
        self.distributed = tier;
        self
    }

    pub fn build(self) -> CacheManager {
        if self.policy.enable_local && self.local.is_none() {
            tracing::warn!("local cache enabled but no local tier supplied; running without it");
        }
        if self.policy.enable_distributed && self.distributed.is_none() {
            tracing::warn!(
                "distributed cache enabled but no distributed tier supplied; running without it"
            );
        }
        tracing::info!(
            local = self.local.is_some() && self.policy.enable_local,
            distributed = self.distributed.is_some() && self.policy.enable_distributed,
            graceful_degradation = self.policy.graceful_degradation,
            write_through = self.policy.write_through,
            "cache manager ready"
        );
        CacheManager {
            policy: self.policy,
            local: self.local,
            distributed: self.distributed,
        }
    }
}

/// Orchestrates both tiers. Holds no mutable state of its own, so a single
/// instance can be shared across tasks behind an `Arc`.
pub struct CacheManager {
    policy: CachePolicy,
    local: Option<Arc<LocalTier>>,
    distributed: Option<Arc<dyn DistributedTier>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("policy", &self.policy)
            .field("local", &self.local)
            .field("distributed", &self.distributed.as_ref().map(|d| d.name()))
            .finish()
    }
}

impl CacheManager {
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::default()
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// The local tier, if present and enabled.
    pub fn local_tier(&self) -> Option<&LocalTier> {
        self.local
            .as_deref()
            .filter(|_| self.policy.enable_local)
    }

    /// The distributed tier, if present and enabled.
    pub fn distributed_tier(&self) -> Option<&dyn DistributedTier> {
        self.distributed
            .as_deref()
            .filter(|_| self.policy.enable_distributed)
    }

    /// Looks `key` up in each enabled tier in order.
    ///
    /// A miss is `Ok` with `source == Source::Miss`. A distributed-tier
    /// failure becomes a miss under graceful degradation and an error
    /// otherwise.
    pub async fn get(&self, ctx: &CallContext, key: &str) -> CacheResult<CacheRead> {
        let mut advisory = Advisory::new();

        if let Some(local) = self.local_tier() {
            if let Lookup::Hit(value) = local.get(key) {
                tracing::debug!(key = %key, "cache hit (local)");
                return Ok(CacheRead {
                    value: Some(value),
                    source: Source::Local,
                    advisory,
                });
            }
        }

        let Some(distributed) = self.distributed_tier() else {
            tracing::debug!(key = %key, "cache miss");
            return Ok(CacheRead::miss(advisory));
        };

        match distributed.get(ctx, key).await {
            Ok(Lookup::Hit(value)) => {
                if let Some(local) = self.local_tier() {
                    let written = local.set(key, Arc::clone(&value));
                    if let Err(e) = &written {
                        tracing::warn!(tier = "local", key = %key, error = %e, "local write-back failed");
                    }
                    advisory.record(SideEffectKind::LocalWriteBack, Tier::Local, written);
                }
                Ok(CacheRead {
                    value: Some(value),
                    source: Source::Distributed,
                    advisory,
                })
            }
            Ok(Lookup::Miss) => {
                tracing::debug!(key = %key, "cache miss");
                Ok(CacheRead::miss(advisory))
            }
            Err(e) => {
                self.policy.degrade("get", key, e)?;
                Ok(CacheRead::miss(advisory))
            }
        }
    }

    /// Writes `value` to the enabled tiers with the default distributed TTL.
    pub async fn set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: impl Into<CacheValue>,
    ) -> CacheResult<Advisory> {
        self.set_with_ttl(ctx, key, value, self.policy.distributed_ttl)
            .await
    }

    /// Like [`CacheManager::set`] with an explicit distributed TTL. Local
    /// entries always use the local life window.
    pub async fn set_with_ttl(
        &self,
        ctx: &CallContext,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: Duration,
    ) -> CacheResult<Advisory> {
        let results = self.write_tiers(ctx, key, value.into(), ttl).await;
        let attempted = results.len();
        let failures = results
            .into_iter()
            .filter_map(|(tier, res)| res.err().map(|e| (tier, e)))
            .collect();
        self.policy
            .resolve_writes("set", key, SideEffectKind::TolerantWrite, failures, attempted)
    }

    /// Writes the tiers selected by the write plan, local first.
    async fn write_tiers(
        &self,
        ctx: &CallContext,
        key: &str,
        value: CacheValue,
        ttl: Duration,
    ) -> Vec<(Tier, CacheResult<()>)> {
        let plan = self
            .policy
            .write_plan(self.local_tier().is_some(), self.distributed_tier().is_some());
        let mut results = Vec::with_capacity(2);

        if let Some(local) = self.local_tier() {
            if plan.drop_local {
                local.delete(key);
            } else if plan.local {
                results.push((Tier::Local, local.set(key, Arc::clone(&value))));
            }
        }
        if let Some(distributed) = self.distributed_tier().filter(|_| plan.distributed) {
            results.push((Tier::Distributed, distributed.set(ctx, key, value, ttl).await));
        }
        results
    }

    /// Read-through lookup.
    ///
    /// On a miss `fetch` runs exactly once; its error is returned unchanged.
    /// The fetched value is written back best-effort: a failed backfill shows
    /// up in the advisory, never in the result.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        ctx: &CallContext,
        key: &str,
        fetch: F,
    ) -> Result<Resolved<CacheValue>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue, E>>,
        E: From<CacheError>,
    {
        let read = self.get(ctx, key).await?;
        let mut advisory = read.advisory;

        if let Some(value) = read.value {
            let source = match read.source {
                Source::Local => ValueSource::Local,
                _ => ValueSource::Distributed,
            };
            return Ok(Resolved {
                value,
                source,
                advisory,
            });
        }

        let value = fetch().await?;
        advisory.extend(self.backfill(ctx, key, Arc::clone(&value)).await);

        Ok(Resolved {
            value,
            source: ValueSource::Origin,
            advisory,
        })
    }

    /// Best-effort population after a fetch from the source of truth.
    pub(crate) async fn backfill(&self, ctx: &CallContext, key: &str, value: CacheValue) -> Advisory {
        let mut advisory = Advisory::new();
        for (tier, res) in self
            .write_tiers(ctx, key, value, self.policy.distributed_ttl)
            .await
        {
            if let Err(e) = &res {
                tracing::warn!(tier = %tier, key = %key, error = %e, "cache backfill failed");
            }
            advisory.record(SideEffectKind::Backfill, tier, res);
        }
        advisory
    }

    /// Removes `key` from every enabled tier. Absent keys are not an error.
    pub async fn delete(&self, ctx: &CallContext, key: &str) -> CacheResult<Advisory> {
        let mut attempted = 0;
        let mut failures = Vec::new();

        if let Some(local) = self.local_tier() {
            attempted += 1;
            local.delete(key);
        }
        if let Some(distributed) = self.distributed_tier() {
            attempted += 1;
            if let Err(e) = distributed.delete(ctx, key).await {
                failures.push((Tier::Distributed, e));
            }
        }
        self.policy
            .resolve_writes("delete", key, SideEffectKind::TolerantDelete, failures, attempted)
    }

    /// `true` if any enabled tier holds `key`.
    ///
    /// Under graceful degradation a distributed-tier failure reads as `false`.
    pub async fn exists(&self, ctx: &CallContext, key: &str) -> CacheResult<bool> {
        if self.local_tier().is_some_and(|local| local.exists(key)) {
            return Ok(true);
        }
        let Some(distributed) = self.distributed_tier() else {
            return Ok(false);
        };
        match distributed.exists(ctx, key).await {
            Ok(found) => Ok(found),
            Err(e) => {
                self.policy.degrade("exists", key, e)?;
                Ok(false)
            }
        }
    }

    /// Per-tier counters. Disabled tiers are omitted.
    pub fn metrics(&self) -> CacheMetricsReport {
        let mut report = CacheMetricsReport::default();
        if let Some(local) = self.local_tier() {
            report
                .tiers
                .insert(Tier::Local, TierReport::new(local.metrics(), Some(local.len())));
        }
        if let Some(distributed) = self.distributed_tier() {
            report
                .tiers
                .insert(Tier::Distributed, TierReport::new(distributed.metrics(), None));
        }
        report
    }

    /// Probes each tier. The local tier is healthy whenever it is enabled.
    pub async fn health_check(&self, ctx: &CallContext) -> BTreeMap<Tier, TierHealth> {
        let mut health = BTreeMap::new();

        let local = if self.local_tier().is_some() {
            TierHealth::Healthy
        } else {
            TierHealth::Disabled
        };
        health.insert(Tier::Local, local);

        let distributed = match self.distributed_tier() {
            Some(tier) => match tier.health_check(ctx).await {
                Ok(()) => TierHealth::Healthy,
                Err(e) => {
                    tracing::warn!(tier = tier.name(), error = %e, "distributed cache health check failed");
                    TierHealth::Unhealthy(e.to_string())
                }
            },
            None => TierHealth::Disabled,
        };
        health.insert(Tier::Distributed, distributed);

        health
    }

    /// Closes both tiers and logs the final counters.
    ///
    /// Tiers are closed even when disabled by policy, since the manager was
    /// handed their lifecycle.
    pub async fn close(&self) -> CacheResult<()> {
        for (tier, report) in &self.metrics().tiers {
            tracing::info!(
                tier = %tier,
                hits = report.counters.hits,
                misses = report.counters.misses,
                sets = report.counters.sets,
                errors = report.counters.errors,
                hit_rate = report.hit_rate,
                "final cache metrics"
            );
        }

        let mut failures = Vec::new();
        if let Some(local) = &self.local {
            local.close();
        }
        if let Some(distributed) = &self.distributed {
            if let Err(e) = distributed.close().await {
                failures.push(format!("{}: {e}", Tier::Distributed));
            }
        }

        if failures.is_empty() {
            tracing::info!("cache manager closed");
            Ok(())
        } else {
            Err(CacheError::Shutdown {
                message: failures.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalTierConfig;
    use crate::distributed::MemoryTier;

    fn local() -> Arc<LocalTier> {
        let config = LocalTierConfig {
            shards: 4,
            max_entries: 128,
            clean_interval_ms: 0,
            ..Default::default()
        };
        Arc::new(LocalTier::new(&config, Duration::from_secs(60)).unwrap())
    }

    #[tokio::test]
    async fn no_tiers_means_miss() {
        let manager = CacheManager::builder()
            .policy(CachePolicy {
                enable_local: false,
                enable_distributed: false,
                ..CachePolicy::default()
            })
            .build();
        let ctx = CallContext::background();

        let read = manager.get(&ctx, "k").await.unwrap();
        assert_eq!(read.source, Source::Miss);
        assert!(manager.set(&ctx, "k", b"v".to_vec()).await.unwrap().is_empty());
        assert!(!manager.exists(&ctx, "k").await.unwrap());
    }

    #[tokio::test]
    async fn disabled_tier_is_ignored_even_when_supplied() {
        let distributed = Arc::new(MemoryTier::new());
        let manager = CacheManager::builder()
            .policy(CachePolicy {
                enable_distributed: false,
                ..CachePolicy::default()
            })
            .local(local())
            .distributed(distributed.clone())
            .build();
        let ctx = CallContext::background();

        manager.set(&ctx, "k", b"v".to_vec()).await.unwrap();
        assert!(distributed.is_empty());

        let health = manager.health_check(&ctx).await;
        assert_eq!(health[&Tier::Distributed], TierHealth::Disabled);
        assert!(manager.metrics().tier(Tier::Distributed).is_none());
    }

    #[tokio::test]
    async fn delete_tolerates_distributed_outage() {
        let distributed = Arc::new(MemoryTier::new());
        let manager = CacheManager::builder()
            .local(local())
            .distributed(distributed.clone())
            .build();
        let ctx = CallContext::background();

        manager.set(&ctx, "k", b"v".to_vec()).await.unwrap();
        distributed.set_available(false);

        let advisory = manager.delete(&ctx, "k").await.unwrap();
        assert!(advisory.attempted(SideEffectKind::TolerantDelete));
        assert!(!manager.local_tier().unwrap().exists("k"));
    }

    #[tokio::test]
    async fn close_reports_and_releases() {
        let distributed = Arc::new(MemoryTier::new());
        let manager = CacheManager::builder()
            .local(local())
            .distributed(distributed.clone())
            .build();
        let ctx = CallContext::background();
        manager.set(&ctx, "k", b"v".to_vec()).await.unwrap();

        manager.close().await.unwrap();
        assert!(manager.local_tier().unwrap().is_empty());
        assert!(distributed.health_check(&ctx).await.is_err());
    }
}

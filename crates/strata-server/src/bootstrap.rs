//! Builds the cache, the store and the user service from configuration.

use std::sync::Arc;

use strata_cache::{CacheManager, DistributedTier, LocalTier, MemoryTier, RedisTier};
use tracing::{info, warn};

use crate::config::{AppConfig, DistributedBackend, StorageBackend};
use crate::service::UserService;
use crate::store::{MemoryUserStore, PgUserStore, UserStore};

/// Builds the cache manager.
///
/// An unreachable Redis at startup is not fatal: the manager runs without a
/// distributed tier and every request falls through to the store.
pub async fn build_cache(cfg: &AppConfig) -> anyhow::Result<CacheManager> {
    let policy = cfg.cache.policy.to_policy();

    let local = if policy.enable_local {
        let tier = Arc::new(LocalTier::new(&cfg.cache.local, policy.local_ttl)?);
        if let Some(interval) = cfg.cache.local.clean_interval() {
            // Stops when the tier is closed.
            let _cleaner = tier.start_cleaner(interval);
        }
        info!(
            shards = cfg.cache.local.shards,
            capacity = tier.capacity(),
            ttl_ms = cfg.cache.policy.local_ttl_ms,
            "local cache tier initialized"
        );
        Some(tier)
    } else {
        None
    };

    let distributed: Option<Arc<dyn DistributedTier>> = if policy.enable_distributed {
        match cfg.distributed.backend {
            DistributedBackend::Memory => {
                info!("using in-process distributed tier");
                Some(memory_tier(cfg))
            }
            DistributedBackend::Redis => match RedisTier::connect(&cfg.cache.redis).await {
                Ok(tier) => Some(Arc::new(tier)),
                Err(e) => {
                    warn!(error = %e, "failed to connect to redis, continuing without distributed cache");
                    None
                }
            },
        }
    } else {
        None
    };

    let mut builder = CacheManager::builder()
        .policy(policy)
        .maybe_distributed(distributed);
    if let Some(local) = local {
        builder = builder.local(local);
    }
    Ok(builder.build())
}

fn memory_tier(cfg: &AppConfig) -> Arc<MemoryTier> {
    let tier = Arc::new(MemoryTier::new());
    if let Some(interval) = cfg.distributed.memory_clean_interval() {
        // Stops when the tier is closed.
        let _cleaner = tier.start_cleaner(interval);
    }
    tier
}

pub async fn build_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn UserStore>> {
    let store: Arc<dyn UserStore> = match cfg.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryUserStore::new()),
        StorageBackend::Postgres => Arc::new(PgUserStore::connect(&cfg.storage.postgres).await?),
    };
    info!(backend = store.name(), "user store initialized");
    Ok(store)
}

pub async fn build_service(cfg: &AppConfig) -> anyhow::Result<UserService> {
    let cache = build_cache(cfg).await?;
    let store = match build_store(cfg).await {
        Ok(store) => store,
        Err(e) => {
            // The cache already holds pools and a cleaner task.
            if let Err(close_err) = cache.close().await {
                warn!(error = %close_err, "failed to close cache after store init failure");
            }
            return Err(e);
        }
    };
    Ok(UserService::new(
        Arc::new(cache),
        store,
        cfg.users.reservation_ttl(),
        cfg.request_timeout(),
    ))
}

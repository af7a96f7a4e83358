//! Configuration for the cache tiers and the manager policy.
//!
//! Durations are carried as integer milliseconds (`*_ms`) so the structs map
//! directly onto TOML and `STRATA__CACHE__...` environment overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::policy::{CachePolicy, ReservationOutage};

/// Top-level cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub local: LocalTierConfig,
    #[serde(default)]
    pub redis: RedisTierConfig,
}

impl CacheConfig {
    pub fn validate(&self) -> CacheResult<()> {
        self.policy.validate()?;
        if self.policy.enable_local {
            self.local.validate()?;
        }
        if self.policy.enable_distributed {
            self.redis.validate()?;
        }
        Ok(())
    }
}

/// Manager policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub enable_local: bool,

    #[serde(default = "default_true")]
    pub enable_distributed: bool,

    /// Treat distributed-tier outages as misses instead of errors.
    #[serde(default = "default_true")]
    pub graceful_degradation: bool,

    /// Write every enabled tier on `set`. When off, only the distributed tier
    /// is written and the local tier fills on read.
    #[serde(default = "default_true")]
    pub write_through: bool,

    /// Local life window. Applies to every local entry.
    #[serde(default = "default_local_ttl_ms")]
    pub local_ttl_ms: u64,

    #[serde(default = "default_distributed_ttl_ms")]
    pub distributed_ttl_ms: u64,

    /// What `reserve_unique` returns when the distributed tier is down.
    #[serde(default)]
    pub reservation_outage: ReservationOutage,
}

fn default_true() -> bool {
    true
}

fn default_local_ttl_ms() -> u64 {
    60_000
}

fn default_distributed_ttl_ms() -> u64 {
    600_000
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enable_local: true,
            enable_distributed: true,
            graceful_degradation: true,
            write_through: true,
            local_ttl_ms: default_local_ttl_ms(),
            distributed_ttl_ms: default_distributed_ttl_ms(),
            reservation_outage: ReservationOutage::default(),
        }
    }
}

impl PolicyConfig {
    pub fn local_ttl(&self) -> Duration {
        Duration::from_millis(self.local_ttl_ms)
    }

    pub fn distributed_ttl(&self) -> Duration {
        Duration::from_millis(self.distributed_ttl_ms)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.enable_local && self.local_ttl_ms == 0 {
            return Err(CacheError::configuration("policy.local_ttl_ms must be > 0"));
        }
        if self.enable_distributed && self.distributed_ttl_ms == 0 {
            return Err(CacheError::configuration(
                "policy.distributed_ttl_ms must be > 0",
            ));
        }
        Ok(())
    }

    pub fn to_policy(&self) -> CachePolicy {
        CachePolicy {
            enable_local: self.enable_local,
            enable_distributed: self.enable_distributed,
            graceful_degradation: self.graceful_degradation,
            write_through: self.write_through,
            local_ttl: self.local_ttl(),
            distributed_ttl: self.distributed_ttl(),
            reservation_outage: self.reservation_outage,
        }
    }
}

/// Sizing of the in-process tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTierConfig {
    /// Number of shards. Must be a power of two.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Maximum number of live entries, split evenly across shards.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Largest value accepted, in bytes.
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size: usize,

    /// Upper bound on stored bytes (keys + values). `0` disables the bound.
    #[serde(default)]
    pub hard_capacity_bytes: usize,

    /// How often expired entries are purged. `0` disables the cleaner.
    #[serde(default = "default_clean_interval_ms")]
    pub clean_interval_ms: u64,
}

fn default_shards() -> usize {
    1024
}

fn default_max_entries() -> usize {
    600_000
}

fn default_max_entry_size() -> usize {
    64 * 1024
}

fn default_clean_interval_ms() -> u64 {
    300_000
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            max_entries: default_max_entries(),
            max_entry_size: default_max_entry_size(),
            hard_capacity_bytes: 0,
            clean_interval_ms: default_clean_interval_ms(),
        }
    }
}

impl LocalTierConfig {
    pub fn clean_interval(&self) -> Option<Duration> {
        (self.clean_interval_ms > 0).then(|| Duration::from_millis(self.clean_interval_ms))
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.shards == 0 || !self.shards.is_power_of_two() {
            return Err(CacheError::configuration(format!(
                "local.shards must be a power of two, got {}",
                self.shards
            )));
        }
        if self.max_entries == 0 {
            return Err(CacheError::configuration("local.max_entries must be > 0"));
        }
        if self.max_entries < self.shards {
            return Err(CacheError::configuration(format!(
                "local.max_entries ({}) must be >= local.shards ({})",
                self.max_entries, self.shards
            )));
        }
        if self.max_entry_size == 0 {
            return Err(CacheError::configuration("local.max_entry_size must be > 0"));
        }
        if self.hard_capacity_bytes > 0 && self.hard_capacity_bytes / self.shards < self.max_entry_size {
            return Err(CacheError::configuration(format!(
                "local.hard_capacity_bytes per shard ({}) is smaller than local.max_entry_size ({})",
                self.hard_capacity_bytes / self.shards,
                self.max_entry_size
            )));
        }
        Ok(())
    }
}

/// Connection parameters for the Redis tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisTierConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connections opened eagerly at startup.
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// How long to wait for a free pooled connection.
    #[serde(default = "default_pool_timeout_ms")]
    pub pool_timeout_ms: u64,

    /// Extra attempts for idempotent commands after a transport error.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_min_idle() -> usize {
    5
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    3000
}

fn default_write_timeout_ms() -> u64 {
    3000
}

fn default_pool_timeout_ms() -> u64 {
    4000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RedisTierConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            min_idle: default_min_idle(),
            dial_timeout_ms: default_dial_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            pool_timeout_ms: default_pool_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl RedisTierConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.url.trim().is_empty() {
            return Err(CacheError::configuration("redis.url must not be empty"));
        }
        if self.pool_size == 0 {
            return Err(CacheError::configuration("redis.pool_size must be > 0"));
        }
        if self.min_idle > self.pool_size {
            return Err(CacheError::configuration(format!(
                "redis.min_idle ({}) must be <= redis.pool_size ({})",
                self.min_idle, self.pool_size
            )));
        }
        for (name, value) in [
            ("dial_timeout_ms", self.dial_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("pool_timeout_ms", self.pool_timeout_ms),
        ] {
            if value == 0 {
                return Err(CacheError::configuration(format!(
                    "redis.{name} must be > 0"
                )));
            }
        }
        Ok(())
    }
}

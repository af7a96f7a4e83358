//! Redis-backed distributed tier over a `deadpool-redis` pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime, Timeouts};
use redis::{Cmd, ErrorKind, FromRedisValue, RedisError};

use super::DistributedTier;
use crate::config::RedisTierConfig;
use crate::context::CallContext;
use crate::error::{CacheError, CacheResult, UnavailableReason};
use crate::metrics::{MetricsSnapshot, TierMetrics};
use crate::outcome::{CacheValue, Lookup, Tier};

/// Deletes KEYS[1] only when it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const RETRY_BACKOFF: Duration = Duration::from_millis(8);

/// Whether a command may be sent again after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    Idempotent,
    Once,
}

/// Which default timeout bounds a command.
#[derive(Debug, Clone, Copy)]
enum Direction {
    Read,
    Write,
}

pub struct RedisTier {
    pool: Pool,
    config: RedisTierConfig,
    redacted_url: String,
    closed: AtomicBool,
    metrics: TierMetrics,
}

impl std::fmt::Debug for RedisTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTier")
            .field("url", &self.redacted_url)
            .field("pool_size", &self.config.pool_size)
            .finish()
    }
}

impl RedisTier {
    /// Builds the pool, opens `min_idle` connections and PINGs the server,
    /// all within the dial timeout.
    ///
    /// Returns no client when the server cannot be reached.
    pub async fn connect(config: &RedisTierConfig) -> CacheResult<Self> {
        config.validate()?;
        let redacted_url = redact_url(&config.url);

        let mut timeouts = Timeouts::default();
        timeouts.wait = Some(config.pool_timeout());
        timeouts.create = Some(config.dial_timeout());
        timeouts.recycle = Some(config.dial_timeout());

        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts = timeouts;

        let mut redis_config = Config::from_url(&config.url);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| {
                CacheError::configuration(format!("invalid redis url {redacted_url}: {e}"))
            })?;

        tracing::info!(url = %redacted_url, pool_size = config.pool_size, "Connecting to Redis");

        let tier = Self {
            pool,
            config: config.clone(),
            redacted_url,
            closed: AtomicBool::new(false),
            metrics: TierMetrics::new(Tier::Distributed),
        };

        match tokio::time::timeout(config.dial_timeout(), tier.warm_up()).await {
            Ok(Ok(())) => {
                tracing::info!(url = %tier.redacted_url, min_idle = config.min_idle, "Connected to Redis");
                Ok(tier)
            }
            Ok(Err(e)) => {
                tier.pool.close();
                Err(e)
            }
            Err(_) => {
                tier.pool.close();
                Err(CacheError::unavailable(
                    Tier::Distributed,
                    UnavailableReason::Timeout,
                    format!(
                        "redis at {} did not answer within {}ms",
                        tier.redacted_url, config.dial_timeout_ms
                    ),
                ))
            }
        }
    }

    async fn warm_up(&self) -> CacheResult<()> {
        let mut conns = Vec::with_capacity(self.config.min_idle.max(1));
        for _ in 0..self.config.min_idle.max(1) {
            conns.push(self.pool.get().await.map_err(|e| {
                CacheError::transport(Tier::Distributed, format!("redis connect failed: {e}"))
            })?);
        }
        let pong: String = redis::cmd("PING")
            .query_async(&mut conns[0])
            .await
            .map_err(|e| classify(e, "PING", None))?;
        if pong != "PONG" {
            return Err(CacheError::transport(
                Tier::Distributed,
                format!("unexpected PING reply: {pong}"),
            ));
        }
        Ok(())
    }

    pub fn redacted_url(&self) -> &str {
        &self.redacted_url
    }

    fn default_timeout(&self, direction: Direction) -> Duration {
        match direction {
            Direction::Read => self.config.read_timeout(),
            Direction::Write => self.config.write_timeout(),
        }
    }

    async fn query_once<T>(
        &self,
        cmd: &Cmd,
        name: &'static str,
        key: Option<&str>,
    ) -> Result<T, (CacheError, bool)>
    where
        T: FromRedisValue + Send,
    {
        let mut conn = self.pool.get().await.map_err(|e| {
            (
                CacheError::transport(Tier::Distributed, format!("redis pool: {e}")),
                true,
            )
        })?;
        cmd.query_async::<T>(&mut conn).await.map_err(|e| {
            let retryable = e.is_io_error() || e.is_connection_dropped() || e.is_timeout();
            (classify(e, name, key), retryable)
        })
    }

    /// Runs `cmd` bounded by the caller's context, retrying idempotent
    /// commands on transport failures within the same budget.
    async fn query<T>(
        &self,
        ctx: &CallContext,
        op: &'static str,
        key: Option<&str>,
        cmd: Cmd,
        retry: Retry,
        direction: Direction,
    ) -> CacheResult<T>
    where
        T: FromRedisValue + Send,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::unavailable(
                Tier::Distributed,
                UnavailableReason::Closed,
                "redis tier closed",
            ));
        }
        let attempts = match retry {
            Retry::Idempotent => self.config.max_retries + 1,
            Retry::Once => 1,
        };
        ctx.bound(Tier::Distributed, op, self.default_timeout(direction), async {
            let mut attempt = 1;
            loop {
                match self.query_once::<T>(&cmd, op, key).await {
                    Ok(value) => return Ok(value),
                    Err((err, true)) if attempt < attempts => {
                        tracing::debug!(op = op, attempt = attempt, error = %err, "retrying redis command");
                        attempt += 1;
                        tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    }
                    Err((err, _)) => return Err(err),
                }
            }
        })
        .await
    }

    /// [`Self::query`] plus error accounting.
    async fn exec<T>(
        &self,
        ctx: &CallContext,
        op: &'static str,
        key: &str,
        cmd: Cmd,
        retry: Retry,
        direction: Direction,
    ) -> CacheResult<T>
    where
        T: FromRedisValue + Send,
    {
        let res = self.query(ctx, op, Some(key), cmd, retry, direction).await;
        if let Err(e) = &res {
            self.metrics.record_error(op);
            tracing::warn!(tier = "distributed", op = op, key = %key, error = %e, "redis command failed");
        }
        res
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn classify(err: RedisError, command: &str, key: Option<&str>) -> CacheError {
    if err.is_timeout() {
        CacheError::unavailable(
            Tier::Distributed,
            UnavailableReason::Timeout,
            format!("redis {command}: {err}"),
        )
    } else if err.kind() == ErrorKind::TypeError {
        CacheError::serialization(key.unwrap_or_default(), format!("redis {command}: {err}"))
    } else {
        CacheError::transport(Tier::Distributed, format!("redis {command}: {err}"))
    }
}

/// Masks the password in a connection URL for logging.
pub(crate) fn redact_url(url: &str) -> String {
    let authority_start = url.find("://").map_or(0, |i| i + 3);
    let Some(at) = url[authority_start..].find('@').map(|i| i + authority_start) else {
        return url.to_string();
    };
    match url[authority_start..at].find(':') {
        Some(colon) => {
            let colon = colon + authority_start;
            format!("{}***{}", &url[..=colon], &url[at..])
        }
        None => url.to_string(),
    }
}

#[async_trait]
impl DistributedTier for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, ctx: &CallContext, key: &str) -> CacheResult<Lookup> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let value: Option<Vec<u8>> = self
            .exec(ctx, "get", key, cmd, Retry::Idempotent, Direction::Read)
            .await?;
        match value {
            Some(bytes) => {
                tracing::debug!(key = %key, "cache hit (distributed)");
                self.metrics.record_hit();
                Ok(Lookup::Hit(Arc::from(bytes)))
            }
            None => {
                tracing::debug!(key = %key, "cache miss (distributed)");
                self.metrics.record_miss();
                Ok(Lookup::Miss)
            }
        }
    }

    async fn set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: CacheValue,
        ttl: Duration,
    ) -> CacheResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(&*value).arg("PX").arg(ttl_millis(ttl));
        self.exec::<()>(ctx, "set", key, cmd, Retry::Idempotent, Direction::Write)
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
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(&*value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl));
        // A resent SET NX could observe its own first write, so no retries.
        let reply: Option<String> = self
            .exec(ctx, "set_if_absent", key, cmd, Retry::Once, Direction::Write)
            .await?;
        let stored = reply.is_some();
        if stored {
            self.metrics.record_set();
        }
        Ok(stored)
    }

    async fn exists(&self, ctx: &CallContext, key: &str) -> CacheResult<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let count: i64 = self
            .exec(ctx, "exists", key, cmd, Retry::Idempotent, Direction::Read)
            .await?;
        Ok(count > 0)
    }

    async fn delete(&self, ctx: &CallContext, key: &str) -> CacheResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.exec::<()>(ctx, "delete", key, cmd, Retry::Idempotent, Direction::Write)
            .await
    }

    async fn delete_if_value(
        &self,
        ctx: &CallContext,
        key: &str,
        expected: &[u8],
    ) -> CacheResult<bool> {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(COMPARE_AND_DELETE).arg(1).arg(key).arg(expected);
        let removed: i64 = self
            .exec(ctx, "delete_if_value", key, cmd, Retry::Once, Direction::Write)
            .await?;
        Ok(removed > 0)
    }

    async fn incr(&self, ctx: &CallContext, key: &str) -> CacheResult<i64> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        self.exec(ctx, "incr", key, cmd, Retry::Once, Direction::Write)
            .await
    }

    async fn expire(&self, ctx: &CallContext, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl_millis(ttl));
        let applied: i64 = self
            .exec(ctx, "expire", key, cmd, Retry::Idempotent, Direction::Write)
            .await?;
        Ok(applied == 1)
    }

    async fn health_check(&self, ctx: &CallContext) -> CacheResult<()> {
        let pong: String = self
            .query(ctx, "health_check", None, redis::cmd("PING"), Retry::Once, Direction::Read)
            .await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CacheError::transport(
                Tier::Distributed,
                format!("unexpected PING reply: {pong}"),
            ))
        }
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.close();
        tracing::info!(url = %self.redacted_url, "Redis pool closed");
        Ok(())
    }
}

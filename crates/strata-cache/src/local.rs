//! In-process cache tier.
//!
//! Keys are spread over a power-of-two number of shards, each behind its own
//! `parking_lot::RwLock`, so readers and writers of different keys rarely
//! contend. Every entry lives for the tier's fixed life window; capacity is
//! enforced per shard with CLOCK (second-chance) eviction.
//!
//! The tier never performs I/O and never reports `Unavailable`.

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LocalTierConfig;
use crate::error::{CacheError, CacheResult};
use crate::metrics::{MetricsSnapshot, TierMetrics};
use crate::outcome::{CacheValue, Lookup, Tier};

struct Entry {
    value: CacheValue,
    expires_at: Instant,
    /// Second-chance bit, set on read, cleared by the clock hand.
    referenced: AtomicBool,
    /// Matches the entry to its slot in the clock queue.
    seq: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, Entry>,
    clock: VecDeque<(String, u64)>,
    next_seq: u64,
    bytes: usize,
}

impl Shard {
    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.bytes -= key.len() + entry.value.len();
        Some(entry)
    }

    /// Advances the clock hand until one entry has been evicted.
    /// Returns `false` if the shard is empty.
    fn evict_one(&mut self, now: Instant) -> bool {
        while let Some((key, seq)) = self.clock.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            if entry.seq != seq {
                continue;
            }
            if !entry.is_expired(now) && entry.referenced.swap(false, Ordering::Relaxed) {
                self.clock.push_back((key, seq));
                continue;
            }
            self.remove(&key);
            return true;
        }
        false
    }

    /// Drops queue slots whose entries are gone.
    fn compact_clock(&mut self) {
        if self.clock.len() <= self.entries.len() * 2 + 16 {
            return;
        }
        let entries = &self.entries;
        self.clock
            .retain(|(key, seq)| entries.get(key).is_some_and(|e| e.seq == *seq));
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|key, entry| {
            if entry.is_expired(now) {
                freed += key.len() + entry.value.len();
                false
            } else {
                true
            }
        });
        self.bytes -= freed;
        self.compact_clock();
        before - self.entries.len()
    }
}

/// Bounded, sharded, TTL-expiring in-process store.
pub struct LocalTier {
    shards: Box<[RwLock<Shard>]>,
    mask: usize,
    hasher: RandomState,
    ttl: Duration,
    entries_per_shard: usize,
    bytes_per_shard: Option<usize>,
    max_entry_size: usize,
    metrics: TierMetrics,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for LocalTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTier")
            .field("shards", &self.shards.len())
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl LocalTier {
    /// Builds a tier whose entries live for `ttl`.
    ///
    /// Fails with [`CacheError::Configuration`] if the sizing is invalid.
    pub fn new(config: &LocalTierConfig, ttl: Duration) -> CacheResult<Self> {
        config.validate()?;
        if ttl.is_zero() {
            return Err(CacheError::configuration("local ttl must be > 0"));
        }

        let shards = (0..config.shards)
            .map(|_| RwLock::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let bytes_per_shard =
            (config.hard_capacity_bytes > 0).then(|| config.hard_capacity_bytes / config.shards);

        tracing::debug!(
            shards = config.shards,
            max_entries = config.max_entries,
            ttl_ms = ttl.as_millis() as u64,
            "local cache tier created"
        );

        Ok(Self {
            shards,
            mask: config.shards - 1,
            hasher: RandomState::new(),
            ttl,
            entries_per_shard: config.max_entries / config.shards,
            bytes_per_shard,
            max_entry_size: config.max_entry_size,
            metrics: TierMetrics::new(Tier::Local),
            shutdown: CancellationToken::new(),
        })
    }

    fn shard(&self, key: &str) -> &RwLock<Shard> {
        let idx = (self.hasher.hash_one(key) as usize) & self.mask;
        &self.shards[idx]
    }

    /// Stores `value`, restarting its life window.
    pub fn set(&self, key: &str, value: CacheValue) -> CacheResult<()> {
        if value.len() > self.max_entry_size {
            self.metrics.record_error("set");
            return Err(CacheError::EntryTooLarge {
                key: key.to_string(),
                size: value.len(),
                max: self.max_entry_size,
            });
        }

        let now = Instant::now();
        let size = key.len() + value.len();
        let mut shard = self.shard(key).write();

        // An overwrite goes through the same bounds as a new key; the old
        // clock slot goes stale and is dropped by compaction.
        shard.remove(key);

        let mut evicted = 0u64;
        while shard.entries.len() >= self.entries_per_shard
            || self
                .bytes_per_shard
                .is_some_and(|cap| shard.bytes + size > cap)
        {
            if !shard.evict_one(now) {
                break;
            }
            evicted += 1;
        }

        let seq = shard.next_seq;
        shard.next_seq += 1;
        shard.bytes += size;
        shard.clock.push_back((key.to_string(), seq));
        shard.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + self.ttl,
                referenced: AtomicBool::new(false),
                seq,
            },
        );
        shard.compact_clock();
        drop(shard);

        self.metrics.record_evictions(evicted);
        self.metrics.record_set();
        Ok(())
    }

    pub fn get(&self, key: &str) -> Lookup {
        let now = Instant::now();
        let found = {
            let shard = self.shard(key).read();
            shard.entries.get(key).and_then(|entry| {
                if entry.is_expired(now) {
                    None
                } else {
                    entry.referenced.store(true, Ordering::Relaxed);
                    Some(Arc::clone(&entry.value))
                }
            })
        };

        match found {
            Some(value) => {
                self.metrics.record_hit();
                Lookup::Hit(value)
            }
            None => {
                self.metrics.record_miss();
                Lookup::Miss
            }
        }
    }

    /// Presence check. Does not touch hit/miss counters or the reference bit.
    pub fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.shard(key)
            .read()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Removes `key`. Absent keys are not an error.
    pub fn delete(&self, key: &str) -> bool {
        self.shard(key).write().remove(key).is_some()
    }

    /// Removes `key` only if it currently holds `expected`.
    pub fn delete_if_value(&self, key: &str, expected: &[u8]) -> bool {
        let mut shard = self.shard(key).write();
        let matches = shard
            .entries
            .get(key)
            .is_some_and(|e| &*e.value == expected);
        matches && shard.remove(key).is_some()
    }

    /// Clears every shard.
    pub fn reset(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            shard.entries.clear();
            shard.clock.clear();
            shard.bytes = 0;
        }
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|s| {
                s.read()
                    .entries
                    .values()
                    .filter(|e| !e.is_expired(now))
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries the tier will hold.
    pub fn capacity(&self) -> usize {
        self.entries_per_shard * self.shards.len()
    }

    /// Bytes held by keys and values, including not-yet-purged expired entries.
    pub fn used_bytes(&self) -> usize {
        self.shards.iter().map(|s| s.read().bytes).sum()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Removes expired entries from every shard. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|s| s.write().purge_expired(now))
            .sum()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Spawns the periodic purge task. Stops on [`LocalTier::close`] or when
    /// the tier is dropped.
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
                            tracing::debug!(purged = purged, "purged expired local cache entries");
                        }
                    }
                }
            }
            tracing::debug!("local cache cleaner stopped");
        })
    }

    /// Stops the cleaner and releases all entries.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.reset();
    }
}

//! In-process memory cache
//!
//! Top of the chain: blobs held in process memory behind a sharded index.
//! Access times come from the process-wide monotonic clock, so eviction
//! ordering is exact at this level.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::eviction::{check_alarm, plan_victims, AlarmSink, EvictionPolicy, VictimCandidate};
use super::shard::ShardedMap;
use super::writeback::{WritebackJob, WritebackQueue};
use super::{CacheLevel, CachedEntry, LevelStat, PutOutcome, WritebackMode};
use crate::error::Result;
use crate::name::{identity_of_key, DerivativeKey, ImageIdentity};

pub struct MemoryCache {
    policy: EvictionPolicy,
    writeback: WritebackMode,
    index: ShardedMap<CachedEntry>,
    used: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    next: Option<Arc<dyn CacheLevel>>,
    lazy: Option<WritebackQueue>,
    alarm: Option<AlarmSink>,
}

impl MemoryCache {
    /// Build the level. With lazy writeback and a next level configured the
    /// queue worker is spawned here, so this must run inside a runtime.
    pub fn new(
        policy: EvictionPolicy,
        writeback: WritebackMode,
        next: Option<Arc<dyn CacheLevel>>,
        alarm: Option<AlarmSink>,
    ) -> Self {
        let lazy = match (writeback, &next) {
            (WritebackMode::Lazy, Some(next)) => Some(WritebackQueue::start(Arc::clone(next))),
            _ => None,
        };
        Self {
            policy,
            writeback,
            index: ShardedMap::new(),
            used: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            next,
            lazy,
            alarm,
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &DerivativeKey) -> bool {
        self.index.contains(key.as_str())
    }

    /// Run an eviction pass if occupancy demands one. Victims are selected
    /// from a snapshot, removed, then written back with no index locks held.
    async fn maybe_evict(&self) {
        let used = self.used.load(Ordering::Relaxed);
        let count = self.index.len() as u64;
        if !self.policy.should_evict(used, count) {
            return;
        }

        let candidates = self.index.snapshot(|key, entry| VictimCandidate {
            key: key.to_owned(),
            size: entry.size(),
            atime: entry.meta().atime(),
            is_thumbnail: entry.meta().is_thumbnail(),
        });
        let plan = plan_victims(&self.policy, candidates, used, count);

        let mut writebacks: Vec<(DerivativeKey, CachedEntry)> = Vec::new();
        for victim in plan {
            if let Some(entry) = self.index.remove(&victim.key) {
                self.used.fetch_sub(entry.size(), Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                if self.writeback != WritebackMode::Never && self.next.is_some() {
                    match DerivativeKey::parse(&victim.key) {
                        Ok(key) => writebacks.push((key, entry)),
                        Err(err) => warn!(key = %victim.key, %err, "unparseable key in index"),
                    }
                }
            }
        }

        for (key, entry) in writebacks {
            match self.writeback {
                WritebackMode::Eager => {
                    if let Some(next) = &self.next {
                        if let Err(err) = next.put(&key, entry).await {
                            debug!(level = next.name(), key = %key, %err, "eviction writeback failed");
                        }
                    }
                }
                WritebackMode::Lazy => {
                    if let Some(queue) = &self.lazy {
                        queue.enqueue(WritebackJob { key, entry });
                    }
                }
                WritebackMode::Never => {}
            }
        }
    }
}

#[async_trait]
impl CacheLevel for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn writeback(&self) -> WritebackMode {
        self.writeback
    }

    async fn get(&self, key: &DerivativeKey) -> Result<Option<CachedEntry>> {
        let entry = self.index.inspect(key.as_str(), |entry| {
            entry.touch();
            entry.clone()
        });
        match entry {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &DerivativeKey, entry: CachedEntry) -> Result<PutOutcome> {
        let size = entry.size();
        if !self.policy.admits(size) {
            return Ok(PutOutcome::TooLarge);
        }

        match self.index.insert(key.as_str().to_owned(), entry) {
            Some(old) => {
                let old_size = old.size();
                if size >= old_size {
                    self.used.fetch_add(size - old_size, Ordering::Relaxed);
                } else {
                    self.used.fetch_sub(old_size - size, Ordering::Relaxed);
                }
            }
            None => {
                self.used.fetch_add(size, Ordering::Relaxed);
            }
        }

        self.maybe_evict().await;
        Ok(PutOutcome::Stored)
    }

    async fn invalidate(&self, identity: &ImageIdentity) -> Result<usize> {
        let removed = self
            .index
            .remove_matching(|key| identity_of_key(key) == identity.as_str());
        for (_, entry) in &removed {
            self.used.fetch_sub(entry.size(), Ordering::Relaxed);
        }
        Ok(removed.len())
    }

    fn stat(&self) -> LevelStat {
        let used_bytes = self.used.load(Ordering::Relaxed);
        LevelStat {
            used_bytes,
            element_count: self.index.len() as u64,
            alarm_triggered: check_alarm(&self.policy, self.name(), used_bytes, self.alarm.as_ref()),
        }
    }

    fn chain_next(&self) -> Option<Arc<dyn CacheLevel>> {
        self.next.clone()
    }
}

// =============================================================================
// Tests
// =============================================================================

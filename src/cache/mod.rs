//! Tiered content cache
//!
//! A chain of content caches with uniform semantics:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Derivation Coordinator                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ MemoryCache      │ FileCache        │ ObjectCache │ ObjectStore  │
//! │ (process RAM)    │ (local disk,     │ (remote     │ (remote,     │
//! │                  │  survives        │  derivative │  authoritative│
//! │                  │  restart)        │  container) │  originals)  │
//! │        │                 │                │              │       │
//! │        └────────── next-level chain ──────┴──────────────┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every level implements the same contract: `get` bumps access time, `put`
//! may trigger an eviction pass that runs to its hysteresis target,
//! `invalidate` removes everything derived from one identity, and `stat`
//! reports occupancy and the alarm state. Levels hold only a handle to the
//! tier below them, never a back-reference.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::name::{DerivativeKey, ImageIdentity};

mod entry;
mod eviction;
mod file;
mod memory;
mod metrics;
mod object;
mod shard;
mod writeback;

pub use entry::{monotonic_millis, CachedEntry, EntryMeta};
pub use eviction::{
    check_alarm, plan_victims, AlarmEvent, AlarmSink, EvictionPolicy, Priority, VictimCandidate,
    WritebackMode,
};
pub use file::{FileCache, FileCacheOptions};
pub use memory::MemoryCache;
pub use metrics::{MetricsSnapshot, ServiceMetrics};
pub use object::{ObjectCache, ObjectCacheOptions, ObjectStore};
pub use shard::ShardedMap;
pub use writeback::{WritebackJob, WritebackQueue};

/// Number of shards in the in-memory index
pub const SHARD_COUNT: usize = 64;

/// Depth of a lazy-writeback queue before overflow drops jobs
pub const WRITEBACK_QUEUE_DEPTH: usize = 256;

/// Result of a `put` against one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The entry alone exceeds this level's byte cap.
    TooLarge,
}

/// Occupancy report for one level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LevelStat {
    pub used_bytes: u64,
    pub element_count: u64,
    pub alarm_triggered: bool,
}

/// Uniform contract for one tier of the cache chain.
///
/// All operations are thread-safe. Lookup failures at a level are reported
/// as errors and treated as misses by the coordinator, so a flaky tier
/// cannot prevent service.
#[async_trait]
pub trait CacheLevel: Send + Sync {
    /// Stable identifier used in logs, metrics and alarms.
    fn name(&self) -> &'static str;

    /// How entries propagate from this level to the one below, and how this
    /// level accepts population from above.
    fn writeback(&self) -> WritebackMode;

    /// Return the entry and update its access time.
    async fn get(&self, key: &DerivativeKey) -> Result<Option<CachedEntry>>;

    /// Insert an entry; may trigger an eviction pass before returning.
    async fn put(&self, key: &DerivativeKey, entry: CachedEntry) -> Result<PutOutcome>;

    /// Remove every entry whose key derives from the identity. Returns the
    /// number of entries removed.
    async fn invalidate(&self, identity: &ImageIdentity) -> Result<usize>;

    /// Occupancy; computing it re-checks the alarm threshold.
    fn stat(&self) -> LevelStat;

    /// The tier immediately below, if any.
    fn chain_next(&self) -> Option<Arc<dyn CacheLevel>>;
}

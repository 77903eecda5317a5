//! Lazy writeback worker
//!
//! Levels configured with lazy writeback enqueue evicted entries here
//! instead of blocking on the tier below. The queue is bounded: evicted
//! entries are regenerable, so overflow drops the job rather than applying
//! back-pressure to the eviction path.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::{CacheLevel, CachedEntry, WRITEBACK_QUEUE_DEPTH};
use crate::name::DerivativeKey;

/// One entry awaiting propagation to the next level.
pub struct WritebackJob {
    pub key: DerivativeKey,
    pub entry: CachedEntry,
}

/// Bounded queue drained by a dedicated worker task.
pub struct WritebackQueue {
    tx: mpsc::Sender<WritebackJob>,
}

impl WritebackQueue {
    /// Spawn the worker draining into `next`. Dropping the queue closes the
    /// channel; the worker drains what it holds and exits.
    pub fn start(next: Arc<dyn CacheLevel>) -> Self {
        Self::with_depth(next, WRITEBACK_QUEUE_DEPTH)
    }

    pub fn with_depth(next: Arc<dyn CacheLevel>, depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<WritebackJob>(depth.max(1));
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(err) = next.put(&job.key, job.entry).await {
                    // Secondary-tier put failures are logged and swallowed.
                    debug!(
                        level = next.name(),
                        key = %job.key,
                        %err,
                        "lazy writeback failed"
                    );
                }
            }
        });
        Self { tx }
    }

    /// Enqueue without blocking; a full queue drops the job.
    pub fn enqueue(&self, job: WritebackJob) {
        if let Err(mpsc::error::TrySendError::Full(job)) = self.tx.try_send(job) {
            debug!(key = %job.key, "writeback queue full, dropping entry");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Cache entry types
//!
//! A cached entry is the ready-to-serve blob plus the bookkeeping the
//! eviction engine needs: size, creation time, access time and the
//! thumbnail flag.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

static LAST_TICK: AtomicU64 = AtomicU64::new(0);

/// Strictly monotonic wall-clock milliseconds.
///
/// Access times order eviction victims, so two touches in the same
/// millisecond must still be distinguishable.
pub fn monotonic_millis() -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let mut prev = LAST_TICK.load(Ordering::Relaxed);
    loop {
        let next = wall.max(prev + 1);
        match LAST_TICK.compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => prev = observed,
        }
    }
}

/// Metadata attached to a cached blob.
#[derive(Debug)]
pub struct EntryMeta {
    size: u64,
    ctime: u64,
    atime: AtomicU64,
    is_thumbnail: bool,
}

impl EntryMeta {
    pub fn new(size: u64, is_thumbnail: bool) -> Self {
        let now = monotonic_millis();
        Self {
            size,
            ctime: now,
            atime: AtomicU64::new(now),
            is_thumbnail,
        }
    }

    /// Rebuild metadata with known timestamps, e.g. from the file-cache
    /// sidecar index after a restart.
    pub fn with_times(size: u64, is_thumbnail: bool, ctime: u64, atime: u64) -> Self {
        Self {
            size,
            ctime,
            atime: AtomicU64::new(atime.max(ctime)),
            is_thumbnail,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn ctime(&self) -> u64 {
        self.ctime
    }

    #[inline]
    pub fn atime(&self) -> u64 {
        self.atime.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_thumbnail(&self) -> bool {
        self.is_thumbnail
    }

    /// Record an access.
    #[inline]
    pub fn touch(&self) -> u64 {
        let now = monotonic_millis();
        self.atime.store(now, Ordering::Relaxed);
        now
    }
}

impl Clone for EntryMeta {
    fn clone(&self) -> Self {
        Self {
            size: self.size,
            ctime: self.ctime,
            atime: AtomicU64::new(self.atime.load(Ordering::Relaxed)),
            is_thumbnail: self.is_thumbnail,
        }
    }
}

/// A ready-to-serve blob with its cache bookkeeping.
#[derive(Clone)]
pub struct CachedEntry {
    meta: EntryMeta,
    bytes: Bytes,
}

impl CachedEntry {
    pub fn new(bytes: Bytes, is_thumbnail: bool) -> Self {
        let meta = EntryMeta::new(bytes.len() as u64, is_thumbnail);
        Self { meta, bytes }
    }

    pub fn with_meta(bytes: Bytes, meta: EntryMeta) -> Self {
        Self { meta, bytes }
    }

    #[inline]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.meta.size()
    }

    #[inline]
    pub fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    #[inline]
    pub fn touch(&self) {
        self.meta.touch();
    }
}

impl std::fmt::Debug for CachedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEntry")
            .field("size", &self.meta.size())
            .field("atime", &self.meta.atime())
            .field("is_thumbnail", &self.meta.is_thumbnail())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

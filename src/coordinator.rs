//! Derivation coordinator
//!
//! Turns a request for `(identity, params)` into a lookup across the cache
//! chain, with at-most-once derivation per cache miss and optional
//! pre-signed URL emission.
//!
//! The per-key life of a resolve:
//!
//! ```text
//!         ┌──────────┐   probe hit        ┌──────┐
//!  IDLE ──│ PROBING  │──────────────────▶│ DONE │
//!         └─────┬────┘                   └──────┘
//!               │ all-miss, not leader
//!               ▼
//!          ┌─────────┐   leader finishes  ┌──────┐
//!          │ WAITING │───────────────────▶│ DONE │
//!          └─────────┘                    └──────┘
//!               ▲ miss-collapse join
//!               │
//!         ┌─────┴─────┐  finish  ┌──────┐
//!         │ DERIVING  │─────────▶│ DONE │
//!         └───────────┘          └──────┘
//! ```
//!
//! Leader errors reach every waiter but are not sticky: the in-flight entry
//! is removed on completion, so the next resolve retries. Deadline expiry
//! abandons the wait only; leader work runs to completion so later requests
//! and the caches still benefit.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::{
    CacheLevel, CachedEntry, ObjectCache, ObjectStore, PutOutcome, ServiceMetrics, WritebackMode,
};
use crate::error::{Error, Result};
use crate::name::{DerivativeKey, ImageFormat, ImageIdentity, TransformParams};
use crate::transform::Transform;

/// Everything the coordinator needs, assembled once at startup. Replaces
/// any notion of process-wide configuration state.
pub struct CoreContext {
    /// Probe order, top down. The originals store is not a member; it is
    /// the fall-through below the last level.
    pub levels: Vec<Arc<dyn CacheLevel>>,
    pub store: Arc<ObjectStore>,
    /// Remote derivative container, target of pre-signed URLs for derived
    /// artifacts.
    pub object_cache: Option<Arc<ObjectCache>>,
    pub transform: Arc<dyn Transform>,
    pub metrics: Arc<ServiceMetrics>,
    pub canonical_format: ImageFormat,
    pub canonical_format_used: bool,
}

/// Outcome of a resolve.
pub enum Resolved {
    Bytes {
        bytes: Bytes,
        content_type: Option<&'static str>,
    },
    Url(String),
}

type FlightState = Option<std::result::Result<Bytes, Error>>;

struct Inner {
    ctx: CoreContext,
    flights: DashMap<String, watch::Receiver<FlightState>>,
}

#[derive(Clone)]
pub struct DerivationCoordinator {
    inner: Arc<Inner>,
}

impl DerivationCoordinator {
    pub fn new(ctx: CoreContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                flights: DashMap::new(),
            }),
        }
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.inner.ctx.metrics
    }

    pub fn levels(&self) -> &[Arc<dyn CacheLevel>] {
        &self.inner.ctx.levels
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Serve `(identity, params)` as bytes or as a pre-signed URL.
    ///
    /// `params = None` is the distinguished "original" request: no
    /// transform, deliver as uploaded.
    pub async fn resolve(
        &self,
        identity: &ImageIdentity,
        params: Option<TransformParams>,
        want_url: bool,
        deadline: Option<Duration>,
    ) -> Result<Resolved> {
        if let Some(params) = &params {
            params.validate()?;
        }
        let key = match params {
            None => DerivativeKey::original(identity.clone()),
            Some(params) => DerivativeKey::derived(identity.clone(), params),
        };
        with_deadline(deadline, self.resolve_key(key, want_url)).await
    }

    /// Upload an original, then synchronously invalidate every cached
    /// artifact of this identity before acknowledging.
    pub async fn put(
        &self,
        identity: &ImageIdentity,
        bytes: Bytes,
        content_type: Option<String>,
        deadline: Option<Duration>,
    ) -> Result<()> {
        with_deadline(deadline, async {
            self.inner
                .ctx
                .store
                .upload(identity, bytes, content_type)
                .await?;
            self.inner.ctx.metrics.record_upload();

            let mut removed = 0u64;
            for level in &self.inner.ctx.levels {
                removed += level.invalidate(identity).await? as u64;
            }
            self.inner.ctx.metrics.record_invalidation(removed);
            debug!(identity = %identity, removed, "upload invalidated cached derivatives");
            Ok(())
        })
        .await
    }

    /// Identities in the originals container, optionally filtered by a
    /// path prefix and an anchored regular expression.
    pub async fn list(&self, prefix: Option<&str>, pattern: Option<&str>) -> Result<Vec<String>> {
        let regex = match pattern {
            None => None,
            Some(pattern) => Some(Regex::new(pattern).map_err(|err| {
                Error::InvalidParameter(format!("regular expression fails: {err}"))
            })?),
        };
        let mut names = self.inner.ctx.store.list_identities().await?;
        if let Some(prefix) = prefix {
            names.retain(|name| name.starts_with(prefix));
        }
        if let Some(regex) = regex {
            names.retain(|name| full_match(&regex, name));
        }
        Ok(names)
    }

    /// Structured metadata of the original. Reads through the cache stack
    /// and never strips; nothing from this path is written to any cache
    /// beyond the original itself.
    pub async fn meta(
        &self,
        identity: &ImageIdentity,
        deadline: Option<Duration>,
    ) -> Result<serde_json::Value> {
        with_deadline(deadline, async {
            let key = DerivativeKey::original(identity.clone());
            let bytes = self.resolve_bytes(&key).await?;
            let transform = Arc::clone(&self.inner.ctx.transform);
            let value = tokio::task::spawn_blocking(move || transform.metadata(&bytes))
                .await
                .map_err(|err| Error::Internal(format!("metadata task failed: {err}")))??;
            Ok(value)
        })
        .await
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    async fn resolve_key(&self, key: DerivativeKey, want_url: bool) -> Result<Resolved> {
        if want_url {
            let url = self.resolve_url(&key).await?;
            return Ok(Resolved::Url(url));
        }
        let content_type = key.content_type();
        let bytes = self.resolve_bytes(&key).await?;
        Ok(Resolved::Bytes {
            bytes,
            content_type,
        })
    }

    async fn resolve_bytes(&self, key: &DerivativeKey) -> Result<Bytes> {
        if let Some((found_at, entry)) = self.probe(key).await {
            self.promote(key, &entry, found_at).await;
            return Ok(entry.into_bytes());
        }
        self.single_flight(key).await
    }

    /// Probe levels top-down. Lookup errors are logged and treated as
    /// misses so a flaky tier cannot prevent service.
    async fn probe(&self, key: &DerivativeKey) -> Option<(usize, CachedEntry)> {
        for (idx, level) in self.inner.ctx.levels.iter().enumerate() {
            match level.get(key).await {
                Ok(Some(entry)) => return Some((idx, entry)),
                Ok(None) => {}
                Err(err) => {
                    warn!(level = level.name(), key = %key, %err, "lookup failed, treating as miss");
                }
            }
        }
        None
    }

    /// Populate the levels above a hit, each according to its own
    /// writeback mode, lowest first.
    async fn promote(&self, key: &DerivativeKey, entry: &CachedEntry, found_at: usize) {
        for idx in (0..found_at).rev() {
            self.insert_level(idx, key, entry.clone()).await;
        }
    }

    async fn insert_level(&self, idx: usize, key: &DerivativeKey, entry: CachedEntry) {
        let level = &self.inner.ctx.levels[idx];
        match level.writeback() {
            WritebackMode::Never => {}
            WritebackMode::Eager => match level.put(key, entry).await {
                Ok(PutOutcome::Stored) => {}
                Ok(PutOutcome::TooLarge) => {
                    debug!(level = level.name(), key = %key, "entry exceeds level capacity");
                }
                Err(err) => {
                    debug!(level = level.name(), key = %key, %err, "secondary-tier put failed");
                }
            },
            WritebackMode::Lazy => {
                let level = Arc::clone(level);
                let key = key.clone();
                tokio::spawn(async move {
                    if let Err(err) = level.put(&key, entry).await {
                        debug!(level = level.name(), key = %key, %err, "async population failed");
                    }
                });
            }
        }
    }

    /// Insert-or-join on the in-flight table. The leader derives on a
    /// spawned task so waiter cancellation never cancels the shared work.
    async fn single_flight(&self, key: &DerivativeKey) -> Result<Bytes> {
        use dashmap::mapref::entry::Entry;

        let leader_tx = match self.inner.flights.entry(key.as_str().to_owned()) {
            Entry::Occupied(existing) => {
                let rx = existing.get().clone();
                drop(existing);
                self.inner.ctx.metrics.record_flight_join();
                return wait_for_leader(rx).await;
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx);
                tx
            }
        };

        let this = self.clone();
        let flight_key = key.clone();
        let worker = tokio::spawn(async move {
            let result = this.derive(&flight_key).await;
            this.inner.flights.remove(flight_key.as_str());
            let _ = leader_tx.send(Some(result.clone()));
            result
        });
        match worker.await {
            Ok(result) => result,
            Err(err) => Err(Error::Internal(format!("derivation task failed: {err}"))),
        }
    }

    /// Miss path: fetch the original and, for derived keys, run the
    /// transform, then establish the artifact in the cache chain from the
    /// lowest persistent level upward.
    async fn derive(&self, key: &DerivativeKey) -> Result<Bytes> {
        // A previous leader may have finished between this request's probe
        // and its flight insert; re-checking here keeps derivation
        // at-most-once per actual miss.
        if let Some((found_at, entry)) = self.probe(key).await {
            self.promote(key, &entry, found_at).await;
            return Ok(entry.into_bytes());
        }

        let original = self.fetch_original(key.identity()).await?;

        let bytes = match key.params() {
            // "Deliver as uploaded".
            None => original,
            Some(params) => {
                let params = params.clone();
                match self.run_transform(original, params).await {
                    Ok(bytes) => {
                        self.inner.ctx.metrics.record_derivation();
                        bytes
                    }
                    Err(err) => {
                        self.inner.ctx.metrics.record_derivation_failure();
                        return Err(err);
                    }
                }
            }
        };

        self.populate(key, &bytes).await;
        Ok(bytes)
    }

    /// The original's bytes, from any cache level that happens to hold
    /// them, else from the authoritative store. Does not populate: only a
    /// client request for the original itself earns it cache residency.
    async fn fetch_original(&self, identity: &ImageIdentity) -> Result<Bytes> {
        let original_key = DerivativeKey::original(identity.clone());
        if let Some((_, entry)) = self.probe(&original_key).await {
            return Ok(entry.into_bytes());
        }
        self.inner.ctx.metrics.record_store_fetch();
        match self.inner.ctx.store.fetch(identity).await? {
            Some(bytes) => Ok(bytes),
            None => Err(Error::NotFound(identity.to_string())),
        }
    }

    async fn run_transform(&self, src: Bytes, params: TransformParams) -> Result<Bytes> {
        let transform = Arc::clone(&self.inner.ctx.transform);
        let canonical_transit = (self.inner.ctx.canonical_format_used
            && params.format != self.inner.ctx.canonical_format)
            .then_some(self.inner.ctx.canonical_format);

        let bytes = tokio::task::spawn_blocking(move || {
            let src = match canonical_transit {
                Some(format) => transform.apply(&src, &TransformParams::convert(format))?,
                None => src,
            };
            transform.apply(&src, &params)
        })
        .await
        .map_err(|err| Error::Internal(format!("transform task failed: {err}")))??;
        Ok(bytes)
    }

    async fn populate(&self, key: &DerivativeKey, bytes: &Bytes) {
        let entry = CachedEntry::new(bytes.clone(), key.is_thumbnail());
        for idx in (0..self.inner.ctx.levels.len()).rev() {
            self.insert_level(idx, key, entry.clone()).await;
        }
    }

    // =========================================================================
    // Pre-signed URLs
    // =========================================================================

    /// The artifact must reside in the originals container (original
    /// request) or the derivative container (otherwise) before a URL for
    /// it can be issued.
    async fn resolve_url(&self, key: &DerivativeKey) -> Result<String> {
        let ctx = &self.inner.ctx;

        if key.is_original() {
            if !ctx.store.exists(key.identity()).await? {
                return Err(Error::NotFound(key.identity().to_string()));
            }
            let issued = ctx.store.presign(key.identity())?;
            self.note_presign(issued.reused);
            return Ok(issued.url);
        }

        let object_cache = ctx.object_cache.as_ref().ok_or_else(|| {
            Error::Config("no derivative container configured for URL generation".into())
        })?;

        if !object_cache.contains(key) {
            let bytes = self.resolve_bytes(key).await?;
            if !object_cache.contains(key) {
                let size = bytes.len() as u64;
                let entry = CachedEntry::new(bytes, key.is_thumbnail());
                match object_cache.put(key, entry).await? {
                    PutOutcome::Stored => {}
                    PutOutcome::TooLarge => return Err(Error::Capacity { size }),
                }
            }
        }

        let issued = object_cache.presign(key)?;
        self.note_presign(issued.reused);
        Ok(issued.url)
    }

    fn note_presign(&self, reused: bool) {
        if reused {
            self.inner.ctx.metrics.record_presign_reused();
        } else {
            self.inner.ctx.metrics.record_presign_issued();
        }
    }
}

async fn wait_for_leader(mut rx: watch::Receiver<FlightState>) -> Result<Bytes> {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or_else(|| Err(Error::Internal("derivation leader aborted".into())));
        }
    }
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        None => fut.await,
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| Error::Timeout)?,
    }
}

/// Anchored regex match over the full name, the listing filter semantics.
fn full_match(regex: &Regex, name: &str) -> bool {
    regex
        .find(name)
        .map_or(false, |m| m.start() == 0 && m.end() == name.len())
}

// =============================================================================
// Tests
// =============================================================================

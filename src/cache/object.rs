//! Remote object tiers
//!
//! Two levels live in remote containers behind the [`ObjectBackend`]
//! abstraction: the bounded derivative cache ([`ObjectCache`]) and the
//! authoritative, unbounded originals store ([`ObjectStore`]).
//!
//! The derivative cache keeps a local mirror of the container index for
//! eviction accounting. Access times are best-effort: the mirror starts
//! from each object's `last-modified`, so the `newest` retention policy
//! degrades to LRU-by-last-modified after a restart.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::entry::{monotonic_millis, EntryMeta};
use super::eviction::{check_alarm, plan_victims, AlarmSink, EvictionPolicy, VictimCandidate};
use super::file::FileCache;
use super::writeback::{WritebackJob, WritebackQueue};
use super::{CacheLevel, CachedEntry, LevelStat, PutOutcome, WritebackMode};
use crate::error::Result;
use crate::name::{identity_of_key, DerivativeKey, ImageIdentity};
use crate::store::{IssuedUrl, RemoteContainer};

#[derive(Debug, Clone)]
struct MirrorRecord {
    size: u64,
    ctime: u64,
    atime: u64,
    is_thumbnail: bool,
}

/// Behavioural switches for the remote derivative cache.
#[derive(Clone, Default)]
pub struct ObjectCacheOptions {
    /// Wipe the container at startup.
    pub initialise: bool,
    /// Stream downloaded blobs through the local file cache. The cache
    /// handle itself arrives later via [`ObjectCache::set_file_cache`],
    /// after the file level exists.
    pub use_file_cache: bool,
}

/// Remote bounded cache of derivatives.
pub struct ObjectCache {
    container: Arc<RemoteContainer>,
    policy: EvictionPolicy,
    writeback: WritebackMode,
    mirror: RwLock<BTreeMap<String, MirrorRecord>>,
    used: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    next: Option<Arc<dyn CacheLevel>>,
    lazy: Option<WritebackQueue>,
    alarm: Option<AlarmSink>,
    use_file_cache: bool,
    file_cache: RwLock<Option<Arc<FileCache>>>,
}

impl ObjectCache {
    /// Connect to the container and rebuild the eviction mirror from a
    /// listing.
    pub async fn open(
        container: Arc<RemoteContainer>,
        options: ObjectCacheOptions,
        policy: EvictionPolicy,
        writeback: WritebackMode,
        next: Option<Arc<dyn CacheLevel>>,
        alarm: Option<AlarmSink>,
    ) -> Result<Self> {
        if options.initialise {
            container.wipe().await?;
        }

        let mut mirror = BTreeMap::new();
        let mut used = 0u64;
        for stat in container.list().await? {
            let is_thumbnail = match DerivativeKey::parse(&stat.name) {
                Ok(key) => key.is_thumbnail(),
                Err(err) => {
                    debug!(name = %stat.name, %err, "skipping foreign object in derivative container");
                    continue;
                }
            };
            used += stat.bytes;
            mirror.insert(
                stat.name,
                MirrorRecord {
                    size: stat.bytes,
                    ctime: stat.last_modified_ms,
                    atime: stat.last_modified_ms,
                    is_thumbnail,
                },
            );
        }
        info!(
            container = container.container(),
            entries = mirror.len(),
            used_bytes = used,
            "derivative cache mirror rebuilt"
        );

        let lazy = match (writeback, &next) {
            (WritebackMode::Lazy, Some(next)) => Some(WritebackQueue::start(Arc::clone(next))),
            _ => None,
        };

        Ok(Self {
            container,
            policy,
            writeback,
            mirror: RwLock::new(mirror),
            used: AtomicU64::new(used),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            next,
            lazy,
            alarm,
            use_file_cache: options.use_file_cache,
            file_cache: RwLock::new(None),
        })
    }

    /// Attach the local file cache used as a staging area for downloads.
    /// Wired after construction because the file level sits above this one
    /// in the chain.
    pub fn set_file_cache(&self, cache: Arc<FileCache>) {
        *self.file_cache.write() = Some(cache);
    }

    pub fn presign(&self, key: &DerivativeKey) -> Result<IssuedUrl> {
        self.container.presign(key.as_str())
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

    pub fn len(&self) -> usize {
        self.mirror.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror.read().is_empty()
    }

    pub fn contains(&self, key: &DerivativeKey) -> bool {
        self.mirror.read().contains_key(key.as_str())
    }

    fn mirror_upsert(&self, key: &str, size: u64, ctime: u64, is_thumbnail: bool) {
        let mut mirror = self.mirror.write();
        match mirror.insert(
            key.to_owned(),
            MirrorRecord {
                size,
                ctime,
                atime: monotonic_millis(),
                is_thumbnail,
            },
        ) {
            Some(old) => {
                if size >= old.size {
                    self.used.fetch_add(size - old.size, Ordering::Relaxed);
                } else {
                    self.used.fetch_sub(old.size - size, Ordering::Relaxed);
                }
            }
            None => {
                self.used.fetch_add(size, Ordering::Relaxed);
            }
        }
    }

    fn mirror_remove(&self, key: &str) -> Option<MirrorRecord> {
        let removed = self.mirror.write().remove(key);
        if let Some(record) = &removed {
            self.used.fetch_sub(record.size, Ordering::Relaxed);
        }
        removed
    }

    async fn maybe_evict(&self) {
        let used = self.used.load(Ordering::Relaxed);
        let count = self.mirror.read().len() as u64;
        if !self.policy.should_evict(used, count) {
            return;
        }

        let candidates: Vec<VictimCandidate> = self
            .mirror
            .read()
            .iter()
            .map(|(key, record)| VictimCandidate {
                key: key.clone(),
                size: record.size,
                atime: record.atime,
                is_thumbnail: record.is_thumbnail,
            })
            .collect();
        let plan = plan_victims(&self.policy, candidates, used, count);

        for victim in plan {
            let Some(record) = self.mirror_remove(&victim.key) else {
                continue;
            };
            self.evictions.fetch_add(1, Ordering::Relaxed);

            if self.writeback != WritebackMode::Never && self.next.is_some() {
                // Writeback needs the blob; pull it down before deletion.
                if let (Ok(key), Ok(Some(bytes))) = (
                    DerivativeKey::parse(&victim.key),
                    self.container.get(&victim.key).await,
                ) {
                    let entry = CachedEntry::with_meta(
                        bytes,
                        EntryMeta::with_times(
                            record.size,
                            record.is_thumbnail,
                            record.ctime,
                            record.atime,
                        ),
                    );
                    match self.writeback {
                        WritebackMode::Eager => {
                            if let Some(next) = &self.next {
                                if let Err(err) = next.put(&key, entry).await {
                                    debug!(key = %victim.key, %err, "eviction writeback failed");
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

            if let Err(err) = self.container.delete(&victim.key).await {
                warn!(key = %victim.key, %err, "failed to delete evicted object");
            }
        }
    }
}

#[async_trait]
impl CacheLevel for ObjectCache {
    fn name(&self) -> &'static str {
        "object-cache"
    }

    fn writeback(&self) -> WritebackMode {
        self.writeback
    }

    async fn get(&self, key: &DerivativeKey) -> Result<Option<CachedEntry>> {
        match self.container.get(key.as_str()).await? {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let size = bytes.len() as u64;
                let ctime = self
                    .mirror
                    .read()
                    .get(key.as_str())
                    .map(|r| r.ctime)
                    .unwrap_or_else(monotonic_millis);
                self.mirror_upsert(key.as_str(), size, ctime, key.is_thumbnail());

                let entry = CachedEntry::with_meta(
                    bytes,
                    EntryMeta::with_times(size, key.is_thumbnail(), ctime, monotonic_millis()),
                );

                // A download that had to touch the network is worth keeping
                // on local disk for the next request.
                let staging = self
                    .use_file_cache
                    .then(|| self.file_cache.read().clone())
                    .flatten();
                if let Some(file_cache) = staging {
                    if let Err(err) = file_cache.put(key, entry.clone()).await {
                        debug!(key = %key, %err, "file cache side insert failed");
                    }
                }

                Ok(Some(entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.mirror_remove(key.as_str());
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &DerivativeKey, entry: CachedEntry) -> Result<PutOutcome> {
        let size = entry.size();
        if !self.policy.admits(size) {
            return Ok(PutOutcome::TooLarge);
        }

        self.container
            .put(
                key.as_str(),
                entry.bytes().clone(),
                key.content_type().map(str::to_owned),
            )
            .await?;
        self.mirror_upsert(
            key.as_str(),
            size,
            entry.meta().ctime(),
            entry.meta().is_thumbnail(),
        );
        self.maybe_evict().await;
        Ok(PutOutcome::Stored)
    }

    async fn invalidate(&self, identity: &ImageIdentity) -> Result<usize> {
        // The remote listing is authoritative: another server may have
        // written derivatives this mirror has never seen.
        let mut doomed: Vec<String> = self
            .container
            .list()
            .await?
            .into_iter()
            .map(|stat| stat.name)
            .filter(|name| identity_of_key(name) == identity.as_str())
            .collect();

        let mirrored: Vec<String> = self
            .mirror
            .read()
            .keys()
            .filter(|key| identity_of_key(key) == identity.as_str())
            .cloned()
            .collect();
        for key in mirrored {
            if !doomed.contains(&key) {
                doomed.push(key);
            }
        }

        let mut removed = 0usize;
        for key in doomed {
            self.mirror_remove(&key);
            self.container.delete(&key).await?;
            removed += 1;
        }
        Ok(removed)
    }

    fn stat(&self) -> LevelStat {
        let used_bytes = self.used.load(Ordering::Relaxed);
        LevelStat {
            used_bytes,
            element_count: self.mirror.read().len() as u64,
            alarm_triggered: check_alarm(&self.policy, self.name(), used_bytes, self.alarm.as_ref()),
        }
    }

    fn chain_next(&self) -> Option<Arc<dyn CacheLevel>> {
        self.next.clone()
    }
}

// =============================================================================
// ObjectStore
// =============================================================================

/// Authoritative originals container. Unbounded: nothing is ever evicted,
/// and invalidation never touches originals.
pub struct ObjectStore {
    container: Arc<RemoteContainer>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ObjectStore {
    pub fn new(container: Arc<RemoteContainer>) -> Self {
        Self {
            container,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn container(&self) -> &Arc<RemoteContainer> {
        &self.container
    }

    pub fn presign(&self, identity: &ImageIdentity) -> Result<IssuedUrl> {
        self.container.presign(identity.as_str())
    }

    pub async fn exists(&self, identity: &ImageIdentity) -> Result<bool> {
        Ok(self.container.stat(identity.as_str()).await?.is_some())
    }

    /// Fetch the byte-exact original.
    pub async fn fetch(&self, identity: &ImageIdentity) -> Result<Option<Bytes>> {
        let fetched = self.container.get(identity.as_str()).await?;
        match &fetched {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(fetched)
    }

    pub async fn upload(
        &self,
        identity: &ImageIdentity,
        bytes: Bytes,
        content_type: Option<String>,
    ) -> Result<()> {
        self.container
            .put(identity.as_str(), bytes, content_type)
            .await
    }

    /// All original identities in the container.
    pub async fn list_identities(&self) -> Result<Vec<String>> {
        Ok(self
            .container
            .list()
            .await?
            .into_iter()
            .map(|stat| stat.name)
            .filter(|name| !name.contains('#'))
            .collect())
    }

    pub async fn healthy(&self) -> Result<()> {
        self.container.healthy().await
    }
}

#[async_trait]
impl CacheLevel for ObjectStore {
    fn name(&self) -> &'static str {
        "store"
    }

    fn writeback(&self) -> WritebackMode {
        WritebackMode::Never
    }

    async fn get(&self, key: &DerivativeKey) -> Result<Option<CachedEntry>> {
        match self.container.get(key.as_str()).await? {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(CachedEntry::new(bytes, key.is_thumbnail())))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &DerivativeKey, entry: CachedEntry) -> Result<PutOutcome> {
        self.container
            .put(
                key.as_str(),
                entry.bytes().clone(),
                key.content_type().map(str::to_owned),
            )
            .await?;
        Ok(PutOutcome::Stored)
    }

    async fn invalidate(&self, identity: &ImageIdentity) -> Result<usize> {
        // Only derivatives that strayed into the originals container are
        // removed; the original itself is never a cache entry.
        let doomed: Vec<String> = self
            .container
            .list()
            .await?
            .into_iter()
            .map(|stat| stat.name)
            .filter(|name| name.contains('#') && identity_of_key(name) == identity.as_str())
            .collect();
        let mut removed = 0;
        for name in doomed {
            if self.container.delete(&name).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn stat(&self) -> LevelStat {
        // Unbounded sink: occupancy is not tracked and alarms never fire.
        LevelStat::default()
    }

    fn chain_next(&self) -> Option<Arc<dyn CacheLevel>> {
        None
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Priority;
    use crate::store::MemoryObjectBackend;

    fn key(name: &str) -> DerivativeKey {
        DerivativeKey::parse(name).unwrap()
    }

    fn entry(payload: &[u8]) -> CachedEntry {
        CachedEntry::new(Bytes::copy_from_slice(payload), false)
    }

    async fn open_cache(max_bytes: u64) -> ObjectCache {
        let backend = Arc::new(MemoryObjectBackend::new());
        let container = Arc::new(RemoteContainer::new(backend, "derivatives", None));
        ObjectCache::open(
            container,
            ObjectCacheOptions::default(),
            EvictionPolicy::new(max_bytes, 0, 0.8, 0.2, 0.1, Priority::Newest),
            WritebackMode::Never,
            None,
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_object_cache_roundtrip() {
        let cache = open_cache(10_000).await;
        let k = key("a/b#.jpg");
        cache.put(&k, entry(b"remote bytes")).await.unwrap();
        let got = cache.get(&k).await.unwrap().unwrap();
        assert_eq!(got.bytes().as_ref(), b"remote bytes");
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.stat().used_bytes, 12);
    }

    #[tokio::test]
    async fn test_object_cache_mirror_rebuild() {
        let backend = Arc::new(MemoryObjectBackend::new());
        let container = Arc::new(RemoteContainer::new(backend.clone(), "derivatives", None));
        container
            .put("a/b#.jpg", Bytes::from_static(b"cached"), None)
            .await
            .unwrap();
        container
            .put("not-a-key#", Bytes::from_static(b"junk"), None)
            .await
            .unwrap();

        let cache = ObjectCache::open(
            Arc::new(RemoteContainer::new(backend, "derivatives", None)),
            ObjectCacheOptions::default(),
            EvictionPolicy::new(10_000, 0, 0.8, 0.2, 0.1, Priority::Newest),
            WritebackMode::Never,
            None,
            None,
        )
        .await
        .unwrap();

        // Only the parseable key is mirrored.
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key("a/b#.jpg")));
    }

    #[tokio::test]
    async fn test_object_cache_eviction_deletes_remote() {
        let cache = open_cache(1000).await;
        for i in 0..12 {
            cache
                .put(&key(&format!("img/{i}#.jpg")), entry(&[0u8; 100]))
                .await
                .unwrap();
        }
        assert!(cache.stat().used_bytes <= 600);
        assert!(cache.evictions() >= 3);
        // Evicted keys answer miss from the remote too.
        assert!(cache.get(&key("img/0#.jpg")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_object_cache_invalidate_uses_listing() {
        let cache = open_cache(10_000).await;
        cache.put(&key("a/b#.jpg"), entry(b"one")).await.unwrap();
        cache.put(&key("a/b#.png"), entry(b"two")).await.unwrap();
        cache.put(&key("a/c#.jpg"), entry(b"three")).await.unwrap();

        let removed = cache
            .invalidate(&ImageIdentity::parse("a/b").unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("a/b#.jpg")).await.unwrap().is_none());
        assert!(cache.get(&key("a/c#.jpg")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_download_streams_through_file_cache() {
        let dir = tempfile::tempdir().unwrap();
        let file_cache = Arc::new(
            FileCache::open(
                crate::cache::FileCacheOptions {
                    root: dir.path().to_path_buf(),
                    initialise: false,
                },
                EvictionPolicy::new(0, 0, 0.8, 0.2, 0.1, Priority::Newest),
                WritebackMode::Never,
                None,
                None,
            )
            .await
            .unwrap(),
        );

        let backend = Arc::new(MemoryObjectBackend::new());
        let container = Arc::new(RemoteContainer::new(backend, "derivatives", None));
        container
            .put("a/b#.jpg", Bytes::from_static(b"downloaded"), None)
            .await
            .unwrap();

        let cache = ObjectCache::open(
            container,
            ObjectCacheOptions {
                initialise: false,
                use_file_cache: true,
            },
            EvictionPolicy::new(0, 0, 0.8, 0.2, 0.1, Priority::Newest),
            WritebackMode::Never,
            None,
            None,
        )
        .await
        .unwrap();
        cache.set_file_cache(file_cache.clone());

        let k = key("a/b#.jpg");
        cache.get(&k).await.unwrap().unwrap();
        assert!(file_cache.contains(&k));
    }

    #[tokio::test]
    async fn test_store_fetch_and_upload() {
        let backend = Arc::new(MemoryObjectBackend::new());
        let store = ObjectStore::new(Arc::new(RemoteContainer::new(backend, "originals", None)));
        let id = ImageIdentity::parse("a/b").unwrap();

        assert!(store.fetch(&id).await.unwrap().is_none());
        store
            .upload(&id, Bytes::from_static(b"orig"), Some("image/jpeg".into()))
            .await
            .unwrap();
        assert!(store.exists(&id).await.unwrap());
        assert_eq!(store.fetch(&id).await.unwrap(), Some(Bytes::from_static(b"orig")));
    }

    #[tokio::test]
    async fn test_store_list_identities_excludes_derivatives() {
        let backend = Arc::new(MemoryObjectBackend::new());
        let container = Arc::new(RemoteContainer::new(backend, "originals", None));
        container.put("a", Bytes::from_static(b"1"), None).await.unwrap();
        container
            .put("a#.jpg", Bytes::from_static(b"2"), None)
            .await
            .unwrap();
        let store = ObjectStore::new(container);
        assert_eq!(store.list_identities().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_store_invalidate_never_touches_originals() {
        let backend = Arc::new(MemoryObjectBackend::new());
        let container = Arc::new(RemoteContainer::new(backend, "originals", None));
        container.put("a/b", Bytes::from_static(b"orig"), None).await.unwrap();
        let store = ObjectStore::new(container);

        let id = ImageIdentity::parse("a/b").unwrap();
        store.invalidate(&id).await.unwrap();
        assert!(store.exists(&id).await.unwrap());
    }
}

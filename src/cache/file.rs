//! Local filesystem cache
//!
//! Blobs live under `<root>/<hh>/<hash>` where the hash is the SHA-256 of
//! the key, layered by a two-character prefix to avoid wide directories. A
//! JSON sidecar index records `{key, size, ctime, atime, is_thumbnail}` per
//! blob and is rebuilt and validated against the filesystem at startup:
//! files whose size disagrees with the sidecar are partial writes and are
//! deleted, as are files the sidecar does not know about.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use super::entry::{monotonic_millis, EntryMeta};
use super::eviction::{check_alarm, plan_victims, AlarmSink, EvictionPolicy, VictimCandidate};
use super::writeback::{WritebackJob, WritebackQueue};
use super::{CacheLevel, CachedEntry, LevelStat, PutOutcome, WritebackMode};
use crate::error::{Error, Result};
use crate::name::{identity_of_key, sha256_hex, DerivativeKey, ImageIdentity};

const INDEX_FILE: &str = "index.json";

/// Filesystem-specific settings; caps and ratios arrive via the policy.
#[derive(Clone, Debug)]
pub struct FileCacheOptions {
    pub root: PathBuf,
    /// Wipe and recreate the storage area at startup.
    pub initialise: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SidecarEntry {
    key: String,
    size: u64,
    ctime: u64,
    atime: u64,
    is_thumbnail: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SidecarIndex {
    entries: Vec<SidecarEntry>,
}

#[derive(Debug, Clone)]
struct IndexRecord {
    size: u64,
    ctime: u64,
    atime: u64,
    is_thumbnail: bool,
}

pub struct FileCache {
    root: PathBuf,
    policy: EvictionPolicy,
    writeback: WritebackMode,
    index: RwLock<BTreeMap<String, IndexRecord>>,
    used: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    next: Option<Arc<dyn CacheLevel>>,
    lazy: Option<WritebackQueue>,
    alarm: Option<AlarmSink>,
}

impl FileCache {
    /// Open (or initialise) the cache directory and reconstruct the index.
    pub async fn open(
        options: FileCacheOptions,
        policy: EvictionPolicy,
        writeback: WritebackMode,
        next: Option<Arc<dyn CacheLevel>>,
        alarm: Option<AlarmSink>,
    ) -> Result<Self> {
        if options.initialise {
            match fs::remove_dir_all(&options.root).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        fs::create_dir_all(&options.root).await?;

        let lazy = match (writeback, &next) {
            (WritebackMode::Lazy, Some(next)) => Some(WritebackQueue::start(Arc::clone(next))),
            _ => None,
        };

        let cache = Self {
            root: options.root,
            policy,
            writeback,
            index: RwLock::new(BTreeMap::new()),
            used: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            next,
            lazy,
            alarm,
        };
        cache.restore().await?;
        Ok(cache)
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let hash = sha256_hex(key.as_bytes());
        self.root.join(&hash[..2]).join(&hash[2..])
    }

    /// Load the sidecar, drop records that disagree with the filesystem and
    /// remove files the sidecar does not account for.
    async fn restore(&self) -> Result<()> {
        let sidecar_path = self.root.join(INDEX_FILE);
        let sidecar: SidecarIndex = match fs::read(&sidecar_path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!(%err, "file cache sidecar unreadable, starting empty");
                SidecarIndex::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SidecarIndex::default(),
            Err(err) => return Err(err.into()),
        };

        let mut restored = BTreeMap::new();
        let mut used = 0u64;
        let mut expected: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();

        for entry in sidecar.entries {
            let path = self.blob_path(&entry.key);
            match fs::metadata(&path).await {
                Ok(meta) if meta.len() == entry.size => {
                    used += entry.size;
                    expected.insert(path);
                    restored.insert(
                        entry.key,
                        IndexRecord {
                            size: entry.size,
                            ctime: entry.ctime,
                            atime: entry.atime,
                            is_thumbnail: entry.is_thumbnail,
                        },
                    );
                }
                Ok(_) => {
                    debug!(key = %entry.key, "dropping partial write from file cache");
                    let _ = fs::remove_file(&path).await;
                }
                Err(_) => {
                    debug!(key = %entry.key, "sidecar entry has no blob, dropping");
                }
            }
        }

        // Remove stray files (crashed writes that never made the sidecar).
        let mut top = fs::read_dir(&self.root).await?;
        while let Some(dir_entry) = top.next_entry().await? {
            let path = dir_entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(INDEX_FILE) {
                continue;
            }
            if !dir_entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                let _ = fs::remove_file(&path).await;
                continue;
            }
            let mut inner = fs::read_dir(&path).await?;
            while let Ok(Some(blob)) = inner.next_entry().await {
                let blob_path = blob.path();
                if !expected.contains(&blob_path) {
                    debug!(path = %blob_path.display(), "removing stray file from cache root");
                    let _ = fs::remove_file(&blob_path).await;
                }
            }
        }

        let count = restored.len();
        *self.index.write() = restored;
        self.used.store(used, Ordering::Relaxed);
        info!(
            entries = count,
            used_bytes = used,
            root = %self.root.display(),
            "file cache restored"
        );
        Ok(())
    }

    /// Write the sidecar atomically; failures degrade restart fidelity but
    /// never the running cache, so they are only logged.
    async fn persist_index(&self) {
        let snapshot = SidecarIndex {
            entries: self
                .index
                .read()
                .iter()
                .map(|(key, record)| SidecarEntry {
                    key: key.clone(),
                    size: record.size,
                    ctime: record.ctime,
                    atime: record.atime,
                    is_thumbnail: record.is_thumbnail,
                })
                .collect(),
        };
        let path = self.root.join(INDEX_FILE);
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        let result = async {
            let raw = serde_json::to_vec(&snapshot)?;
            fs::write(&tmp, raw).await?;
            fs::rename(&tmp, &path).await?;
            Ok::<(), Error>(())
        }
        .await;
        if let Err(err) = result {
            warn!(%err, "failed to persist file cache sidecar");
        }
    }

    async fn write_blob(&self, key: &str, bytes: &Bytes) -> Result<()> {
        let path = self.blob_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_path(&path);
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn maybe_evict(&self) {
        let used = self.used.load(Ordering::Relaxed);
        let count = self.index.read().len() as u64;
        if !self.policy.should_evict(used, count) {
            return;
        }

        let candidates: Vec<VictimCandidate> = self
            .index
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

        let mut victims = Vec::new();
        {
            let mut index = self.index.write();
            for victim in plan {
                if let Some(record) = index.remove(&victim.key) {
                    self.used.fetch_sub(record.size, Ordering::Relaxed);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    victims.push((victim.key, record));
                }
            }
        }

        for (key, record) in victims {
            let path = self.blob_path(&key);
            if self.writeback != WritebackMode::Never && self.next.is_some() {
                if let (Ok(parsed), Ok(raw)) =
                    (DerivativeKey::parse(&key), fs::read(&path).await)
                {
                    let entry = CachedEntry::with_meta(
                        Bytes::from(raw),
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
                                if let Err(err) = next.put(&parsed, entry).await {
                                    debug!(%key, %err, "eviction writeback failed");
                                }
                            }
                        }
                        WritebackMode::Lazy => {
                            if let Some(queue) = &self.lazy {
                                queue.enqueue(WritebackJob { key: parsed, entry });
                            }
                        }
                        WritebackMode::Never => {}
                    }
                }
            }
            let _ = fs::remove_file(&path).await;
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

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    pub fn contains(&self, key: &DerivativeKey) -> bool {
        self.index.read().contains_key(key.as_str())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[async_trait]
impl CacheLevel for FileCache {
    fn name(&self) -> &'static str {
        "file"
    }

    fn writeback(&self) -> WritebackMode {
        self.writeback
    }

    async fn get(&self, key: &DerivativeKey) -> Result<Option<CachedEntry>> {
        let record = {
            let mut index = self.index.write();
            match index.get_mut(key.as_str()) {
                Some(record) => {
                    record.atime = monotonic_millis();
                    Some(record.clone())
                }
                None => None,
            }
        };
        let Some(record) = record else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let path = self.blob_path(key.as_str());
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Blob vanished underneath us; drop the record.
                if self.index.write().remove(key.as_str()).is_some() {
                    self.used.fetch_sub(record.size, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        if raw.len() as u64 != record.size {
            // Partial write; treat as the crash-safety path does at startup.
            if self.index.write().remove(key.as_str()).is_some() {
                self.used.fetch_sub(record.size, Ordering::Relaxed);
            }
            let _ = fs::remove_file(&path).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(CachedEntry::with_meta(
            Bytes::from(raw),
            EntryMeta::with_times(record.size, record.is_thumbnail, record.ctime, record.atime),
        )))
    }

    async fn put(&self, key: &DerivativeKey, entry: CachedEntry) -> Result<PutOutcome> {
        let size = entry.size();
        if !self.policy.admits(size) {
            return Ok(PutOutcome::TooLarge);
        }

        self.write_blob(key.as_str(), entry.bytes()).await?;

        {
            let mut index = self.index.write();
            let record = IndexRecord {
                size,
                ctime: entry.meta().ctime(),
                atime: entry.meta().atime(),
                is_thumbnail: entry.meta().is_thumbnail(),
            };
            match index.insert(key.as_str().to_owned(), record) {
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

        self.maybe_evict().await;
        self.persist_index().await;
        Ok(PutOutcome::Stored)
    }

    async fn invalidate(&self, identity: &ImageIdentity) -> Result<usize> {
        let removed: Vec<(String, IndexRecord)> = {
            let mut index = self.index.write();
            let keys: Vec<String> = index
                .keys()
                .filter(|key| identity_of_key(key) == identity.as_str())
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| index.remove(&key).map(|record| (key, record)))
                .collect()
        };

        for (key, record) in &removed {
            self.used.fetch_sub(record.size, Ordering::Relaxed);
            let _ = fs::remove_file(self.blob_path(key)).await;
        }
        if !removed.is_empty() {
            self.persist_index().await;
        }
        Ok(removed.len())
    }

    fn stat(&self) -> LevelStat {
        let used_bytes = self.used.load(Ordering::Relaxed);
        LevelStat {
            used_bytes,
            element_count: self.index.read().len() as u64,
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

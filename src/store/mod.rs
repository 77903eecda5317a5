//! Object storage backends
//!
//! The remote containers (originals and derivative cache) sit behind the
//! [`ObjectBackend`] trait so the service never depends on a particular
//! object-store client. Two backends ship in-tree: an in-memory one for
//! tests and development, and a filesystem one that makes a single-node
//! deployment self-contained. A real Swift/S3 client slots in by
//! implementing the trait.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs;

use crate::error::{Error, Result};

mod container;

pub use container::{IssuedUrl, PresignConfig, RemoteContainer};

/// Listing/stat row for one stored object.
#[derive(Debug, Clone)]
pub struct ObjectStat {
    pub name: String,
    pub bytes: u64,
    pub content_type: Option<String>,
    /// Milliseconds since the epoch; best-effort, used as an access-time
    /// stand-in by the remote cache level.
    pub last_modified_ms: u64,
}

/// Abstract object-storage client for one or more named containers.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn get(&self, container: &str, name: &str) -> Result<Option<Bytes>>;

    async fn put(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        content_type: Option<String>,
    ) -> Result<()>;

    async fn delete(&self, container: &str, name: &str) -> Result<bool>;

    async fn stat(&self, container: &str, name: &str) -> Result<Option<ObjectStat>>;

    async fn list(&self, container: &str) -> Result<Vec<ObjectStat>>;

    /// Remove every object in the container. Used by `initialise_store`.
    async fn wipe(&self, container: &str) -> Result<()>;

    /// Cheap reachability probe, run at startup.
    async fn healthy(&self) -> Result<()>;
}

fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// In-memory backend
// =============================================================================

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
    last_modified_ms: u64,
}

/// In-memory backend for tests and development.
#[derive(Default)]
pub struct MemoryObjectBackend {
    containers: DashMap<String, DashMap<String, StoredObject>>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryObjectBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObjectBackend for MemoryObjectBackend {
    async fn get(&self, container: &str, name: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .containers
            .get(container)
            .and_then(|objects| objects.get(name).map(|o| o.data.clone())))
    }

    async fn put(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        content_type: Option<String>,
    ) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let objects = self
            .containers
            .entry(container.to_owned())
            .or_insert_with(DashMap::new);
        objects.insert(
            name.to_owned(),
            StoredObject {
                data,
                content_type,
                last_modified_ms: wall_millis(),
            },
        );
        Ok(())
    }

    async fn delete(&self, container: &str, name: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .containers
            .get(container)
            .map(|objects| objects.remove(name).is_some())
            .unwrap_or(false))
    }

    async fn stat(&self, container: &str, name: &str) -> Result<Option<ObjectStat>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.containers.get(container).and_then(|objects| {
            objects.get(name).map(|o| ObjectStat {
                name: name.to_owned(),
                bytes: o.data.len() as u64,
                content_type: o.content_type.clone(),
                last_modified_ms: o.last_modified_ms,
            })
        }))
    }

    async fn list(&self, container: &str) -> Result<Vec<ObjectStat>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut listing = Vec::new();
        if let Some(objects) = self.containers.get(container) {
            for item in objects.iter() {
                listing.push(ObjectStat {
                    name: item.key().clone(),
                    bytes: item.value().data.len() as u64,
                    content_type: item.value().content_type.clone(),
                    last_modified_ms: item.value().last_modified_ms,
                });
            }
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    async fn wipe(&self, container: &str) -> Result<()> {
        if let Some(objects) = self.containers.get(container) {
            objects.clear();
        }
        Ok(())
    }

    async fn healthy(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Filesystem backend
// =============================================================================

/// Backend storing objects as files under `<root>/<container>/<name>`.
///
/// Object names are path-like (identities and derivative keys), so they map
/// directly onto nested directories. Content types are not persisted;
/// callers sniff formats from the bytes.
pub struct FsObjectBackend {
    root: PathBuf,
}

impl FsObjectBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        for segment in name.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(Error::InvalidName(format!(
                    "object name not representable on the filesystem: {name}"
                )));
            }
        }
        Ok(self.root.join(container).join(name))
    }
}

#[async_trait]
impl ObjectBackend for FsObjectBackend {
    async fn get(&self, container: &str, name: &str) -> Result<Option<Bytes>> {
        let path = self.object_path(container, name)?;
        match fs::read(&path).await {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::Unavailable(err.to_string())),
        }
    }

    async fn put(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        _content_type: Option<String>,
    ) -> Result<()> {
        let path = self.object_path(container, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| Error::Unavailable(err.to_string()))?;
        }
        let tmp = {
            let mut os = path.as_os_str().to_owned();
            os.push(".upload-tmp");
            PathBuf::from(os)
        };
        fs::write(&tmp, &data)
            .await
            .map_err(|err| Error::Unavailable(err.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|err| Error::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn delete(&self, container: &str, name: &str) -> Result<bool> {
        let path = self.object_path(container, name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::Unavailable(err.to_string())),
        }
    }

    async fn stat(&self, container: &str, name: &str) -> Result<Option<ObjectStat>> {
        let path = self.object_path(container, name)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectStat {
                name: name.to_owned(),
                bytes: meta.len(),
                content_type: None,
                last_modified_ms: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_else(wall_millis),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::Unavailable(err.to_string())),
        }
    }

    async fn list(&self, container: &str) -> Result<Vec<ObjectStat>> {
        let base = self.root.join(container);
        let mut listing = Vec::new();
        let mut pending: Vec<PathBuf> = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            let mut reader = match fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(Error::Unavailable(err.to_string())),
            };
            while let Some(dir_entry) = reader
                .next_entry()
                .await
                .map_err(|err| Error::Unavailable(err.to_string()))?
            {
                let path = dir_entry.path();
                let file_type = match dir_entry.file_type().await {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Some(name) = relative_name(&base, &path) {
                    if let Ok(Some(stat)) = self.stat(container, &name).await {
                        listing.push(stat);
                    }
                }
            }
        }

        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    async fn wipe(&self, container: &str) -> Result<()> {
        let base = self.root.join(container);
        match fs::remove_dir_all(&base).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::Unavailable(err.to_string())),
        }
        fs::create_dir_all(&base)
            .await
            .map_err(|err| Error::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn healthy(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| Error::Unavailable(format!("store root unusable: {err}")))?;
        Ok(())
    }
}

fn relative_name(base: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(base)
        .ok()
        .and_then(|rel| rel.to_str())
        .map(|s| s.to_owned())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryObjectBackend::new();
        backend
            .put("images", "a/b", Bytes::from_static(b"data"), None)
            .await
            .unwrap();

        let got = backend.get("images", "a/b").await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"data")));
        assert_eq!(backend.writes(), 1);

        assert!(backend.delete("images", "a/b").await.unwrap());
        assert!(backend.get("images", "a/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_backend_stat_and_list() {
        let backend = MemoryObjectBackend::new();
        backend
            .put("images", "b", Bytes::from_static(b"22"), Some("image/png".into()))
            .await
            .unwrap();
        backend
            .put("images", "a", Bytes::from_static(b"1"), None)
            .await
            .unwrap();

        let stat = backend.stat("images", "b").await.unwrap().unwrap();
        assert_eq!(stat.bytes, 2);
        assert_eq!(stat.content_type.as_deref(), Some("image/png"));

        let listing = backend.list("images").await.unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].name, "a");
        assert_eq!(listing[1].name, "b");
    }

    #[tokio::test]
    async fn test_memory_backend_wipe() {
        let backend = MemoryObjectBackend::new();
        for i in 0..5 {
            backend
                .put("images", &format!("obj-{i}"), Bytes::from_static(b"x"), None)
                .await
                .unwrap();
        }
        backend.wipe("images").await.unwrap();
        assert!(backend.list("images").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fs_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsObjectBackend::new(dir.path());

        backend
            .put("originals", "gallery/shot-1", Bytes::from_static(b"pixels"), None)
            .await
            .unwrap();
        let got = backend.get("originals", "gallery/shot-1").await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"pixels")));

        let listing = backend.list("originals").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "gallery/shot-1");
        assert_eq!(listing[0].bytes, 6);
    }

    #[tokio::test]
    async fn test_fs_backend_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsObjectBackend::new(dir.path());
        let err = backend.get("c", "../etc/passwd").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_fs_backend_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsObjectBackend::new(dir.path());
        assert!(backend.get("c", "nothing").await.unwrap().is_none());
        assert!(backend.stat("c", "nothing").await.unwrap().is_none());
        assert!(!backend.delete("c", "nothing").await.unwrap());
        assert!(backend.list("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fs_backend_wipe() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsObjectBackend::new(dir.path());
        backend
            .put("c", "a/b", Bytes::from_static(b"x"), None)
            .await
            .unwrap();
        backend.wipe("c").await.unwrap();
        assert!(backend.list("c").await.unwrap().is_empty());
    }
}

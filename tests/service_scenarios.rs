//! End-to-end service scenarios
//!
//! Drives the full stack (memory → file → derivative container →
//! originals store over an in-memory backend) through the coordinator,
//! with a counting transform double standing in for the image pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use image_depot::cache::{
    CacheLevel, EvictionPolicy, FileCache, FileCacheOptions, MemoryCache, ObjectCache,
    ObjectCacheOptions, ObjectStore, Priority, ServiceMetrics, WritebackMode,
};
use image_depot::config::Config;
use image_depot::coordinator::{CoreContext, DerivationCoordinator, Resolved};
use image_depot::error::TransformError;
use image_depot::name::{DerivativeKey, ImageFormat, ImageIdentity, TransformParams};
use image_depot::store::{MemoryObjectBackend, PresignConfig, RemoteContainer};
use image_depot::transform::Transform;

/// Deterministic pipeline double. Output depends on the parameters, so
/// distinct derivative keys carry distinct bytes, and invocations are
/// counted for the miss-collapse assertions.
struct CountingTransform {
    calls: AtomicU64,
    delay: Option<Duration>,
}

impl CountingTransform {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            delay: None,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            calls: AtomicU64::new(0),
            delay: Some(delay),
        }
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transform for CountingTransform {
    fn apply(
        &self,
        src: &Bytes,
        params: &TransformParams,
    ) -> std::result::Result<Bytes, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if src.is_empty() {
            return Err(TransformError::Corrupt("empty image".into()));
        }
        let mut out = Vec::new();
        out.extend_from_slice(params.format.as_str().as_bytes());
        if params.thumbnail {
            out.extend_from_slice(b"+thumb");
            if params.equalise {
                out.extend_from_slice(b"+equalise");
            }
            if params.sharpen {
                out.extend_from_slice(b"+sharpen");
            }
            if let (Some(w), Some(h)) = (params.max_width, params.max_height) {
                out.extend_from_slice(format!("+{w}x{h}").as_bytes());
            }
        }
        out.extend_from_slice(b"|");
        out.extend_from_slice(src);
        Ok(Bytes::from(out))
    }

    fn metadata(&self, src: &Bytes) -> std::result::Result<serde_json::Value, TransformError> {
        Ok(serde_json::json!({ "bytes": src.len() }))
    }
}

struct Stack {
    coordinator: DerivationCoordinator,
    memory: Arc<MemoryCache>,
    file: Arc<FileCache>,
    object_cache: Arc<ObjectCache>,
    transform: Arc<CountingTransform>,
    config: Config,
    _dir: tempfile::TempDir,
}

fn presign_config(lifetime: u64, slack: u64) -> PresignConfig {
    PresignConfig {
        server_url: "https://store.example.net:8888".into(),
        url_key: "0123456789".into(),
        url_method: "GET".into(),
        url_lifetime: lifetime,
        url_lifetime_slack: slack,
    }
}

async fn build_stack(transform: CountingTransform, url_lifetime: u64, url_slack: u64) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryObjectBackend::new());

    let store = Arc::new(ObjectStore::new(Arc::new(RemoteContainer::new(
        backend.clone(),
        "originals",
        Some(presign_config(url_lifetime, url_slack)),
    ))));

    let object_cache = Arc::new(
        ObjectCache::open(
            Arc::new(RemoteContainer::new(
                backend.clone(),
                "derivatives",
                Some(presign_config(url_lifetime, url_slack)),
            )),
            ObjectCacheOptions::default(),
            EvictionPolicy::new(0, 0, 0.8, 0.2, 0.1, Priority::Newest),
            WritebackMode::Never,
            None,
            None,
        )
        .await
        .unwrap(),
    );

    let file = Arc::new(
        FileCache::open(
            FileCacheOptions {
                root: dir.path().to_path_buf(),
                initialise: false,
            },
            EvictionPolicy::new(0, 0, 0.8, 0.2, 0.1, Priority::Newest),
            WritebackMode::Eager,
            Some(object_cache.clone() as Arc<dyn CacheLevel>),
            None,
        )
        .await
        .unwrap(),
    );

    let memory = Arc::new(MemoryCache::new(
        EvictionPolicy::new(0, 0, 0.8, 0.2, 0.1, Priority::Newest),
        WritebackMode::Eager,
        Some(file.clone() as Arc<dyn CacheLevel>),
        None,
    ));

    let transform = Arc::new(transform);
    let coordinator = DerivationCoordinator::new(CoreContext {
        levels: vec![
            memory.clone() as Arc<dyn CacheLevel>,
            file.clone() as Arc<dyn CacheLevel>,
            object_cache.clone() as Arc<dyn CacheLevel>,
        ],
        store,
        object_cache: Some(object_cache.clone()),
        transform: transform.clone() as Arc<dyn Transform>,
        metrics: Arc::new(ServiceMetrics::new()),
        canonical_format: ImageFormat::Miff,
        canonical_format_used: false,
    });

    Stack {
        coordinator,
        memory,
        file,
        object_cache,
        transform,
        config: Config::default(),
        _dir: dir,
    }
}

async fn upload(stack: &Stack, identity: &str, body: &[u8]) -> ImageIdentity {
    let id = ImageIdentity::parse(identity).unwrap();
    stack
        .coordinator
        .put(&id, Bytes::copy_from_slice(body), None, None)
        .await
        .unwrap();
    id
}

async fn get_bytes(stack: &Stack, id: &ImageIdentity, params: Option<TransformParams>) -> Bytes {
    match stack
        .coordinator
        .resolve(id, params, false, None)
        .await
        .unwrap()
    {
        Resolved::Bytes { bytes, .. } => bytes,
        Resolved::Url(_) => panic!("expected bytes"),
    }
}

async fn get_url(stack: &Stack, id: &ImageIdentity, params: Option<TransformParams>) -> String {
    match stack
        .coordinator
        .resolve(id, params, true, None)
        .await
        .unwrap()
    {
        Resolved::Url(url) => url,
        Resolved::Bytes { .. } => panic!("expected url"),
    }
}

// =============================================================================
// Scenarios
// =============================================================================

/// Upload then fetch: the served body is the default-format derivative
/// with metadata stripped, and the memory and file levels each hold
/// exactly that one entry.
#[tokio::test]
async fn scenario_upload_then_fetch() {
    let stack = build_stack(CountingTransform::new(), 3600, 600).await;
    let id = upload(&stack, "a/b.jpg", b"original-pixels").await;

    let params = TransformParams::convert(ImageFormat::Jpg);
    let body = get_bytes(&stack, &id, Some(params.clone())).await;
    assert_eq!(body.as_ref(), b"jpg|original-pixels");

    let key = DerivativeKey::derived(id.clone(), params);
    assert_eq!(stack.memory.stat().element_count, 1);
    assert_eq!(stack.file.stat().element_count, 1);
    assert!(stack.memory.contains(&key));
    assert!(stack.file.contains(&key));
}

/// Thumbnail with enhancements; the second request is served from the
/// memory cache without another pipeline invocation.
#[tokio::test]
async fn scenario_thumbnail_served_from_cache() {
    let stack = build_stack(CountingTransform::new(), 3600, 600).await;
    let id = upload(&stack, "a/b", b"px").await;

    let params = stack.config.thumbnail_params(None, None, None);
    let first = get_bytes(&stack, &id, Some(params.clone())).await;
    assert_eq!(first.as_ref(), b"jpg+thumb+equalise+sharpen+50x50|px");

    let memory_hits_before = stack.memory.hits();
    let second = get_bytes(&stack, &id, Some(params)).await;
    assert_eq!(first, second);
    assert_eq!(stack.transform.calls(), 1);
    assert!(stack.memory.hits() > memory_hits_before);
}

/// Bounded memory level with newest-retention: the ninth 100-byte insert
/// crosses the start ratio and the three oldest entries leave, settling
/// at or below the stop ratio.
#[tokio::test]
async fn scenario_memory_eviction() {
    let memory = MemoryCache::new(
        EvictionPolicy::new(1000, 0, 0.8, 0.2, 0.1, Priority::Newest),
        WritebackMode::Never,
        None,
        None,
    );

    let mut keys = Vec::new();
    for i in 0..12 {
        let key = DerivativeKey::parse(&format!("img/{i}")).unwrap();
        memory
            .put(&key, image_depot::cache::CachedEntry::new(Bytes::from(vec![0u8; 100]), false))
            .await
            .unwrap();
        keys.push(key);
    }

    assert!(memory.stat().used_bytes <= 600);
    for key in &keys[..3] {
        assert!(!memory.contains(key), "expected {key} evicted");
    }
    assert!(memory.contains(&keys[11]));
}

/// Miss collapse: 100 concurrent requests for one uncached derivative
/// cause exactly one originals-store fetch and one pipeline invocation,
/// and all responses are byte-equal.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scenario_miss_collapse() {
    let stack = build_stack(CountingTransform::slow(Duration::from_millis(25)), 3600, 600).await;
    let id = upload(&stack, "hot/key", b"px").await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..100 {
        let coordinator = stack.coordinator.clone();
        let id = id.clone();
        tasks.spawn(async move {
            match coordinator
                .resolve(
                    &id,
                    Some(TransformParams::convert(ImageFormat::Jpg)),
                    false,
                    None,
                )
                .await
                .unwrap()
            {
                Resolved::Bytes { bytes, .. } => bytes,
                Resolved::Url(_) => panic!("expected bytes"),
            }
        });
    }

    let mut bodies = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        bodies.push(joined.unwrap());
    }

    assert_eq!(bodies.len(), 100);
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(stack.transform.calls(), 1);
    assert_eq!(stack.coordinator.metrics().store_fetches(), 1);
    assert_eq!(stack.coordinator.metrics().derivations(), 1);
}

/// Pre-signed URL reuse: requests inside the slack window share one URL;
/// once the full lifetime plus slack has passed, a fresh URL is issued.
#[tokio::test]
async fn scenario_presigned_url_reuse_and_expiry() {
    let stack = build_stack(CountingTransform::new(), 1, 1).await;
    let id = upload(&stack, "a/b", b"px").await;

    let first = get_url(&stack, &id, None).await;
    let second = get_url(&stack, &id, None).await;
    assert_eq!(first, second);
    assert!(first.contains("/v1/originals/a/b?"));
    assert!(first.contains("temp_url_sig="));

    // Outlive lifetime + slack (1s + 1s); a new URL must be signed.
    tokio::time::sleep(Duration::from_millis(2300)).await;
    let third = get_url(&stack, &id, None).await;
    assert_ne!(first, third);
}

/// Derivative URLs require the artifact in the derivative container.
#[tokio::test]
async fn scenario_derivative_url_lands_in_container() {
    let stack = build_stack(CountingTransform::new(), 3600, 600).await;
    let id = upload(&stack, "a/b", b"px").await;

    let params = TransformParams::convert(ImageFormat::Png);
    let url = get_url(&stack, &id, Some(params.clone())).await;
    assert!(url.contains("/v1/derivatives/"));

    let key = DerivativeKey::derived(id, params);
    assert!(stack.object_cache.contains(&key));
}

/// Invalidation on re-upload: a derivative fetched after the second
/// upload is derived from the second body, never served stale.
#[tokio::test]
async fn scenario_invalidation_on_reupload() {
    let stack = build_stack(CountingTransform::new(), 3600, 600).await;
    let id = upload(&stack, "x", b"one").await;

    let params = TransformParams::convert(ImageFormat::Jpg);
    let first = get_bytes(&stack, &id, Some(params.clone())).await;
    assert_eq!(first.as_ref(), b"jpg|one");

    stack
        .coordinator
        .put(&id, Bytes::from_static(b"two"), None, None)
        .await
        .unwrap();

    let second = get_bytes(&stack, &id, Some(params.clone())).await;
    assert_eq!(second.as_ref(), b"jpg|two");

    // Nothing stale survives anywhere in the chain.
    let key = DerivativeKey::derived(id.clone(), params);
    let held = stack.memory.get(&key).await.unwrap().unwrap();
    assert_eq!(held.bytes().as_ref(), b"jpg|two");
}

/// The original round-trips byte-exact, and a restart of the file level
/// still serves it without another store fetch.
#[tokio::test]
async fn scenario_file_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let key = DerivativeKey::parse("keep/me#.jpg").unwrap();
    {
        let cache = FileCache::open(
            FileCacheOptions {
                root: dir.path().to_path_buf(),
                initialise: false,
            },
            EvictionPolicy::new(0, 0, 0.8, 0.2, 0.1, Priority::Newest),
            WritebackMode::Never,
            None,
            None,
        )
        .await
        .unwrap();
        cache
            .put(
                &key,
                image_depot::cache::CachedEntry::new(Bytes::from_static(b"persisted"), false),
            )
            .await
            .unwrap();
    }

    let reopened = FileCache::open(
        FileCacheOptions {
            root: dir.path().to_path_buf(),
            initialise: false,
        },
        EvictionPolicy::new(0, 0, 0.8, 0.2, 0.1, Priority::Newest),
        WritebackMode::Never,
        None,
        None,
    )
    .await
    .unwrap();
    let entry = reopened.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.bytes().as_ref(), b"persisted");
}

/// Listing returns identities only, filtered by an anchored regex.
#[tokio::test]
async fn scenario_listing_with_regex() {
    let stack = build_stack(CountingTransform::new(), 3600, 600).await;
    upload(&stack, "gallery/summer/one", b"1").await;
    upload(&stack, "gallery/winter/two", b"2").await;
    upload(&stack, "misc/three", b"3").await;
    // Derivatives never appear in listings.
    get_bytes(
        &stack,
        &ImageIdentity::parse("misc/three").unwrap(),
        Some(TransformParams::convert(ImageFormat::Jpg)),
    )
    .await;

    let all = stack.coordinator.list(None, None).await.unwrap();
    assert_eq!(all.len(), 3);

    let gallery = stack
        .coordinator
        .list(None, Some(r"gallery/.*"))
        .await
        .unwrap();
    assert_eq!(gallery.len(), 2);

    let prefixed = stack
        .coordinator
        .list(Some("gallery/summer/"), None)
        .await
        .unwrap();
    assert_eq!(prefixed, vec!["gallery/summer/one"]);
}

/// Metadata requests read the original through the cache stack and do not
/// pollute the caches with pipeline output.
#[tokio::test]
async fn scenario_meta_of_original() {
    let stack = build_stack(CountingTransform::new(), 3600, 600).await;
    let id = upload(&stack, "a/b", b"12345678").await;
    let meta = stack.coordinator.meta(&id, None).await.unwrap();
    assert_eq!(meta["bytes"], 8);
    assert_eq!(stack.transform.calls(), 0);
}

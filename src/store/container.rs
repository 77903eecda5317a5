//! Remote container handle
//!
//! Wraps one named container of an [`ObjectBackend`] with the operational
//! behaviour both remote tiers share: transient-failure retry with backoff,
//! a per-operation timeout, and pre-signed URL issuance with reuse to
//! amortise signature cost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::time::timeout;
use tracing::debug;

use super::{ObjectBackend, ObjectStat};
use crate::error::{Error, Result};
use crate::name::sha256_hex;

/// Per-operation ceiling for remote I/O, independent of request deadlines.
const REMOTE_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Transient failures are retried this many times with doubling backoff.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Settings for time-limited URL issuance on a container.
#[derive(Clone, Debug)]
pub struct PresignConfig {
    /// Public base, e.g. `https://store.example.net:8888`
    pub server_url: String,
    /// Shared signing secret
    pub url_key: String,
    pub url_method: String,
    /// Requested validity in seconds
    pub url_lifetime: u64,
    /// Extra validity granted so repeat requests can reuse one URL
    pub url_lifetime_slack: u64,
}

/// A URL handed to a client, with whether it was served from the reuse
/// cache.
#[derive(Clone, Debug)]
pub struct IssuedUrl {
    pub url: String,
    pub expires_at_ms: u64,
    pub reused: bool,
}

pub struct RemoteContainer {
    backend: Arc<dyn ObjectBackend>,
    container: String,
    presign: Option<PresignConfig>,
    url_cache: DashMap<String, IssuedUrl>,
    presigns_issued: AtomicU64,
    presigns_reused: AtomicU64,
}

impl RemoteContainer {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        container: impl Into<String>,
        presign: Option<PresignConfig>,
    ) -> Self {
        Self {
            backend,
            container: container.into(),
            presign,
            url_cache: DashMap::new(),
            presigns_issued: AtomicU64::new(0),
            presigns_reused: AtomicU64::new(0),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn presigns_issued(&self) -> u64 {
        self.presigns_issued.load(Ordering::Relaxed)
    }

    pub fn presigns_reused(&self) -> u64 {
        self.presigns_reused.load(Ordering::Relaxed)
    }

    /// Run a remote operation under the per-op timeout, retrying transient
    /// failures with doubling backoff.
    async fn retrying<T>(
        &self,
        what: &'static str,
        mut op: impl FnMut() -> BoxFuture<'static, Result<T>>,
    ) -> Result<T> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match timeout(REMOTE_OP_TIMEOUT, op()).await {
                Err(_) => return Err(Error::Timeout),
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                    debug!(container = self.container, what, attempt, %err, "retrying remote operation");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Ok(Err(err)) => return Err(err),
            }
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        let backend = Arc::clone(&self.backend);
        let container = self.container.clone();
        let name = name.to_owned();
        self.retrying("get", move || {
            let backend = Arc::clone(&backend);
            let container = container.clone();
            let name = name.clone();
            Box::pin(async move { backend.get(&container, &name).await })
        })
        .await
    }

    pub async fn put(&self, name: &str, data: Bytes, content_type: Option<String>) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let container = self.container.clone();
        let name = name.to_owned();
        self.retrying("put", move || {
            let backend = Arc::clone(&backend);
            let container = container.clone();
            let name = name.clone();
            let data = data.clone();
            let content_type = content_type.clone();
            Box::pin(async move { backend.put(&container, &name, data, content_type).await })
        })
        .await
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        self.url_cache.remove(name);
        let backend = Arc::clone(&self.backend);
        let container = self.container.clone();
        let name = name.to_owned();
        self.retrying("delete", move || {
            let backend = Arc::clone(&backend);
            let container = container.clone();
            let name = name.clone();
            Box::pin(async move { backend.delete(&container, &name).await })
        })
        .await
    }

    pub async fn stat(&self, name: &str) -> Result<Option<ObjectStat>> {
        let backend = Arc::clone(&self.backend);
        let container = self.container.clone();
        let name = name.to_owned();
        self.retrying("stat", move || {
            let backend = Arc::clone(&backend);
            let container = container.clone();
            let name = name.clone();
            Box::pin(async move { backend.stat(&container, &name).await })
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<ObjectStat>> {
        let backend = Arc::clone(&self.backend);
        let container = self.container.clone();
        self.retrying("list", move || {
            let backend = Arc::clone(&backend);
            let container = container.clone();
            Box::pin(async move { backend.list(&container).await })
        })
        .await
    }

    pub async fn wipe(&self) -> Result<()> {
        self.url_cache.clear();
        let backend = Arc::clone(&self.backend);
        let container = self.container.clone();
        self.retrying("wipe", move || {
            let backend = Arc::clone(&backend);
            let container = container.clone();
            Box::pin(async move { backend.wipe(&container).await })
        })
        .await
    }

    pub async fn healthy(&self) -> Result<()> {
        self.backend.healthy().await
    }

    /// Issue (or reuse) a time-limited URL for an object.
    ///
    /// A fresh URL is valid for `lifetime + slack` seconds. A cached URL is
    /// reused while its remaining lifetime is at least `lifetime − slack`,
    /// so clients always get at least the advertised lifetime minus slack
    /// and the signature is not recomputed on every request.
    pub fn presign(&self, name: &str) -> Result<IssuedUrl> {
        let config = self.presign.as_ref().ok_or_else(|| {
            Error::Config(format!(
                "container {} has no pre-signed URL configuration",
                self.container
            ))
        })?;

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        if let Some(cached) = self.url_cache.get(name) {
            let remaining_ms = cached.expires_at_ms.saturating_sub(now_ms);
            let floor_ms = config.url_lifetime.saturating_sub(config.url_lifetime_slack) * 1000;
            if remaining_ms >= floor_ms && remaining_ms > 0 {
                self.presigns_reused.fetch_add(1, Ordering::Relaxed);
                let mut reused = cached.clone();
                reused.reused = true;
                return Ok(reused);
            }
        }

        let expires_secs =
            now_ms / 1000 + config.url_lifetime + config.url_lifetime_slack;
        let path = format!("/v1/{}/{}", self.container, name);
        let signature = sha256_hex(
            format!(
                "{}\n{}\n{}\n{}",
                config.url_method, expires_secs, path, config.url_key
            )
            .as_bytes(),
        );
        let issued = IssuedUrl {
            url: format!(
                "{}{}?temp_url_sig={}&temp_url_expires={}",
                config.server_url, path, signature, expires_secs
            ),
            expires_at_ms: expires_secs * 1000,
            reused: false,
        };
        self.url_cache.insert(name.to_owned(), issued.clone());
        self.presigns_issued.fetch_add(1, Ordering::Relaxed);
        Ok(issued)
    }
}

// =============================================================================
// Tests
// =============================================================================

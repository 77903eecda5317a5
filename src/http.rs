//! HTTP surface
//!
//! A thin hyper service mapping the REST shape onto coordinator
//! operations:
//!
//! | Method | Path                  | Core op        |
//! |--------|-----------------------|----------------|
//! | GET    | `/images`             | list           |
//! | GET    | `/images/<identity>`  | resolve / meta |
//! | POST   | `/images/<identity>`  | put            |
//!
//! plus `/healthz` and `/metrics`. Query parameters: `xsize`, `ysize`,
//! `kind`, `thumbnail`, `url`, `meta`, `regex`. A `regex` request returns
//! the matching identities as JSON.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, TextEncoder};
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use url::form_urlencoded;

use crate::config::Config;
use crate::coordinator::{DerivationCoordinator, Resolved};
use crate::error::{Error, Result};
use crate::name::{ImageFormat, ImageIdentity, TransformParams};

const BASE_PATH: &str = "/images";

/// Per-request deadline for coordinator operations.
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Parsed query string of an image request.
#[derive(Debug, Default)]
struct ImageQuery {
    xsize: Option<u32>,
    ysize: Option<u32>,
    kind: Option<ImageFormat>,
    thumbnail: bool,
    url: bool,
    meta: bool,
    regex: Option<String>,
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::InvalidParameter(format!(
            "{name} must be boolean, got '{other}'"
        ))),
    }
}

fn parse_size(name: &str, value: &str) -> Result<u32> {
    let parsed: u32 = value
        .parse()
        .map_err(|_| Error::InvalidParameter(format!("{name} must be a positive integer")))?;
    if parsed == 0 || parsed >= 10_000 {
        return Err(Error::InvalidParameter(format!(
            "image {name} {parsed} is unreasonable"
        )));
    }
    Ok(parsed)
}

fn parse_image_query(raw: Option<&str>) -> Result<ImageQuery> {
    let mut query = ImageQuery::default();
    let Some(raw) = raw else {
        return Ok(query);
    };
    for (name, value) in form_urlencoded::parse(raw.as_bytes()) {
        match name.as_ref() {
            "xsize" => query.xsize = Some(parse_size("xsize", &value)?),
            "ysize" => query.ysize = Some(parse_size("ysize", &value)?),
            "kind" => query.kind = Some(ImageFormat::parse(&value)?),
            "thumbnail" => query.thumbnail = parse_bool("thumbnail", &value)?,
            "url" => query.url = parse_bool("url", &value)?,
            "meta" => query.meta = parse_bool("meta", &value)?,
            "regex" => query.regex = Some(value.into_owned()),
            other => {
                return Err(Error::InvalidParameter(format!(
                    "unknown query parameter '{other}'"
                )))
            }
        }
    }
    Ok(query)
}

/// The service handed to every connection.
pub struct DepotService {
    coordinator: DerivationCoordinator,
    config: Arc<Config>,
    requests: IntCounterVec,
    cache_used_bytes: IntGaugeVec,
    cache_entries: IntGaugeVec,
}

impl DepotService {
    pub fn new(coordinator: DerivationCoordinator, config: Arc<Config>) -> Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new("image_depot_requests_total", "Requests by operation"),
            &["op"],
        )
        .map_err(|err| Error::Internal(err.to_string()))?;
        let cache_used_bytes = IntGaugeVec::new(
            Opts::new("image_depot_cache_used_bytes", "Bytes held per cache level"),
            &["level"],
        )
        .map_err(|err| Error::Internal(err.to_string()))?;
        let cache_entries = IntGaugeVec::new(
            Opts::new("image_depot_cache_entries", "Entries held per cache level"),
            &["level"],
        )
        .map_err(|err| Error::Internal(err.to_string()))?;

        // Re-registration only happens when a second service is built in
        // the same process (tests); the scrape still works off the clones.
        let registry = prometheus::default_registry();
        let _ = registry.register(Box::new(requests.clone()));
        let _ = registry.register(Box::new(cache_used_bytes.clone()));
        let _ = registry.register(Box::new(cache_entries.clone()));

        Ok(Self {
            coordinator,
            config,
            requests,
            cache_used_bytes,
            cache_entries,
        })
    }

    /// Map a request's query onto transform parameters; `None` is the
    /// distinguished "original" request.
    fn request_params(&self, query: &ImageQuery) -> Option<TransformParams> {
        if query.thumbnail {
            return Some(
                self.config
                    .thumbnail_params(query.xsize, query.ysize, query.kind),
            );
        }
        let format = query.kind.unwrap_or(self.config.image_default_format);
        if query.xsize.is_some() || query.ysize.is_some() {
            let x = query.xsize.or(query.ysize).unwrap_or_default();
            let y = query.ysize.or(query.xsize).unwrap_or_default();
            return Some(TransformParams::resize(x, y, format));
        }
        Some(TransformParams::convert(format))
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let result = self.route(req).await;
        match result {
            Ok(response) => response,
            Err(err) => {
                debug!(%method, %path, %err, "request failed");
                respond(
                    StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    "text/plain",
                    Bytes::from(err.to_string()),
                )
            }
        }
    }

    async fn route(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let path = req.uri().path().to_owned();
        match (req.method().clone(), path.as_str()) {
            (Method::GET, "/healthz") | (Method::GET, "/livez") | (Method::GET, "/readyz") => {
                Ok(respond(StatusCode::OK, "text/plain", Bytes::from_static(b"ok")))
            }
            (Method::GET, "/metrics") => self.metrics_response(),
            (Method::GET, path) if path == BASE_PATH || path == base_path_slash() => {
                self.requests.with_label_values(&["list"]).inc();
                let query = parse_image_query(req.uri().query())?;
                self.listing(None, query.regex.as_deref()).await
            }
            (Method::GET, path) if path.starts_with(&format!("{BASE_PATH}/")) => {
                let raw_identity = &path[BASE_PATH.len() + 1..];
                let query = parse_image_query(req.uri().query())?;
                self.get_image(raw_identity, query).await
            }
            (Method::POST, path) if path.starts_with(&format!("{BASE_PATH}/")) => {
                self.requests.with_label_values(&["put"]).inc();
                let raw_identity = path[BASE_PATH.len() + 1..].to_owned();
                let identity = ImageIdentity::parse(&raw_identity)?;
                let body = req
                    .into_body()
                    .collect()
                    .await
                    .map_err(|err| Error::InvalidParameter(format!("unreadable body: {err}")))?
                    .to_bytes();
                if body.is_empty() {
                    return Err(Error::InvalidParameter("empty upload body".into()));
                }
                let content_type = crate::transform::sniff_format(&body)
                    .and_then(|f| ImageFormat::parse(f).ok())
                    .map(|f| f.mime().to_owned());
                self.coordinator
                    .put(&identity, body, content_type, Some(REQUEST_DEADLINE))
                    .await?;
                Ok(respond(
                    StatusCode::CREATED,
                    "text/plain",
                    Bytes::from(identity.to_string()),
                ))
            }
            _ => Ok(respond(
                StatusCode::NOT_FOUND,
                "text/plain",
                Bytes::from_static(b"not found"),
            )),
        }
    }

    async fn get_image(&self, raw_identity: &str, query: ImageQuery) -> Result<Response<Full<Bytes>>> {
        // A regex or a trailing slash turns the request into a listing
        // under the path prefix.
        if let Some(pattern) = &query.regex {
            self.requests.with_label_values(&["list"]).inc();
            let prefix = format!("{}/", raw_identity.trim_end_matches('/'));
            return self.listing(Some(prefix.as_str()), Some(pattern)).await;
        }
        if raw_identity.is_empty() || raw_identity.ends_with('/') {
            self.requests.with_label_values(&["list"]).inc();
            let prefix = raw_identity.trim_end_matches('/');
            let prefix = (!prefix.is_empty()).then(|| format!("{prefix}/"));
            return self.listing(prefix.as_deref(), None).await;
        }

        let identity = ImageIdentity::parse(raw_identity)?;

        if query.meta {
            self.requests.with_label_values(&["meta"]).inc();
            let meta = self
                .coordinator
                .meta(&identity, Some(REQUEST_DEADLINE))
                .await?;
            return json_response(StatusCode::OK, &meta);
        }

        self.requests.with_label_values(&["resolve"]).inc();
        let params = self.request_params(&query);
        match self
            .coordinator
            .resolve(&identity, params, query.url, Some(REQUEST_DEADLINE))
            .await?
        {
            Resolved::Url(url) => Ok(respond(StatusCode::OK, "text/plain", Bytes::from(url))),
            Resolved::Bytes {
                bytes,
                content_type,
            } => {
                let content_type = content_type
                    .or_else(|| {
                        crate::transform::sniff_format(&bytes)
                            .and_then(|f| ImageFormat::parse(f).ok())
                            .map(|f| f.mime())
                    })
                    .unwrap_or("application/octet-stream");
                Ok(respond(StatusCode::OK, content_type, bytes))
            }
        }
    }

    async fn listing(
        &self,
        prefix: Option<&str>,
        pattern: Option<&str>,
    ) -> Result<Response<Full<Bytes>>> {
        let names = self.coordinator.list(prefix, pattern).await?;
        if pattern.is_some() && names.is_empty() {
            return Err(Error::NotFound(format!(
                "no images match '{}{}'",
                prefix.unwrap_or(""),
                pattern.unwrap_or("")
            )));
        }
        json_response(StatusCode::OK, &names)
    }

    fn metrics_response(&self) -> Result<Response<Full<Bytes>>> {
        for level in self.coordinator.levels() {
            let stat = level.stat();
            self.cache_used_bytes
                .with_label_values(&[level.name()])
                .set(stat.used_bytes as i64);
            self.cache_entries
                .with_label_values(&[level.name()])
                .set(stat.element_count as i64);
        }

        let encoder = TextEncoder::new();
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|err| Error::Internal(err.to_string()))?;
        Ok(respond(
            StatusCode::OK,
            encoder.format_type(),
            Bytes::from(buffer),
        ))
    }
}

fn base_path_slash() -> String {
    format!("{BASE_PATH}/")
}

fn respond(status: StatusCode, content_type: &str, body: Bytes) -> Response<Full<Bytes>> {
    match Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(body))
    {
        Ok(response) => response,
        Err(_) => {
            let mut fallback = Response::new(Full::new(Bytes::from_static(b"internal error")));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        }
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>> {
    let raw = serde_json::to_vec(value)?;
    Ok(respond(status, "application/json", Bytes::from(raw)))
}

/// Accept loop in front of [`DepotService`].
pub async fn serve(addr: SocketAddr, service: Arc<DepotService>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| Error::Config(format!("failed to bind {addr}: {err}")))?;
    info!(%addr, "image depot listening");

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|err| Error::Internal(format!("accept failed: {err}")))?;
        let io = TokioIo::new(stream);
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let handler = service_fn(move |req| {
                let service = Arc::clone(&service);
                async move { Ok::<_, Infallible>(service.handle(req).await) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, handler).await {
                error!(%peer, %err, "connection error");
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_query() {
        let query =
            parse_image_query(Some("xsize=100&ysize=50&kind=png&thumbnail=true&url=false"))
                .unwrap();
        assert_eq!(query.xsize, Some(100));
        assert_eq!(query.ysize, Some(50));
        assert_eq!(query.kind, Some(ImageFormat::Png));
        assert!(query.thumbnail);
        assert!(!query.url);
        assert!(query.regex.is_none());
    }

    #[test]
    fn test_parse_image_query_rejects_garbage() {
        assert!(parse_image_query(Some("xsize=0")).is_err());
        assert!(parse_image_query(Some("xsize=999999")).is_err());
        assert!(parse_image_query(Some("thumbnail=maybe")).is_err());
        assert!(parse_image_query(Some("kind=exe")).is_err());
        assert!(parse_image_query(Some("verbose=true")).is_err());
    }

    #[test]
    fn test_parse_empty_query() {
        let query = parse_image_query(None).unwrap();
        assert!(!query.thumbnail && !query.url && !query.meta);
        assert!(query.xsize.is_none());
    }
}

//! Image Depot server
//!
//! Startup wiring: configuration, logging, the cache chain, the
//! coordinator and the HTTP surface.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use image_depot::cache::{
    AlarmEvent, AlarmSink, CacheLevel, FileCache, FileCacheOptions, MemoryCache, ObjectCache,
    ObjectCacheOptions, ObjectStore, ServiceMetrics,
};
use image_depot::config::{Config, RemoteContainerConfig, StoreBackendConfig};
use image_depot::coordinator::{CoreContext, DerivationCoordinator};
use image_depot::error::Result;
use image_depot::http::{serve, DepotService};
use image_depot::store::{
    FsObjectBackend, MemoryObjectBackend, ObjectBackend, PresignConfig, RemoteContainer,
};
use image_depot::transform::PassthroughTransform;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Image Depot - on-demand image derivation service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long, env = "IMAGE_DEPOT_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address for the HTTP surface
    #[arg(long, env = "IMAGE_DEPOT_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Check the configuration and exit
    #[arg(short = 't', long)]
    trial_run: bool,

    /// Dump the effective configuration as YAML and exit
    #[arg(short = 'Y', long)]
    dump_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = Arc::new(Config::load(args.config.as_deref()).map_err(|err| {
        error!(%err, "configuration rejected");
        err
    })?);

    if args.dump_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }
    if args.trial_run {
        info!("trial run, configuration accepted");
        return Ok(());
    }

    info!("image depot server starts");
    info!("  pid: {}", std::process::id());
    if let Some(pid_file) = &config.pid_file {
        std::fs::write(pid_file, format!("{}\n", std::process::id()))?;
    }
    if config.max_size > 0 || config.max_images > 0 {
        // Global caps are advisory diagnostics only.
        warn!(
            max_size = config.max_size,
            max_images = config.max_images,
            "global caps are advisory; per-level limits govern eviction"
        );
    }

    let coordinator = build_coordinator(&config).await?;
    let service = Arc::new(DepotService::new(coordinator, Arc::clone(&config))?);
    serve(args.listen, service).await
}

// =============================================================================
// Wiring
// =============================================================================

async fn build_coordinator(config: &Arc<Config>) -> Result<DerivationCoordinator> {
    let backend = build_backend(&config.store_backend);

    // Fail fast when the object store is unreachable.
    backend.healthy().await.map_err(|err| {
        error!(%err, "object store unreachable at startup");
        err
    })?;

    let alarm_sink = spawn_alarm_consumer();

    let originals = remote_container(
        Arc::clone(&backend),
        &config.persistent_store_configuration,
    )?;
    let derivatives = remote_container(Arc::clone(&backend), &config.object_cache_configuration)?;

    let store = Arc::new(ObjectStore::new(Arc::new(originals)));

    // Build the chain bottom-up so each level can hold its next-level
    // handle at construction.
    let wipe_derivatives =
        config.create_new || config.object_cache_configuration.initialise_store;
    if config.create_new || config.persistent_store_configuration.initialise_store {
        warn!("initialising originals container, existing objects are removed");
        store.container().wipe().await?;
    }

    let object_cache = Arc::new(
        ObjectCache::open(
            Arc::new(derivatives),
            ObjectCacheOptions {
                initialise: wipe_derivatives,
                use_file_cache: config.object_cache_configuration.use_file_cache,
            },
            config.object_cache_policy(),
            config.object_cache_configuration.writeback,
            None,
            Some(alarm_sink.clone()),
        )
        .await?,
    );

    let file_cache = Arc::new(
        FileCache::open(
            FileCacheOptions {
                root: config.local_cache_configuration.cache_path.clone(),
                initialise: config.create_new || config.local_cache_configuration.initialise,
            },
            config.file_policy(),
            config.local_cache_configuration.writeback,
            Some(object_cache.clone() as Arc<dyn CacheLevel>),
            Some(alarm_sink.clone()),
        )
        .await?,
    );

    // Remote downloads stream through the file cache as a staging area.
    object_cache.set_file_cache(file_cache.clone());

    let memory_cache = Arc::new(MemoryCache::new(
        config.memory_policy(),
        config.memory_cache_configuration.writeback,
        Some(file_cache.clone() as Arc<dyn CacheLevel>),
        Some(alarm_sink),
    ));

    info!(
        memory_max = config.memory_cache_configuration.max_size,
        file_max = config.local_cache_configuration.max_size,
        object_cache_max = config.object_cache_configuration.max_size,
        "cache chain assembled"
    );

    Ok(DerivationCoordinator::new(CoreContext {
        levels: vec![
            memory_cache as Arc<dyn CacheLevel>,
            file_cache as Arc<dyn CacheLevel>,
            object_cache.clone() as Arc<dyn CacheLevel>,
        ],
        store,
        object_cache: Some(object_cache),
        transform: Arc::new(PassthroughTransform::new()),
        metrics: Arc::new(ServiceMetrics::new()),
        canonical_format: config.canonical_format,
        canonical_format_used: config.canonical_format_used,
    }))
}

fn build_backend(config: &StoreBackendConfig) -> Arc<dyn ObjectBackend> {
    match config {
        StoreBackendConfig::Memory => Arc::new(MemoryObjectBackend::new()),
        StoreBackendConfig::Filesystem { root } => Arc::new(FsObjectBackend::new(root.clone())),
    }
}

fn remote_container(
    backend: Arc<dyn ObjectBackend>,
    config: &RemoteContainerConfig,
) -> Result<RemoteContainer> {
    // Credentials resolve at startup so a missing environment variable is
    // fatal here rather than surprising at request time.
    let _credentials = config.credentials.resolve()?;
    let url_key = config.url_key.resolve()?;
    let presign = (!url_key.is_empty()).then(|| PresignConfig {
        server_url: config.server_url.clone(),
        url_key,
        url_method: config.url_method.clone(),
        url_lifetime: config.url_lifetime,
        url_lifetime_slack: config.url_lifetime_slack,
    });
    Ok(RemoteContainer::new(
        backend,
        config.container.clone(),
        presign,
    ))
}

fn spawn_alarm_consumer() -> AlarmSink {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<AlarmEvent>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            warn!(
                level = event.level,
                used_bytes = event.used_bytes,
                max_bytes = event.max_bytes,
                "cache capacity alarm"
            );
        }
    });
    tx
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("tower=warn".parse().expect("static directive"));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// Startup failures exit nonzero through the Result return; configuration
// errors and an unreachable store are the two expected cases.

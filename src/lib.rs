//! Image Depot - On-Demand Image Derivation Service
//!
//! Serves original images and derivatives (resized variants, alternate
//! formats, thumbnails) from a tiered cache hierarchy over object storage.
//! A derivative is fully determined by `(identity, transform parameters)`,
//! so the system keeps no database: every cached artifact can be
//! regenerated from the originals container at any time.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      HTTP surface (hyper)                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │                   Derivation Coordinator                      │
//! │        probe → single-flight derive → populate │ presign      │
//! ├──────────────┬──────────────┬──────────────┬──────────────────┤
//! │ MemoryCache  │  FileCache   │ ObjectCache  │   ObjectStore    │
//! │ (RAM)        │ (local disk) │ (derivative  │ (authoritative   │
//! │              │              │  container)  │  originals)      │
//! └──────────────┴──────────────┴──────────────┴──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiered cache levels, eviction and writeback
//! - [`config`] - YAML configuration and credentials
//! - [`coordinator`] - Miss handling, single-flight, URL issuance
//! - [`error`] - Error types
//! - [`http`] - REST surface
//! - [`name`] - Identities, transform parameters, derivative keys
//! - [`store`] - Object-storage backends and remote containers
//! - [`transform`] - Image pipeline seam

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod name;
pub mod store;
pub mod transform;

// Re-export commonly used types
pub use cache::{
    AlarmEvent, CacheLevel, CachedEntry, EvictionPolicy, FileCache, FileCacheOptions, LevelStat,
    MemoryCache, ObjectCache, ObjectCacheOptions, ObjectStore, Priority, ServiceMetrics,
    WritebackMode,
};
pub use config::Config;
pub use coordinator::{CoreContext, DerivationCoordinator, Resolved};
pub use error::{Error, Result};
pub use name::{DerivativeKey, ImageFormat, ImageIdentity, TransformParams};
pub use store::{FsObjectBackend, MemoryObjectBackend, ObjectBackend, RemoteContainer};
pub use transform::{PassthroughTransform, Transform};

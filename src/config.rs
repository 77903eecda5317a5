//! Configuration loading
//!
//! YAML configuration, flat plus nested per-level sections. Every field has
//! a default; a config file overrides on a per-field basis and unknown
//! options are rejected. Credential values are either literal strings or
//! `["env", VAR]` / `["file", PATH]` pairs resolved at startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::{EvictionPolicy, Priority, WritebackMode};
use crate::error::{Error, Result};
use crate::name::{ImageFormat, TransformParams};

// =============================================================================
// Credentials
// =============================================================================

/// A configuration value that may be read from elsewhere at startup.
///
/// - a plain string is taken literally
/// - `["env", VAR]` reads the environment variable `VAR`
/// - `["file", PATH]` reads the first line of `PATH`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Credential {
    Literal(String),
    Indirect(String, String),
}

impl Default for Credential {
    fn default() -> Self {
        Credential::Literal(String::new())
    }
}

impl Credential {
    pub fn resolve(&self) -> Result<String> {
        match self {
            Credential::Literal(value) => Ok(value.clone()),
            Credential::Indirect(mechanism, source) => match mechanism.as_str() {
                "env" => std::env::var(source).map_err(|_| {
                    Error::Config(format!(
                        "credential environment variable {source} is not set"
                    ))
                }),
                "file" => {
                    let raw = std::fs::read_to_string(source).map_err(|err| {
                        Error::Config(format!("credential file {source} unreadable: {err}"))
                    })?;
                    Ok(raw.lines().next().unwrap_or_default().trim().to_owned())
                }
                other => Err(Error::Config(format!(
                    "unknown credential mechanism '{other}'"
                ))),
            },
        }
    }
}

/// Object-store access credentials. The in-tree backends ignore them; a
/// real object-store client consumes the resolved values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Credentials {
    pub username: Credential,
    pub password: Credential,
    pub authurl: Credential,
    pub tenant: Credential,
    pub tenant_id: Credential,
}

impl Credentials {
    /// Resolve every indirect value; fatal at startup if one is missing.
    pub fn resolve(&self) -> Result<ResolvedCredentials> {
        Ok(ResolvedCredentials {
            username: self.username.resolve()?,
            password: self.password.resolve()?,
            authurl: self.authurl.resolve()?,
            tenant: self.tenant.resolve()?,
            tenant_id: self.tenant_id.resolve()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedCredentials {
    pub username: String,
    pub password: String,
    pub authurl: String,
    pub tenant: String,
    pub tenant_id: String,
}

// =============================================================================
// Per-level sections
// =============================================================================

/// Bounds and policy for the in-memory level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryCacheConfig {
    /// Bytes; 0 = unlimited
    pub max_size: u64,
    /// 0 = unlimited
    pub max_elements: u64,
    pub evict_start_ratio: f64,
    pub evict_hysteresis: f64,
    /// Falls back to the global `alarm_threshold` when unset
    pub alarm_free_ratio: Option<f64>,
    pub priority: Priority,
    pub writeback: WritebackMode,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 512 * 1024 * 1024,
            max_elements: 64 * 1024,
            evict_start_ratio: 0.8,
            evict_hysteresis: 0.2,
            alarm_free_ratio: None,
            priority: Priority::Newest,
            writeback: WritebackMode::Eager,
        }
    }
}

/// Bounds, policy and location of the local filesystem level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalCacheConfig {
    pub cache_path: PathBuf,
    /// Wipe and recreate the storage area at boot
    pub initialise: bool,
    pub max_size: u64,
    pub max_elements: u64,
    pub evict_start_ratio: f64,
    pub evict_hysteresis: f64,
    pub alarm_free_ratio: Option<f64>,
    pub priority: Priority,
    pub writeback: WritebackMode,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from("/var/tmp/image-depot/cache"),
            initialise: false,
            max_size: 8 * 1024 * 1024 * 1024,
            max_elements: 256 * 1024,
            evict_start_ratio: 0.8,
            evict_hysteresis: 0.2,
            alarm_free_ratio: None,
            priority: Priority::Thumbnail,
            writeback: WritebackMode::Lazy,
        }
    }
}

/// One remote container: either the derivative cache or the originals
/// store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteContainerConfig {
    pub container: String,
    /// Public base URL used in pre-signed URLs
    pub server_url: String,
    /// Stream remote downloads through the local file cache
    pub use_file_cache: bool,
    /// Wipe the container at boot
    pub initialise_store: bool,
    pub credentials: Credentials,
    pub url_key: Credential,
    /// Seconds a pre-signed URL is advertised as valid
    pub url_lifetime: u64,
    /// Extra validity granted so repeated requests reuse one URL
    pub url_lifetime_slack: u64,
    pub url_method: String,
    pub max_size: u64,
    pub max_elements: u64,
    pub evict_start_ratio: f64,
    pub evict_hysteresis: f64,
    pub alarm_free_ratio: Option<f64>,
    pub priority: Priority,
    pub writeback: WritebackMode,
}

impl Default for RemoteContainerConfig {
    fn default() -> Self {
        Self {
            container: "image-depot-derivatives".into(),
            server_url: "http://127.0.0.1:8888".into(),
            use_file_cache: true,
            initialise_store: false,
            credentials: Credentials::default(),
            url_key: Credential::Literal("change-me".into()),
            url_lifetime: 3600 * 24 * 2,
            url_lifetime_slack: 3600 * 24,
            url_method: "GET".into(),
            max_size: 64 * 1024 * 1024 * 1024,
            max_elements: 1024 * 1024,
            evict_start_ratio: 0.8,
            evict_hysteresis: 0.2,
            alarm_free_ratio: None,
            priority: Priority::Newest,
            writeback: WritebackMode::Never,
        }
    }
}

impl RemoteContainerConfig {
    fn originals_default() -> Self {
        Self {
            container: "image-depot-originals".into(),
            // The authoritative store is an unbounded sink.
            max_size: 0,
            max_elements: 0,
            ..Self::default()
        }
    }
}

/// Which in-tree object backend serves the remote containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreBackendConfig {
    /// Process-local, for tests and development
    Memory,
    /// Objects as files under a root directory
    Filesystem { root: PathBuf },
}

impl Default for StoreBackendConfig {
    fn default() -> Self {
        StoreBackendConfig::Filesystem {
            root: PathBuf::from("/var/tmp/image-depot/store"),
        }
    }
}

// =============================================================================
// Top level
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Wipe every store and cache at boot
    pub create_new: bool,
    pub pid_file: Option<PathBuf>,

    /// Format applied when a request names no kind
    pub image_default_format: ImageFormat,

    pub thumbnail_default_format: ImageFormat,
    pub thumbnail_default_size: (u32, u32),
    pub thumbnail_equalise: bool,
    pub thumbnail_sharpen: bool,
    pub thumbnail_liquid_resize: bool,
    pub thumbnail_liquid_cutin_ratio: f64,

    /// Derivatives transit this intermediate format when enabled
    pub canonical_format: ImageFormat,
    pub canonical_format_used: bool,

    /// Global default for per-level `alarm_free_ratio`
    pub alarm_threshold: f64,

    /// Advisory global caps; logged at startup, never enforced per level
    pub max_size: u64,
    pub max_images: u64,

    pub store_backend: StoreBackendConfig,
    pub memory_cache_configuration: MemoryCacheConfig,
    pub local_cache_configuration: LocalCacheConfig,
    pub object_cache_configuration: RemoteContainerConfig,
    pub persistent_store_configuration: RemoteContainerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_new: false,
            pid_file: None,
            image_default_format: ImageFormat::Jpg,
            thumbnail_default_format: ImageFormat::Jpg,
            thumbnail_default_size: (50, 50),
            thumbnail_equalise: true,
            thumbnail_sharpen: true,
            thumbnail_liquid_resize: true,
            thumbnail_liquid_cutin_ratio: 5.0,
            canonical_format: ImageFormat::Miff,
            canonical_format_used: false,
            alarm_threshold: 0.1,
            max_size: 0,
            max_images: 0,
            store_backend: StoreBackendConfig::default(),
            memory_cache_configuration: MemoryCacheConfig::default(),
            local_cache_configuration: LocalCacheConfig::default(),
            object_cache_configuration: RemoteContainerConfig::default(),
            persistent_store_configuration: RemoteContainerConfig::originals_default(),
        }
    }
}

impl Config {
    /// Built-in defaults, overridden per field by the YAML file when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            None => Self::default(),
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|err| {
                    Error::Config(format!("cannot read config file {}: {err}", path.display()))
                })?;
                serde_yaml::from_str(&raw)?
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let ratio = |name: &str, value: f64| {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{name} must lie in [0, 1], got {value}"
                )));
            }
            Ok(())
        };

        ratio("alarm_threshold", self.alarm_threshold)?;
        for (section, start, hysteresis, alarm) in [
            (
                "memory_cache_configuration",
                self.memory_cache_configuration.evict_start_ratio,
                self.memory_cache_configuration.evict_hysteresis,
                self.memory_cache_configuration.alarm_free_ratio,
            ),
            (
                "local_cache_configuration",
                self.local_cache_configuration.evict_start_ratio,
                self.local_cache_configuration.evict_hysteresis,
                self.local_cache_configuration.alarm_free_ratio,
            ),
            (
                "object_cache_configuration",
                self.object_cache_configuration.evict_start_ratio,
                self.object_cache_configuration.evict_hysteresis,
                self.object_cache_configuration.alarm_free_ratio,
            ),
        ] {
            if !(0.0 < start && start <= 1.0) {
                return Err(Error::Config(format!(
                    "{section}.evict_start_ratio must lie in (0, 1], got {start}"
                )));
            }
            if !(0.0..=1.0).contains(&hysteresis) {
                return Err(Error::Config(format!(
                    "{section}.evict_hysteresis must lie in [0, 1], got {hysteresis}"
                )));
            }
            if let Some(alarm) = alarm {
                ratio(&format!("{section}.alarm_free_ratio"), alarm)?;
            }
        }

        if self.thumbnail_default_size.0 == 0 || self.thumbnail_default_size.1 == 0 {
            return Err(Error::Config("thumbnail_default_size must be positive".into()));
        }
        if self.thumbnail_liquid_cutin_ratio < 1.0 {
            return Err(Error::Config(format!(
                "thumbnail_liquid_cutin_ratio must be at least 1.0, got {}",
                self.thumbnail_liquid_cutin_ratio
            )));
        }
        for (section, config) in [
            ("object_cache_configuration", &self.object_cache_configuration),
            (
                "persistent_store_configuration",
                &self.persistent_store_configuration,
            ),
        ] {
            if config.container.is_empty() {
                return Err(Error::Config(format!("{section}.container must be set")));
            }
            if config.url_method.is_empty() {
                return Err(Error::Config(format!("{section}.url_method must be set")));
            }
            if config.url_lifetime == 0 {
                return Err(Error::Config(format!(
                    "{section}.url_lifetime must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn memory_policy(&self) -> EvictionPolicy {
        let c = &self.memory_cache_configuration;
        EvictionPolicy::new(
            c.max_size,
            c.max_elements,
            c.evict_start_ratio,
            c.evict_hysteresis,
            c.alarm_free_ratio.unwrap_or(self.alarm_threshold),
            c.priority,
        )
    }

    pub fn file_policy(&self) -> EvictionPolicy {
        let c = &self.local_cache_configuration;
        EvictionPolicy::new(
            c.max_size,
            c.max_elements,
            c.evict_start_ratio,
            c.evict_hysteresis,
            c.alarm_free_ratio.unwrap_or(self.alarm_threshold),
            c.priority,
        )
    }

    pub fn object_cache_policy(&self) -> EvictionPolicy {
        let c = &self.object_cache_configuration;
        EvictionPolicy::new(
            c.max_size,
            c.max_elements,
            c.evict_start_ratio,
            c.evict_hysteresis,
            c.alarm_free_ratio.unwrap_or(self.alarm_threshold),
            c.priority,
        )
    }

    /// Thumbnail parameters for a request, with per-request overrides on
    /// top of the configured defaults.
    pub fn thumbnail_params(
        &self,
        xsize: Option<u32>,
        ysize: Option<u32>,
        kind: Option<ImageFormat>,
    ) -> TransformParams {
        let (default_x, default_y) = self.thumbnail_default_size;
        let x = xsize.or(ysize).unwrap_or(default_x);
        let y = ysize.or(xsize).unwrap_or(default_y);
        TransformParams {
            max_width: Some(x),
            max_height: Some(y),
            format: kind.unwrap_or(self.thumbnail_default_format),
            thumbnail: true,
            equalise: self.thumbnail_equalise,
            sharpen: self.thumbnail_sharpen,
            liquid_rescale: self.thumbnail_liquid_resize,
            liquid_cutin_ratio: self.thumbnail_liquid_cutin_ratio,
            strip_metadata: true,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_overrides_per_field() {
        let yaml = r#"
image_default_format: png
memory_cache_configuration:
  max_size: 1000
  priority: thumbnail
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.image_default_format, ImageFormat::Png);
        assert_eq!(config.memory_cache_configuration.max_size, 1000);
        assert_eq!(
            config.memory_cache_configuration.priority,
            Priority::Thumbnail
        );
        // Untouched fields keep their defaults.
        assert_eq!(config.memory_cache_configuration.evict_start_ratio, 0.8);
        assert_eq!(config.thumbnail_default_size, (50, 50));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let yaml = "no_such_option: true\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_bad_ratio_rejected() {
        let mut config = Config::default();
        config.memory_cache_configuration.evict_start_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credential_literal_and_env() {
        let literal = Credential::Literal("secret".into());
        assert_eq!(literal.resolve().unwrap(), "secret");

        std::env::set_var("IMAGE_DEPOT_TEST_CRED", "from-env");
        let indirect = Credential::Indirect("env".into(), "IMAGE_DEPOT_TEST_CRED".into());
        assert_eq!(indirect.resolve().unwrap(), "from-env");

        let missing = Credential::Indirect("env".into(), "IMAGE_DEPOT_NO_SUCH_VAR".into());
        assert!(missing.resolve().is_err());

        let unknown = Credential::Indirect("carrier-pigeon".into(), "x".into());
        assert!(unknown.resolve().is_err());
    }

    #[test]
    fn test_credential_yaml_forms() {
        #[derive(Deserialize)]
        struct Holder {
            value: Credential,
        }
        let literal: Holder = serde_yaml::from_str("value: hunter2").unwrap();
        assert_eq!(literal.value, Credential::Literal("hunter2".into()));

        let pair: Holder = serde_yaml::from_str("value: [env, OS_USERNAME]").unwrap();
        assert_eq!(
            pair.value,
            Credential::Indirect("env".into(), "OS_USERNAME".into())
        );
    }

    #[test]
    fn test_thumbnail_params_defaults_and_overrides() {
        let config = Config::default();
        let params = config.thumbnail_params(None, None, None);
        assert_eq!(params.max_width, Some(50));
        assert_eq!(params.max_height, Some(50));
        assert!(params.thumbnail && params.equalise && params.sharpen);

        // A single axis squares up, original behaviour.
        let params = config.thumbnail_params(Some(80), None, Some(ImageFormat::Png));
        assert_eq!(params.max_width, Some(80));
        assert_eq!(params.max_height, Some(80));
        assert_eq!(params.format, ImageFormat::Png);
    }

    #[test]
    fn test_store_backend_yaml() {
        let yaml = r#"
store_backend:
  kind: filesystem
  root: /srv/depot
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        match config.store_backend {
            StoreBackendConfig::Filesystem { root } => {
                assert_eq!(root, PathBuf::from("/srv/depot"))
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn test_yaml_dump_roundtrips() {
        let config = Config::default();
        let dumped = config.to_yaml().unwrap();
        let reparsed: Config = serde_yaml::from_str(&dumped).unwrap();
        reparsed.validate().unwrap();
        assert_eq!(reparsed.image_default_format, config.image_default_format);
    }
}

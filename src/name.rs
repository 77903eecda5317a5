//! Image naming and canonical derivative keys
//!
//! An identity names an original image; a derivative key names the artifact
//! produced by applying one set of transform parameters to that original.
//! Keys are canonical and injective: two requests that would yield the same
//! pixels share a key, and any parameter difference yields a distinct key.
//! The key string is the lookup key at every cache level and the object name
//! in the remote containers.
//!
//! Encoding: `<identity>` for the original, otherwise
//! `<identity>#<sorted k=v list>.<format>` with fixed canonical spellings
//! and default-valued parameters omitted.

use std::fmt;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Default aspect-ratio cut-in beyond which thumbnailing switches to
/// distortion-aware resizing.
pub const DEFAULT_LIQUID_CUTIN_RATIO: f64 = 5.0;

/// Lowercase hex SHA-256 of arbitrary bytes, used for blob paths and
/// pre-signed URL signatures.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

// =============================================================================
// ImageIdentity
// =============================================================================

/// Normalised path-like name of an original image.
///
/// Extensions are not part of identity. Equality is byte-equality after
/// normalisation: repeated slashes collapse, leading and trailing slashes
/// are stripped.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageIdentity(String);

impl ImageIdentity {
    /// Parse and normalise a raw identity string.
    ///
    /// Extensions are not part of identity: a recognised image-format
    /// suffix on the final segment is dropped, so an upload of `a/b.jpg`
    /// and a request for `a/b` name the same image. `#` is rejected: it is
    /// reserved as the key separator, which keeps the derivative key
    /// encoding injective. `.` and `..` segments are rejected so an
    /// identity can never escape a store root.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.contains('#') {
            return Err(Error::InvalidName(format!(
                "identity may not contain '#': {raw}"
            )));
        }
        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" => continue,
                "." | ".." => {
                    return Err(Error::InvalidName(format!(
                        "identity may not contain relative segments: {raw}"
                    )))
                }
                s => segments.push(s),
            }
        }
        if segments.is_empty() {
            return Err(Error::InvalidName("empty identity".into()));
        }

        if let Some(last) = segments.last_mut() {
            if let Some((stem, extension)) = last.rsplit_once('.') {
                if !stem.is_empty() && ImageFormat::parse(extension).is_ok() {
                    *last = stem;
                }
            }
        }
        Ok(Self(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity component of an encoded key string.
pub fn identity_of_key(key: &str) -> &str {
    key.split_once('#').map_or(key, |(identity, _)| identity)
}

// =============================================================================
// ImageFormat
// =============================================================================

/// Output format of a served artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[serde(alias = "jpeg")]
    Jpg,
    Png,
    #[serde(alias = "tiff")]
    Tif,
    Bmp,
    Webp,
    /// Canonical intermediate format
    Miff,
}

impl ImageFormat {
    /// Canonical spelling used in keys, file names and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Jpg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Tif => "tif",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Webp => "webp",
            ImageFormat::Miff => "miff",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            ImageFormat::Jpg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Tif => "image/tiff",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Miff => "image/x-miff",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(ImageFormat::Jpg),
            "png" => Ok(ImageFormat::Png),
            "tif" | "tiff" => Ok(ImageFormat::Tif),
            "bmp" => Ok(ImageFormat::Bmp),
            "webp" => Ok(ImageFormat::Webp),
            "miff" => Ok(ImageFormat::Miff),
            other => Err(Error::InvalidParameter(format!(
                "{other} is not a supported image format"
            ))),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// TransformParams
// =============================================================================

/// Value record describing one derivation of an original.
///
/// The distinguished "no transform" request is represented by the absence of
/// params (see [`DerivativeKey::original`]), not by a member of this type.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformParams {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub format: ImageFormat,
    pub thumbnail: bool,
    pub equalise: bool,
    pub sharpen: bool,
    pub liquid_rescale: bool,
    pub liquid_cutin_ratio: f64,
    pub strip_metadata: bool,
}

impl TransformParams {
    /// Bare format conversion, no geometry change.
    pub fn convert(format: ImageFormat) -> Self {
        Self {
            max_width: None,
            max_height: None,
            format,
            thumbnail: false,
            equalise: false,
            sharpen: false,
            liquid_rescale: false,
            liquid_cutin_ratio: DEFAULT_LIQUID_CUTIN_RATIO,
            strip_metadata: true,
        }
    }

    /// Bounding-box resize.
    pub fn resize(max_width: u32, max_height: u32, format: ImageFormat) -> Self {
        Self {
            max_width: Some(max_width),
            max_height: Some(max_height),
            ..Self::convert(format)
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("max_width", self.max_width), ("max_height", self.max_height)] {
            if let Some(v) = value {
                if v == 0 || v >= 10_000 {
                    return Err(Error::InvalidParameter(format!(
                        "image {name} {v} is unreasonable"
                    )));
                }
            }
        }
        if self.liquid_rescale && self.liquid_cutin_ratio < 1.0 {
            return Err(Error::InvalidParameter(format!(
                "liquid cut-in ratio {} must be at least 1.0",
                self.liquid_cutin_ratio
            )));
        }
        Ok(())
    }

    /// Sorted `k=v` list with defaults omitted. The spelling here is load
    /// bearing: it is the canonical key encoding.
    fn encode_kv(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.equalise {
            parts.push("equalise=true".into());
        }
        if self.liquid_rescale {
            parts.push(format!("liquid={}", self.liquid_cutin_ratio));
        }
        if let Some(h) = self.max_height {
            parts.push(format!("max_height={h}"));
        }
        if let Some(w) = self.max_width {
            parts.push(format!("max_width={w}"));
        }
        if self.sharpen {
            parts.push("sharpen=true".into());
        }
        if !self.strip_metadata {
            parts.push("strip=false".into());
        }
        if self.thumbnail {
            parts.push("thumbnail=true".into());
        }
        parts.join(",")
    }

    fn decode_kv(kvs: &str, format: ImageFormat, source: &str) -> Result<Self> {
        let mut params = Self::convert(format);
        if kvs.is_empty() {
            return Ok(params);
        }
        for pair in kvs.split(',') {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidName(format!("malformed parameter '{pair}' in key {source}"))
            })?;
            let bad = || Error::InvalidName(format!("bad value '{value}' for {key} in {source}"));
            match key {
                "equalise" => params.equalise = value.parse().map_err(|_| bad())?,
                "liquid" => {
                    params.liquid_rescale = true;
                    params.liquid_cutin_ratio = value.parse().map_err(|_| bad())?;
                }
                "max_height" => params.max_height = Some(value.parse().map_err(|_| bad())?),
                "max_width" => params.max_width = Some(value.parse().map_err(|_| bad())?),
                "sharpen" => params.sharpen = value.parse().map_err(|_| bad())?,
                "strip" => params.strip_metadata = value.parse().map_err(|_| bad())?,
                "thumbnail" => params.thumbnail = value.parse().map_err(|_| bad())?,
                other => {
                    return Err(Error::InvalidName(format!(
                        "unknown parameter '{other}' in key {source}"
                    )))
                }
            }
        }
        Ok(params)
    }
}

// =============================================================================
// DerivativeKey
// =============================================================================

/// Canonical, deterministic cache key for `(identity, params)`.
#[derive(Clone, Debug)]
pub struct DerivativeKey {
    identity: ImageIdentity,
    params: Option<TransformParams>,
    encoded: String,
}

impl DerivativeKey {
    /// Key of the byte-exact original: the identity itself.
    pub fn original(identity: ImageIdentity) -> Self {
        let encoded = identity.as_str().to_owned();
        Self {
            identity,
            params: None,
            encoded,
        }
    }

    /// Key of a derived artifact.
    pub fn derived(identity: ImageIdentity, params: TransformParams) -> Self {
        let encoded = format!(
            "{}#{}.{}",
            identity.as_str(),
            params.encode_kv(),
            params.format.as_str()
        );
        Self {
            identity,
            params: Some(params),
            encoded,
        }
    }

    /// Reconstruct a key from its encoded string, as found in the file-cache
    /// sidecar index or a remote container listing.
    pub fn parse(encoded: &str) -> Result<Self> {
        match encoded.split_once('#') {
            None => Ok(Self::original(ImageIdentity::parse(encoded)?)),
            Some((identity, rest)) => {
                let identity = ImageIdentity::parse(identity)?;
                let (kvs, format) = rest.rsplit_once('.').ok_or_else(|| {
                    Error::InvalidName(format!("derivative key missing format suffix: {encoded}"))
                })?;
                let format = ImageFormat::parse(format)
                    .map_err(|_| Error::InvalidName(format!("unknown format in key {encoded}")))?;
                let params = TransformParams::decode_kv(kvs, format, encoded)?;
                Ok(Self::derived(identity, params))
            }
        }
    }

    pub fn identity(&self) -> &ImageIdentity {
        &self.identity
    }

    pub fn params(&self) -> Option<&TransformParams> {
        self.params.as_ref()
    }

    pub fn is_original(&self) -> bool {
        self.params.is_none()
    }

    pub fn is_thumbnail(&self) -> bool {
        self.params.as_ref().map_or(false, |p| p.thumbnail)
    }

    /// Served content type; originals are sniffed by the pipeline, so only
    /// derived keys carry one.
    pub fn content_type(&self) -> Option<&'static str> {
        self.params.as_ref().map(|p| p.format.mime())
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Stable content-address used for the file-cache blob path.
    pub fn blob_hash(&self) -> String {
        sha256_hex(self.encoded.as_bytes())
    }
}

impl fmt::Display for DerivativeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl PartialEq for DerivativeKey {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for DerivativeKey {}

impl Hash for DerivativeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encoded.hash(state);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_normalisation() {
        let a = ImageIdentity::parse("a//b/c/").unwrap();
        let b = ImageIdentity::parse("/a/b/c").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "a/b/c");
    }

    #[test]
    fn test_identity_drops_format_extension() {
        assert_eq!(
            ImageIdentity::parse("a/b.jpg").unwrap(),
            ImageIdentity::parse("a/b").unwrap()
        );
        assert_eq!(ImageIdentity::parse("a/b.jpeg").unwrap().as_str(), "a/b");
        // Unknown suffixes are part of the name.
        assert_eq!(
            ImageIdentity::parse("backup.2021/b.dat").unwrap().as_str(),
            "backup.2021/b.dat"
        );
        // A bare dotfile-style segment survives.
        assert_eq!(ImageIdentity::parse(".jpg/x").unwrap().as_str(), ".jpg/x");
    }

    #[test]
    fn test_identity_rejects_bad_names() {
        assert!(ImageIdentity::parse("").is_err());
        assert!(ImageIdentity::parse("///").is_err());
        assert!(ImageIdentity::parse("a/../b").is_err());
        assert!(ImageIdentity::parse("a#b").is_err());
    }

    #[test]
    fn test_original_key_is_identity() {
        let id = ImageIdentity::parse("a/b").unwrap();
        let key = DerivativeKey::original(id.clone());
        assert_eq!(key.as_str(), "a/b");
        assert!(key.is_original());
        assert!(!key.is_thumbnail());
        assert_eq!(key.identity(), &id);
    }

    #[test]
    fn test_derived_key_encoding_is_sorted_and_stable() {
        let id = ImageIdentity::parse("a/b").unwrap();
        let mut params = TransformParams::resize(200, 100, ImageFormat::Png);
        params.sharpen = true;
        params.equalise = true;
        let key = DerivativeKey::derived(id, params);
        assert_eq!(
            key.as_str(),
            "a/b#equalise=true,max_height=100,max_width=200,sharpen=true.png"
        );
    }

    #[test]
    fn test_convert_only_key() {
        let id = ImageIdentity::parse("x").unwrap();
        let key = DerivativeKey::derived(id, TransformParams::convert(ImageFormat::Jpg));
        assert_eq!(key.as_str(), "x#.jpg");
        assert_eq!(key.content_type(), Some("image/jpeg"));
    }

    #[test]
    fn test_distinct_params_distinct_keys() {
        let id = ImageIdentity::parse("a").unwrap();
        let k1 = DerivativeKey::derived(id.clone(), TransformParams::resize(50, 50, ImageFormat::Jpg));
        let k2 = DerivativeKey::derived(id.clone(), TransformParams::resize(50, 51, ImageFormat::Jpg));
        let k3 = DerivativeKey::derived(id, TransformParams::resize(50, 50, ImageFormat::Png));
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
        assert_ne!(k2, k3);
    }

    #[test]
    fn test_key_parse_roundtrip() {
        let id = ImageIdentity::parse("gallery/shot-1").unwrap();
        let mut params = TransformParams::resize(50, 50, ImageFormat::Jpg);
        params.thumbnail = true;
        params.equalise = true;
        params.sharpen = true;
        params.liquid_rescale = true;
        let key = DerivativeKey::derived(id.clone(), params);

        let parsed = DerivativeKey::parse(key.as_str()).unwrap();
        assert_eq!(parsed, key);
        assert!(parsed.is_thumbnail());
        assert_eq!(parsed.identity(), &id);

        let original = DerivativeKey::parse("gallery/shot-1").unwrap();
        assert!(original.is_original());
    }

    #[test]
    fn test_key_parse_rejects_garbage() {
        assert!(DerivativeKey::parse("a#nosuffix").is_err());
        assert!(DerivativeKey::parse("a#bogus=1.jpg").is_err());
        assert!(DerivativeKey::parse("a#max_width=x.jpg").is_err());
    }

    #[test]
    fn test_identity_of_key() {
        assert_eq!(identity_of_key("a/b#thumbnail=true.jpg"), "a/b");
        assert_eq!(identity_of_key("a/b"), "a/b");
    }

    #[test]
    fn test_params_validation() {
        assert!(TransformParams::resize(0, 10, ImageFormat::Jpg).validate().is_err());
        assert!(TransformParams::resize(10, 20_000, ImageFormat::Jpg)
            .validate()
            .is_err());
        assert!(TransformParams::resize(10, 10, ImageFormat::Jpg).validate().is_ok());
    }

    #[test]
    fn test_format_aliases() {
        assert_eq!(ImageFormat::parse("JPEG").unwrap(), ImageFormat::Jpg);
        assert_eq!(ImageFormat::parse("tiff").unwrap(), ImageFormat::Tif);
        assert!(ImageFormat::parse("exe").is_err());
    }

    #[test]
    fn test_blob_hash_is_hex() {
        let key = DerivativeKey::parse("a/b").unwrap();
        let hash = key.blob_hash();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

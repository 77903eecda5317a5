//! Image pipeline seam
//!
//! The codec, resize and enhancement primitives are an external capability;
//! the service only depends on this trait. Implementations must be
//! deterministic: fixed input bytes and fixed parameters always yield the
//! same output bytes, which is what makes derivative keys cacheable at
//! every level.
//!
//! [`PassthroughTransform`] wires the service up without a codec stack; a
//! real pipeline (ImageMagick bindings or similar) implements the same two
//! methods.

use bytes::Bytes;
use serde_json::json;

use crate::error::TransformError;
use crate::name::TransformParams;

/// Pure image pipeline: `(bytes, params) → bytes`.
///
/// The contract the coordinator relies on:
/// - deterministic for fixed input and params
/// - strips embedded metadata when `params.strip_metadata` is set
/// - honours `params.thumbnail` with the configured enhancements
/// - applies distortion-aware resizing only when `params.liquid_rescale`
///   is set and the source/target aspect ratios differ by more than
///   `params.liquid_cutin_ratio`
///
/// Calls may be CPU-heavy; the coordinator runs them on the blocking pool.
pub trait Transform: Send + Sync {
    fn apply(&self, src: &Bytes, params: &TransformParams)
        -> std::result::Result<Bytes, TransformError>;

    /// Structured subset of the embedded metadata. Reads the original; the
    /// caller decides what, if anything, gets cached.
    fn metadata(&self, src: &Bytes) -> std::result::Result<serde_json::Value, TransformError>;
}

/// Sniff an image container format from its magic bytes.
pub fn sniff_format(src: &[u8]) -> Option<&'static str> {
    if src.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpg")
    } else if src.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("png")
    } else if src.starts_with(b"II*\0") || src.starts_with(b"MM\0*") {
        Some("tif")
    } else if src.starts_with(b"BM") {
        Some("bmp")
    } else if src.len() >= 12 && &src[0..4] == b"RIFF" && &src[8..12] == b"WEBP" {
        Some("webp")
    } else if src.starts_with(b"id=ImageMagick") {
        Some("miff")
    } else {
        None
    }
}

/// Identity pipeline: serves bytes untouched.
///
/// Keeps the cache, coordination and URL machinery fully exercisable in
/// deployments and tests that do not link a codec stack. Derivative keys
/// remain distinct per parameter set, so caching behaves exactly as it
/// would with a real pipeline.
#[derive(Default)]
pub struct PassthroughTransform;

impl PassthroughTransform {
    pub fn new() -> Self {
        Self
    }
}

impl Transform for PassthroughTransform {
    fn apply(
        &self,
        src: &Bytes,
        _params: &TransformParams,
    ) -> std::result::Result<Bytes, TransformError> {
        if src.is_empty() {
            return Err(TransformError::Corrupt("empty image".into()));
        }
        Ok(src.clone())
    }

    fn metadata(&self, src: &Bytes) -> std::result::Result<serde_json::Value, TransformError> {
        if src.is_empty() {
            return Err(TransformError::Corrupt("empty image".into()));
        }
        Ok(json!({
            "bytes": src.len(),
            "format": sniff_format(src),
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Error types for the image depot

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving or deriving images.
///
/// The enum is `Clone` so a single derivation outcome can be fanned out to
/// every waiter collapsed onto the same in-flight request; I/O and
/// serialization sources are therefore captured as strings rather than held
/// as source errors.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Identity absent from the originals container
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed image identity or derivative key
    #[error("invalid image name: {0}")]
    InvalidName(String),

    /// Malformed request parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Remote backend unreachable (transient, retried with backoff)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Remote store answered with a non-404 failure
    #[error("store error ({status}): {message}")]
    Store { status: u16, message: String },

    /// Image pipeline failure
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    /// Fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Entry too large for every bounded level
    #[error("entry of {size} bytes exceeds the capacity of every bounded cache level")]
    Capacity { size: u64 },

    /// Deadline exceeded
    #[error("deadline exceeded")]
    Timeout,

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures surfaced by the image pipeline
#[derive(Error, Debug, Clone)]
pub enum TransformError {
    /// Source format is not one the pipeline can decode
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// Source bytes do not decode
    #[error("corrupt image data: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("JSON encoding: {err}"))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(format!("YAML parse: {err}"))
    }
}

impl Error {
    /// Whether a retry against the same backend may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    /// HTTP status code covering the nature of the error
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::InvalidName(_) | Error::InvalidParameter(_) => 400,
            Error::Unavailable(_) => 503,
            Error::Store { .. } => 502,
            Error::Transform(_) => 415,
            Error::Config(_) => 500,
            Error::Capacity { .. } => 507,
            Error::Timeout => 504,
            Error::Io(_) | Error::Internal(_) => 500,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

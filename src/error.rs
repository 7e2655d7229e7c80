// THEORY:
// Every failure in the engine falls into one of four families: a bad request
// (configuration), a filter name nobody knows, an on-disk cache that contradicts
// itself, or an external collaborator (noise sampler, video encoder) that gave up.
// None of them are retried. They bubble up to the top-level operation, which
// aborts and leaves the cache as it was at the moment of failure.

use std::path::PathBuf;

use thiserror::Error;

/// Problems with the request itself, always detected before any work starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid demean mode `{0}` (expected one of: both, time, space, none)")]
    InvalidDemeanMode(String),
    #[error("x_size / y_size * 100 must be an integer (got {x_size}x{y_size})")]
    AspectRatio { x_size: usize, y_size: usize },
    #[error("wrong orientation: width {x_size} is smaller than height {y_size}")]
    Orientation { x_size: usize, y_size: usize },
    #[error("volume dimensions must be non-zero")]
    ZeroDimension,
    #[error("seed {0} is outside 0..=255")]
    SeedOutOfRange(u32),
    #[error("octave count must be at least 1")]
    ZeroOctaves,
    #[error("temporal scale must be at least 1")]
    ZeroTemporalScale,
    #[error("fps must be at least 1")]
    ZeroFps,
    #[error("loop count must be at least 1")]
    ZeroLoop,
    #[error("output file {0} already exists")]
    OutputExists(PathBuf),
    #[error("filter `{filter}` expects {expected} argument(s), got {got}")]
    FilterArguments {
        filter: String,
        expected: usize,
        got: usize,
    },
    #[error("malformed filter specification `{0}`")]
    MalformedFilter(String),
}

#[derive(Debug, Error)]
pub enum StimulusError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
    #[error("unknown filter `{0}`")]
    UnknownFilter(String),
    #[error("cache inconsistency for {key}: {detail}")]
    CacheInconsistency { key: String, detail: String },
    #[error("{tool} failed: {detail}")]
    ExternalTool { tool: String, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StimulusError {
    pub(crate) fn sampler(detail: impl Into<String>) -> Self {
        StimulusError::ExternalTool {
            tool: "noise sampler".to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn inconsistent(key: impl ToString, detail: impl Into<String>) -> Self {
        StimulusError::CacheInconsistency {
            key: key.to_string(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StimulusError>;

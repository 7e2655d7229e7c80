// THEORY:
// A `VolumeSpec` is the complete, validated description of one noise volume. It is
// the only thing the cache key is derived from, so every parameter that changes the
// generated samples must live here, and nothing else may.
//
// Key architectural principles:
// 1.  **Validate eagerly**: `VolumeSpec::new` is the single gate for configuration
//     errors (aspect ratio, orientation, ranges). Once a spec exists it is valid.
// 2.  **Immutable**: fields are private and only exposed through getters. A spec is
//     built once per stimulus request and owned by one engine.
// 3.  **Padding is part of the spec**: the time axis is padded up to a multiple of the
//     temporal scale before the spec is sealed, so two requests that pad to the same
//     length share one cache entry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Base of the spatial repeat period along y. The x period is the aspect ratio times this.
pub const XY_SCALE_BASE: usize = 100;

/// Default per-batch sample budget (`x_size * y_size * batch_length` stays below it).
pub const DEFAULT_BATCH_BUDGET: usize = 400_000_000;

/// Axes along which the volume is forced to zero mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemeanMode {
    /// Leave the sampler output untouched.
    None,
    /// Remove each frame's spatial mean, so mean luminance is flat over time.
    Time,
    /// Remove each pixel's mean over the whole duration (needs a second sweep).
    Space,
    /// `Time` during generation followed by the `Space` sweep.
    Both,
}

impl DemeanMode {
    pub fn removes_time(self) -> bool {
        matches!(self, DemeanMode::Time | DemeanMode::Both)
    }

    pub fn removes_space(self) -> bool {
        matches!(self, DemeanMode::Space | DemeanMode::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DemeanMode::None => "none",
            DemeanMode::Time => "time",
            DemeanMode::Space => "space",
            DemeanMode::Both => "both",
        }
    }
}

impl fmt::Display for DemeanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DemeanMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(DemeanMode::None),
            "time" => Ok(DemeanMode::Time),
            "space" => Ok(DemeanMode::Space),
            "both" => Ok(DemeanMode::Both),
            other => Err(ConfigError::InvalidDemeanMode(other.to_string())),
        }
    }
}

/// The raw request for a noise volume, before validation and padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Width of each frame in pixels.
    pub x_size: usize,
    /// Height of each frame in pixels.
    pub y_size: usize,
    /// Requested number of frames. Padded up to a multiple of `temporal_scale`.
    pub t_size: usize,
    pub fps: u32,
    /// Offset into the permutation lattice, `0..=255`.
    pub seed: u32,
    /// Relative strength of successive octaves (the sampler's persistence).
    pub spatial_scale: f64,
    /// Frames per temporal lattice unit. Larger is slower.
    pub temporal_scale: usize,
    pub octave_count: u32,
    /// Stretch of the x axis. Larger is a bigger spatial scale.
    pub x_scale: f64,
    /// Stretch of the y axis. Larger is a bigger spatial scale.
    pub y_scale: f64,
    pub demean: DemeanMode,
    /// Upper bound on `x_size * y_size * batch_length`. Not part of the cache key.
    pub batch_budget: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            x_size: 640,
            y_size: 320,
            t_size: 30 * 60,
            fps: 30,
            seed: 0,
            spatial_scale: 0.2,
            temporal_scale: 50,
            octave_count: 10,
            x_scale: 1.0,
            y_scale: 1.0,
            demean: DemeanMode::Both,
            batch_budget: DEFAULT_BATCH_BUDGET,
        }
    }
}

/// Converts a duration to a frame count the way a stimulus request does: `floor(seconds * fps)`.
pub fn frames_for_duration(duration_secs: f64, fps: u32) -> usize {
    (duration_secs * fps as f64).max(0.0) as usize
}

/// Number of frames that must be appended so `t_size` is a multiple of `temporal_scale`.
pub fn temporal_padding(t_size: usize, temporal_scale: usize) -> usize {
    (temporal_scale - t_size % temporal_scale) % temporal_scale
}

/// A validated, immutable description of one noise volume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeSpec {
    x_size: usize,
    y_size: usize,
    t_size: usize,
    fps: u32,
    seed: u32,
    spatial_scale: f64,
    temporal_scale: usize,
    octave_count: u32,
    x_scale: f64,
    y_scale: f64,
    demean: DemeanMode,
    #[serde(skip)]
    batch_budget: usize,
}

impl VolumeSpec {
    pub fn new(config: &VolumeConfig) -> Result<Self, ConfigError> {
        if config.x_size == 0 || config.y_size == 0 || config.t_size == 0 {
            return Err(ConfigError::ZeroDimension);
        }
        if (config.x_size * XY_SCALE_BASE) % config.y_size != 0 {
            return Err(ConfigError::AspectRatio {
                x_size: config.x_size,
                y_size: config.y_size,
            });
        }
        if config.x_size < config.y_size {
            return Err(ConfigError::Orientation {
                x_size: config.x_size,
                y_size: config.y_size,
            });
        }
        if config.seed > 255 {
            return Err(ConfigError::SeedOutOfRange(config.seed));
        }
        if config.octave_count == 0 {
            return Err(ConfigError::ZeroOctaves);
        }
        if config.temporal_scale == 0 {
            return Err(ConfigError::ZeroTemporalScale);
        }
        if config.fps == 0 {
            return Err(ConfigError::ZeroFps);
        }

        let extra = temporal_padding(config.t_size, config.temporal_scale);
        if extra > 0 {
            warn!(
                "Adding {} extra timepoints to make the duration a multiple of the temporal scale {}",
                extra, config.temporal_scale
            );
        }

        Ok(Self {
            x_size: config.x_size,
            y_size: config.y_size,
            t_size: config.t_size + extra,
            fps: config.fps,
            seed: config.seed,
            spatial_scale: config.spatial_scale,
            temporal_scale: config.temporal_scale,
            octave_count: config.octave_count,
            x_scale: config.x_scale,
            y_scale: config.y_scale,
            demean: config.demean,
            batch_budget: config.batch_budget.max(1),
        })
    }

    pub fn x_size(&self) -> usize {
        self.x_size
    }

    pub fn y_size(&self) -> usize {
        self.y_size
    }

    /// Padded number of frames.
    pub fn t_size(&self) -> usize {
        self.t_size
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn spatial_scale(&self) -> f64 {
        self.spatial_scale
    }

    pub fn temporal_scale(&self) -> usize {
        self.temporal_scale
    }

    pub fn octave_count(&self) -> u32 {
        self.octave_count
    }

    pub fn x_scale(&self) -> f64 {
        self.x_scale
    }

    pub fn y_scale(&self) -> f64 {
        self.y_scale
    }

    pub fn demean(&self) -> DemeanMode {
        self.demean
    }

    pub fn batch_budget(&self) -> usize {
        self.batch_budget
    }

    /// `x_size / y_size * 100`, guaranteed integral by construction.
    pub fn aspect_ratio(&self) -> usize {
        self.x_size * XY_SCALE_BASE / self.y_size
    }

    /// Number of temporal lattice units spanned by the volume.
    pub fn temporal_units(&self) -> usize {
        self.t_size / self.temporal_scale
    }
}

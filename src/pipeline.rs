// THEORY:
// The `pipeline` module is the top-level API of the stimulus engine. A `Stimulus`
// bundles one validated volume with its sampler and cache, generates (or reloads)
// the normalized batches on demand, and renders them to video files.
// Its purpose is to give callers the whole flow in three calls: build from a
// `StimulusConfig`, `generate`, `save_video`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core_modules::batch_cache::{CacheKey, CacheStore, DiskCache};
use crate::core_modules::encoder::VideoEncoder;
use crate::core_modules::engine::StimulusEngine;
use crate::core_modules::frame_batch::FrameBatch;
use crate::core_modules::sampler::{NoiseSampler, PerlinSampler};
use crate::core_modules::video_assembler::{self, with_mp4_extension, VideoAssembler};
use crate::error::{ConfigError, Result};

// Re-export key data structures for the public API.
pub use crate::core_modules::batch_cache::Statistics;
pub use crate::core_modules::encoder::{EncodeJob, FfmpegEncoder};
pub use crate::core_modules::filters::{Filter, FilterPipeline};
pub use crate::core_modules::video_assembler::AssemblyConfig;
pub use crate::core_modules::volume_spec::{DemeanMode, VolumeConfig, VolumeSpec};

const DEFAULT_CACHE_DIR: &str = "perlcache";

/// Everything needed to build a `Stimulus`, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusConfig {
    pub volume: VolumeConfig,
    /// Directory holding the batch and statistics files. Shared between runs.
    pub cache_dir: PathBuf,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            volume: VolumeConfig::default(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

impl StimulusConfig {
    /// Reads a JSON config. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// The main, top-level struct: one noise volume, its sampler and its cache.
pub struct Stimulus<S = PerlinSampler, C = DiskCache> {
    engine: StimulusEngine<S, C>,
}

impl Stimulus {
    /// Validates the volume and opens the on-disk cache. Nothing is generated yet.
    pub fn new(config: &StimulusConfig) -> Result<Self> {
        let spec = VolumeSpec::new(&config.volume)?;
        let cache = DiskCache::new(&config.cache_dir)?;
        Ok(Self::with_parts(spec, PerlinSampler, cache))
    }
}

impl<S: NoiseSampler, C: CacheStore> Stimulus<S, C> {
    pub fn with_parts(spec: VolumeSpec, sampler: S, cache: C) -> Self {
        Self {
            engine: StimulusEngine::new(spec, sampler, cache),
        }
    }

    pub fn spec(&self) -> &VolumeSpec {
        self.engine.spec()
    }

    pub fn key(&self) -> &CacheKey {
        self.engine.key()
    }

    pub fn cache(&self) -> &C {
        self.engine.cache()
    }

    /// Generates the volume, or loads its statistics when it is already cached.
    pub fn generate(&mut self) -> Result<Statistics> {
        self.engine.generate_batches()
    }

    /// A single unscaled frame at time `t`, bypassing the cache.
    pub fn generate_frame(&self, t: usize, filters: &FilterPipeline) -> Result<FrameBatch> {
        self.engine.generate_frame(t, filters)
    }

    /// Generates if needed, then renders the filtered volume to `output`.
    pub async fn save_video<E: VideoEncoder + Sync>(
        &mut self,
        output: &Path,
        config: &AssemblyConfig,
        encoder: &E,
    ) -> Result<PathBuf> {
        // Checked here too so an existing output never costs a generation run.
        let target = with_mp4_extension(output);
        if target.exists() {
            return Err(ConfigError::OutputExists(target).into());
        }
        let stats = self.generate()?;
        VideoAssembler::new(self.engine.cache(), self.engine.key(), self.engine.spec(), stats, encoder)
            .save_video(output, config)
            .await
    }

    /// A uniform grey video of this volume's size and frame rate.
    pub async fn save_grey_pad<E: VideoEncoder>(
        &self,
        output: &Path,
        duration_secs: f64,
        bitrate_mbps: u32,
        encoder: &E,
    ) -> Result<PathBuf> {
        video_assembler::save_grey_pad(self.engine.spec(), encoder, output, duration_secs, bitrate_mbps).await
    }
}

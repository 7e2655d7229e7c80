// THEORY:
// The `StimulusEngine` owns one `VolumeSpec` and turns it into a fully normalized,
// cached volume. It is the only component that talks to the noise sampler.
//
// Key architectural principles:
// 1.  **Memoized by the statistics record**: If statistics exist for the spec's key,
//     generation is skipped entirely. The batches are checked against the record
//     first, and a cache that contradicts itself is reported, never silently rebuilt.
// 2.  **One batch resident**: Batches are sampled, demeaned, quantized, folded into
//     the accumulator and persisted one at a time. Peak memory is one batch plus one
//     frame-sized mean map.
// 3.  **Strict ordering**: every first-pass batch is persisted before the spatial sweep
//     starts, and the statistics record is written last. A crash at any point leaves
//     an entry without statistics, which the next run reports.
// 4.  **Injected collaborators**: the sampler and the cache are type parameters, so
//     the same engine runs against `PerlinSampler` + `DiskCache` in production and
//     against fakes in tests.

use tracing::{debug, info};

use crate::core_modules::batch_cache::{batch_length, CacheKey, CacheStore, Statistics};
use crate::core_modules::filters::FilterPipeline;
use crate::core_modules::frame_batch::FrameBatch;
use crate::core_modules::normalization::{
    quantize_half, remove_frame_means, spatial_sweep, NormalizationAccumulator,
};
use crate::core_modules::sampler::{NoiseSampler, SampleRequest};
use crate::core_modules::volume_spec::{VolumeSpec, XY_SCALE_BASE};
use crate::error::{Result, StimulusError};

pub struct StimulusEngine<S, C> {
    spec: VolumeSpec,
    key: CacheKey,
    sampler: S,
    cache: C,
    batch_length: usize,
    x_coords: Vec<f32>,
    y_coords: Vec<f32>,
    statistics: Option<Statistics>,
}

impl<S: NoiseSampler, C: CacheStore> StimulusEngine<S, C> {
    pub fn new(spec: VolumeSpec, sampler: S, cache: C) -> Self {
        let key = CacheKey::for_spec(&spec);
        let batch_length = batch_length(&spec);
        // x is divided by the frame height too, so pixels are square in noise space.
        let height = spec.y_size() as f32;
        let x_coords = (0..spec.x_size())
            .map(|i| i as f32 / height / spec.x_scale() as f32)
            .collect();
        let y_coords = (0..spec.y_size())
            .map(|j| j as f32 / height / spec.y_scale() as f32)
            .collect();
        Self {
            spec,
            key,
            sampler,
            cache,
            batch_length,
            x_coords,
            y_coords,
            statistics: None,
        }
    }

    pub fn spec(&self) -> &VolumeSpec {
        &self.spec
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn into_cache(self) -> C {
        self.cache
    }

    /// Frames per generated batch.
    pub fn batch_length(&self) -> usize {
        self.batch_length
    }

    /// Statistics of the volume, once `generate_batches` has run.
    pub fn statistics(&self) -> Option<Statistics> {
        self.statistics
    }

    /// Generates, normalizes and persists every batch, or loads the statistics if
    /// this volume is already cached.
    pub fn generate_batches(&mut self) -> Result<Statistics> {
        if let Some(stats) = self.statistics {
            return Ok(stats);
        }

        if let Some(stats) = self.cache.load_statistics(&self.key)? {
            self.verify_cached(&stats)?;
            debug!("Cache hit for {}: {:?}", self.key, stats);
            self.statistics = Some(stats);
            return Ok(stats);
        }
        if self.cache.batch_frames(&self.key, 0)?.is_some() {
            return Err(StimulusError::inconsistent(
                &self.key,
                "batch files exist but no statistics were recorded",
            ));
        }

        // --- 1. First pass: sample, demean in time, persist ---
        let demean = self.spec.demean();
        let t_size = self.spec.t_size();
        let mut accumulator = NormalizationAccumulator::new(self.spec.x_size(), self.spec.y_size());
        for (k, start) in (0..t_size).step_by(self.batch_length).enumerate() {
            let end = (start + self.batch_length).min(t_size);
            info!("Generating batch {} (frames {}..{})", k, start, end);
            let t_coords: Vec<f32> = (start..end).map(|t| self.t_coord(t)).collect();
            let mut batch = self.sample(&t_coords)?;
            if demean.removes_time() {
                remove_frame_means(&mut batch);
            }
            quantize_half(&mut batch);
            accumulator.fold(&batch);
            self.cache.store_batch(&self.key, k, &batch)?;
        }
        let mut summary = accumulator.finalize();

        // --- 2. Second pass: remove the spatial mean from every batch ---
        if demean.removes_space() {
            summary = spatial_sweep(&mut self.cache, &self.key, &summary.spatial_mean)?;
        }

        // --- 3. Seal the entry ---
        let stats = summary.statistics;
        self.cache.store_statistics(&self.key, &stats)?;
        info!(
            "Generated {} frames, range [{}, {}]",
            stats.frame_count, stats.min, stats.max
        );
        self.statistics = Some(stats);
        Ok(stats)
    }

    /// Samples a single frame without touching the cache. See `generate_frames`.
    pub fn generate_frame(&self, t: usize, filters: &FilterPipeline) -> Result<FrameBatch> {
        self.generate_frames(&[t], filters)
    }

    /// Samples arbitrary timepoints without touching the cache. The per-frame mean is
    /// removed if the demean mode includes `time`, then `filters` run with the first
    /// timepoint as the frame offset. Values are not rescaled.
    pub fn generate_frames(&self, timepoints: &[usize], filters: &FilterPipeline) -> Result<FrameBatch> {
        let t_coords: Vec<f32> = timepoints.iter().map(|&t| self.t_coord(t)).collect();
        let mut frames = self.sample(&t_coords)?;
        if self.spec.demean().removes_time() {
            remove_frame_means(&mut frames);
        }
        filters.apply(&mut frames, timepoints.first().copied().unwrap_or(0))?;
        Ok(frames)
    }

    fn t_coord(&self, t: usize) -> f32 {
        t as f32 / self.spec.temporal_scale() as f32
    }

    fn sample(&self, t_coords: &[f32]) -> Result<FrameBatch> {
        let request = SampleRequest {
            x_coords: &self.x_coords,
            y_coords: &self.y_coords,
            t_coords,
            octaves: self.spec.octave_count(),
            persistence: self.spec.spatial_scale() as f32,
            repeat_x: self.spec.aspect_ratio(),
            repeat_y: XY_SCALE_BASE,
            repeat_z: self.spec.temporal_units(),
            seed: self.spec.seed(),
        };
        let batch = self.sampler.sample(&request)?;
        let expected = (self.x_coords.len(), self.y_coords.len(), t_coords.len());
        let got = (batch.width, batch.height, batch.frame_count());
        if got != expected || batch.data.len() != expected.0 * expected.1 * expected.2 {
            return Err(StimulusError::sampler(format!(
                "returned a {}x{}x{} batch, expected {}x{}x{}",
                got.0, got.1, got.2, expected.0, expected.1, expected.2
            )));
        }
        Ok(batch)
    }

    /// Checks that the persisted batches add up to the recorded frame count.
    fn verify_cached(&self, stats: &Statistics) -> Result<()> {
        let (batches, frames) = self.cache.scan(&self.key)?;
        if frames != stats.frame_count {
            return Err(StimulusError::inconsistent(
                &self.key,
                format!(
                    "statistics record {} frames but {} contiguous batches hold {}",
                    stats.frame_count, batches, frames
                ),
            ));
        }
        Ok(())
    }
}

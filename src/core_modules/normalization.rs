// THEORY:
// The normalization pass gives the volume a controllable zero-mean property and the
// global range needed to rescale it for display, while only ever holding one batch
// in memory.
//
// Key architectural principles:
// 1.  **Local vs. global means**: Removing each frame's spatial mean (`time` mode) only
//     needs the frame itself, so it happens while the batch is still resident.
//     Removing each pixel's mean over the whole duration (`space` mode) needs every
//     batch, so it is a second sweep over the persisted batches.
// 2.  **Fold, then finalize**: Statistics are gathered by an explicit accumulator.
//     `fold` takes one batch, `finalize` produces the statistics and the spatial mean
//     map. The accumulator knows nothing about disk or iteration order, so it can be
//     tested on plain in-memory batches.
// 3.  **Precision discipline**: Sums are accumulated in f64. Batches are persisted in
//     half precision, and min/max are always taken over the values *as persisted*, so
//     rescaling a cached batch lands exactly on 0 and 1. Any rewrite recomputes them.

use half::f16;
use tracing::info;

use crate::core_modules::batch_cache::{CacheKey, CacheStore, Statistics};
use crate::core_modules::frame_batch::FrameBatch;
use crate::error::{Result, StimulusError};

/// Rounds every sample to the nearest half-precision value, the precision batches are stored at.
pub fn quantize_half(batch: &mut FrameBatch) {
    batch.map_in_place(|v| f16::from_f32(v).to_f32());
}

/// Subtracts each frame's spatial mean from that frame.
pub fn remove_frame_means(batch: &mut FrameBatch) {
    for frame in batch.frames_mut() {
        if frame.is_empty() {
            continue;
        }
        let mean = frame.iter().map(|&v| v as f64).sum::<f64>() / frame.len() as f64;
        let mean = mean as f32;
        for v in frame.iter_mut() {
            *v -= mean;
        }
    }
}

/// Per-pixel mean over the whole duration of a volume.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialMean {
    pub width: usize,
    pub height: usize,
    pub values: Vec<f32>,
}

impl SpatialMean {
    /// Subtracts the map from every frame of `batch`.
    pub fn subtract_from(&self, batch: &mut FrameBatch) -> Result<()> {
        if batch.width != self.width || batch.height != self.height {
            return Err(StimulusError::inconsistent(
                "spatial mean",
                format!(
                    "batch is {}x{} but the mean map is {}x{}",
                    batch.width, batch.height, self.width, self.height
                ),
            ));
        }
        for frame in batch.frames_mut() {
            for (v, m) in frame.iter_mut().zip(&self.values) {
                *v -= m;
            }
        }
        Ok(())
    }

    /// Largest absolute entry, a measure of how far the volume is from spatially demeaned.
    pub fn max_abs(&self) -> f32 {
        self.values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
    }
}

/// Result of folding every batch of a volume.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationSummary {
    pub statistics: Statistics,
    pub spatial_mean: SpatialMean,
}

/// Streaming accumulator of min, max, frame count and frame-weighted per-pixel means.
#[derive(Debug, Clone)]
pub struct NormalizationAccumulator {
    width: usize,
    height: usize,
    /// Sum over batches of (batch per-pixel mean * batch frame count).
    weighted_means: Vec<f64>,
    frame_count: usize,
    min: f32,
    max: f32,
}

impl NormalizationAccumulator {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            weighted_means: vec![0.0; width * height],
            frame_count: 0,
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Folds one batch into the running statistics.
    pub fn fold(&mut self, batch: &FrameBatch) -> &mut Self {
        let frames = batch.frame_count();
        if frames == 0 {
            return self;
        }
        debug_assert_eq!((batch.width, batch.height), (self.width, self.height));

        let mut batch_sums = vec![0.0f64; self.weighted_means.len()];
        for frame in batch.frames() {
            for (sum, &v) in batch_sums.iter_mut().zip(frame) {
                *sum += v as f64;
            }
        }
        let weight = frames as f64;
        for (acc, sum) in self.weighted_means.iter_mut().zip(&batch_sums) {
            let batch_mean = sum / weight;
            *acc += batch_mean * weight;
        }

        if let Some((lo, hi)) = batch.min_max() {
            self.min = self.min.min(lo);
            self.max = self.max.max(hi);
        }
        self.frame_count += frames;
        self
    }

    /// Produces the volume-wide statistics and spatial mean. An empty accumulator
    /// yields a zero range and a zero mean map.
    pub fn finalize(&self) -> NormalizationSummary {
        let (min, max, values) = if self.frame_count == 0 {
            (0.0, 0.0, vec![0.0; self.weighted_means.len()])
        } else {
            let total = self.frame_count as f64;
            let values = self.weighted_means.iter().map(|s| (s / total) as f32).collect();
            (self.min, self.max, values)
        };
        NormalizationSummary {
            statistics: Statistics {
                min,
                max,
                frame_count: self.frame_count,
            },
            spatial_mean: SpatialMean {
                width: self.width,
                height: self.height,
                values,
            },
        }
    }
}

/// Second pass of `space` demeaning: re-opens every persisted batch, subtracts the
/// spatial mean, re-quantizes, rewrites it in place and returns statistics over the
/// rewritten volume.
pub fn spatial_sweep<C: CacheStore>(
    cache: &mut C,
    key: &CacheKey,
    mean: &SpatialMean,
) -> Result<NormalizationSummary> {
    let mut accumulator = NormalizationAccumulator::new(mean.width, mean.height);
    let mut k = 0;
    while let Some(mut batch) = cache.load_batch(key, k)? {
        info!("Removing spatial mean from batch {}", k);
        mean.subtract_from(&mut batch)?;
        quantize_half(&mut batch);
        accumulator.fold(&batch);
        cache.store_batch(key, k, &batch)?;
        k += 1;
    }
    Ok(accumulator.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::batch_cache::MemoryCache;
    use crate::core_modules::volume_spec::{VolumeConfig, VolumeSpec};

    fn batch(width: usize, height: usize, values: &[f32]) -> FrameBatch {
        FrameBatch::new(width, height, values.to_vec())
    }

    #[test]
    fn frame_means_are_removed_per_frame() {
        let mut b = batch(2, 1, &[1.0, 3.0, 10.0, 20.0]);
        remove_frame_means(&mut b);
        assert_eq!(b.data, vec![-1.0, 1.0, -5.0, 5.0]);
    }

    #[test]
    fn fold_weights_means_by_frame_count() {
        // Pixel 0 is 1.0 for two frames then 4.0 for one frame: mean 2.0.
        let first = batch(1, 1, &[1.0, 1.0]);
        let second = batch(1, 1, &[4.0]);
        let mut acc = NormalizationAccumulator::new(1, 1);
        acc.fold(&first).fold(&second);
        let summary = acc.finalize();
        assert_eq!(summary.statistics.frame_count, 3);
        assert_eq!(summary.statistics.min, 1.0);
        assert_eq!(summary.statistics.max, 4.0);
        assert!((summary.spatial_mean.values[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn fold_is_independent_of_batch_split() {
        let values: Vec<f32> = (0..24).map(|i| ((i * 7) % 11) as f32 * 0.1).collect();
        let whole = batch(2, 2, &values);
        let mut one = NormalizationAccumulator::new(2, 2);
        one.fold(&whole);

        let mut split = NormalizationAccumulator::new(2, 2);
        split
            .fold(&batch(2, 2, &values[..8]))
            .fold(&batch(2, 2, &values[8..20]))
            .fold(&batch(2, 2, &values[20..]));

        let (a, b) = (one.finalize(), split.finalize());
        assert_eq!(a.statistics, b.statistics);
        for (x, y) in a.spatial_mean.values.iter().zip(&b.spatial_mean.values) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn empty_accumulator_finalizes_to_zero() {
        let summary = NormalizationAccumulator::new(3, 2).finalize();
        assert_eq!(summary.statistics.frame_count, 0);
        assert_eq!(summary.spatial_mean.values, vec![0.0; 6]);
    }

    #[test]
    fn quantization_matches_stored_precision() {
        let mut b = batch(1, 1, &[0.1]);
        quantize_half(&mut b);
        assert_ne!(b.data[0], 0.1);
        assert!((b.data[0] - 0.1).abs() < 1e-4);
    }

    #[test]
    fn spatial_sweep_rewrites_batches_and_refreshes_range() {
        let spec = VolumeSpec::new(&VolumeConfig {
            x_size: 2,
            y_size: 1,
            t_size: 4,
            temporal_scale: 1,
            ..VolumeConfig::default()
        })
        .unwrap();
        let key = CacheKey::for_spec(&spec);
        let mut cache = MemoryCache::new();
        let batches = [batch(2, 1, &[1.0, 0.0, 3.0, 0.0]), batch(2, 1, &[1.0, 2.0, 3.0, 2.0])];
        let mut acc = NormalizationAccumulator::new(2, 1);
        for (k, b) in batches.iter().enumerate() {
            acc.fold(b);
            cache.store_batch(&key, k, b).unwrap();
        }
        let first = acc.finalize();
        assert_eq!(first.spatial_mean.values, vec![2.0, 1.0]);

        let second = spatial_sweep(&mut cache, &key, &first.spatial_mean).unwrap();
        assert_eq!(second.statistics.min, -1.0);
        assert_eq!(second.statistics.max, 1.0);
        assert_eq!(second.statistics.frame_count, 4);
        assert!(second.spatial_mean.max_abs() < 1e-6);
        let rewritten = cache.load_batch(&key, 1).unwrap().unwrap();
        assert_eq!(rewritten.data, vec![-1.0, 1.0, 1.0, 1.0]);
    }
}

// THEORY:
// The `VideoAssembler` is the read side of the cache. It walks the cached batches in
// order, rescales them with the saved statistics, runs the filter pipeline, quantizes
// to 8 bits and writes each frame to the slot chosen by the `FrameOrder`. Once every
// frame exists, loops are added as hard links and the external encoder is invoked once.
//
// Key architectural principles:
// 1.  **Fail before writing**: The output path and loop count are checked before any
//     frame is produced. An existing output is never overwritten.
// 2.  **Scoped scratch**: Frames live in a private temporary directory owned by a
//     single assembly run. It is removed on every exit path, success or error.
// 3.  **Running offset**: Each batch is filtered with the global index of its first
//     frame, so position-dependent filters see one continuous video.
// 4.  **Trust but verify**: The number of frames emitted must equal the statistics'
//     frame count. A mismatch is a cache inconsistency, not a shorter video.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::core_modules::batch_cache::{CacheKey, CacheStore, Statistics};
use crate::core_modules::encoder::{EncodeJob, VideoEncoder};
use crate::core_modules::filters::FilterPipeline;
use crate::core_modules::frame_order::FrameOrder;
use crate::core_modules::frame_writer::{self, frame_path, FrameWriterPool, GreyFrame, FRAME_PATTERN};
use crate::core_modules::volume_spec::{frames_for_duration, VolumeSpec};
use crate::error::{ConfigError, Result, StimulusError};

pub const DEFAULT_BITRATE_MBPS: u32 = 20;
/// Mid-grey used for padding videos.
pub const GREY_LEVEL: u8 = 127;
const SCRATCH_PREFIX: &str = "zebra_noise_frames";
const VIDEO_EXTENSION: &str = ".mp4";

/// Options of one `save_video` call.
#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    /// How many times the whole stimulus is played back to back.
    pub loop_count: usize,
    /// Output bitrate in megabits per second. Raise it for smooth filters like `wood`.
    pub bitrate_mbps: u32,
    pub filters: FilterPipeline,
    pub writer_threads: usize,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            loop_count: 1,
            bitrate_mbps: DEFAULT_BITRATE_MBPS,
            filters: FilterPipeline::default(),
            writer_threads: num_cpus::get(),
        }
    }
}

/// Appends `.mp4` unless the path already ends with it.
pub fn with_mp4_extension(path: &Path) -> PathBuf {
    if path.as_os_str().to_string_lossy().ends_with(VIDEO_EXTENSION) {
        return path.to_path_buf();
    }
    let mut name = OsString::from(path.as_os_str());
    name.push(VIDEO_EXTENSION);
    PathBuf::from(name)
}

fn checked_output(output: &Path) -> Result<PathBuf> {
    let output = with_mp4_extension(output);
    if output.exists() {
        return Err(ConfigError::OutputExists(output).into());
    }
    Ok(output)
}

fn scratch_dir() -> Result<tempfile::TempDir> {
    Ok(tempfile::Builder::new().prefix(SCRATCH_PREFIX).tempdir()?)
}

pub struct VideoAssembler<'a, C, E> {
    cache: &'a C,
    key: &'a CacheKey,
    statistics: Statistics,
    fps: u32,
    width: usize,
    height: usize,
    encoder: E,
}

impl<'a, C: CacheStore, E: VideoEncoder> VideoAssembler<'a, C, E> {
    pub fn new(
        cache: &'a C,
        key: &'a CacheKey,
        spec: &VolumeSpec,
        statistics: Statistics,
        encoder: E,
    ) -> Self {
        Self {
            cache,
            key,
            statistics,
            fps: spec.fps(),
            width: spec.x_size(),
            height: spec.y_size(),
            encoder,
        }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Renders the cached volume through `config.filters` and encodes it to `output`
    /// (with `.mp4` appended if missing). Returns the path actually written.
    pub async fn save_video(&self, output: &Path, config: &AssemblyConfig) -> Result<PathBuf> {
        if config.loop_count == 0 {
            return Err(ConfigError::ZeroLoop.into());
        }
        let output = checked_output(output)?;
        let scratch = scratch_dir()?;
        let total = self.statistics.frame_count;
        let order = FrameOrder::for_filters(config.filters.filters(), total);

        // Stage 1: rescale, filter and write every frame of the volume.
        let pool = FrameWriterPool::new(config.writer_threads);
        let emitted = self.emit_frames(&pool, scratch.path(), &config.filters, order).await;
        pool.shutdown().await;
        let emitted = emitted?;
        if emitted != total {
            return Err(StimulusError::inconsistent(
                self.key,
                format!("statistics record {total} frames but the batches hold {emitted}"),
            ));
        }

        // Stage 2: loops reuse the frames already on disk.
        for j in 1..config.loop_count {
            for i in 0..total {
                tokio::fs::hard_link(frame_path(scratch.path(), i), frame_path(scratch.path(), i + j * total))
                    .await?;
            }
        }

        // Stage 3: hand everything to the encoder.
        self.encode(scratch.path(), config.bitrate_mbps, &output).await?;
        scratch.close()?;
        Ok(output)
    }

    /// Encodes a uniform grey padding video of this volume's size. See `save_grey_pad`.
    pub async fn save_grey_pad(&self, output: &Path, duration_secs: f64, bitrate_mbps: u32) -> Result<PathBuf> {
        let frame = PadFrame {
            fps: self.fps,
            width: self.width,
            height: self.height,
        };
        grey_pad(&self.encoder, frame, output, duration_secs, bitrate_mbps).await
    }

    /// Streams the cached batches through the pipeline. Returns the number of frames emitted.
    async fn emit_frames(
        &self,
        pool: &FrameWriterPool,
        dir: &Path,
        filters: &FilterPipeline,
        order: FrameOrder,
    ) -> Result<usize> {
        let total = order.total();
        let mut offset = 0;
        for item in self.cache.batches(self.key) {
            let (k, mut batch) = item?;
            let n = batch.frame_count();
            if offset + n > total {
                return Err(StimulusError::inconsistent(
                    self.key,
                    format!("batch {k} runs past the recorded {total} frames"),
                ));
            }
            let stats = self.statistics;
            batch.map_in_place(|v| stats.rescale(v));
            filters.apply(&mut batch, offset)?;

            let frames = batch
                .frames()
                .enumerate()
                .map(|(j, values)| {
                    let slot = order.map(offset + j);
                    GreyFrame::from_unit_values(frame_path(dir, slot), batch.width, batch.height, values)
                })
                .collect();
            pool.write_all(frames).await?;
            info!("Assembled batch {} (frames {}..{})", k, offset, offset + n);
            offset += n;
        }
        Ok(offset)
    }

    async fn encode(&self, frame_dir: &Path, bitrate_mbps: u32, output: &Path) -> Result<()> {
        encode_dir(&self.encoder, self.fps, frame_dir, bitrate_mbps, output).await
    }
}

#[derive(Debug, Clone, Copy)]
struct PadFrame {
    fps: u32,
    width: usize,
    height: usize,
}

/// Encodes `floor(duration_secs * fps)` uniform mid-grey frames of the volume's size,
/// for padding between stimuli. Needs no generated volume.
pub async fn save_grey_pad<E: VideoEncoder>(
    spec: &VolumeSpec,
    encoder: &E,
    output: &Path,
    duration_secs: f64,
    bitrate_mbps: u32,
) -> Result<PathBuf> {
    let frame = PadFrame {
        fps: spec.fps(),
        width: spec.x_size(),
        height: spec.y_size(),
    };
    grey_pad(encoder, frame, output, duration_secs, bitrate_mbps).await
}

async fn grey_pad<E: VideoEncoder>(
    encoder: &E,
    frame: PadFrame,
    output: &Path,
    duration_secs: f64,
    bitrate_mbps: u32,
) -> Result<PathBuf> {
    let output = checked_output(output)?;
    let scratch = scratch_dir()?;
    let n_frames = frames_for_duration(duration_secs, frame.fps);

    // One encoded frame, hard-linked under every frame name.
    let grey = GreyFrame::uniform(scratch.path().join("_grey.png"), frame.width, frame.height, GREY_LEVEL);
    let grey_path = grey.path.clone();
    tokio::task::spawn_blocking(move || frame_writer::save_png(&grey))
        .await
        .map_err(|e| StimulusError::ExternalTool {
            tool: "frame writer".to_string(),
            detail: e.to_string(),
        })??;
    for i in 0..n_frames {
        tokio::fs::hard_link(&grey_path, frame_path(scratch.path(), i)).await?;
    }
    info!("Prepared {} grey frames", n_frames);

    encode_dir(encoder, frame.fps, scratch.path(), bitrate_mbps, &output).await?;
    scratch.close()?;
    Ok(output)
}

async fn encode_dir<E: VideoEncoder>(
    encoder: &E,
    fps: u32,
    frame_dir: &Path,
    bitrate_mbps: u32,
    output: &Path,
) -> Result<()> {
    let job = EncodeJob {
        frame_dir: frame_dir.to_path_buf(),
        pattern: FRAME_PATTERN.to_string(),
        fps,
        bitrate_mbps,
        output: output.to_path_buf(),
    };
    debug!("Encoding {:?}", job);
    encoder.encode(&job).await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core_modules::batch_cache::MemoryCache;
    use crate::core_modules::engine::StimulusEngine;
    use crate::core_modules::frame_batch::FrameBatch;
    use crate::core_modules::sampler::{NoiseSampler, SampleRequest};
    use crate::core_modules::volume_spec::{DemeanMode, VolumeConfig};

    /// Every pixel of frame `t` has the value of its time coordinate.
    struct RampSampler;

    impl NoiseSampler for RampSampler {
        fn sample(&self, r: &SampleRequest<'_>) -> Result<FrameBatch> {
            let per_frame = r.x_coords.len() * r.y_coords.len();
            let data = r
                .t_coords
                .iter()
                .flat_map(|&t| std::iter::repeat_n(t, per_frame))
                .collect();
            Ok(FrameBatch::new(r.x_coords.len(), r.y_coords.len(), data))
        }
    }

    /// Snapshots the scratch directory at encode time instead of running ffmpeg.
    #[derive(Default)]
    struct RecordingEncoder {
        fail: bool,
        jobs: Mutex<Vec<EncodeJob>>,
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl VideoEncoder for RecordingEncoder {
        async fn encode(&self, job: &EncodeJob) -> Result<()> {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&job.frame_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.file_name().is_some_and(|n| n.to_string_lossy().starts_with("_frame")))
                .collect();
            paths.sort();
            let frames = paths
                .iter()
                .map(|p| image::open(p).map(|img| img.to_luma8().into_raw()))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            *self.frames.lock().unwrap() = frames;
            self.jobs.lock().unwrap().push(job.clone());
            if self.fail {
                return Err(StimulusError::ExternalTool {
                    tool: "recorder".to_string(),
                    detail: "asked to fail".to_string(),
                });
            }
            std::fs::write(&job.output, b"video")?;
            Ok(())
        }
    }

    impl RecordingEncoder {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn first_pixels(&self) -> Vec<u8> {
            self.frames.lock().unwrap().iter().map(|f| f[0]).collect()
        }

        fn last_job(&self) -> EncodeJob {
            self.jobs.lock().unwrap().last().cloned().unwrap()
        }
    }

    /// Six 4x2 frames in three batches, frame `t` uniformly `t / 5` after rescaling.
    fn generated() -> (MemoryCache, CacheKey, VolumeSpec, Statistics) {
        let spec = VolumeSpec::new(&VolumeConfig {
            x_size: 4,
            y_size: 2,
            t_size: 6,
            temporal_scale: 1,
            demean: DemeanMode::None,
            batch_budget: 4 * 2 * 2,
            ..VolumeConfig::default()
        })
        .unwrap();
        let mut cache = MemoryCache::new();
        let mut engine = StimulusEngine::new(spec.clone(), RampSampler, &mut cache);
        let stats = engine.generate_batches().unwrap();
        let key = engine.key().clone();
        (cache, key, spec, stats)
    }

    fn config(filters: &[&str], loop_count: usize) -> AssemblyConfig {
        AssemblyConfig {
            loop_count,
            filters: FilterPipeline::parse(filters).unwrap(),
            writer_threads: 2,
            ..AssemblyConfig::default()
        }
    }

    #[test]
    fn mp4_extension_is_appended_once() {
        assert_eq!(with_mp4_extension(Path::new("out/stim")), PathBuf::from("out/stim.mp4"));
        assert_eq!(with_mp4_extension(Path::new("stim.mp4")), PathBuf::from("stim.mp4"));
        assert_eq!(with_mp4_extension(Path::new("stim.avi")), PathBuf::from("stim.avi.mp4"));
    }

    #[tokio::test]
    async fn frames_are_emitted_in_order_and_scratch_is_removed() {
        let (cache, key, spec, stats) = generated();
        let out = tempfile::tempdir().unwrap();
        let assembler = VideoAssembler::new(&cache, &key, &spec, stats, RecordingEncoder::default());

        let written = assembler
            .save_video(&out.path().join("stim"), &config(&[], 1))
            .await
            .unwrap();
        assert_eq!(written, out.path().join("stim.mp4"));
        assert!(written.exists());

        let encoder = assembler.encoder();
        assert_eq!(encoder.first_pixels(), vec![0, 51, 102, 153, 204, 255]);
        let job = encoder.last_job();
        assert_eq!((job.fps, job.bitrate_mbps), (30, DEFAULT_BITRATE_MBPS));
        assert_eq!(job.pattern, FRAME_PATTERN);
        assert!(!job.frame_dir.exists());
    }

    #[tokio::test]
    async fn reverse_filter_plays_the_volume_backwards() {
        let (cache, key, spec, stats) = generated();
        let out = tempfile::tempdir().unwrap();
        let assembler = VideoAssembler::new(&cache, &key, &spec, stats, RecordingEncoder::default());
        assembler
            .save_video(&out.path().join("rev.mp4"), &config(&["reverse"], 1))
            .await
            .unwrap();
        assert_eq!(assembler.encoder().first_pixels(), vec![255, 204, 153, 102, 51, 0]);
    }

    #[tokio::test]
    async fn loops_repeat_the_whole_sequence() {
        let (cache, key, spec, stats) = generated();
        let out = tempfile::tempdir().unwrap();
        let assembler = VideoAssembler::new(&cache, &key, &spec, stats, RecordingEncoder::default());
        assembler
            .save_video(&out.path().join("loop.mp4"), &config(&["invert"], 2))
            .await
            .unwrap();
        let once = vec![255, 204, 153, 102, 51, 0];
        let twice: Vec<u8> = once.iter().chain(&once).copied().collect();
        assert_eq!(assembler.encoder().first_pixels(), twice);
    }

    #[tokio::test]
    async fn photodiode_marker_alternates_across_batches() {
        let (cache, key, spec, stats) = generated();
        let out = tempfile::tempdir().unwrap();
        let assembler = VideoAssembler::new(&cache, &key, &spec, stats, RecordingEncoder::default());
        assembler
            .save_video(&out.path().join("pd.mp4"), &config(&["photodiode:1"], 1))
            .await
            .unwrap();
        // The marker is the top-right pixel, index 3 of each 4x2 frame.
        let markers: Vec<u8> = assembler.encoder().frames.lock().unwrap().iter().map(|f| f[3]).collect();
        assert_eq!(markers, vec![0, 255, 0, 255, 0, 255]);
    }

    #[tokio::test]
    async fn existing_output_fails_before_any_frame_is_written() {
        let (cache, key, spec, stats) = generated();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join("taken.mp4"), b"keep me").unwrap();
        let assembler = VideoAssembler::new(&cache, &key, &spec, stats, RecordingEncoder::default());

        let err = assembler
            .save_video(&out.path().join("taken"), &config(&[], 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StimulusError::Configuration(ConfigError::OutputExists(_))
        ));
        assert!(assembler.encoder().jobs.lock().unwrap().is_empty());
        assert_eq!(std::fs::read(out.path().join("taken.mp4")).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn zero_loop_count_is_rejected() {
        let (cache, key, spec, stats) = generated();
        let out = tempfile::tempdir().unwrap();
        let assembler = VideoAssembler::new(&cache, &key, &spec, stats, RecordingEncoder::default());
        let err = assembler
            .save_video(&out.path().join("none.mp4"), &config(&[], 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StimulusError::Configuration(ConfigError::ZeroLoop)));
    }

    #[tokio::test]
    async fn encoder_failure_propagates_and_cleans_scratch() {
        let (cache, key, spec, stats) = generated();
        let out = tempfile::tempdir().unwrap();
        let assembler = VideoAssembler::new(&cache, &key, &spec, stats, RecordingEncoder::failing());
        let err = assembler
            .save_video(&out.path().join("fail.mp4"), &config(&[], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StimulusError::ExternalTool { .. }));
        assert!(!assembler.encoder().last_job().frame_dir.exists());
        assert!(!out.path().join("fail.mp4").exists());
    }

    #[tokio::test]
    async fn frame_count_mismatch_is_inconsistent() {
        let (cache, key, spec, mut stats) = generated();
        stats.frame_count = 8;
        let out = tempfile::tempdir().unwrap();
        let assembler = VideoAssembler::new(&cache, &key, &spec, stats, RecordingEncoder::default());
        let err = assembler
            .save_video(&out.path().join("short.mp4"), &config(&[], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StimulusError::CacheInconsistency { .. }));
        assert!(assembler.encoder().jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn grey_pad_is_uniform_mid_grey() {
        let (cache, key, spec, stats) = generated();
        let out = tempfile::tempdir().unwrap();
        let assembler = VideoAssembler::new(&cache, &key, &spec, stats, RecordingEncoder::default());
        let written = assembler
            .save_grey_pad(&out.path().join("pad"), 0.1, 5)
            .await
            .unwrap();
        assert_eq!(written, out.path().join("pad.mp4"));

        let encoder = assembler.encoder();
        let frames = encoder.frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 8 && f.iter().all(|&p| p == GREY_LEVEL)));
        assert_eq!(encoder.last_job().bitrate_mbps, 5);
        assert!(!encoder.last_job().frame_dir.exists());
    }
}

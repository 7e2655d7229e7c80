// THEORY:
// PNG encoding dominates the wall time of an assembly, and every frame is independent
// once its pixels are known. The `FrameWriterPool` spreads frame encoding over a
// fixed set of workers while the assembler stays strictly batch-sequential.
//
// Key architectural principles:
// 1.  **Single dispatcher, round-robin workers**: all tasks enter one unbounded
//     channel; a dispatcher hands them to the workers in turn.
// 2.  **Per-task completion**: each task carries a `oneshot` sender, so callers await
//     exactly the frames they submitted and get each frame's own error.
// 3.  **Blocking work off the runtime**: encoding and file I/O run in
//     `spawn_blocking`, so workers never stall the async executor.

use std::path::{Path, PathBuf};

use futures::future::try_join_all;
use image::ImageEncoder;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, StimulusError};

/// `printf`-style pattern matching `frame_file_name`, as handed to the video encoder.
pub const FRAME_PATTERN: &str = "_frame%05d.png";

pub fn frame_file_name(index: usize) -> String {
    format!("_frame{index:05}.png")
}

/// One 8-bit greyscale frame on its way to disk.
#[derive(Debug, Clone)]
pub struct GreyFrame {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl GreyFrame {
    /// Quantizes `[0, 1]` values with `round(v * 255)`, saturating outside the range.
    pub fn from_unit_values(path: PathBuf, width: usize, height: usize, values: &[f32]) -> Self {
        Self {
            path,
            width: width as u32,
            height: height as u32,
            pixels: values.iter().map(|&v| (v * 255.0).round() as u8).collect(),
        }
    }

    /// A frame of one uniform grey level.
    pub fn uniform(path: PathBuf, width: usize, height: usize, level: u8) -> Self {
        Self {
            path,
            width: width as u32,
            height: height as u32,
            pixels: vec![level; width * height],
        }
    }
}

/// Encodes `frame` as an 8-bit greyscale PNG at `frame.path`.
pub fn save_png(frame: &GreyFrame) -> Result<()> {
    let output = std::io::BufWriter::new(std::fs::File::create(&frame.path)?);
    let encoder = image::codecs::png::PngEncoder::new(output);
    encoder.write_image(&frame.pixels, frame.width, frame.height, image::ExtendedColorType::L8)?;
    Ok(())
}

struct FrameTask {
    frame: GreyFrame,
    result_sender: oneshot::Sender<Result<()>>,
}

fn pool_closed() -> StimulusError {
    StimulusError::ExternalTool {
        tool: "frame writer".to_string(),
        detail: "worker pool is shut down".to_string(),
    }
}

pub struct FrameWriterPool {
    task_sender: mpsc::UnboundedSender<FrameTask>,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl FrameWriterPool {
    /// Spawns the dispatcher and `worker_count` workers. Must be called inside a Tokio runtime.
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<FrameTask>();

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::unbounded_channel::<FrameTask>())
            .unzip();

        let dispatcher = tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                // A closed worker drops the task, and its caller sees the closed oneshot.
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % worker_count;
            }
        });

        let workers = worker_receivers
            .into_iter()
            .map(|mut worker_receiver| {
                tokio::spawn(async move {
                    while let Some(FrameTask { frame, result_sender }) = worker_receiver.recv().await {
                        let result = tokio::task::spawn_blocking(move || -> Result<()> {
                            save_png(&frame)?;
                            debug!("Wrote {}", frame.path.display());
                            Ok(())
                        })
                        .await
                        .unwrap_or_else(|e| {
                            Err(StimulusError::ExternalTool {
                                tool: "frame writer".to_string(),
                                detail: e.to_string(),
                            })
                        });
                        let _ = result_sender.send(result);
                    }
                })
            })
            .collect();

        Self {
            task_sender,
            dispatcher,
            workers,
        }
    }

    /// One worker per logical CPU.
    pub fn with_default_workers() -> Self {
        Self::new(num_cpus::get())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub async fn write_frame(&self, frame: GreyFrame) -> Result<()> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.task_sender
            .send(FrameTask { frame, result_sender })
            .map_err(|_| pool_closed())?;
        result_receiver.await.map_err(|_| pool_closed())?
    }

    /// Submits every frame at once and waits for all of them. The first failure is returned.
    pub async fn write_all(&self, frames: Vec<GreyFrame>) -> Result<()> {
        try_join_all(frames.into_iter().map(|frame| self.write_frame(frame))).await?;
        Ok(())
    }

    /// Closes the queue and waits for in-flight frames to finish.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        let _ = self.dispatcher.await;
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Path of frame `index` inside `dir`.
pub fn frame_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(frame_file_name(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_names_are_zero_padded_and_sort_in_order() {
        assert_eq!(frame_file_name(0), "_frame00000.png");
        assert_eq!(frame_file_name(123), "_frame00123.png");
        assert!(frame_file_name(9) < frame_file_name(10));
    }

    #[test]
    fn unit_values_quantize_with_rounding_and_saturation() {
        let frame = GreyFrame::from_unit_values(PathBuf::new(), 5, 1, &[0.0, 0.5, 1.0, 1.7, -0.2]);
        assert_eq!(frame.pixels, vec![0, 128, 255, 255, 0]);
    }

    #[test]
    fn save_png_round_trips_through_the_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let frame = GreyFrame {
            path: dir.path().join("ramp.png"),
            width: 4,
            height: 2,
            pixels: (0..8).map(|i| i * 30).collect(),
        };
        save_png(&frame).unwrap();
        let decoded = image::open(&frame.path).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (4, 2));
        assert_eq!(decoded.into_raw(), frame.pixels);
    }

    #[tokio::test]
    async fn pool_writes_every_submitted_frame() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FrameWriterPool::new(3);
        assert_eq!(pool.worker_count(), 3);
        let frames: Vec<GreyFrame> = (0..7)
            .map(|i| GreyFrame::uniform(frame_path(dir.path(), i), 6, 3, (i * 10) as u8))
            .collect();
        pool.write_all(frames).await.unwrap();
        pool.shutdown().await;

        for i in 0..7 {
            let decoded = image::open(frame_path(dir.path(), i)).unwrap().to_luma8();
            assert_eq!(decoded.get_pixel(5, 2).0[0], (i * 10) as u8);
        }
    }

    #[tokio::test]
    async fn pool_reports_write_failures() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FrameWriterPool::new(2);
        let missing = dir.path().join("no_such_dir").join("frame.png");
        let err = pool
            .write_frame(GreyFrame::uniform(missing, 2, 2, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StimulusError::Io(_) | StimulusError::Image(_)));
        pool.shutdown().await;
    }
}

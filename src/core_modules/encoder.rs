// THEORY:
// Turning a directory of numbered frames into a movie is delegated to an external
// encoder. The assembler only knows the `VideoEncoder` trait: one call per assembly,
// given the frame rate, the input filename pattern, the bitrate and the output path.
// Any failure of the encoder is fatal for the assembly.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Result, StimulusError};

pub const DEFAULT_ENCODER_PROGRAM: &str = "ffmpeg";
pub const DEFAULT_CODEC: &str = "mpeg2video";

/// Everything an encoder needs to produce one video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeJob {
    /// Directory holding the numbered frames.
    pub frame_dir: PathBuf,
    /// Zero-padded sequential filename pattern, e.g. `_frame%05d.png`.
    pub pattern: String,
    pub fps: u32,
    /// Output bitrate in megabits per second.
    pub bitrate_mbps: u32,
    pub output: PathBuf,
}

impl EncodeJob {
    pub fn input_pattern(&self) -> PathBuf {
        self.frame_dir.join(&self.pattern)
    }
}

pub trait VideoEncoder {
    fn encode(&self, job: &EncodeJob) -> impl Future<Output = Result<()>> + Send;
}

impl<E: VideoEncoder + Sync + ?Sized> VideoEncoder for &E {
    fn encode(&self, job: &EncodeJob) -> impl Future<Output = Result<()>> + Send {
        (**self).encode(job)
    }
}

/// Runs `ffmpeg` (or a compatible program) as a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegEncoder {
    pub program: PathBuf,
    pub codec: String,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_ENCODER_PROGRAM),
            codec: DEFAULT_CODEC.to_string(),
        }
    }
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Command-line arguments for `job`, without the program name. `-n` makes the
    /// encoder fail instead of overwriting an existing output.
    pub fn arguments(&self, job: &EncodeJob) -> Vec<String> {
        vec![
            "-n".to_string(),
            "-r".to_string(),
            job.fps.to_string(),
            "-i".to_string(),
            job.input_pattern().display().to_string(),
            "-c:v".to_string(),
            self.codec.clone(),
            "-an".to_string(),
            "-b:v".to_string(),
            format!("{}M", job.bitrate_mbps),
            job.output.display().to_string(),
        ]
    }

    fn failure(&self, detail: String) -> StimulusError {
        StimulusError::ExternalTool {
            tool: self.program.display().to_string(),
            detail,
        }
    }
}

impl VideoEncoder for FfmpegEncoder {
    async fn encode(&self, job: &EncodeJob) -> Result<()> {
        let args = self.arguments(job);
        debug!("Running {} {}", self.program.display(), args.join(" "));

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.failure(format!("could not start: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(self.failure(format!("{} ({})", output.status, tail.join(" | "))));
        }
        info!("Encoded {}", job.output.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> EncodeJob {
        EncodeJob {
            frame_dir: PathBuf::from("/scratch"),
            pattern: "_frame%05d.png".to_string(),
            fps: 30,
            bitrate_mbps: 20,
            output: PathBuf::from("out.mp4"),
        }
    }

    #[test]
    fn arguments_follow_encoder_contract() {
        let args = FfmpegEncoder::default().arguments(&job());
        assert_eq!(
            args,
            vec![
                "-n",
                "-r",
                "30",
                "-i",
                "/scratch/_frame%05d.png",
                "-c:v",
                "mpeg2video",
                "-an",
                "-b:v",
                "20M",
                "out.mp4"
            ]
        );
    }

    #[tokio::test]
    async fn missing_program_is_an_external_tool_error() {
        let encoder = FfmpegEncoder::new("/definitely/not/an/encoder");
        let err = encoder.encode(&job()).await.unwrap_err();
        assert!(matches!(err, StimulusError::ExternalTool { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_external_tool_error() {
        let encoder = FfmpegEncoder::new("false");
        let err = encoder.encode(&job()).await.unwrap_err();
        match err {
            StimulusError::ExternalTool { tool, .. } => assert_eq!(tool, "false"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}

// Command-line runner for the `zebra_noise` library.
//
// Every volume parameter can come from a JSON config (`--config`) and be overridden
// by a flag. Generation is cached in `--cache-dir`, so repeated runs with the same
// volume go straight to assembly.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use zebra_noise::core_modules::volume_spec::frames_for_duration;
use zebra_noise::pipeline::{
    AssemblyConfig, DemeanMode, FfmpegEncoder, FilterPipeline, Statistics, Stimulus, StimulusConfig,
};
use zebra_noise::Result;

#[derive(Parser)]
#[command(author, version, about = "Procedural Perlin noise stimuli, cached and rendered to video")]
struct Cli {
    /// JSON file with a full `StimulusConfig`; flags below override it
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[command(flatten)]
    volume: VolumeArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct VolumeArgs {
    /// Directory for batch and statistics files
    #[arg(long, global = true, value_hint = ValueHint::DirPath)]
    cache_dir: Option<PathBuf>,
    /// Frame width in pixels
    #[arg(long, global = true)]
    width: Option<usize>,
    /// Frame height in pixels
    #[arg(long, global = true)]
    height: Option<usize>,
    /// Duration in seconds, converted with floor(duration * fps)
    #[arg(long, global = true, conflicts_with = "frames")]
    duration: Option<f64>,
    /// Duration in frames
    #[arg(long, global = true)]
    frames: Option<usize>,
    #[arg(long, global = true)]
    fps: Option<u32>,
    /// Seed, 0 to 255
    #[arg(long, global = true)]
    seed: Option<u32>,
    /// Number of octaves
    #[arg(long, global = true)]
    levels: Option<u32>,
    /// Relative strength of successive octaves
    #[arg(long, global = true)]
    spatial_scale: Option<f64>,
    /// Frames per temporal lattice unit
    #[arg(long, global = true)]
    temporal_scale: Option<usize>,
    #[arg(long, global = true)]
    x_scale: Option<f64>,
    #[arg(long, global = true)]
    y_scale: Option<f64>,
    /// One of: both, time, space, none
    #[arg(long, global = true)]
    demean: Option<DemeanMode>,
}

#[derive(Subcommand)]
enum Command {
    /// Generate (or reuse) the volume and render it to a video
    Video(VideoArgs),

    /// Render a uniform grey video of the volume's size and frame rate
    GreyPad(GreyPadArgs),

    /// Generate (or reuse) the volume and print its statistics as JSON
    Stats,
}

#[derive(Args)]
struct EncoderArgs {
    /// Output bitrate in megabits per second
    #[arg(long, default_value_t = 20)]
    bitrate: u32,
    /// Encoder executable
    #[arg(long, default_value = "ffmpeg", value_hint = ValueHint::ExecutablePath)]
    encoder: PathBuf,
}

#[derive(Args)]
struct VideoArgs {
    /// Output file; `.mp4` is appended if missing
    #[arg(value_hint = ValueHint::FilePath)]
    output: PathBuf,
    /// Filter as `name` or `name:arg[,arg...]`, applied in the order given
    #[arg(long = "filter")]
    filters: Vec<String>,
    /// Number of times to play the stimulus back to back
    #[arg(long = "loop", default_value_t = 1)]
    loop_count: usize,
    #[command(flatten)]
    encoder: EncoderArgs,
}

#[derive(Args)]
struct GreyPadArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    output: PathBuf,
    /// Length of the padding in seconds
    #[arg(long = "pad-duration")]
    pad_duration: f64,
    #[command(flatten)]
    encoder: EncoderArgs,
}

#[derive(Serialize)]
struct StatsReport<'a> {
    key: &'a str,
    #[serde(flatten)]
    statistics: Statistics,
}

impl VolumeArgs {
    fn apply(&self, config: &mut StimulusConfig) {
        let volume = &mut config.volume;
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(v) = self.width {
            volume.x_size = v;
        }
        if let Some(v) = self.height {
            volume.y_size = v;
        }
        if let Some(v) = self.fps {
            volume.fps = v;
        }
        if let Some(v) = self.seed {
            volume.seed = v;
        }
        if let Some(v) = self.levels {
            volume.octave_count = v;
        }
        if let Some(v) = self.spatial_scale {
            volume.spatial_scale = v;
        }
        if let Some(v) = self.temporal_scale {
            volume.temporal_scale = v;
        }
        if let Some(v) = self.x_scale {
            volume.x_scale = v;
        }
        if let Some(v) = self.y_scale {
            volume.y_scale = v;
        }
        if let Some(v) = self.demean {
            volume.demean = v;
        }
        // Duration last, so it uses the final frame rate.
        if let Some(frames) = self.frames {
            volume.t_size = frames;
        } else if let Some(secs) = self.duration {
            volume.t_size = frames_for_duration(secs, volume.fps);
        }
    }
}

fn encoder(args: &EncoderArgs) -> FfmpegEncoder {
    FfmpegEncoder::new(&args.encoder)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => StimulusConfig::from_json_file(path)?,
        None => StimulusConfig::default(),
    };
    cli.volume.apply(&mut config);

    let mut stimulus = Stimulus::new(&config)?;
    info!(
        "Volume {}x{}x{} at {} fps, cache key {}",
        stimulus.spec().x_size(),
        stimulus.spec().y_size(),
        stimulus.spec().t_size(),
        stimulus.spec().fps(),
        stimulus.key()
    );

    match cli.command {
        Command::Video(args) => {
            let assembly = AssemblyConfig {
                loop_count: args.loop_count,
                bitrate_mbps: args.encoder.bitrate,
                filters: FilterPipeline::parse(args.filters.as_slice())?,
                ..AssemblyConfig::default()
            };
            let written = stimulus
                .save_video(&args.output, &assembly, &encoder(&args.encoder))
                .await?;
            info!("Saved {}", written.display());
        }
        Command::GreyPad(args) => {
            let written = stimulus
                .save_grey_pad(&args.output, args.pad_duration, args.encoder.bitrate, &encoder(&args.encoder))
                .await?;
            info!("Saved {}", written.display());
        }
        Command::Stats => {
            let statistics = stimulus.generate()?;
            let report = StatsReport {
                key: stimulus.key().as_str(),
                statistics,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

// THEORY:
// Filters turn rescaled noise (values in [0, 1]) into the final stimulus. A pipeline
// is an ordered list of filters applied one after another to a whole batch of frames.
//
// Key architectural principles:
// 1.  **Typed filters**: Each filter kind is an enum variant carrying its own parameter
//     struct, and dispatch is a single exhaustive `match`. Names and argument lists
//     only exist at the edge (`FromStr` / `from_parts`), where an unknown name is a
//     hard error, never a silent no-op.
// 2.  **Values vs. order**: Filters only change sample values. Filters that change
//     the *order* of frames (`reverse`) are identity here; their effect is carried by
//     `FrameOrder`, which the assembler consults when emitting frames.
// 3.  **Batch position matters**: Marker filters depend on a frame's position in the
//     whole video, not in its batch, so every application receives the global index
//     of the batch's first frame.
// 4.  **Escape hatch**: `Filter::Custom` wraps an arbitrary batch transform for
//     experiments that do not deserve a variant yet.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::core_modules::frame_batch::FrameBatch;
use crate::error::{ConfigError, Result, StimulusError};

/// Gaussian kernels are cut off at this many standard deviations.
const BLUR_TRUNCATE: f32 = 4.0;
/// Largest accepted blur sigma, in pixels.
const MAX_BLUR_SIGMA: f64 = 1000.0;
/// Largest accepted marker position or size, in pixels.
const MAX_MARKER_EXTENT: f64 = 65536.0;

const B2_MARKER_SIZE: usize = 125;
const FUSI_MARKER_SIZE: usize = 75;
const BSCOPE_MARKER_SIZE: usize = 100;

const IBL_MARKER_SIZE: usize = 75;
const IBL_MARKER_X: usize = 1995;
const IBL_MARKER_Y: usize = 1500;
const IBL_CHANNELS: usize = 8;
const IBL_PERIOD: usize = 3600;
const IBL_SEED: u64 = 1234;

static IBL_SEQUENCE: OnceLock<Arc<[bool]>> = OnceLock::new();

/// The seeded default marker sequence: `IBL_PERIOD` random bits, each held for
/// `IBL_CHANNELS` consecutive frames.
pub fn ibl_sequence() -> Arc<[bool]> {
    IBL_SEQUENCE
        .get_or_init(|| {
            let mut rng = ChaCha8Rng::seed_from_u64(IBL_SEED);
            let mut seq = Vec::with_capacity(IBL_PERIOD * IBL_CHANNELS);
            for _ in 0..IBL_PERIOD {
                let bit = rng.random::<f64>() > 0.5;
                seq.extend(std::iter::repeat_n(bit, IBL_CHANNELS));
            }
            seq.into()
        })
        .clone()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub level: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftThreshold {
    pub steepness: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comb {
    pub width: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wood {
    pub width: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blur {
    pub sigma: f32,
}

/// Where a photodiode marker is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerAnchor {
    TopRight,
    BottomLeft,
    /// Top-left corner of the square at column `x`, row `y`.
    At { x: usize, y: usize },
}

/// A square that alternates black/white on even/odd frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Photodiode {
    pub anchor: MarkerAnchor,
    pub size: usize,
}

impl Photodiode {
    pub fn top_right(size: usize) -> Self {
        Self {
            anchor: MarkerAnchor::TopRight,
            size,
        }
    }

    pub fn b2() -> Self {
        Self::top_right(B2_MARKER_SIZE)
    }

    pub fn fusi() -> Self {
        Self::top_right(FUSI_MARKER_SIZE)
    }

    pub fn bscope() -> Self {
        Self {
            anchor: MarkerAnchor::BottomLeft,
            size: BSCOPE_MARKER_SIZE,
        }
    }

    /// `(rows, cols)` covered by the marker, clipped to the frame.
    fn region(&self, width: usize, height: usize) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let s = self.size;
        match self.anchor {
            MarkerAnchor::TopRight => (0..s.min(height), width.saturating_sub(s)..width),
            MarkerAnchor::BottomLeft => (height.saturating_sub(s)..height, 0..s.min(width)),
            MarkerAnchor::At { x, y } => (
                y.min(height)..y.saturating_add(s).min(height),
                x.min(width)..x.saturating_add(s).min(width),
            ),
        }
    }
}

/// A square driven by a binary sequence, indexed by the global frame number.
/// The index wraps around when the video is longer than the sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct IblMarker {
    pub sequence: Arc<[bool]>,
}

impl Default for IblMarker {
    fn default() -> Self {
        Self {
            sequence: ibl_sequence(),
        }
    }
}

impl IblMarker {
    fn region(width: usize, height: usize) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let rows = IBL_MARKER_Y.saturating_sub(IBL_MARKER_SIZE).min(height)..IBL_MARKER_Y.min(height);
        let cols = IBL_MARKER_X.saturating_sub(IBL_MARKER_SIZE).min(width)..IBL_MARKER_X.min(width);
        (rows, cols)
    }

    fn bit(&self, frame_index: usize) -> bool {
        if self.sequence.is_empty() {
            return false;
        }
        self.sequence[frame_index % self.sequence.len()]
    }
}

type TransformFn = dyn Fn(&mut FrameBatch) -> Result<()> + Send + Sync;

/// A named, injectable batch transform.
#[derive(Clone)]
pub struct CustomFilter {
    pub name: String,
    transform: Arc<TransformFn>,
}

impl CustomFilter {
    pub fn new(
        name: impl Into<String>,
        transform: impl Fn(&mut FrameBatch) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            transform: Arc::new(transform),
        }
    }
}

impl fmt::Debug for CustomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomFilter").field("name", &self.name).finish()
    }
}

impl PartialEq for CustomFilter {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Arc::ptr_eq(&self.transform, &other.transform)
    }
}

/// One step of a filter pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// 1 where the value exceeds the level, else 0.
    Threshold(Threshold),
    /// Logistic squashing around 0.5.
    SoftThreshold(SoftThreshold),
    /// 1 where `floor(value / width)` is odd: periodic binary banding.
    Comb(Comb),
    Invert,
    /// Plays the video backwards. Values are untouched.
    Reverse,
    /// Per-frame Gaussian smoothing with periodic boundaries.
    Blur(Blur),
    /// `(value mod width) / width`: sawtooth banding.
    Wood(Wood),
    /// Folds values around 0.5.
    Center,
    Photodiode(Photodiode),
    PhotodiodeIbl(IblMarker),
    Custom(CustomFilter),
}

impl Filter {
    /// Builds a filter from its name and positional arguments.
    pub fn from_parts(name: &str, args: &[f64]) -> Result<Self> {
        let arity = |expected: usize| -> Result<()> {
            if args.len() == expected {
                Ok(())
            } else {
                Err(ConfigError::FilterArguments {
                    filter: name.to_string(),
                    expected,
                    got: args.len(),
                }
                .into())
            }
        };
        let filter = match name {
            "threshold" => {
                arity(1)?;
                Filter::Threshold(Threshold { level: args[0] as f32 })
            }
            "softthresh" => {
                arity(1)?;
                Filter::SoftThreshold(SoftThreshold {
                    steepness: args[0] as f32,
                })
            }
            "comb" => {
                arity(1)?;
                Filter::Comb(Comb {
                    width: positive(name, args[0])?,
                })
            }
            "invert" => {
                arity(0)?;
                Filter::Invert
            }
            "reverse" => {
                arity(0)?;
                Filter::Reverse
            }
            "blur" => {
                arity(1)?;
                Filter::Blur(Blur {
                    sigma: sigma(name, args[0])?,
                })
            }
            "wood" => {
                arity(1)?;
                Filter::Wood(Wood {
                    width: positive(name, args[0])?,
                })
            }
            "center" => {
                arity(0)?;
                Filter::Center
            }
            "photodiode" => {
                arity(1)?;
                Filter::Photodiode(Photodiode::top_right(whole(name, args[0])?))
            }
            "photodiode_anywhere" => {
                arity(3)?;
                Filter::Photodiode(Photodiode {
                    anchor: MarkerAnchor::At {
                        x: whole(name, args[0])?,
                        y: whole(name, args[1])?,
                    },
                    size: whole(name, args[2])?,
                })
            }
            "photodiode_b2" => {
                arity(0)?;
                Filter::Photodiode(Photodiode::b2())
            }
            "photodiode_fusi" => {
                arity(0)?;
                Filter::Photodiode(Photodiode::fusi())
            }
            "photodiode_bscope" => {
                arity(0)?;
                Filter::Photodiode(Photodiode::bscope())
            }
            "photodiode_ibl" => {
                // Any arguments form an explicit 0/1 sequence.
                if args.is_empty() {
                    Filter::PhotodiodeIbl(IblMarker::default())
                } else {
                    Filter::PhotodiodeIbl(IblMarker {
                        sequence: args.iter().map(|&a| a > 0.5).collect(),
                    })
                }
            }
            other => return Err(StimulusError::UnknownFilter(other.to_string())),
        };
        Ok(filter)
    }

    pub fn name(&self) -> &str {
        match self {
            Filter::Threshold(_) => "threshold",
            Filter::SoftThreshold(_) => "softthresh",
            Filter::Comb(_) => "comb",
            Filter::Invert => "invert",
            Filter::Reverse => "reverse",
            Filter::Blur(_) => "blur",
            Filter::Wood(_) => "wood",
            Filter::Center => "center",
            Filter::Photodiode(_) => "photodiode",
            Filter::PhotodiodeIbl(_) => "photodiode_ibl",
            Filter::Custom(custom) => &custom.name,
        }
    }

    /// Whether this filter changes the emission order of frames.
    pub fn reorders_frames(&self) -> bool {
        matches!(self, Filter::Reverse)
    }

    /// Applies the filter to `batch`, whose first frame is frame `first_frame` of the video.
    pub fn apply(&self, batch: &mut FrameBatch, first_frame: usize) -> Result<()> {
        match self {
            Filter::Threshold(Threshold { level }) => {
                batch.map_in_place(|v| if v > *level { 1.0 } else { 0.0 })
            }
            Filter::SoftThreshold(SoftThreshold { steepness }) => {
                batch.map_in_place(|v| 1.0 / (1.0 + (-steepness * (v - 0.5)).exp()))
            }
            Filter::Comb(Comb { width }) => batch.map_in_place(|v| {
                if (v / width).floor().rem_euclid(2.0) == 1.0 { 1.0 } else { 0.0 }
            }),
            Filter::Invert => batch.map_in_place(|v| 1.0 - v),
            Filter::Reverse => {}
            Filter::Blur(Blur { sigma }) => gaussian_blur_wrap(batch, *sigma),
            Filter::Wood(Wood { width }) => batch.map_in_place(|v| v.rem_euclid(*width) / width),
            Filter::Center => batch.map_in_place(|v| 1.0 - (v - 0.5).abs() * 2.0),
            Filter::Photodiode(marker) => {
                let (rows, cols) = marker.region(batch.width, batch.height);
                fill_region(batch, rows, cols, |t| ((first_frame + t) % 2) as f32);
            }
            Filter::PhotodiodeIbl(marker) => {
                let (rows, cols) = IblMarker::region(batch.width, batch.height);
                fill_region(batch, rows, cols, |t| marker.bit(first_frame + t) as u8 as f32);
            }
            Filter::Custom(custom) => (custom.transform)(batch)?,
        }
        Ok(())
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Threshold(p) => write!(f, "threshold:{}", p.level),
            Filter::SoftThreshold(p) => write!(f, "softthresh:{}", p.steepness),
            Filter::Comb(p) => write!(f, "comb:{}", p.width),
            Filter::Blur(p) => write!(f, "blur:{}", p.sigma),
            Filter::Wood(p) => write!(f, "wood:{}", p.width),
            Filter::Photodiode(p) => match p.anchor {
                MarkerAnchor::At { x, y } => write!(f, "photodiode_anywhere:{x},{y},{}", p.size),
                _ => write!(f, "photodiode:{}", p.size),
            },
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for Filter {
    type Err = StimulusError;

    /// Parses `name` or `name:arg[,arg...]`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, args) = match s.split_once(':') {
            Some((name, rest)) => {
                let args = rest
                    .split(',')
                    .map(|a| a.trim().parse::<f64>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|_| ConfigError::MalformedFilter(s.to_string()))?;
                (name.trim(), args)
            }
            None => (s, Vec::new()),
        };
        if name.is_empty() {
            return Err(ConfigError::MalformedFilter(s.to_string()).into());
        }
        Filter::from_parts(name, &args)
    }
}

fn positive(filter: &str, value: f64) -> Result<f32> {
    if value > 0.0 {
        Ok(value as f32)
    } else {
        Err(ConfigError::MalformedFilter(format!("{filter}: width must be > 0, got {value}")).into())
    }
}

fn whole(filter: &str, value: f64) -> Result<usize> {
    if (0.0..=MAX_MARKER_EXTENT).contains(&value) && value.fract() == 0.0 {
        Ok(value as usize)
    } else {
        Err(ConfigError::MalformedFilter(format!(
            "{filter}: expected an integer in 0..={MAX_MARKER_EXTENT}, got {value}"
        ))
        .into())
    }
}

fn sigma(filter: &str, value: f64) -> Result<f32> {
    // Zero is allowed and leaves the frames untouched.
    if (0.0..=MAX_BLUR_SIGMA).contains(&value) {
        Ok(value as f32)
    } else {
        Err(ConfigError::MalformedFilter(format!(
            "{filter}: sigma must be in 0..={MAX_BLUR_SIGMA}, got {value}"
        ))
        .into())
    }
}

fn fill_region(
    batch: &mut FrameBatch,
    rows: std::ops::Range<usize>,
    cols: std::ops::Range<usize>,
    value_for_frame: impl Fn(usize) -> f32,
) {
    let width = batch.width;
    for (t, frame) in batch.frames_mut().enumerate() {
        let value = value_for_frame(t);
        for row in rows.clone() {
            frame[row * width + cols.start..row * width + cols.end].fill(value);
        }
    }
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (BLUR_TRUNCATE * sigma + 0.5) as usize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / denom).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for w in kernel.iter_mut() {
        *w /= sum;
    }
    kernel
}

/// Separable Gaussian smoothing of each frame with wrap-around boundaries.
fn gaussian_blur_wrap(batch: &mut FrameBatch, sigma: f32) {
    if sigma <= 0.0 || batch.frame_len() == 0 {
        return;
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as isize;
    let (width, height) = (batch.width, batch.height);
    let wrap = |i: isize, n: usize| i.rem_euclid(n as isize) as usize;
    let mut scratch = vec![0.0f32; width * height];

    for frame in batch.frames_mut() {
        // --- 1. Along rows ---
        for row in 0..height {
            let line = &frame[row * width..(row + 1) * width];
            for col in 0..width {
                scratch[row * width + col] = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| w * line[wrap(col as isize + k as isize - radius, width)])
                    .sum();
            }
        }
        // --- 2. Along columns ---
        for row in 0..height {
            for col in 0..width {
                frame[row * width + col] = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| {
                        w * scratch[wrap(row as isize + k as isize - radius, height) * width + col]
                    })
                    .sum();
            }
        }
    }
}

/// An ordered list of filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterPipeline {
    filters: Vec<Filter>,
}

impl FilterPipeline {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self { filters }
    }

    /// Parses each entry with `Filter::from_str`. The first unknown name aborts.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        let filters = specs
            .iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<Filter>>>()?;
        Ok(Self::new(filters))
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Applies every filter in list order.
    pub fn apply(&self, batch: &mut FrameBatch, first_frame: usize) -> Result<()> {
        apply_filters(batch, &self.filters, first_frame)
    }
}

impl From<Vec<Filter>> for FilterPipeline {
    fn from(filters: Vec<Filter>) -> Self {
        Self::new(filters)
    }
}

/// Applies `filters` to `batch` strictly in order.
pub fn apply_filters(batch: &mut FrameBatch, filters: &[Filter], first_frame: usize) -> Result<()> {
    for filter in filters {
        filter.apply(batch, first_frame)?;
    }
    Ok(())
}

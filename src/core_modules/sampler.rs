// THEORY:
// The noise sampler is the one primitive the whole engine is built around: a pure
// function from three coordinate axes plus parameters to a scalar field. The engine
// never looks inside it. It only relies on one property, determinism, because the
// cache treats "same parameters" as "same samples".
//
// `PerlinSampler` is the default implementation: fractal (multi-octave) improved
// Perlin noise on a periodic lattice. Each axis has its own repeat period so the
// field tiles seamlessly in x, y and t.

use crate::core_modules::frame_batch::FrameBatch;
use crate::error::{Result, StimulusError};

const LACUNARITY: f32 = 2.0;
/// Octaves whose amplitude falls below this cannot move an 8-bit output.
const MIN_AMPLITUDE: f32 = 0.004;

/// Everything a sampler needs to fill one batch.
#[derive(Debug, Clone, Copy)]
pub struct SampleRequest<'a> {
    /// Column coordinates, one per output column.
    pub x_coords: &'a [f32],
    /// Row coordinates, one per output row.
    pub y_coords: &'a [f32],
    /// Time coordinates, one per output frame.
    pub t_coords: &'a [f32],
    pub octaves: u32,
    pub persistence: f32,
    pub repeat_x: usize,
    pub repeat_y: usize,
    pub repeat_z: usize,
    pub seed: u32,
}

/// A deterministic coherent-noise field.
///
/// Implementations return a batch with `t_coords.len()` frames of
/// `y_coords.len()` rows by `x_coords.len()` columns.
pub trait NoiseSampler {
    fn sample(&self, request: &SampleRequest<'_>) -> Result<FrameBatch>;
}

impl<S: NoiseSampler + ?Sized> NoiseSampler for &S {
    fn sample(&self, request: &SampleRequest<'_>) -> Result<FrameBatch> {
        (**self).sample(request)
    }
}

const GRAD3: [[f32; 3]; 16] = [
    [1.0, 1.0, 0.0],
    [-1.0, 1.0, 0.0],
    [1.0, -1.0, 0.0],
    [-1.0, -1.0, 0.0],
    [1.0, 0.0, 1.0],
    [-1.0, 0.0, 1.0],
    [1.0, 0.0, -1.0],
    [-1.0, 0.0, -1.0],
    [0.0, 1.0, 1.0],
    [0.0, -1.0, 1.0],
    [0.0, 1.0, -1.0],
    [0.0, -1.0, -1.0],
    [1.0, 0.0, -1.0],
    [-1.0, 0.0, -1.0],
    [0.0, -1.0, 1.0],
    [0.0, 1.0, 1.0],
];

// Ken Perlin's reference permutation.
const PERMUTATION: [u8; 256] = [
    151, 160, 137, 91, 90, 15, 131, 13, 201, 95, 96, 53, 194, 233, 7, 225, 140, 36, 103, 30, 69,
    142, 8, 99, 37, 240, 21, 10, 23, 190, 6, 148, 247, 120, 234, 75, 0, 26, 197, 62, 94, 252, 219,
    203, 117, 35, 11, 32, 57, 177, 33, 88, 237, 149, 56, 87, 174, 20, 125, 136, 171, 168, 68, 175,
    74, 165, 71, 134, 139, 48, 27, 166, 77, 146, 158, 231, 83, 111, 229, 122, 60, 211, 133, 230,
    220, 105, 92, 41, 55, 46, 245, 40, 244, 102, 143, 54, 65, 25, 63, 161, 1, 216, 80, 73, 209, 76,
    132, 187, 208, 89, 18, 169, 200, 196, 135, 130, 116, 188, 159, 86, 164, 100, 109, 198, 173,
    186, 3, 64, 52, 217, 226, 250, 124, 123, 5, 202, 38, 147, 118, 126, 255, 82, 85, 212, 207, 206,
    59, 227, 47, 16, 58, 17, 182, 189, 28, 42, 223, 183, 170, 213, 119, 248, 152, 2, 44, 154, 163,
    70, 221, 153, 101, 155, 167, 43, 172, 9, 129, 22, 39, 253, 19, 98, 108, 110, 79, 113, 224, 232,
    178, 185, 112, 104, 218, 246, 97, 228, 251, 34, 242, 193, 238, 210, 144, 12, 191, 179, 162,
    241, 81, 51, 145, 235, 249, 14, 239, 107, 49, 192, 214, 31, 181, 199, 106, 157, 184, 84, 204,
    176, 115, 121, 50, 45, 127, 4, 150, 254, 138, 236, 205, 93, 222, 114, 67, 29, 24, 72, 243, 141,
    128, 195, 78, 66, 215, 61, 156, 180,
];

#[inline]
fn perm(i: usize) -> usize {
    PERMUTATION[i & 255] as usize
}

#[inline]
fn lerp(t: f32, a: f32, b: f32) -> f32 {
    a + t * (b - a)
}

#[inline]
fn fade(t: f32) -> f32 {
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

#[inline]
fn grad3(hash: usize, x: f32, y: f32, z: f32) -> f32 {
    let g = &GRAD3[hash & 15];
    x * g[0] + y * g[1] + z * g[2]
}

/// Single-octave periodic Perlin noise at a non-negative coordinate.
fn noise3(x: f32, y: f32, z: f32, repeat: [usize; 3], base: usize) -> f32 {
    let (i, j, k) = (x as usize, y as usize, z as usize);
    let ii = ((i + 1) % repeat[0] + base) & 255;
    let jj = ((j + 1) % repeat[1] + base) & 255;
    let kk = ((k + 1) % repeat[2] + base) & 255;
    let (i, j, k) = ((i + base) & 255, (j + base) & 255, (k + base) & 255);

    let x = x - x.trunc();
    let y = y - y.trunc();
    let z = z - z.trunc();
    let (fx, fy, fz) = (fade(x), fade(y), fade(z));

    let a = perm(i);
    let aa = perm(a + j);
    let ab = perm(a + jj);
    let b = perm(ii);
    let ba = perm(b + j);
    let bb = perm(b + jj);

    lerp(
        fz,
        lerp(
            fy,
            lerp(fx, grad3(perm(aa + k), x, y, z), grad3(perm(ba + k), x - 1.0, y, z)),
            lerp(
                fx,
                grad3(perm(ab + k), x, y - 1.0, z),
                grad3(perm(bb + k), x - 1.0, y - 1.0, z),
            ),
        ),
        lerp(
            fy,
            lerp(
                fx,
                grad3(perm(aa + kk), x, y, z - 1.0),
                grad3(perm(ba + kk), x - 1.0, y, z - 1.0),
            ),
            lerp(
                fx,
                grad3(perm(ab + kk), x, y - 1.0, z - 1.0),
                grad3(perm(bb + kk), x - 1.0, y - 1.0, z - 1.0),
            ),
        ),
    )
}

/// Fractal periodic Perlin noise.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerlinSampler;

impl PerlinSampler {
    pub fn new() -> Self {
        Self
    }

    fn fractal(x: f32, y: f32, z: f32, request: &SampleRequest<'_>, base: usize) -> f32 {
        let repeat = [request.repeat_x, request.repeat_y, request.repeat_z];
        if request.octaves == 1 {
            return noise3(x, y, z, repeat, base);
        }

        let mut freq = 1.0f32;
        let mut amp = 1.0f32;
        let mut max = 0.0f32;
        let mut total = 0.0f32;
        for _ in 0..request.octaves {
            let scaled = repeat.map(|r| ((r as f32 * freq) as usize).max(1));
            total += noise3(x * freq, y * freq, z * freq, scaled, base) * amp;
            max += amp;
            freq *= LACUNARITY;
            amp *= request.persistence;
            if amp < MIN_AMPLITUDE {
                break;
            }
        }
        total / max
    }

    fn validate(request: &SampleRequest<'_>) -> Result<()> {
        if request.seed > 255 {
            return Err(StimulusError::sampler(format!(
                "seed {} must be between 0 and 255",
                request.seed
            )));
        }
        if request.octaves == 0 {
            return Err(StimulusError::sampler("expected octaves value > 0"));
        }
        let axes = [
            ("x", request.x_coords, request.repeat_x),
            ("y", request.y_coords, request.repeat_y),
            ("t", request.t_coords, request.repeat_z),
        ];
        for (name, coords, repeat) in axes {
            if repeat == 0 {
                return Err(StimulusError::sampler(format!("{name} repeat period must be > 0")));
            }
            if let Some(bad) = coords.iter().find(|&&c| c < 0.0 || c >= repeat as f32) {
                return Err(StimulusError::sampler(format!(
                    "{name} coordinate {bad} outside the repeat period {repeat}"
                )));
            }
        }
        Ok(())
    }
}

impl NoiseSampler for PerlinSampler {
    fn sample(&self, request: &SampleRequest<'_>) -> Result<FrameBatch> {
        Self::validate(request)?;
        let width = request.x_coords.len();
        let height = request.y_coords.len();
        let base = request.seed as usize;

        let mut data = Vec::with_capacity(width * height * request.t_coords.len());
        for &t in request.t_coords {
            for &y in request.y_coords {
                for &x in request.x_coords {
                    data.push(Self::fractal(x, y, t, request, base));
                }
            }
        }
        Ok(FrameBatch::new(width, height, data))
    }
}

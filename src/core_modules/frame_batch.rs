// THEORY:
// The `FrameBatch` is the unit of data that flows through every layer of the engine.
// It is a time-contiguous slice of the noise volume: `frames` images of
// `height` rows by `width` columns, stored densely as f32.
//
// Key architectural principles:
// 1.  **Frame-major layout**: Frame `t` occupies one contiguous run of
//     `width * height` values, row-major inside the frame. Every filter works on
//     whole frames, so this keeps each frame a single slice.
// 2.  **Data Container**: Like a chunk of pixels, a `FrameBatch` is "dumb". It knows
//     its shape and how to summarize itself (min/max, frame means), but not where it
//     came from or which cache it belongs to.

/// A dense `(frames, height, width)` block of scalar samples.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBatch {
    /// Number of columns per frame (the x axis).
    pub width: usize,
    /// Number of rows per frame (the y axis).
    pub height: usize,
    /// Flattened samples, `frames * height * width` long.
    pub data: Vec<f32>,
}

impl FrameBatch {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        debug_assert!(width * height == 0 || data.len() % (width * height) == 0);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn zeros(width: usize, height: usize, frames: usize) -> Self {
        Self::new(width, height, vec![0.0; width * height * frames])
    }

    pub fn filled(width: usize, height: usize, frames: usize, value: f32) -> Self {
        Self::new(width, height, vec![value; width * height * frames])
    }

    /// Number of samples in a single frame.
    pub fn frame_len(&self) -> usize {
        self.width * self.height
    }

    pub fn frame_count(&self) -> usize {
        match self.frame_len() {
            0 => 0,
            n => self.data.len() / n,
        }
    }

    pub fn frame(&self, t: usize) -> &[f32] {
        let n = self.frame_len();
        &self.data[t * n..(t + 1) * n]
    }

    pub fn frame_mut(&mut self, t: usize) -> &mut [f32] {
        let n = self.frame_len();
        &mut self.data[t * n..(t + 1) * n]
    }

    pub fn frames(&self) -> std::slice::Chunks<'_, f32> {
        self.data.chunks(self.frame_len().max(1))
    }

    pub fn frames_mut(&mut self) -> std::slice::ChunksMut<'_, f32> {
        let n = self.frame_len().max(1);
        self.data.chunks_mut(n)
    }

    #[inline]
    pub fn index(&self, t: usize, row: usize, col: usize) -> usize {
        (t * self.height + row) * self.width + col
    }

    pub fn get(&self, t: usize, row: usize, col: usize) -> f32 {
        self.data[self.index(t, row, col)]
    }

    /// Applies `f` to every sample in place.
    pub fn map_in_place(&mut self, f: impl Fn(f32) -> f32) {
        for v in self.data.iter_mut() {
            *v = f(*v);
        }
    }

    /// Returns `(min, max)` of all samples, or `None` for an empty batch.
    pub fn min_max(&self) -> Option<(f32, f32)> {
        let mut iter = self.data.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }
}

// THEORY:
// Some filters do not change pixel values at all but the order in which frames are
// played. Rather than shuffling data, the assembler asks a `FrameOrder` where each
// generated frame should land in the output sequence and writes it there directly.
// A `FrameOrder` is always a bijection on `0..total`; composing two of them is again
// a bijection, so any number of order-changing filters can be stacked.

use crate::core_modules::filters::Filter;

/// Maps a generated frame index to its position in the output sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOrder {
    total: usize,
    reversed: bool,
}

impl FrameOrder {
    pub fn identity(total: usize) -> Self {
        Self {
            total,
            reversed: false,
        }
    }

    pub fn reversed(total: usize) -> Self {
        Self {
            total,
            reversed: true,
        }
    }

    /// The combined order of every order-changing filter in `filters`.
    pub fn for_filters(filters: &[Filter], total: usize) -> Self {
        filters
            .iter()
            .filter(|f| f.reorders_frames())
            .fold(Self::identity(total), |order, f| match f {
                Filter::Reverse => order.then(Self::reversed(total)),
                _ => order,
            })
    }

    /// Applies `self` first, then `next`.
    pub fn then(self, next: FrameOrder) -> Self {
        debug_assert_eq!(self.total, next.total);
        Self {
            total: self.total,
            reversed: self.reversed ^ next.reversed,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_identity(&self) -> bool {
        !self.reversed
    }

    #[inline]
    pub fn map(&self, i: usize) -> usize {
        debug_assert!(i < self.total);
        if self.reversed { self.total - 1 - i } else { i }
    }
}

/// Shorthand for `FrameOrder::for_filters`.
pub fn reindex(filters: &[Filter], total: usize) -> FrameOrder {
    FrameOrder::for_filters(filters, total)
}

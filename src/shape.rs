//! Three-dimensional shape descriptors.
//!
//! Samples are stored channel-major: channel `c` occupies one contiguous
//! `width * height` block, rows inside it are contiguous, so
//! `(x, y, c)` lives at `c * height * width + y * width + x`.

use crate::error::{KernelError, Result};
use core::fmt;

/// A `width x height x depth` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Shape3d {
    /// Columns.
    pub width: usize,
    /// Rows.
    pub height: usize,
    /// Channels.
    pub depth: usize,
}

impl Shape3d {
    /// Creates a shape, rejecting element counts that overflow `usize`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidParams`] on overflow.
    pub fn new(width: usize, height: usize, depth: usize) -> Result<Self> {
        width
            .checked_mul(height)
            .and_then(|a| a.checked_mul(depth))
            .ok_or_else(|| {
                KernelError::InvalidParams(format!(
                    "shape {width}x{height}x{depth} is too large"
                ))
            })?;
        Ok(Self {
            width,
            height,
            depth,
        })
    }

    /// Elements in one channel.
    #[must_use]
    pub const fn area(&self) -> usize {
        self.width * self.height
    }

    /// Elements in the whole shape.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// Flat offset of `(x, y, c)`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::IndexOutOfBounds`] if any coordinate is outside the shape.
    pub fn get_index(&self, x: usize, y: usize, c: usize) -> Result<usize> {
        if x >= self.width || y >= self.height || c >= self.depth {
            return Err(KernelError::IndexOutOfBounds {
                x,
                y,
                c,
                shape: self.to_string(),
            });
        }
        Ok(self.offset(x, y, c))
    }

    /// Unchecked flat offset, for loops whose bounds were validated up front.
    #[inline]
    pub(crate) const fn offset(&self, x: usize, y: usize, c: usize) -> usize {
        (c * self.height + y) * self.width + x
    }
}

impl fmt::Display for Shape3d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_channel_major() {
        let s = Shape3d::new(4, 3, 2).unwrap();
        assert_eq!(s.get_index(0, 0, 0).unwrap(), 0);
        assert_eq!(s.get_index(3, 0, 0).unwrap(), 3);
        assert_eq!(s.get_index(0, 1, 0).unwrap(), 4);
        assert_eq!(s.get_index(1, 2, 1).unwrap(), 12 + 8 + 1);
        assert_eq!(s.area(), 12);
        assert_eq!(s.size(), 24);
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let s = Shape3d::new(2, 2, 1).unwrap();
        assert!(matches!(
            s.get_index(2, 0, 0),
            Err(KernelError::IndexOutOfBounds { x: 2, .. })
        ));
        assert!(s.get_index(0, 0, 1).is_err());
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        assert!(Shape3d::new(usize::MAX, 2, 1).is_err());
    }

    #[test]
    fn displays_as_w_x_h_x_d() {
        assert_eq!(Shape3d::new(5, 6, 7).unwrap().to_string(), "5x6x7");
    }
}

//! Batch tensors.
//!
//! A [`Tensor`] is a batch of flat samples. Each sample is laid out
//! channel-major over a [`Shape3d`](crate::shape::Shape3d) that the tensor
//! itself does not store: the parameter block of the kernel that reads it is
//! the source of truth, and kernels check lengths with
//! [`Tensor::check_samples`] before touching the data.
//!
//! ## Design Highlights
//! - The element type [`Float`] is fixed at compile time (`f64` feature)
//! - Samples are separate allocations, so batch workers borrow disjoint memory
//! - The `tensor!` macro builds a batch from literal rows
//!
//! ## Example
//!
//! ```rust
//! use convkit::tensor;
//! let t = tensor![[1.0, 2.0], [3.0, 4.0]];
//! assert_eq!(t.sample_count(), 2);
//! assert_eq!(t.sample(1), &[3.0, 4.0]);
//! ```

use crate::error::{KernelError, Result};

/// Element type of every tensor.
#[cfg(not(feature = "f64"))]
pub type Float = f32;

/// Element type of every tensor.
#[cfg(feature = "f64")]
pub type Float = f64;

/// A batch of flat samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tensor {
    samples: Vec<Vec<Float>>,
}

impl Tensor {
    /// `count` samples of `len` zeros.
    #[must_use]
    pub fn zeros(count: usize, len: usize) -> Self {
        Self::filled(count, len, 0.0)
    }

    /// `count` samples of `len` copies of `value`.
    #[must_use]
    pub fn filled(count: usize, len: usize, value: Float) -> Self {
        Self {
            samples: vec![vec![value; len]; count],
        }
    }

    /// Wraps existing samples.
    #[must_use]
    pub const fn from_samples(samples: Vec<Vec<Float>>) -> Self {
        Self { samples }
    }

    /// Number of samples in the batch.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Sample `i`.
    ///
    /// # Panics
    /// Panics if `i` is out of range.
    #[must_use]
    pub fn sample(&self, i: usize) -> &[Float] {
        &self.samples[i]
    }

    /// Sample `i`, mutably.
    ///
    /// # Panics
    /// Panics if `i` is out of range.
    pub fn sample_mut(&mut self, i: usize) -> &mut [Float] {
        &mut self.samples[i]
    }

    /// All samples.
    #[must_use]
    pub fn samples(&self) -> &[Vec<Float>] {
        &self.samples
    }

    /// Every sample as a mutable slice, in batch order. Lengths stay fixed;
    /// use [`Self::resize`] to change them.
    pub fn iter_samples_mut(&mut self) -> impl Iterator<Item = &mut [Float]> {
        self.samples.iter_mut().map(Vec::as_mut_slice)
    }

    /// Per-sample vectors for batch workers. Callers must not change lengths.
    pub(crate) fn samples_mut(&mut self) -> &mut [Vec<Float>] {
        &mut self.samples
    }

    /// Consumes the tensor.
    #[must_use]
    pub fn into_samples(self) -> Vec<Vec<Float>> {
        self.samples
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: Float) {
        for s in &mut self.samples {
            s.fill(value);
        }
    }

    /// Reshapes to `count` samples of `len` elements.
    ///
    /// Existing allocations are reused; contents are unspecified afterwards
    /// except that newly created elements are zero.
    pub fn resize(&mut self, count: usize, len: usize) {
        self.samples.resize_with(count, Vec::new);
        for s in &mut self.samples {
            s.resize(len, 0.0);
        }
    }

    /// Checks that every sample has `len` elements and, when `count` is
    /// given, that there are exactly `count` samples.
    ///
    /// # Errors
    /// Returns [`KernelError::ShapeMismatch`] naming `what`.
    pub fn check_samples(&self, len: usize, count: Option<usize>, what: &'static str) -> Result<()> {
        if let Some(expected) = count {
            if self.samples.len() != expected {
                return Err(KernelError::ShapeMismatch {
                    what,
                    expected,
                    actual: self.samples.len(),
                });
            }
        }
        match self.samples.iter().find(|s| s.len() != len) {
            Some(bad) => Err(KernelError::ShapeMismatch {
                what,
                expected: len,
                actual: bad.len(),
            }),
            None => Ok(()),
        }
    }

    /// Element-wise sum of all samples, accumulated in sample order.
    ///
    /// Returns an empty vector for an empty batch.
    #[must_use]
    pub fn sum_samples(&self) -> Vec<Float> {
        let mut iter = self.samples.iter();
        let Some(first) = iter.next() else {
            return Vec::new();
        };
        let mut acc = first.clone();
        for s in iter {
            for (a, v) in acc.iter_mut().zip(s) {
                *a += *v;
            }
        }
        acc
    }
}

/// Builds a [`Tensor`] from literal samples.
///
/// # Example
/// ```
/// use convkit::tensor;
/// let t = tensor![[1.0, 2.0, 3.0]];
/// assert_eq!(t.sample(0).len(), 3);
/// ```
#[macro_export]
macro_rules! tensor {
    ($([ $( $x:expr ),* $(,)? ]),* $(,)?) => {
        $crate::tensors::Tensor::from_samples(vec![
            $( vec![ $( $x as $crate::tensors::Float ),* ] ),*
        ])
    };
}

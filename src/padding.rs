//! Pad / unpad transform for `same` convolutions.
//!
//! Under `same` padding every input channel is copied into the centre of a
//! zero-filled `in_padded` channel, offset by `(kernel_w / 2, kernel_h / 2)`.
//! [`Conv2dPadding::unpad_delta`] extracts that centre again, which is how a
//! gradient computed in the padded frame is handed back to the previous
//! layer. Under `valid` padding both directions are the identity.

use crate::error::Result;
use crate::parallel::for_each_mut;
use crate::params::{ConvParams, Padding};
use crate::shape::Shape3d;
use crate::tensors::{Float, Tensor};
use std::sync::Arc;

/// Padding helper bound to one parameter block.
#[derive(Debug, Clone)]
pub struct Conv2dPadding {
    params: Arc<ConvParams>,
}

impl Conv2dPadding {
    /// Binds the helper to `params`.
    #[must_use]
    pub const fn new(params: Arc<ConvParams>) -> Self {
        Self { params }
    }

    /// Parameter block in use.
    #[must_use]
    pub fn params(&self) -> &ConvParams {
        &self.params
    }

    /// Returns the tensor the kernels should read.
    ///
    /// Under `valid` this is `input` itself and `scratch` is left untouched;
    /// under `same`, `scratch` is filled with the padded copy and returned.
    ///
    /// # Errors
    /// Returns [`crate::KernelError::ShapeMismatch`] if a sample of `input`
    /// does not hold `in` elements.
    pub fn padded<'a>(
        &self,
        input: &'a Tensor,
        scratch: &'a mut Tensor,
        parallelize: bool,
    ) -> Result<&'a Tensor> {
        match self.params.pad_type() {
            Padding::Valid => {
                input.check_samples(self.params.input().size(), None, "conv input")?;
                Ok(input)
            }
            Padding::Same => {
                self.pad_input(input, scratch, parallelize)?;
                Ok(scratch)
            }
        }
    }

    /// Writes the padded form of `input` into `out`, resizing it.
    ///
    /// # Errors
    /// Returns [`crate::KernelError::ShapeMismatch`] before writing anything
    /// if a sample of `input` does not hold `in` elements.
    pub fn pad_input(&self, input: &Tensor, out: &mut Tensor, parallelize: bool) -> Result<()> {
        let src_shape = self.params.input();
        let dst_shape = self.params.in_padded();
        input.check_samples(src_shape.size(), None, "conv input")?;

        out.resize(input.sample_count(), dst_shape.size());
        if self.params.pad_type() == Padding::Valid {
            for (dst, src) in out.iter_samples_mut().zip(input.samples()) {
                dst.copy_from_slice(src);
            }
            return Ok(());
        }

        let (ox, oy) = self.params.pad_offset();
        for_each_mut(parallelize, out.samples_mut(), |sample, dst| {
            dst.fill(0.0);
            copy_block(&input.samples()[sample], src_shape, (0, 0), dst, dst_shape, (ox, oy), src_shape);
        });
        Ok(())
    }

    /// Writes the centre of every padded channel of `delta` into `out`,
    /// resizing it.
    ///
    /// # Errors
    /// Returns [`crate::KernelError::ShapeMismatch`] before writing anything
    /// if a sample of `delta` does not hold `in_padded` elements.
    pub fn unpad_delta(&self, delta: &Tensor, out: &mut Tensor, parallelize: bool) -> Result<()> {
        let src_shape = self.params.in_padded();
        let dst_shape = self.params.input();
        delta.check_samples(src_shape.size(), None, "padded delta")?;

        out.resize(delta.sample_count(), dst_shape.size());
        if self.params.pad_type() == Padding::Valid {
            for (dst, src) in out.iter_samples_mut().zip(delta.samples()) {
                dst.copy_from_slice(src);
            }
            return Ok(());
        }

        let (ox, oy) = self.params.pad_offset();
        for_each_mut(parallelize, out.samples_mut(), |sample, dst| {
            copy_block(&delta.samples()[sample], src_shape, (ox, oy), dst, dst_shape, (0, 0), dst_shape);
        });
        Ok(())
    }
}

/// Copies a `block.width x block.height` window of every channel.
fn copy_block(
    src: &[Float],
    src_shape: Shape3d,
    src_origin: (usize, usize),
    dst: &mut [Float],
    dst_shape: Shape3d,
    dst_origin: (usize, usize),
    block: Shape3d,
) {
    for c in 0..block.depth {
        for y in 0..block.height {
            let s = src_shape.offset(src_origin.0, src_origin.1 + y, c);
            let d = dst_shape.offset(dst_origin.0, dst_origin.1 + y, c);
            dst[d..d + block.width].copy_from_slice(&src[s..s + block.width]);
        }
    }
}

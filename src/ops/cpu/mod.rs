//! CPU convolution kernels.
//!
//! - [`conv2d`]: the reference kernels every other engine must agree with
//! - [`simd`]: vector helpers and the 5x5 specialisation used by `Avx`
//! - [`gemm`]: the im2col + GEMM lowering used by `Nnpack` (forward only)
//!
//! All kernels here assume their slots were validated by the caller and
//! iterate the batch through [`crate::parallel`].

pub mod conv2d;
pub mod gemm;
pub mod simd;

use crate::tensors::{Float, Tensor};

/// Mutable gradient slices of one sample.
///
/// Each batch worker owns one of these, which is what keeps weight and bias
/// gradients race-free: they are written per sample and reduced afterwards.
#[derive(Debug)]
pub struct SampleGrads<'t> {
    /// Input gradient, padded frame.
    pub prev_delta: &'t mut [Float],
    /// Weight gradient of this sample.
    pub dw: &'t mut [Float],
    /// Bias gradient of this sample, absent without bias.
    pub db: Option<&'t mut [Float]>,
}

/// Zips per-sample gradient tensors into per-worker bundles.
pub fn sample_grads<'t>(
    prev_delta: &'t mut Tensor,
    dw: &'t mut Tensor,
    db: Option<&'t mut Tensor>,
) -> Vec<SampleGrads<'t>> {
    let n = prev_delta.sample_count();
    let mut dbs: Vec<Option<&'t mut [Float]>> = match db {
        Some(db) => db.iter_samples_mut().map(Some).collect(),
        None => Vec::new(),
    };
    dbs.resize_with(n, || None);

    prev_delta
        .iter_samples_mut()
        .zip(dw.iter_samples_mut())
        .zip(dbs)
        .map(|((prev_delta, dw), db)| SampleGrads { prev_delta, dw, db })
        .collect()
}

//! Utilities to approximate equality of floating point values.
//!
//! Engines reassociate sums differently, so cross-engine results are compared
//! with a tolerance scaled by the magnitude of the operands rather than
//! bit-for-bit.

use crate::tensors::{Float, Tensor};

/// Default relative tolerance for cross-engine agreement.
pub const ENGINE_TOLERANCE: Float = 1e-4;

/// `|a - b| <= tol * max(1, |a|, |b|)`.
#[must_use]
pub fn rel_eq(a: Float, b: Float, tol: Float) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= tol * scale
}

/// Largest `|a - b| / max(1, |a|, |b|)` over two equally long slices.
#[must_use]
pub fn max_rel_diff(a: &[Float], b: &[Float]) -> Float {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs() / x.abs().max(y.abs()).max(1.0))
        .fold(0.0, Float::max)
}

/// Element-wise [`rel_eq`] over two batches of identical layout.
#[must_use]
pub fn tensors_rel_eq(a: &Tensor, b: &Tensor, tol: Float) -> bool {
    a.sample_count() == b.sample_count()
        && a.samples().iter().zip(b.samples()).all(|(x, y)| {
            x.len() == y.len() && x.iter().zip(y).all(|(&p, &q)| rel_eq(p, q, tol))
        })
}

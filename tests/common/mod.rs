#![allow(dead_code)]

use convkit::Float;
use convkit::tensors::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `count` samples of `len` values drawn uniformly from `[-1, 1)`.
pub fn random_tensor(rng: &mut StdRng, count: usize, len: usize) -> Tensor {
    Tensor::from_samples(
        (0..count)
            .map(|_| (0..len).map(|_| rng.random_range(-1.0..1.0) as Float).collect())
            .collect(),
    )
}

/// `sum(out * r)` accumulated in `f64`.
pub fn weighted_sum(out: &Tensor, r: &Tensor) -> f64 {
    out.samples()
        .iter()
        .flatten()
        .zip(r.samples().iter().flatten())
        .map(|(&a, &b)| f64::from(a) * f64::from(b))
        .sum()
}

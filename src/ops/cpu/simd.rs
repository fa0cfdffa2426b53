//! SIMD ("avx") convolution kernels.
//!
//! The vector helpers [`dot`], [`axpy`] and [`sum`] use AVX2 intrinsics when
//! the crate is built with the `simd` feature for an AVX2 target with `f32`
//! elements, and an 8-lane portable loop otherwise.
//!
//! Only 5x5 kernels take the specialised path; every other kernel size goes
//! to the reference kernels in [`super::conv2d`]. The specialised path
//! reassociates sums, so it agrees with the reference within floating-point
//! tolerance rather than bit-for-bit.
//!
//! ## Safety
//!
//! - Intrinsics are only compiled in when `target_feature = "avx2"` is set
//!   at build time, so no runtime detection is needed
//! - All loads are unaligned and bounded by the slice lengths

use super::{SampleGrads, conv2d};
use crate::parallel::for_each_mut;
use crate::params::ConvParams;
use crate::tensors::{Float, Tensor};

#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2", not(feature = "f64")))]
use core::arch::x86_64::*;

const LANES: usize = 8;
const K: usize = 5;

/// Whether the specialised path handles `params`.
#[must_use]
pub fn is_applicable(params: &ConvParams) -> bool {
    let w = params.weight();
    w.width == K && w.height == K
}

/// Forward pass, specialised for 5x5 kernels.
pub fn forward(
    params: &ConvParams,
    input: &Tensor,
    weight: &[Float],
    bias: &[Float],
    out: &mut Tensor,
    parallelize: bool,
) {
    if !is_applicable(params) {
        log::debug!(
            "avx conv2d forward: {}x{} kernel, using reference kernel",
            params.weight().width,
            params.weight().height
        );
        conv2d::forward(params, input, weight, bias, out, parallelize);
        return;
    }
    for_each_mut(parallelize, out.samples_mut(), |sample, a| {
        forward_sample_5x5(params, input.sample(sample), weight, bias, a);
    });
}

/// Backward pass, specialised for 5x5 kernels.
pub fn backward(
    params: &ConvParams,
    prev_out: &Tensor,
    weight: &[Float],
    curr_delta: &Tensor,
    grads: &mut [SampleGrads<'_>],
    parallelize: bool,
) {
    if !is_applicable(params) {
        log::debug!(
            "avx conv2d backward: {}x{} kernel, using reference kernel",
            params.weight().width,
            params.weight().height
        );
        conv2d::backward(params, prev_out, weight, curr_delta, grads, parallelize);
        return;
    }
    for_each_mut(parallelize, grads, |sample, g| {
        backward_sample_5x5(params, prev_out.sample(sample), weight, curr_delta.sample(sample), g);
    });
}

fn forward_sample_5x5(params: &ConvParams, input: &[Float], weight: &[Float], bias: &[Float], out: &mut [Float]) {
    let in_depth = params.input().depth;
    let ip = params.in_padded();
    let os = params.output();
    let ws = params.weight();
    let (w_stride, h_stride) = (params.w_stride(), params.h_stride());

    // 1x1 output over a 5x5 frame: each window is a whole contiguous channel.
    if os.width == 1 && os.height == 1 && ip.width == K && ip.height == K {
        for o in 0..os.depth {
            let mut acc: Float = 0.0;
            for inc in 0..in_depth {
                if !params.table().is_connected(o, inc) {
                    continue;
                }
                let pw = &weight[ws.offset(0, 0, in_depth * o + inc)..][..K * K];
                let pi = &input[ip.offset(0, 0, inc)..][..K * K];
                acc += dot(pw, pi);
            }
            if params.has_bias() {
                acc += bias[o];
            }
            out[o] += acc;
        }
        return;
    }

    for o in 0..os.depth {
        let pa = &mut out[os.offset(0, 0, o)..][..os.area()];
        for inc in 0..in_depth {
            if !params.table().is_connected(o, inc) {
                continue;
            }
            let pw = &weight[ws.offset(0, 0, in_depth * o + inc)..][..K * K];
            let pi = &input[ip.offset(0, 0, inc)..][..ip.area()];
            let rows: [&[Float]; K] = core::array::from_fn(|r| &pw[r * K..][..K]);

            for y in 0..os.height {
                let line = y * h_stride * ip.width;
                for x in 0..os.width {
                    let origin = line + x * w_stride;
                    let mut sum: Float = 0.0;
                    for (wy, wrow) in rows.iter().enumerate() {
                        sum += dot5(wrow, &pi[origin + wy * ip.width..][..K]);
                    }
                    pa[y * os.width + x] += sum;
                }
            }
        }
        if params.has_bias() {
            let b = bias[o];
            pa.iter_mut().for_each(|v| *v += b);
        }
    }
}

fn backward_sample_5x5(
    params: &ConvParams,
    prev_out: &[Float],
    weight: &[Float],
    curr_delta: &[Float],
    g: &mut SampleGrads<'_>,
) {
    let in_depth = params.input().depth;
    let ip = params.in_padded();
    let os = params.output();
    let ws = params.weight();
    let (w_stride, h_stride) = (params.w_stride(), params.h_stride());

    // delta propagation
    for inc in 0..in_depth {
        for outc in 0..os.depth {
            if !params.table().is_connected(outc, inc) {
                continue;
            }
            let pw = &weight[ws.offset(0, 0, in_depth * outc + inc)..][..K * K];
            let src = &curr_delta[os.offset(0, 0, outc)..][..os.area()];
            let dst = &mut g.prev_delta[ip.offset(0, 0, inc)..][..ip.area()];
            for y in 0..os.height {
                for x in 0..os.width {
                    let d = src[y * os.width + x];
                    let origin = y * h_stride * ip.width + x * w_stride;
                    for wy in 0..K {
                        axpy(d, &pw[wy * K..][..K], &mut dst[origin + wy * ip.width..][..K]);
                    }
                }
            }
        }
    }

    // weight gradient
    for inc in 0..in_depth {
        for outc in 0..os.depth {
            if !params.table().is_connected(outc, inc) {
                continue;
            }
            let delta = &curr_delta[os.offset(0, 0, outc)..][..os.area()];
            let kernel = &mut g.dw[ws.offset(0, 0, in_depth * outc + inc)..][..K * K];
            for wy in 0..K {
                for wx in 0..K {
                    let prevo = &prev_out[ip.offset(wx, wy, inc)..];
                    let mut acc: Float = 0.0;
                    for y in 0..os.height {
                        let row = &prevo[y * h_stride * ip.width..];
                        let drow = &delta[y * os.width..][..os.width];
                        acc += if w_stride == 1 {
                            dot(&row[..os.width], drow)
                        } else {
                            drow.iter()
                                .enumerate()
                                .fold(0.0, |s, (x, d)| s + row[x * w_stride] * d)
                        };
                    }
                    kernel[wy * K + wx] += acc;
                }
            }
        }
    }

    // bias gradient
    if let Some(db) = g.db.as_deref_mut() {
        for (outc, acc) in db.iter_mut().enumerate().take(os.depth) {
            *acc += sum(&curr_delta[os.offset(0, 0, outc)..][..os.area()]);
        }
    }
}

#[inline]
fn dot5(w: &[Float], i: &[Float]) -> Float {
    w[0] * i[0] + w[1] * i[1] + w[2] * i[2] + w[3] * i[3] + w[4] * i[4]
}

/// `sum(a[i] * b[i])` over the shorter of the two slices.
#[must_use]
pub fn dot(a: &[Float], b: &[Float]) -> Float {
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2", not(feature = "f64")))]
    {
        let mut idx = 0;
        // SAFETY: every load reads LANES elements starting at idx, and idx + LANES <= n.
        let mut acc = unsafe { _mm256_setzero_ps() };
        while idx + LANES <= n {
            unsafe {
                let va = _mm256_loadu_ps(a.as_ptr().add(idx));
                let vb = _mm256_loadu_ps(b.as_ptr().add(idx));
                acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
            }
            idx += LANES;
        }
        let mut lanes = [0.0f32; LANES];
        unsafe { _mm256_storeu_ps(lanes.as_mut_ptr(), acc) };
        let mut total: f32 = lanes.iter().sum();
        for l in idx..n {
            total += a[l] * b[l];
        }
        total
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2", not(feature = "f64"))))]
    {
        let mut lanes = [0.0 as Float; LANES];
        let ca = a.chunks_exact(LANES);
        let cb = b.chunks_exact(LANES);
        let (ra, rb) = (ca.remainder(), cb.remainder());
        for (xa, xb) in ca.zip(cb) {
            for l in 0..LANES {
                lanes[l] += xa[l] * xb[l];
            }
        }
        let mut total: Float = lanes.iter().sum();
        for (x, y) in ra.iter().zip(rb) {
            total += x * y;
        }
        total
    }
}

/// `y[i] += alpha * x[i]` over the shorter of the two slices.
pub fn axpy(alpha: Float, x: &[Float], y: &mut [Float]) {
    let n = x.len().min(y.len());
    let (x, y) = (&x[..n], &mut y[..n]);

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2", not(feature = "f64")))]
    {
        let mut idx = 0;
        // SAFETY: loads and stores touch idx..idx + LANES, which is within n.
        unsafe {
            let va = _mm256_set1_ps(alpha);
            while idx + LANES <= n {
                let vx = _mm256_loadu_ps(x.as_ptr().add(idx));
                let vy = _mm256_loadu_ps(y.as_ptr().add(idx));
                _mm256_storeu_ps(y.as_mut_ptr().add(idx), _mm256_add_ps(vy, _mm256_mul_ps(va, vx)));
                idx += LANES;
            }
        }
        for l in idx..n {
            y[l] += alpha * x[l];
        }
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2", not(feature = "f64"))))]
    {
        for (yv, xv) in y.iter_mut().zip(x) {
            *yv += alpha * xv;
        }
    }
}

/// Sum of all elements.
#[must_use]
pub fn sum(a: &[Float]) -> Float {
    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2", not(feature = "f64")))]
    {
        let n = a.len();
        let mut idx = 0;
        // SAFETY: each load reads idx..idx + LANES, which is within n.
        let mut acc = unsafe { _mm256_setzero_ps() };
        while idx + LANES <= n {
            unsafe {
                acc = _mm256_add_ps(acc, _mm256_loadu_ps(a.as_ptr().add(idx)));
            }
            idx += LANES;
        }
        let mut lanes = [0.0f32; LANES];
        unsafe { _mm256_storeu_ps(lanes.as_mut_ptr(), acc) };
        lanes.iter().sum::<f32>() + a[idx..].iter().sum::<f32>()
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2", not(feature = "f64"))))]
    {
        let mut lanes = [0.0 as Float; LANES];
        let chunks = a.chunks_exact(LANES);
        let rest = chunks.remainder();
        for c in chunks {
            for l in 0..LANES {
                lanes[l] += c[l];
            }
        }
        lanes.iter().sum::<Float>() + rest.iter().sum::<Float>()
    }
}

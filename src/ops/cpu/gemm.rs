//! im2col + GEMM lowering, bound to the `Nnpack` engine.
//!
//! Inference only. Each input channel is unrolled into a
//! `(kernel_h * kernel_w) x out_area` column matrix, and every connected
//! output channel is accumulated as `W[o, inc] * cols`, one rank-1 update per
//! kernel tap.

use super::simd::axpy;
use crate::parallel::for_each_mut;
use crate::params::ConvParams;
use crate::tensors::{Float, Tensor};

/// Forward pass over a batch already in the padded frame.
pub fn forward(
    params: &ConvParams,
    input: &Tensor,
    weight: &[Float],
    bias: &[Float],
    out: &mut Tensor,
    parallelize: bool,
) {
    for_each_mut(parallelize, out.samples_mut(), |sample, a| {
        let mut cols = vec![0.0; params.weight().area() * params.output().area()];
        forward_sample(params, input.sample(sample), weight, bias, a, &mut cols);
    });
}

fn forward_sample(
    params: &ConvParams,
    input: &[Float],
    weight: &[Float],
    bias: &[Float],
    out: &mut [Float],
    cols: &mut [Float],
) {
    let in_depth = params.input().depth;
    let ip = params.in_padded();
    let os = params.output();
    let ws = params.weight();
    let area = os.area();

    for inc in 0..in_depth {
        if !(0..os.depth).any(|o| params.table().is_connected(o, inc)) {
            continue;
        }
        im2col(params, &input[ip.offset(0, 0, inc)..][..ip.area()], cols);

        for o in 0..os.depth {
            if !params.table().is_connected(o, inc) {
                continue;
            }
            let pw = &weight[ws.offset(0, 0, in_depth * o + inc)..][..ws.area()];
            let pa = &mut out[os.offset(0, 0, o)..][..area];
            for (tap, &w) in pw.iter().enumerate() {
                axpy(w, &cols[tap * area..][..area], pa);
            }
        }
    }

    if params.has_bias() {
        for o in 0..os.depth {
            let b = bias[o];
            out[os.offset(0, 0, o)..][..area].iter_mut().for_each(|v| *v += b);
        }
    }
}

/// Unrolls one padded channel; row `wy * kernel_w + wx` holds the input
/// pixel under that tap for every output position.
fn im2col(params: &ConvParams, channel: &[Float], cols: &mut [Float]) {
    let ip = params.in_padded();
    let os = params.output();
    let ws = params.weight();
    let (w_stride, h_stride) = (params.w_stride(), params.h_stride());
    let area = os.area();

    for wy in 0..ws.height {
        for wx in 0..ws.width {
            let row = &mut cols[(wy * ws.width + wx) * area..][..area];
            for y in 0..os.height {
                let src = (y * h_stride + wy) * ip.width + wx;
                let dst = &mut row[y * os.width..][..os.width];
                if w_stride == 1 {
                    dst.copy_from_slice(&channel[src..][..os.width]);
                } else {
                    for (x, d) in dst.iter_mut().enumerate() {
                        *d = channel[src + x * w_stride];
                    }
                }
            }
        }
    }
}

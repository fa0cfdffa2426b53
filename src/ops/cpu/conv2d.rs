//! Reference ("internal") convolution kernels.
//!
//! Every function here is additive: outputs and gradients are accumulated
//! into, never overwritten. The reduction order within a sample is fixed
//! (output channel, input channel, row, column, kernel window), so a
//! sequential run is bit-for-bit reproducible.

use super::SampleGrads;
use crate::parallel::for_each_mut;
use crate::params::ConvParams;
use crate::tensors::{Float, Tensor};

/// Forward pass over a batch whose samples are already in the padded frame.
pub fn forward(
    params: &ConvParams,
    input: &Tensor,
    weight: &[Float],
    bias: &[Float],
    out: &mut Tensor,
    parallelize: bool,
) {
    for_each_mut(parallelize, out.samples_mut(), |sample, a| {
        forward_sample(params, input.sample(sample), weight, bias, a);
    });
}

/// Forward pass for one sample.
pub fn forward_sample(params: &ConvParams, input: &[Float], weight: &[Float], bias: &[Float], out: &mut [Float]) {
    let in_depth = params.input().depth;
    let ip = params.in_padded();
    let os = params.output();
    let ws = params.weight();
    let (w_stride, h_stride) = (params.w_stride(), params.h_stride());

    for o in 0..os.depth {
        let pa = &mut out[os.offset(0, 0, o)..][..os.area()];
        for inc in 0..in_depth {
            if !params.table().is_connected(o, inc) {
                continue;
            }
            let pw = &weight[ws.offset(0, 0, in_depth * o + inc)..][..ws.area()];
            let pi = &input[ip.offset(0, 0, inc)..][..ip.area()];

            for y in 0..os.height {
                for x in 0..os.width {
                    let origin = y * h_stride * ip.width + x * w_stride;
                    let mut sum: Float = 0.0;
                    for wy in 0..ws.height {
                        let wrow = &pw[wy * ws.width..][..ws.width];
                        let irow = &pi[origin + wy * ip.width..][..ws.width];
                        for (w, i) in wrow.iter().zip(irow) {
                            sum += w * i;
                        }
                    }
                    pa[y * os.width + x] += sum;
                }
            }
        }

        if params.has_bias() {
            let b = bias[o];
            for v in pa.iter_mut() {
                *v += b;
            }
        }
    }
}

/// Backward pass over a batch. `grads[s]` receives sample `s`.
pub fn backward(
    params: &ConvParams,
    prev_out: &Tensor,
    weight: &[Float],
    curr_delta: &Tensor,
    grads: &mut [SampleGrads<'_>],
    parallelize: bool,
) {
    for_each_mut(parallelize, grads, |sample, g| {
        backward_sample(params, prev_out.sample(sample), weight, curr_delta.sample(sample), g);
    });
}

/// Backward pass for one sample.
pub fn backward_sample(
    params: &ConvParams,
    prev_out: &[Float],
    weight: &[Float],
    curr_delta: &[Float],
    g: &mut SampleGrads<'_>,
) {
    propagate_delta(params, weight, curr_delta, g.prev_delta);
    accumulate_dw(params, prev_out, curr_delta, g.dw);
    if let Some(db) = g.db.as_deref_mut() {
        accumulate_db(params, curr_delta, db);
    }
}

/// Scatters the output delta back through the kernels into the padded frame.
pub(crate) fn propagate_delta(params: &ConvParams, weight: &[Float], curr_delta: &[Float], prev_delta: &mut [Float]) {
    let in_depth = params.input().depth;
    let ip = params.in_padded();
    let os = params.output();
    let ws = params.weight();
    let (w_stride, h_stride) = (params.w_stride(), params.h_stride());

    for inc in 0..in_depth {
        for outc in 0..os.depth {
            if !params.table().is_connected(outc, inc) {
                continue;
            }
            let pw = &weight[ws.offset(0, 0, in_depth * outc + inc)..][..ws.area()];
            let src = &curr_delta[os.offset(0, 0, outc)..][..os.area()];
            let dst = &mut prev_delta[ip.offset(0, 0, inc)..][..ip.area()];

            for y in 0..os.height {
                for x in 0..os.width {
                    let d = src[y * os.width + x];
                    let origin = y * h_stride * ip.width + x * w_stride;
                    for wy in 0..ws.height {
                        let wrow = &pw[wy * ws.width..][..ws.width];
                        let drow = &mut dst[origin + wy * ip.width..][..ws.width];
                        for (p, w) in drow.iter_mut().zip(wrow) {
                            *p += w * d;
                        }
                    }
                }
            }
        }
    }
}

/// Correlates the saved input with the output delta, one kernel tap at a time.
pub(crate) fn accumulate_dw(params: &ConvParams, prev_out: &[Float], curr_delta: &[Float], dw: &mut [Float]) {
    let in_depth = params.input().depth;
    let ip = params.in_padded();
    let os = params.output();
    let ws = params.weight();
    let (w_stride, h_stride) = (params.w_stride(), params.h_stride());

    for inc in 0..in_depth {
        for outc in 0..os.depth {
            if !params.table().is_connected(outc, inc) {
                continue;
            }
            let delta = &curr_delta[os.offset(0, 0, outc)..][..os.area()];

            for wy in 0..ws.height {
                for wx in 0..ws.width {
                    let prevo = &prev_out[ip.offset(wx, wy, inc)..];
                    let mut dst: Float = 0.0;

                    if w_stride > 1 {
                        for y in 0..os.height {
                            let prevo_row = y * ip.width * h_stride;
                            let delta_row = y * os.width;
                            for x in 0..os.width {
                                dst += prevo[prevo_row + x * w_stride] * delta[delta_row + x];
                            }
                        }
                    } else {
                        for y in 0..os.height {
                            dst += dot(
                                &prevo[y * ip.width * h_stride..][..os.width],
                                &delta[y * os.width..][..os.width],
                            );
                        }
                    }

                    dw[ws.offset(wx, wy, in_depth * outc + inc)] += dst;
                }
            }
        }
    }
}

/// Sums the output delta over each channel.
pub(crate) fn accumulate_db(params: &ConvParams, curr_delta: &[Float], db: &mut [Float]) {
    let os = params.output();
    for (outc, acc) in db.iter_mut().enumerate().take(os.depth) {
        let delta = &curr_delta[os.offset(0, 0, outc)..][..os.area()];
        *acc += delta.iter().fold(0.0, |s, v| s + v);
    }
}

#[inline]
fn dot(a: &[Float], b: &[Float]) -> Float {
    a.iter().zip(b).fold(0.0, |s, (x, y)| s + x * y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Padding;

    #[test]
    fn forward_sums_the_window_and_adds_bias() {
        let p = ConvParams::builder(3, 3, 1).kernel(2, 2).build().unwrap();
        let input = crate::tensor![[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]];
        let mut out = Tensor::zeros(1, 4);
        forward(&p, &input, &[1.0, 0.0, 0.0, 1.0], &[0.5], &mut out, false);
        // diagonal 2x2 kernel: top-left + bottom-right
        assert_eq!(out.sample(0), &[6.5, 8.5, 12.5, 14.5]);
    }

    #[test]
    fn forward_respects_stride() {
        let p = ConvParams::builder(4, 4, 1).kernel(2, 2).stride(2, 2).bias(false).build().unwrap();
        let input = Tensor::from_samples(vec![(0..16).map(|v| v as Float).collect()]);
        let mut out = Tensor::zeros(1, 4);
        forward(&p, &input, &[1.0; 4], &[], &mut out, false);
        assert_eq!(out.sample(0), &[10.0, 18.0, 42.0, 50.0]);
    }

    #[test]
    fn backward_of_single_tap_kernel_is_a_copy() {
        let p = ConvParams::builder(2, 2, 1)
            .kernel(1, 1)
            .padding(Padding::Valid)
            .build()
            .unwrap();
        let prev_out = crate::tensor![[1.0, 2.0, 3.0, 4.0]];
        let delta = crate::tensor![[0.5, 0.5, 1.0, 1.0]];
        let mut pd = vec![0.0; 4];
        let mut dw = vec![0.0; 1];
        let mut db = vec![0.0; 1];
        let mut g = SampleGrads {
            prev_delta: &mut pd,
            dw: &mut dw,
            db: Some(&mut db),
        };
        backward_sample(&p, prev_out.sample(0), &[2.0], delta.sample(0), &mut g);
        assert_eq!(pd, vec![1.0, 1.0, 2.0, 2.0]);
        assert_eq!(dw, vec![0.5 + 1.0 + 3.0 + 4.0]);
        assert_eq!(db, vec![3.0]);
    }
}

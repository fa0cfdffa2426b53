//! Engine-multiplexing convolution kernels and slot validation.
//!
//! [`Conv2dOp`] and [`Conv2dGradOp`] serve every CPU engine. They read the
//! engine from the context on each call, so one bound kernel can switch
//! between the reference, SIMD and GEMM strategies without being rebuilt.

use super::cpu::{self, SampleGrads, conv2d, gemm, simd};
use super::kernel::{OpKernel, OpKernelConstruction, OpKernelContext};
use crate::backend::Engine;
use crate::error::{KernelError, Result};
use crate::params::ConvParams;
use crate::tensors::{Float, Tensor};
use std::sync::Arc;

type ForwardFn = fn(&ConvParams, &Tensor, &[Float], &[Float], &mut Tensor, bool);
type BackwardFn = fn(&ConvParams, &Tensor, &[Float], &Tensor, &mut [SampleGrads<'_>], bool);

/// Validated forward inputs.
pub(crate) struct ForwardArgs<'a> {
    pub input: &'a Tensor,
    pub weight: &'a [Float],
    pub bias: &'a [Float],
}

impl<'a> ForwardArgs<'a> {
    pub(crate) fn from_context(params: &ConvParams, ctx: &OpKernelContext<'a>) -> Result<Self> {
        let input = ctx.input(0)?;
        input.check_samples(params.in_padded().size(), None, "conv input (padded)")?;
        let weight = single_sample(ctx.input(1)?, params.weight().size(), "conv weight")?;
        let bias = if params.has_bias() {
            single_sample(ctx.input(2)?, params.output().depth, "conv bias")?
        } else {
            &[]
        };
        Ok(Self {
            input,
            weight,
            bias,
        })
    }

    pub(crate) fn batch(&self) -> usize {
        self.input.sample_count()
    }
}

/// Validated backward inputs.
pub(crate) struct BackwardArgs<'a> {
    pub prev_out: &'a Tensor,
    pub weight: &'a [Float],
    pub curr_delta: &'a Tensor,
}

impl<'a> BackwardArgs<'a> {
    pub(crate) fn from_context(params: &ConvParams, ctx: &OpKernelContext<'a>) -> Result<Self> {
        let prev_out = ctx.input(0)?;
        prev_out.check_samples(params.in_padded().size(), None, "conv input (padded)")?;
        let weight = single_sample(ctx.input(1)?, params.weight().size(), "conv weight")?;
        let curr_delta = ctx.output_grad(0)?;
        curr_delta.check_samples(params.output().size(), Some(prev_out.sample_count()), "output delta")?;
        Ok(Self {
            prev_out,
            weight,
            curr_delta,
        })
    }

    pub(crate) fn batch(&self) -> usize {
        self.prev_out.sample_count()
    }
}

/// Gradient slots, validated and prepared.
///
/// `prev_delta` is resized and zeroed. `dw` and `db` are accumulators: an
/// empty tensor is sized and zeroed, a non-empty one must already hold one
/// sample per batch entry and is added into.
pub(crate) struct GradSlots<'c> {
    pub prev_delta: &'c mut Tensor,
    pub dw: &'c mut Tensor,
    pub db: Option<&'c mut Tensor>,
}

impl<'c> GradSlots<'c> {
    /// Checks the slots without touching them.
    #[cfg_attr(not(feature = "wgpu"), allow(dead_code))]
    pub(crate) fn validate(params: &ConvParams, ctx: &mut OpKernelContext<'_>, batch: usize) -> Result<()> {
        borrow_grad_slots(params, ctx, batch).map(|_| ())
    }

    pub(crate) fn from_context(params: &ConvParams, ctx: &'c mut OpKernelContext<'_>, batch: usize) -> Result<Self> {
        let (prev_delta, dw, mut db) = borrow_grad_slots(params, ctx, batch)?;
        prev_delta.resize(batch, params.in_padded().size());
        prev_delta.fill(0.0);
        init_accumulator(dw, batch, params.weight().size());
        if let Some(db) = db.as_deref_mut() {
            init_accumulator(db, batch, params.output().depth);
        }

        Ok(Self { prev_delta, dw, db })
    }

    pub(crate) fn per_sample(&mut self) -> Vec<SampleGrads<'_>> {
        cpu::sample_grads(self.prev_delta, self.dw, self.db.as_deref_mut())
    }
}

#[allow(clippy::type_complexity)]
fn borrow_grad_slots<'c>(
    params: &ConvParams,
    ctx: &'c mut OpKernelContext<'_>,
    batch: usize,
) -> Result<(&'c mut Tensor, &'c mut Tensor, Option<&'c mut Tensor>)> {
    let (prev_delta, dw, db) = if params.has_bias() {
        let [prev_delta, dw, db] = ctx.input_grads([0, 1, 2])?;
        (prev_delta, dw, Some(db))
    } else {
        let [prev_delta, dw] = ctx.input_grads([0, 1])?;
        (prev_delta, dw, None)
    };

    check_accumulator(dw, batch, params.weight().size(), "dW")?;
    if let Some(db) = db.as_deref() {
        check_accumulator(db, batch, params.output().depth, "db")?;
    }
    Ok((prev_delta, dw, db))
}

/// Resizes `out` to the batch and zeroes it.
pub(crate) fn prepare_output(out: &mut Tensor, batch: usize, len: usize) {
    out.resize(batch, len);
    out.fill(0.0);
}

fn single_sample<'a>(t: &'a Tensor, len: usize, what: &'static str) -> Result<&'a [Float]> {
    t.check_samples(len, Some(1), what)?;
    Ok(t.sample(0))
}

fn check_accumulator(t: &Tensor, batch: usize, len: usize, what: &'static str) -> Result<()> {
    if t.sample_count() == 0 {
        return Ok(());
    }
    t.check_samples(len, Some(batch), what)
}

fn init_accumulator(t: &mut Tensor, batch: usize, len: usize) {
    if t.sample_count() == 0 {
        t.resize(batch, len);
    }
}

/// Forward convolution for the `Internal`, `Avx` and `Nnpack` engines.
#[derive(Debug, Clone)]
pub struct Conv2dOp {
    params: Arc<ConvParams>,
}

impl Conv2dOp {
    /// Binds the kernel; no work is done here.
    #[must_use]
    pub fn new(ctor: &OpKernelConstruction) -> Self {
        Self {
            params: Arc::clone(ctor.params()),
        }
    }
}

impl OpKernel for Conv2dOp {
    fn name(&self) -> &'static str {
        "Conv2dOp"
    }

    fn compute(&self, ctx: &mut OpKernelContext<'_>) -> Result<()> {
        let engine = ctx.engine();
        let run: ForwardFn = match engine {
            Engine::Internal => conv2d::forward,
            Engine::Avx => simd::forward,
            Engine::Nnpack => gemm::forward,
            Engine::Libdnn | Engine::Opencl => {
                return Err(KernelError::UnsupportedEngine { op: "conv2d", engine });
            }
        };

        let args = ForwardArgs::from_context(&self.params, ctx)?;
        let parallelize = ctx.parallelize();
        let out = ctx.output(0)?;
        prepare_output(out, args.batch(), self.params.output().size());

        log::trace!("conv2d forward [{engine}] batch={}", args.batch());
        run(&self.params, args.input, args.weight, args.bias, out, parallelize);
        Ok(())
    }
}

/// Backward convolution for the `Internal` and `Avx` engines.
#[derive(Debug, Clone)]
pub struct Conv2dGradOp {
    params: Arc<ConvParams>,
}

impl Conv2dGradOp {
    /// Binds the kernel; no work is done here.
    #[must_use]
    pub fn new(ctor: &OpKernelConstruction) -> Self {
        Self {
            params: Arc::clone(ctor.params()),
        }
    }
}

impl OpKernel for Conv2dGradOp {
    fn name(&self) -> &'static str {
        "Conv2dGradOp"
    }

    fn compute(&self, ctx: &mut OpKernelContext<'_>) -> Result<()> {
        let engine = ctx.engine();
        let run: BackwardFn = match engine {
            Engine::Internal => conv2d::backward,
            Engine::Avx => simd::backward,
            Engine::Nnpack => {
                return Err(KernelError::NotImplemented {
                    op: "conv2d backward",
                    engine,
                });
            }
            Engine::Libdnn | Engine::Opencl => {
                return Err(KernelError::UnsupportedEngine {
                    op: "conv2d backward",
                    engine,
                });
            }
        };

        let args = BackwardArgs::from_context(&self.params, ctx)?;
        let parallelize = ctx.parallelize();
        let mut slots = GradSlots::from_context(&self.params, ctx, args.batch())?;
        let mut grads = slots.per_sample();

        log::trace!("conv2d backward [{engine}] batch={}", args.batch());
        run(&self.params, args.prev_out, args.weight, args.curr_delta, &mut grads, parallelize);
        Ok(())
    }
}

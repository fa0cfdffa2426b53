//! Convolution forward and backward kernels on WGPU.
//!
//! One invocation computes one output value, so there are no
//! cross-invocation writes: weight gradients come back per sample and the
//! bias gradient is summed on the host.
//!
//! Weights, bias and the connection table are uploaded once per call. The
//! batch goes up in chunks sized so that no buffer passes the device's
//! storage binding limit, and results are written to the context only after
//! every chunk has come back.

use super::{
    Binding, ComputeKernel, GpuContext, GpuFailure, lazy_kernel, result_buffer, samples_per_chunk, storage_buffer,
    uniform_buffer,
};
use crate::error::{KernelError, Result};
use crate::ops::conv2d::{BackwardArgs, ForwardArgs, GradSlots, prepare_output};
use crate::ops::cpu::conv2d::accumulate_db;
use crate::ops::dispatch::Device;
use crate::ops::kernel::{OpKernel, OpKernelConstruction, OpKernelContext};
use crate::params::ConvParams;
use crate::tensors::{Float, Tensor};
use std::sync::{Arc, OnceLock};

pub(crate) const FORWARD: &str = include_str!("shaders/conv2d_forward.wgsl");
pub(crate) const BACKWARD_INPUT: &str = include_str!("shaders/conv2d_backward_input.wgsl");
pub(crate) const BACKWARD_WEIGHT: &str = include_str!("shaders/conv2d_backward_weight.wgsl");

fn gpu_of(device: &Device) -> Result<&GpuContext> {
    match device {
        Device::Gpu(gpu) => Ok(gpu),
        Device::Cpu => Err(KernelError::UnsupportedConfiguration(
            "libdnn engine requires a GPU device".into(),
        )),
    }
}

/// Shape uniform shared by all three shaders.
fn dims(params: &ConvParams, batch: usize) -> Result<[u32; 12]> {
    let ip = params.in_padded();
    let os = params.output();
    let ws = params.weight();
    let values = [
        ip.width,
        ip.height,
        ip.depth,
        os.width,
        os.height,
        os.depth,
        ws.width,
        ws.height,
        params.w_stride(),
        params.h_stride(),
        usize::from(params.has_bias()),
        batch,
    ];
    let mut out = [0u32; 12];
    for (o, v) in out.iter_mut().zip(values) {
        *o = u32::try_from(v)
            .map_err(|_| KernelError::UnsupportedConfiguration(format!("dimension {v} does not fit in u32")))?;
    }
    Ok(out)
}

/// Connection table as `u32` flags indexed `[in * out_c + out]`.
fn table_flags(params: &ConvParams) -> Vec<u32> {
    let (in_c, out_c) = (params.input().depth, params.output().depth);
    let mut flags = Vec::with_capacity(in_c * out_c);
    for c in 0..in_c {
        for o in 0..out_c {
            flags.push(u32::from(params.table().is_connected(o, c)));
        }
    }
    flags
}

#[allow(clippy::unnecessary_cast)]
fn flatten(samples: &[Vec<Float>]) -> Vec<f32> {
    samples.iter().flatten().map(|&v| v as f32).collect()
}

#[allow(clippy::unnecessary_cast)]
fn narrow(v: &[Float]) -> Vec<f32> {
    v.iter().map(|&x| x as f32).collect()
}

/// Adds `data`, laid out sample after sample, into `t`.
fn scatter_add(t: &mut Tensor, data: &[f32]) {
    let len = t.samples().first().map_or(0, Vec::len);
    if len == 0 {
        return;
    }
    for (dst, src) in t.iter_samples_mut().zip(data.chunks_exact(len)) {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d += Float::from(s);
        }
    }
}

/// Forward convolution on the GPU.
#[derive(Debug)]
pub struct Conv2dGpuForwardOp {
    params: Arc<ConvParams>,
    device: Arc<Device>,
    kernel: OnceLock<ComputeKernel>,
}

impl Conv2dGpuForwardOp {
    /// Binds the kernel to the construction's device. Compilation is deferred
    /// to the first [`OpKernel::compute`].
    ///
    /// # Errors
    /// [`KernelError::UnsupportedConfiguration`] without a GPU device.
    pub fn new(ctor: &OpKernelConstruction) -> Result<Self> {
        let device = ctor
            .device()
            .cloned()
            .ok_or_else(|| KernelError::UnsupportedConfiguration("libdnn engine requires a GPU device".into()))?;
        gpu_of(&device)?;
        Ok(Self {
            params: Arc::clone(ctor.params()),
            device,
            kernel: OnceLock::new(),
        })
    }
}

impl OpKernel for Conv2dGpuForwardOp {
    fn name(&self) -> &'static str {
        "Conv2dGpuForwardOp"
    }

    fn compute(&self, ctx: &mut OpKernelContext<'_>) -> Result<()> {
        let gpu = gpu_of(&self.device)?;
        let params = &*self.params;
        let args = ForwardArgs::from_context(params, ctx)?;
        ctx.output(0)?;
        let batch = args.batch();
        let in_len = params.in_padded().size();
        let out_len = params.output().size();

        let mut values = Vec::with_capacity(batch * out_len);
        if batch > 0 && out_len > 0 {
            let table_flags = table_flags(params);
            let per_chunk = samples_per_chunk(
                gpu.storage_limit(),
                &[in_len, out_len],
                &[args.weight.len(), args.bias.len(), table_flags.len()],
            )?;
            let kernel = lazy_kernel(&self.kernel, || {
                ComputeKernel::build(
                    gpu,
                    "conv2d_forward",
                    FORWARD,
                    &[
                        Binding::Uniform,
                        Binding::Read,
                        Binding::Read,
                        Binding::Read,
                        Binding::Read,
                        Binding::ReadWrite,
                    ],
                )
            })?;
            let weight = storage_buffer(gpu, "weight", &narrow(args.weight));
            let bias = storage_buffer(gpu, "bias", &narrow(args.bias));
            let table = storage_buffer(gpu, "table", &table_flags);
            for chunk in args.input.samples().chunks(per_chunk) {
                let len = chunk.len() * out_len;
                let dims_buf = uniform_buffer(gpu, "dims", &dims(params, chunk.len())?);
                let input = storage_buffer(gpu, "input", &flatten(chunk));
                let output = result_buffer(gpu, "output", len);
                values.extend(kernel.run(gpu, &[&dims_buf, &input, &weight, &bias, &table, &output], &output, len)?);
            }
        }

        let out = ctx.output(0)?;
        prepare_output(out, batch, out_len);
        scatter_add(out, &values);
        log::trace!("conv2d forward [LibDNN] batch={batch}");
        Ok(())
    }
}

/// Kernels used by the backward pass.
#[derive(Debug)]
struct BackwardKernels {
    input: ComputeKernel,
    weight: ComputeKernel,
}

/// Backward convolution on the GPU.
#[derive(Debug)]
pub struct Conv2dGpuBackwardOp {
    params: Arc<ConvParams>,
    device: Arc<Device>,
    kernels: OnceLock<BackwardKernels>,
}

impl Conv2dGpuBackwardOp {
    /// Binds the kernel to the construction's device. Compilation is deferred
    /// to the first [`OpKernel::compute`].
    ///
    /// # Errors
    /// [`KernelError::UnsupportedConfiguration`] without a GPU device.
    pub fn new(ctor: &OpKernelConstruction) -> Result<Self> {
        let device = ctor
            .device()
            .cloned()
            .ok_or_else(|| KernelError::UnsupportedConfiguration("libdnn engine requires a GPU device".into()))?;
        gpu_of(&device)?;
        Ok(Self {
            params: Arc::clone(ctor.params()),
            device,
            kernels: OnceLock::new(),
        })
    }

    fn kernels(&self, gpu: &GpuContext) -> core::result::Result<&BackwardKernels, GpuFailure> {
        let bindings = [
            Binding::Uniform,
            Binding::Read,
            Binding::Read,
            Binding::Read,
            Binding::ReadWrite,
        ];
        lazy_kernel(&self.kernels, || {
            Ok(BackwardKernels {
                input: ComputeKernel::build(gpu, "conv2d_backward_input", BACKWARD_INPUT, &bindings)?,
                weight: ComputeKernel::build(gpu, "conv2d_backward_weight", BACKWARD_WEIGHT, &bindings)?,
            })
        })
    }
}

impl OpKernel for Conv2dGpuBackwardOp {
    fn name(&self) -> &'static str {
        "Conv2dGpuBackwardOp"
    }

    fn compute(&self, ctx: &mut OpKernelContext<'_>) -> Result<()> {
        let gpu = gpu_of(&self.device)?;
        let params = &*self.params;
        let args = BackwardArgs::from_context(params, ctx)?;
        let batch = args.batch();
        GradSlots::validate(params, ctx, batch)?;
        let in_len = params.in_padded().size();
        let out_len = params.output().size();
        let w_len = params.weight().size();

        let mut prev_delta = Vec::with_capacity(batch * in_len);
        let mut dw = Vec::with_capacity(batch * w_len);
        if batch > 0 {
            let table_flags = table_flags(params);
            let per_chunk = samples_per_chunk(
                gpu.storage_limit(),
                &[in_len, out_len, w_len],
                &[args.weight.len(), table_flags.len()],
            )?;
            let kernels = self.kernels(gpu)?;
            let weight = storage_buffer(gpu, "weight", &narrow(args.weight));
            let table = storage_buffer(gpu, "table", &table_flags);
            let chunks = args
                .prev_out
                .samples()
                .chunks(per_chunk)
                .zip(args.curr_delta.samples().chunks(per_chunk));
            for (inputs, deltas) in chunks {
                let n = inputs.len();
                let dims_buf = uniform_buffer(gpu, "dims", &dims(params, n)?);
                let input = storage_buffer(gpu, "input", &flatten(inputs));
                let delta = storage_buffer(gpu, "delta", &flatten(deltas));
                let pd_out = result_buffer(gpu, "prev_delta", n * in_len);
                let dw_out = result_buffer(gpu, "dw", n * w_len);
                prev_delta.extend(kernels.input.run(gpu, &[&dims_buf, &weight, &delta, &table, &pd_out], &pd_out, n * in_len)?);
                dw.extend(kernels.weight.run(gpu, &[&dims_buf, &input, &delta, &table, &dw_out], &dw_out, n * w_len)?);
            }
        }

        let slots = GradSlots::from_context(params, ctx, batch)?;
        scatter_add(slots.prev_delta, &prev_delta);
        scatter_add(slots.dw, &dw);
        if let Some(db) = slots.db {
            for (acc, delta) in db.iter_samples_mut().zip(args.curr_delta.samples()) {
                accumulate_db(params, delta, acc);
            }
        }
        log::trace!("conv2d backward [LibDNN] batch={batch}");
        Ok(())
    }
}

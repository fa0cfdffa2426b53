//! GPU ("libdnn") convolution kernels using WGPU.
//!
//! This module owns the GPU plumbing shared by the convolution kernels:
//! device acquisition, WGSL validation and compilation, buffer helpers and a
//! blocking dispatch routine. The kernels themselves live in [`conv2d`].
//!
//! A [`GpuContext`] is created explicitly and handed to the dispatcher as a
//! [`Device`](crate::ops::dispatch::Device); there is no hidden global
//! context. Shaders are compiled the first time a kernel computes, so a
//! layer that never runs on the GPU never touches the device.
//!
//! All GPU arithmetic is `f32`; with the `f64` feature values are narrowed on
//! upload and widened on readback.

pub mod conv2d;

use crate::error::KernelError;
use briny::prelude::*;
use std::sync::OnceLock;
use std::sync::mpsc;
use thiserror::Error;
use wgpu::util::DeviceExt;

/// Everything that can go wrong between the host and the device.
#[derive(Debug, Error)]
pub enum GpuFailure {
    /// No adapter matched the request.
    #[error("no usable wgpu adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    /// The adapter refused to open a device.
    #[error("wgpu device request refused: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    /// A WGSL source was rejected before compilation.
    #[error("shader `{0}` was rejected by the source checks")]
    Shader(String),
    /// Dispatch, polling or readback failed.
    #[error("wgpu runtime: {0}")]
    Runtime(String),
}

/// Holds the WGPU device and queue used for executing compute pipelines.
#[derive(Debug)]
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// Submission queue of the device.
    pub queue: wgpu::Queue,
    /// Adapter name, for logs.
    pub adapter_name: String,
}

impl GpuContext {
    /// Selects the default adapter and creates a device + queue.
    ///
    /// # Internals
    /// - Uses `pollster::block_on` to synchronously wait for async WGPU calls
    /// - Requests default limits and no optional features
    ///
    /// # Errors
    /// [`GpuFailure::Adapter`] or [`GpuFailure::Device`].
    pub fn new() -> Result<Self, GpuFailure> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("convkit"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;

        let adapter_name = adapter.get_info().name;
        log::debug!("wgpu device ready on adapter `{adapter_name}`");
        Ok(Self {
            device,
            queue,
            adapter_name,
        })
    }

    /// Largest buffer, in bytes, that can be both allocated and bound as storage.
    #[must_use]
    pub fn storage_limit(&self) -> u64 {
        let limits = self.device.limits();
        u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size)
    }
}

/// Upper bound on a shader source.
const MAX_SHADER_BYTES: usize = 64 * 1024;

/// Tokens no bundled shader needs.
const FORBIDDEN: [&str; 6] = ["#include", "import", "asm", "unsafe", "ptr", "std::"];

/// WGSL text that has not been checked yet.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;
        let bounded = src.len() <= MAX_SHADER_BYTES;
        let has_entry = src.contains("fn main");
        let clean = FORBIDDEN.iter().all(|token| !src.contains(token));
        if bounded && has_entry && clean {
            Ok(())
        } else {
            Err(ValidationError)
        }
    }
}

/// Checks a WGSL source and compiles it on `device`.
///
/// # Errors
/// [`GpuFailure::Shader`] if the source is rejected.
pub fn load_shader(device: &wgpu::Device, label: &str, source: &str) -> Result<wgpu::ShaderModule, GpuFailure> {
    WgslSource(source)
        .validate()
        .map_err(|_| GpuFailure::Shader(label.to_owned()))?;

    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

/// A compiled compute pipeline and its bind-group layout.
#[derive(Debug)]
pub(crate) struct ComputeKernel {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    label: &'static str,
}

/// Binding kinds, in binding-index order.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Binding {
    Uniform,
    Read,
    ReadWrite,
}

impl ComputeKernel {
    /// Compiles `source` with an entry point named `main`.
    pub(crate) fn build(
        gpu: &GpuContext,
        label: &'static str,
        source: &str,
        bindings: &[Binding],
    ) -> Result<Self, GpuFailure> {
        let module = load_shader(&gpu.device, label, source)?;

        let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
            .iter()
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupLayoutEntry {
                binding: i as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match b {
                        Binding::Uniform => wgpu::BufferBindingType::Uniform,
                        Binding::Read => wgpu::BufferBindingType::Storage { read_only: true },
                        Binding::ReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let layout = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        });
        let pipeline_layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });

        log::debug!("compiled wgpu pipeline `{label}`");
        Ok(Self {
            layout,
            pipeline,
            label,
        })
    }

    /// Runs one invocation per element of `result` and reads it back.
    ///
    /// `buffers` are bound in order; `result` must be the last of them.
    /// Blocks until the device is idle.
    pub(crate) fn run(
        &self,
        gpu: &GpuContext,
        buffers: &[&wgpu::Buffer],
        result: &wgpu::Buffer,
        len: usize,
    ) -> Result<Vec<f32>, GpuFailure> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let (groups_x, groups_y) = dispatch_grid(len, gpu.device.limits().max_compute_workgroups_per_dimension)
            .ok_or_else(|| GpuFailure::Runtime(format!("{}: {len} invocations exceed the dispatch limit", self.label)))?;

        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: b.as_entire_binding(),
            })
            .collect();
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.label),
            layout: &self.layout,
            entries: &entries,
        });

        let size = (len * std::mem::size_of::<f32>()) as u64;
        let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(self.label),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        encoder.copy_buffer_to_buffer(result, 0, &staging, 0, size);
        gpu.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        gpu.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| GpuFailure::Runtime(format!("device poll failed: {e:?}")))?;
        rx.recv()
            .map_err(|_| GpuFailure::Runtime("map callback dropped".into()))?
            .map_err(|e| GpuFailure::Runtime(format!("buffer map failed: {e:?}")))?;

        let out = {
            let data = slice.get_mapped_range();
            decode_f32(&data)?
        };
        staging.unmap();
        Ok(out)
    }
}

/// Workgroup size declared by every convolution shader.
pub(crate) const WORKGROUP_SIZE: usize = 64;

/// Workgroup counts `(x, y)` covering `len` invocations.
///
/// A single row is used while it fits `max_per_dim`; past that the groups
/// wrap into rows of `max_per_dim` and shaders recover the flat index as
/// `gid.y * groups.x * WORKGROUP_SIZE + gid.x`. `None` if `len` or the grid
/// does not fit a `u32` index.
pub(crate) fn dispatch_grid(len: usize, max_per_dim: u32) -> Option<(u32, u32)> {
    let len = u32::try_from(len).ok()?;
    if max_per_dim == 0 {
        return None;
    }
    let groups = len.div_ceil(WORKGROUP_SIZE as u32);
    if groups <= max_per_dim {
        return Some((groups, 1));
    }
    let rows = groups.div_ceil(max_per_dim);
    let invocations = u64::from(max_per_dim) * u64::from(rows) * WORKGROUP_SIZE as u64;
    (rows <= max_per_dim && invocations <= u64::from(u32::MAX)).then_some((max_per_dim, rows))
}

/// Largest number of samples that can go to the device in one dispatch.
///
/// `per_sample` lists the floats each batch-sized buffer holds per sample,
/// `fixed` the floats of buffers uploaded once. Every buffer must stay within
/// `limit` bytes and every dispatch within a `u32` index.
///
/// # Errors
/// [`KernelError::UnsupportedConfiguration`] if a fixed buffer, or a single
/// sample, is already over the limit.
pub(crate) fn samples_per_chunk(limit: u64, per_sample: &[usize], fixed: &[usize]) -> crate::error::Result<usize> {
    let bytes = |floats: usize| (floats as u64).saturating_mul(std::mem::size_of::<f32>() as u64);
    if let Some(&floats) = fixed.iter().find(|&&f| bytes(f) > limit) {
        return Err(KernelError::UnsupportedConfiguration(format!(
            "a buffer of {floats} values exceeds the device limit of {limit} bytes"
        )));
    }
    let widest = per_sample.iter().copied().max().unwrap_or(0);
    if widest == 0 {
        return Ok(usize::MAX);
    }
    let fit = (limit / bytes(widest)).min(u64::from(u32::MAX) / widest as u64);
    if fit == 0 {
        return Err(KernelError::UnsupportedConfiguration(format!(
            "one sample of {widest} values exceeds the device limit of {limit} bytes"
        )));
    }
    Ok(usize::try_from(fit).unwrap_or(usize::MAX))
}

/// Returns the kernel in `cell`, building it on first use.
pub(crate) fn lazy_kernel<'k, T>(
    cell: &'k OnceLock<T>,
    build: impl FnOnce() -> Result<T, GpuFailure>,
) -> Result<&'k T, GpuFailure> {
    if let Some(k) = cell.get() {
        return Ok(k);
    }
    let built = build()?;
    // A concurrent caller may have won; either value is equivalent.
    let _ = cell.set(built);
    cell.get().ok_or_else(|| GpuFailure::Runtime("kernel cache is empty".into()))
}

/// Uploads `data` as a read-only storage buffer. Empty data becomes one zero.
pub(crate) fn storage_buffer<T: Word>(gpu: &GpuContext, label: &str, data: &[T]) -> wgpu::Buffer {
    let pad = [T::default()];
    let contents = if data.is_empty() { &pad[..] } else { data };
    gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: &encode(contents),
        usage: wgpu::BufferUsages::STORAGE,
    })
}

/// Uploads `data` as a uniform buffer.
pub(crate) fn uniform_buffer<T: Word>(gpu: &GpuContext, label: &str, data: &[T]) -> wgpu::Buffer {
    gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: &encode(data),
        usage: wgpu::BufferUsages::UNIFORM,
    })
}

/// Allocates a writable result buffer of `len` floats.
pub(crate) fn result_buffer(gpu: &GpuContext, label: &str, len: usize) -> wgpu::Buffer {
    gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: (len.max(1) * std::mem::size_of::<f32>()) as u64,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

/// A 32-bit value the shaders read.
pub(crate) trait Word: Copy + Default {
    /// Native-endian bytes, as the device expects them.
    fn to_word(self) -> [u8; 4];
}

impl Word for f32 {
    fn to_word(self) -> [u8; 4] {
        self.to_ne_bytes()
    }
}

impl Word for u32 {
    fn to_word(self) -> [u8; 4] {
        self.to_ne_bytes()
    }
}

fn encode<T: Word>(data: &[T]) -> Vec<u8> {
    data.iter().flat_map(|v| v.to_word()).collect()
}

fn decode_f32(data: &[u8]) -> Result<Vec<f32>, GpuFailure> {
    const WIDTH: usize = std::mem::size_of::<f32>();
    if data.len() % WIDTH != 0 {
        return Err(GpuFailure::Runtime(format!(
            "readback of {} bytes is not a whole number of f32 values",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(WIDTH)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

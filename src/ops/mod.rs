//! # Operator Kernels
//!
//! This module defines the kernel contract and dispatches convolution to
//! the available compute backends.
//!
//! ## Submodules
//!
//! - [`kernel`]: `OpKernel`, construction and per-call context objects
//! - [`dispatch`]: engine routing and device ownership
//! - [`conv2d`]: the engine-multiplexing CPU kernels and slot validation
//! - [`cpu`]: reference, SIMD and GEMM convolution routines
//! - [`wgpu`] *(opt-in)*: GPU compute shader pipelines using `wgpu`
//!
//! ## Extending the Backend
//!
//! To add an engine to convolution:
//!
//! 1. Implement forward/backward routines with the signatures used in [`cpu`]
//! 2. Route the engine in [`conv2d::Conv2dOp`] or bind new kernels in [`dispatch`]
//! 3. Validate every slot before writing, as the existing kernels do
//!
//! ## Feature Flags
//!
//! - `simd`: Enables AVX2 intrinsics in [`cpu::simd`]
//! - `wgpu`: Enables the `wgpu` (WebGPU) backend

pub mod conv2d;
pub mod cpu;
pub mod dispatch;
pub mod kernel;
#[cfg(feature = "wgpu")]
pub mod wgpu;

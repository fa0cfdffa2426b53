//! convkit: operator kernels for 2D convolution.
//!
//! A small execution engine sitting between a convolutional layer and the
//! numeric backends that actually do the work. A layer describes itself once
//! with a [`ConvParams`] block, binds one forward and one backward
//! [`OpKernel`] to it, and then invokes them on every call through an
//! [`OpKernelContext`] that borrows the current tensors.
//!
//! # Features
//!
//! - Reference ("internal") convolution forward and backward passes with a fixed
//!   accumulation order.
//! - A SIMD ("avx") engine with a specialised 5x5 path.
//! - An inference-only im2col + GEMM lowering in the "nnpack" slot.
//! - An optional GPU ("libdnn") engine built on `wgpu` compute shaders.
//! - Batch-parallel execution on top of `rayon`.
//!
//! # Modules
//!
//! - [`backend`]: Engine identifiers and the process-wide default engine.
//! - [`shape`]: 3D shape descriptors and flat index arithmetic.
//! - [`params`]: Convolution parameter blocks and connection tables.
//! - [`tensors`]: Batch tensors and the compile-time float width.
//! - [`padding`]: The pad / unpad memory-layout transform.
//! - [`ops`]: Kernel contract, backend dispatch and per-backend kernels.
//! - [`layer`]: A minimal convolution layer driving the kernels.
//! - [`approx`]: Tolerance comparisons used for cross-backend checks.
//!
//! # Feature Flags
//!
//! - `simd`: AVX2 intrinsics in the SIMD engine; makes `Avx` the default engine
//! - `wgpu`: GPU backend via `wgpu` compute shaders
//! - `f64`: use `f64` instead of `f32` as the tensor element type
//!
//! # Example
//!
//! ```rust
//! use convkit::layer::Conv2dLayer;
//! use convkit::params::{ConvParams, Padding};
//! use convkit::tensors::Tensor;
//!
//! let params = ConvParams::builder(6, 6, 1)
//!     .kernel(5, 5)
//!     .out_channels(1)
//!     .padding(Padding::Valid)
//!     .build()
//!     .unwrap();
//! let mut layer = Conv2dLayer::new(params).unwrap();
//!
//! let input = Tensor::filled(1, 36, 1.0);
//! let weight = Tensor::filled(1, 25, 1.0);
//! let bias = Tensor::zeros(1, 1);
//! let out = layer.forward(&input, &weight, &bias).unwrap();
//! assert_eq!(out.sample(0), &[25.0; 4]);
//! ```

#![warn(clippy::all)]
#![allow(
    clippy::many_single_char_names,
    clippy::similar_names,
    clippy::too_many_arguments
)]

pub mod approx;
pub mod backend;
pub mod error;
pub mod layer;
pub mod ops;
pub mod padding;
pub mod parallel;
pub mod params;
pub mod shape;
pub mod tensors;

pub use backend::Engine;
pub use error::{KernelError, Result};
pub use ops::kernel::{OpKernel, OpKernelConstruction, OpKernelContext};
pub use params::{ConnectionTable, ConvParams, Padding};
pub use shape::Shape3d;
pub use tensors::{Float, Tensor};

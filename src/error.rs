//! Error taxonomy shared by every kernel, transform and dispatcher.
//!
//! All failures are unrecoverable for the call that raised them: kernels
//! validate their slots and shapes before writing anything, so an `Err` means
//! no output or gradient tensor was touched.

use crate::backend::Engine;
use thiserror::Error;

/// Errors raised while configuring or running an operator kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    /// The requested engine has no implementation for the operator.
    #[error("unsupported engine {engine} for {op}")]
    UnsupportedEngine {
        /// Operator name, e.g. `conv2d`.
        op: &'static str,
        /// Engine that was requested.
        engine: Engine,
    },

    /// The parameter block or device does not satisfy the backend's requirements.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// A known gap: the engine exists but this direction of the operator does not.
    #[error("{op} is not implemented for engine {engine}")]
    NotImplemented {
        /// Operator name, e.g. `conv2d backward`.
        op: &'static str,
        /// Engine that was requested.
        engine: Engine,
    },

    /// The parameter block itself is malformed.
    #[error("invalid convolution parameters: {0}")]
    InvalidParams(String),

    /// A tensor does not match the shape the parameter block expects.
    #[error("{what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Which tensor or dimension was checked.
        what: &'static str,
        /// Expected length or count.
        expected: usize,
        /// Actual length or count.
        actual: usize,
    },

    /// A kernel asked the context for a slot the caller did not provide.
    #[error("missing {kind} slot {index}")]
    MissingSlot {
        /// Slot family (`input`, `output`, `input_grad`, `output_grad`).
        kind: &'static str,
        /// Positional index.
        index: usize,
    },

    /// A coordinate fell outside its shape.
    #[error("index ({x}, {y}, {c}) out of bounds for shape {shape}")]
    IndexOutOfBounds {
        /// Column.
        x: usize,
        /// Row.
        y: usize,
        /// Channel.
        c: usize,
        /// Shape rendered as `WxHxD`.
        shape: String,
    },

    /// Failure inside the GPU backend.
    #[cfg(feature = "wgpu")]
    #[error(transparent)]
    Gpu(#[from] crate::ops::wgpu::GpuFailure),
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, KernelError>;

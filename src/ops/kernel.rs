//! The operator-kernel contract.
//!
//! A layer binds one forward and one backward [`OpKernel`] at construction
//! time through an [`OpKernelConstruction`], then on every call hands the
//! kernel an [`OpKernelContext`] borrowing the current tensors.
//!
//! Slots are positional. For convolution:
//!
//! | direction | slot          | 0                         | 1                | 2                |
//! |-----------|---------------|---------------------------|------------------|------------------|
//! | forward   | `input`       | data (padded frame)       | weight (1 sample)| bias (1 sample)  |
//! | forward   | `output`      | output                    |                  |                  |
//! | backward  | `input`       | data (padded frame)       | weight           | bias             |
//! | backward  | `output_grad` | output delta              |                  |                  |
//! | backward  | `input_grad`  | prev delta (padded frame) | dW, per sample   | db, per sample   |
//!
//! Read slots hand out the caller's borrow, so a kernel can hold inputs and a
//! mutable output at the same time.

use crate::backend::{Engine, default_engine};
use crate::error::{KernelError, Result};
use crate::ops::dispatch::Device;
use crate::params::ConvParams;
use crate::tensors::Tensor;
use std::sync::Arc;

/// A backend-specific implementation of one operator direction.
pub trait OpKernel: Send + Sync {
    /// Human readable name, used in logs.
    fn name(&self) -> &'static str;

    /// Runs the operator on the tensors in `ctx`.
    ///
    /// Implementations validate every slot before writing, so on `Err` no
    /// output or gradient has been modified.
    fn compute(&self, ctx: &mut OpKernelContext<'_>) -> Result<()>;
}

/// Everything a kernel receives when it is bound.
#[derive(Debug, Clone)]
pub struct OpKernelConstruction {
    device: Option<Arc<Device>>,
    params: Arc<ConvParams>,
}

impl OpKernelConstruction {
    /// CPU-only construction.
    #[must_use]
    pub const fn new(params: Arc<ConvParams>) -> Self {
        Self {
            device: None,
            params,
        }
    }

    /// Attaches a device handle.
    #[must_use]
    pub fn with_device(mut self, device: Option<Arc<Device>>) -> Self {
        self.device = device;
        self
    }

    /// Device handle, if any.
    #[must_use]
    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    /// Parameter block shared by the layer's kernels.
    #[must_use]
    pub fn params(&self) -> &Arc<ConvParams> {
        &self.params
    }
}

/// Per-call view over the tensors a kernel reads and writes.
pub struct OpKernelContext<'a> {
    in_data: Vec<&'a Tensor>,
    out_data: Vec<&'a mut Tensor>,
    out_grad: Vec<&'a Tensor>,
    in_grad: Vec<&'a mut Tensor>,
    parallelize: bool,
    engine: Engine,
}

impl<'a> OpKernelContext<'a> {
    /// Context for a forward call.
    #[must_use]
    pub fn forward(in_data: Vec<&'a Tensor>, out_data: Vec<&'a mut Tensor>) -> Self {
        Self {
            in_data,
            out_data,
            out_grad: Vec::new(),
            in_grad: Vec::new(),
            parallelize: true,
            engine: default_engine(),
        }
    }

    /// Context for a backward call.
    #[must_use]
    pub fn backward(
        in_data: Vec<&'a Tensor>,
        out_grad: Vec<&'a Tensor>,
        in_grad: Vec<&'a mut Tensor>,
    ) -> Self {
        Self {
            in_data,
            out_data: Vec::new(),
            out_grad,
            in_grad,
            parallelize: true,
            engine: default_engine(),
        }
    }

    /// Sets the batch-parallel flag (on by default).
    #[must_use]
    pub const fn with_parallelize(mut self, parallelize: bool) -> Self {
        self.parallelize = parallelize;
        self
    }

    /// Sets the engine multiplexing kernels branch on.
    #[must_use]
    pub const fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    /// Whether samples may be processed in parallel.
    #[must_use]
    pub const fn parallelize(&self) -> bool {
        self.parallelize
    }

    /// Engine requested for this call.
    #[must_use]
    pub const fn engine(&self) -> Engine {
        self.engine
    }

    /// Input slot `i`.
    ///
    /// # Errors
    /// [`KernelError::MissingSlot`] if the caller did not provide it.
    pub fn input(&self, i: usize) -> Result<&'a Tensor> {
        self.in_data
            .get(i)
            .copied()
            .ok_or(KernelError::MissingSlot { kind: "input", index: i })
    }

    /// Output-gradient slot `i`.
    ///
    /// # Errors
    /// [`KernelError::MissingSlot`] if the caller did not provide it.
    pub fn output_grad(&self, i: usize) -> Result<&'a Tensor> {
        self.out_grad
            .get(i)
            .copied()
            .ok_or(KernelError::MissingSlot { kind: "output_grad", index: i })
    }

    /// Output slot `i`.
    ///
    /// # Errors
    /// [`KernelError::MissingSlot`] if the caller did not provide it.
    pub fn output(&mut self, i: usize) -> Result<&mut Tensor> {
        self.out_data
            .get_mut(i)
            .map(|t| &mut **t)
            .ok_or(KernelError::MissingSlot { kind: "output", index: i })
    }

    /// Whether input-gradient slot `i` was provided.
    #[must_use]
    pub fn has_input_grad(&self, i: usize) -> bool {
        i < self.in_grad.len()
    }

    /// Several distinct input-gradient slots at once.
    ///
    /// # Errors
    /// [`KernelError::MissingSlot`] for an absent slot,
    /// [`KernelError::InvalidParams`] if an index is repeated.
    pub fn input_grads<const N: usize>(&mut self, indices: [usize; N]) -> Result<[&mut Tensor; N]> {
        if let Some(&index) = indices.iter().find(|&&i| i >= self.in_grad.len()) {
            return Err(KernelError::MissingSlot { kind: "input_grad", index });
        }
        let slots = self
            .in_grad
            .get_disjoint_mut(indices)
            .map_err(|_| KernelError::InvalidParams(format!("input_grad slots {indices:?} overlap")))?;
        Ok(slots.map(|t| &mut **t))
    }
}

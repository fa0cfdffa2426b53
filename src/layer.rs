//! A minimal convolution layer.
//!
//! [`Conv2dLayer`] is what a network layer does with the kernels: it owns
//! the parameter block, the padding helper and the padded scratch buffers,
//! binds one forward and one backward kernel through a
//! [`Dispatcher`], and on every call builds a context over the current
//! tensors.
//!
//! Weights and biases are not owned here; they are passed in as one-sample
//! tensors so the caller's optimiser stays in charge of them.

use crate::backend::{Engine, default_engine};
use crate::error::Result;
use crate::ops::dispatch::{Conv2dKernels, Dispatcher};
use crate::ops::kernel::OpKernelContext;
use crate::padding::Conv2dPadding;
use crate::params::ConvParams;
use crate::tensors::Tensor;
use std::sync::Arc;

/// Result of a backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    /// Gradient with respect to the unpadded input, one sample per input sample.
    pub prev_delta: Tensor,
    /// Weight gradient summed over the batch (one sample).
    pub dw: Tensor,
    /// Bias gradient summed over the batch (one sample); empty without bias.
    pub db: Tensor,
}

/// Convolution layer driving a forward and a backward kernel.
#[derive(Debug)]
pub struct Conv2dLayer {
    params: Arc<ConvParams>,
    padding: Conv2dPadding,
    dispatcher: Dispatcher,
    kernels: Conv2dKernels,
    engine: Engine,
    parallelize: bool,
    in_padded: Tensor,
    prev_delta_padded: Tensor,
}

impl Conv2dLayer {
    /// A CPU layer on the process-wide default engine.
    ///
    /// # Errors
    /// Propagates kernel binding errors from [`Dispatcher::conv2d`].
    pub fn new(params: ConvParams) -> Result<Self> {
        Self::with_dispatcher(params, Dispatcher::cpu(), default_engine())
    }

    /// A layer bound to `engine` through `dispatcher`.
    ///
    /// # Errors
    /// Propagates kernel binding errors from [`Dispatcher::conv2d`].
    pub fn with_dispatcher(params: ConvParams, dispatcher: Dispatcher, engine: Engine) -> Result<Self> {
        let params = Arc::new(params);
        let kernels = dispatcher.conv2d(engine, Arc::clone(&params))?;
        Ok(Self {
            padding: Conv2dPadding::new(Arc::clone(&params)),
            params,
            dispatcher,
            kernels,
            engine,
            parallelize: true,
            in_padded: Tensor::default(),
            prev_delta_padded: Tensor::default(),
        })
    }

    /// Parameter block.
    #[must_use]
    pub fn params(&self) -> &ConvParams {
        &self.params
    }

    /// Engine the kernels are bound to.
    #[must_use]
    pub const fn engine(&self) -> Engine {
        self.engine
    }

    /// Bound kernels.
    #[must_use]
    pub const fn kernels(&self) -> &Conv2dKernels {
        &self.kernels
    }

    /// Rebinds both kernels to `engine`. On error the previous binding stays.
    ///
    /// # Errors
    /// Propagates kernel binding errors from [`Dispatcher::conv2d`].
    pub fn set_engine(&mut self, engine: Engine) -> Result<()> {
        self.kernels = self.dispatcher.conv2d(engine, Arc::clone(&self.params))?;
        self.engine = engine;
        Ok(())
    }

    /// Enables or disables batch parallelism.
    pub fn set_parallelize(&mut self, parallelize: bool) {
        self.parallelize = parallelize;
    }

    /// Convolves a batch of unpadded inputs.
    ///
    /// # Errors
    /// Any shape or engine error raised by padding or the forward kernel.
    pub fn forward(&mut self, input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let padded = self.padding.padded(input, &mut self.in_padded, self.parallelize)?;
        let mut out = Tensor::default();
        {
            let mut ctx = OpKernelContext::forward(vec![padded, weight, bias], vec![&mut out])
                .with_parallelize(self.parallelize)
                .with_engine(self.engine);
            self.kernels.forward.compute(&mut ctx)?;
        }
        Ok(out)
    }

    /// Back-propagates `curr_delta` through the convolution of `input`.
    ///
    /// The input gradient is computed in the padded frame and unpadded before
    /// it is returned. Weight and bias gradients are computed per sample and
    /// then reduced in sample order.
    ///
    /// # Errors
    /// Any shape or engine error raised by padding or the backward kernel.
    pub fn backward(
        &mut self,
        input: &Tensor,
        weight: &Tensor,
        bias: &Tensor,
        curr_delta: &Tensor,
    ) -> Result<Gradients> {
        let padded = self.padding.padded(input, &mut self.in_padded, self.parallelize)?;
        let mut dw = Tensor::default();
        let mut db = Tensor::default();
        {
            let mut in_grad = vec![&mut self.prev_delta_padded, &mut dw];
            if self.params.has_bias() {
                in_grad.push(&mut db);
            }
            let mut ctx = OpKernelContext::backward(vec![padded, weight, bias], vec![curr_delta], in_grad)
                .with_parallelize(self.parallelize)
                .with_engine(self.engine);
            self.kernels.backward.compute(&mut ctx)?;
        }

        let mut prev_delta = Tensor::default();
        self.padding
            .unpad_delta(&self.prev_delta_padded, &mut prev_delta, self.parallelize)?;

        Ok(Gradients {
            prev_delta,
            dw: reduce(&dw, self.params.weight().size()),
            db: if self.params.has_bias() {
                reduce(&db, self.params.output().depth)
            } else {
                Tensor::default()
            },
        })
    }
}

/// Sums per-sample gradients into one sample; zeros for an empty batch.
fn reduce(per_sample: &Tensor, len: usize) -> Tensor {
    let total = per_sample.sum_samples();
    if total.is_empty() {
        Tensor::zeros(1, len)
    } else {
        Tensor::from_samples(vec![total])
    }
}

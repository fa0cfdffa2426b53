//! Backend dispatch.
//!
//! The [`Dispatcher`] is the explicit, process-scoped owner of accelerator
//! state. A layer asks it for a [`Conv2dKernels`] pair bound to one engine;
//! the device handle it owns is passed by reference into kernel
//! construction and released when the last kernel and dispatcher drop it.
//!
//! # Routing
//!
//! | engine     | forward              | backward                        |
//! |------------|----------------------|---------------------------------|
//! | `Internal` | `Conv2dOp`           | `Conv2dGradOp`                  |
//! | `Avx`      | `Conv2dOp`           | `Conv2dGradOp`                  |
//! | `Nnpack`   | `Conv2dOp`           | `Conv2dGradOp` (not implemented)|
//! | `Libdnn`   | `Conv2dGpuForwardOp` | `Conv2dGpuBackwardOp`           |
//! | `Opencl`   | unsupported          | unsupported                     |
//!
//! There is no silent fallback between engines.
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use convkit::backend::Engine;
//! use convkit::ops::dispatch::Dispatcher;
//! use convkit::params::ConvParams;
//!
//! let params = Arc::new(ConvParams::builder(6, 6, 1).kernel(3, 3).build().unwrap());
//! let kernels = Dispatcher::cpu().conv2d(Engine::Internal, params).unwrap();
//! assert_eq!(kernels.forward.name(), "Conv2dOp");
//! assert!(Dispatcher::cpu().conv2d(Engine::Opencl, kernels.params.clone()).is_err());
//! ```

use super::conv2d::{Conv2dGradOp, Conv2dOp};
use super::kernel::{OpKernel, OpKernelConstruction};
use crate::backend::Engine;
use crate::error::{KernelError, Result};
use crate::params::ConvParams;
use std::sync::Arc;

#[cfg(feature = "wgpu")]
use super::wgpu::GpuContext;

/// A compute device kernels may be bound to.
#[derive(Debug)]
pub enum Device {
    /// The host; carries no state.
    Cpu,
    /// A WGPU device and queue.
    #[cfg(feature = "wgpu")]
    Gpu(GpuContext),
}

/// The forward and backward kernels of one layer.
pub struct Conv2dKernels {
    /// Engine the pair was bound for.
    pub engine: Engine,
    /// Parameter block both kernels share.
    pub params: Arc<ConvParams>,
    /// Forward kernel.
    pub forward: Box<dyn OpKernel>,
    /// Backward kernel.
    pub backward: Box<dyn OpKernel>,
}

impl std::fmt::Debug for Conv2dKernels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conv2dKernels")
            .field("engine", &self.engine)
            .field("forward", &self.forward.name())
            .field("backward", &self.backward.name())
            .finish_non_exhaustive()
    }
}

/// Selects and constructs kernels for an engine.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    device: Option<Arc<Device>>,
}

impl Dispatcher {
    /// A dispatcher without accelerator state.
    #[must_use]
    pub const fn cpu() -> Self {
        Self { device: None }
    }

    /// A dispatcher owning `device`.
    #[must_use]
    pub fn with_device(device: Device) -> Self {
        Self {
            device: Some(Arc::new(device)),
        }
    }

    /// A dispatcher owning a freshly initialised GPU context.
    ///
    /// # Errors
    /// Returns [`KernelError::Gpu`] if no adapter or device is available.
    #[cfg(feature = "wgpu")]
    pub fn gpu() -> Result<Self> {
        let gpu = GpuContext::new()?;
        Ok(Self::with_device(Device::Gpu(gpu)))
    }

    /// The owned device, if any.
    #[must_use]
    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    /// Binds forward and backward convolution kernels for `engine`.
    ///
    /// # Errors
    /// - [`KernelError::UnsupportedEngine`] for `Opencl`, and for `Libdnn`
    ///   when the crate is built without `wgpu`.
    /// - [`KernelError::UnsupportedConfiguration`] for `Libdnn` without a GPU device.
    pub fn conv2d(&self, engine: Engine, params: Arc<ConvParams>) -> Result<Conv2dKernels> {
        let ctor = OpKernelConstruction::new(Arc::clone(&params)).with_device(self.device.clone());

        let (forward, backward): (Box<dyn OpKernel>, Box<dyn OpKernel>) = match engine {
            Engine::Internal | Engine::Avx | Engine::Nnpack => {
                (Box::new(Conv2dOp::new(&ctor)), Box::new(Conv2dGradOp::new(&ctor)))
            }
            Engine::Libdnn => Self::libdnn(&ctor)?,
            Engine::Opencl => {
                return Err(KernelError::UnsupportedEngine { op: "conv2d", engine });
            }
        };

        log::debug!(
            "bound conv2d kernels [{engine}]: {} / {}",
            forward.name(),
            backward.name()
        );
        Ok(Conv2dKernels {
            engine,
            params,
            forward,
            backward,
        })
    }

    #[cfg(feature = "wgpu")]
    fn libdnn(ctor: &OpKernelConstruction) -> Result<(Box<dyn OpKernel>, Box<dyn OpKernel>)> {
        use super::wgpu::conv2d::{Conv2dGpuBackwardOp, Conv2dGpuForwardOp};
        Ok((
            Box::new(Conv2dGpuForwardOp::new(ctor)?),
            Box::new(Conv2dGpuBackwardOp::new(ctor)?),
        ))
    }

    #[cfg(not(feature = "wgpu"))]
    fn libdnn(_ctor: &OpKernelConstruction) -> Result<(Box<dyn OpKernel>, Box<dyn OpKernel>)> {
        Err(KernelError::UnsupportedEngine {
            op: "conv2d",
            engine: Engine::Libdnn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Arc<ConvParams> {
        Arc::new(ConvParams::builder(5, 5, 2).kernel(3, 3).out_channels(2).build().unwrap())
    }

    #[test]
    fn cpu_engines_share_the_multiplexing_kernels() {
        for engine in [Engine::Internal, Engine::Avx, Engine::Nnpack] {
            let k = Dispatcher::cpu().conv2d(engine, params()).unwrap();
            assert_eq!(k.engine, engine);
            assert_eq!(k.forward.name(), "Conv2dOp");
            assert_eq!(k.backward.name(), "Conv2dGradOp");
        }
    }

    #[test]
    fn opencl_is_unsupported() {
        let err = Dispatcher::cpu().conv2d(Engine::Opencl, params()).unwrap_err();
        assert!(matches!(err, KernelError::UnsupportedEngine { op: "conv2d", engine: Engine::Opencl }));
        assert!(err.to_string().contains("OpenCL"));
    }

    #[test]
    fn libdnn_without_gpu_fails_at_construction() {
        let err = Dispatcher::cpu().conv2d(Engine::Libdnn, params()).unwrap_err();
        if cfg!(feature = "wgpu") {
            assert!(matches!(err, KernelError::UnsupportedConfiguration(_)));
        } else {
            assert!(matches!(err, KernelError::UnsupportedEngine { .. }));
        }

        let with_cpu = Dispatcher::with_device(Device::Cpu);
        assert!(with_cpu.conv2d(Engine::Libdnn, params()).is_err());
    }
}

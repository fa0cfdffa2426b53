//! Engine selection module.
//!
//! This module defines the computation engines a convolution kernel can be
//! bound to and keeps the process-wide default engine.
//!
//! # Supported Engines
//!
//! - `Internal`: Reference CPU kernels (always available).
//! - `Avx`: SIMD kernels with a specialised 5x5 path; other sizes use the reference kernels.
//! - `Nnpack`: Inference-only im2col + GEMM lowering on the CPU.
//! - `Libdnn`: GPU compute shaders through `wgpu` (requires the `wgpu` feature and a device).
//! - `Opencl`: Reserved; binding a kernel to it fails.
//!
//! The default engine is stored globally in an `AtomicU8`, so layers that do
//! not pick an engine explicitly can be switched in one place.

use briny::traits::{InteriorImmutable, RawConvert, StableLayout, Unaligned};
use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;
use core::sync::atomic::{AtomicU8, Ordering};

/// Environment variable consulted by [`engine_from_env`].
pub const ENGINE_ENV_VAR: &str = "CONVKIT_ENGINE";

/// Enumeration of convolution engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Engine {
    /// Reference CPU implementation.
    Internal = 0,
    /// SIMD-vectorised CPU implementation.
    Avx = 1,
    /// Inference-only GEMM lowering.
    Nnpack = 2,
    /// GPU compute shaders.
    Libdnn = 3,
    /// Not implemented.
    Opencl = 4,
}

unsafe impl StableLayout for Engine {}
unsafe impl RawConvert for Engine {}
unsafe impl Unaligned for Engine {}
unsafe impl InteriorImmutable for Engine {}

impl Engine {
    /// Every engine, in discriminant order.
    pub const ALL: [Self; 5] = [
        Self::Internal,
        Self::Avx,
        Self::Nnpack,
        Self::Libdnn,
        Self::Opencl,
    ];

    /// Whether the engine runs on the host CPU.
    #[must_use]
    pub const fn is_cpu(self) -> bool {
        matches!(self, Self::Internal | Self::Avx | Self::Nnpack)
    }
}

impl Default for Engine {
    fn default() -> Self {
        if cfg!(feature = "simd") {
            Self::Avx
        } else {
            Self::Internal
        }
    }
}

impl TryFrom<u8> for Engine {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Internal),
            1 => Ok(Self::Avx),
            2 => Ok(Self::Nnpack),
            3 => Ok(Self::Libdnn),
            4 => Ok(Self::Opencl),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Internal => "Internal",
            Self::Avx => "AVX",
            Self::Nnpack => "NNPACK",
            Self::Libdnn => "LibDNN",
            Self::Opencl => "OpenCL",
        };
        f.write_str(name)
    }
}

/// Error returned when an engine name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEngineError(pub String);

impl fmt::Display for ParseEngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown engine name `{}`", self.0)
    }
}

impl std::error::Error for ParseEngineError {}

impl FromStr for Engine {
    type Err = ParseEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" => Ok(Self::Internal),
            "avx" => Ok(Self::Avx),
            "nnpack" => Ok(Self::Nnpack),
            "libdnn" => Ok(Self::Libdnn),
            "opencl" => Ok(Self::Opencl),
            _ => Err(ParseEngineError(s.to_string())),
        }
    }
}

/// Internal global state for the default engine.
static GLOBAL_DEFAULT_ENGINE: AtomicU8 = AtomicU8::new(if cfg!(feature = "simd") {
    Engine::Avx as u8
} else {
    Engine::Internal as u8
});

/// Sets the engine used by layers that are not given one explicitly.
///
/// # Example
///
/// ```
/// use convkit::backend::{set_default_engine, default_engine, Engine};
/// set_default_engine(Engine::Internal);
/// assert_eq!(default_engine(), Engine::Internal);
/// ```
pub fn set_default_engine(engine: Engine) {
    GLOBAL_DEFAULT_ENGINE.store(engine as u8, Ordering::Release);
}

/// Returns the current default engine.
///
/// If the stored value is invalid, falls back to [`Engine::default`].
pub fn default_engine() -> Engine {
    Engine::try_from(GLOBAL_DEFAULT_ENGINE.load(Ordering::Acquire)).unwrap_or_default()
}

/// Reads an engine name from [`ENGINE_ENV_VAR`].
///
/// Returns `None` when the variable is unset or does not name an engine.
pub fn engine_from_env() -> Option<Engine> {
    let raw = std::env::var(ENGINE_ENV_VAR).ok()?;
    match raw.parse() {
        Ok(engine) => Some(engine),
        Err(err) => {
            log::warn!("ignoring {ENGINE_ENV_VAR}: {err}");
            None
        }
    }
}

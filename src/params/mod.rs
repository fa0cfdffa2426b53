//! Convolution parameter blocks.
//!
//! A [`ConvParams`] is derived once from the layer configuration and is then
//! shared read-only by every kernel bound to that layer. All configuration
//! errors surface from [`ConvParamsBuilder::build`], so kernels can index
//! without re-checking geometry.

mod connection;

pub use connection::ConnectionTable;

use crate::error::{KernelError, Result};
use crate::shape::Shape3d;
use core::fmt;

/// Border handling of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Padding {
    /// No padding; the output shrinks by `kernel - 1`.
    #[default]
    Valid,
    /// Zero padding so the output matches the input at stride 1.
    Same,
}

impl fmt::Display for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Valid => "valid",
            Self::Same => "same",
        })
    }
}

/// Output length along one axis.
///
/// `valid`: `floor((in - kernel) / stride) + 1`, `same`: `ceil(in / stride)`.
///
/// # Errors
///
/// Returns [`KernelError::InvalidParams`] for a zero length, kernel or stride,
/// or a kernel longer than the input under `valid`.
pub fn conv_out_length(in_length: usize, kernel: usize, stride: usize, pad: Padding) -> Result<usize> {
    if in_length == 0 || kernel == 0 || stride == 0 {
        return Err(KernelError::InvalidParams(format!(
            "input {in_length}, kernel {kernel} and stride {stride} must be non-zero"
        )));
    }
    match pad {
        Padding::Valid => {
            if kernel > in_length {
                return Err(KernelError::InvalidParams(format!(
                    "kernel {kernel} exceeds input {in_length} under valid padding"
                )));
            }
            Ok((in_length - kernel) / stride + 1)
        }
        Padding::Same => Ok(in_length.div_ceil(stride)),
    }
}

/// Padded input length along one axis: `in + kernel - 1` under `same`.
///
/// Total for any input; a zero kernel pads nothing.
#[must_use]
pub const fn in_padded_length(in_length: usize, kernel: usize, pad: Padding) -> usize {
    match pad {
        Padding::Valid => in_length,
        Padding::Same => in_length.saturating_add(kernel.saturating_sub(1)),
    }
}

/// Immutable description of one convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvParams {
    input: Shape3d,
    in_padded: Shape3d,
    output: Shape3d,
    weight: Shape3d,
    has_bias: bool,
    pad_type: Padding,
    w_stride: usize,
    h_stride: usize,
    w_dilation: usize,
    h_dilation: usize,
    table: ConnectionTable,
}

impl ConvParams {
    /// Starts a builder for an input of `in_width x in_height x in_channels`.
    #[must_use]
    pub fn builder(in_width: usize, in_height: usize, in_channels: usize) -> ConvParamsBuilder {
        ConvParamsBuilder::new(in_width, in_height, in_channels)
    }

    /// Unpadded input shape.
    #[must_use]
    pub const fn input(&self) -> Shape3d {
        self.input
    }

    /// Input shape after padding; equals [`Self::input`] under `valid`.
    #[must_use]
    pub const fn in_padded(&self) -> Shape3d {
        self.in_padded
    }

    /// Output shape.
    #[must_use]
    pub const fn output(&self) -> Shape3d {
        self.output
    }

    /// Weight shape: `kernel_w x kernel_h x (in_channels * out_channels)`.
    ///
    /// The kernel for output `o` and input `c` is block `in_channels * o + c`.
    #[must_use]
    pub const fn weight(&self) -> Shape3d {
        self.weight
    }

    /// Whether a bias is added per output channel.
    #[must_use]
    pub const fn has_bias(&self) -> bool {
        self.has_bias
    }

    /// Border handling.
    #[must_use]
    pub const fn pad_type(&self) -> Padding {
        self.pad_type
    }

    /// Horizontal stride.
    #[must_use]
    pub const fn w_stride(&self) -> usize {
        self.w_stride
    }

    /// Vertical stride.
    #[must_use]
    pub const fn h_stride(&self) -> usize {
        self.h_stride
    }

    /// Horizontal dilation (always 1 for a built block).
    #[must_use]
    pub const fn w_dilation(&self) -> usize {
        self.w_dilation
    }

    /// Vertical dilation (always 1 for a built block).
    #[must_use]
    pub const fn h_dilation(&self) -> usize {
        self.h_dilation
    }

    /// Channel connection table.
    #[must_use]
    pub const fn table(&self) -> &ConnectionTable {
        &self.table
    }

    /// Number of bias terms, zero without bias.
    #[must_use]
    pub const fn bias_len(&self) -> usize {
        if self.has_bias { self.output.depth } else { 0 }
    }

    /// Inputs feeding one output unit.
    #[must_use]
    pub const fn fan_in_size(&self) -> usize {
        self.weight.width * self.weight.height * self.input.depth
    }

    /// Outputs fed by one input unit.
    #[must_use]
    pub const fn fan_out_size(&self) -> usize {
        self.weight.width * self.weight.height * self.output.depth
    }

    /// Offset of the unpadded image inside the padded frame.
    #[must_use]
    pub const fn pad_offset(&self) -> (usize, usize) {
        match self.pad_type {
            Padding::Valid => (0, 0),
            Padding::Same => (self.weight.width / 2, self.weight.height / 2),
        }
    }
}

impl fmt::Display for ConvParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "in:        {}", self.input)?;
        writeln!(f, "in_padded: {}", self.in_padded)?;
        writeln!(f, "out:       {}", self.output)?;
        writeln!(f, "weight:    {}", self.weight)?;
        writeln!(f, "has_bias:  {}", self.has_bias)?;
        writeln!(f, "pad_type:  {}", self.pad_type)?;
        writeln!(f, "stride:    {}x{}", self.w_stride, self.h_stride)?;
        writeln!(f, "dilation:  {}x{}", self.w_dilation, self.h_dilation)?;
        if self.table.is_dense() {
            write!(f, "table:     dense")
        } else {
            write!(f, "table:     {}x{}", self.table.rows(), self.table.cols())
        }
    }
}

/// Validating builder for [`ConvParams`].
#[derive(Debug, Clone)]
pub struct ConvParamsBuilder {
    in_width: usize,
    in_height: usize,
    in_channels: usize,
    kernel_w: usize,
    kernel_h: usize,
    out_channels: usize,
    padding: Padding,
    w_stride: usize,
    h_stride: usize,
    w_dilation: usize,
    h_dilation: usize,
    has_bias: bool,
    table: ConnectionTable,
    groups: Option<usize>,
}

impl ConvParamsBuilder {
    fn new(in_width: usize, in_height: usize, in_channels: usize) -> Self {
        Self {
            in_width,
            in_height,
            in_channels,
            kernel_w: 1,
            kernel_h: 1,
            out_channels: 1,
            padding: Padding::Valid,
            w_stride: 1,
            h_stride: 1,
            w_dilation: 1,
            h_dilation: 1,
            has_bias: true,
            table: ConnectionTable::dense(),
            groups: None,
        }
    }

    /// Kernel window size.
    #[must_use]
    pub const fn kernel(mut self, width: usize, height: usize) -> Self {
        self.kernel_w = width;
        self.kernel_h = height;
        self
    }

    /// Number of output channels.
    #[must_use]
    pub const fn out_channels(mut self, n: usize) -> Self {
        self.out_channels = n;
        self
    }

    /// Border handling.
    #[must_use]
    pub const fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Horizontal and vertical stride.
    #[must_use]
    pub const fn stride(mut self, w: usize, h: usize) -> Self {
        self.w_stride = w;
        self.h_stride = h;
        self
    }

    /// Horizontal and vertical dilation. Only 1 is supported.
    #[must_use]
    pub const fn dilation(mut self, w: usize, h: usize) -> Self {
        self.w_dilation = w;
        self.h_dilation = h;
        self
    }

    /// Enables or disables the bias term (enabled by default).
    #[must_use]
    pub const fn bias(mut self, has_bias: bool) -> Self {
        self.has_bias = has_bias;
        self
    }

    /// Explicit connection table; overrides [`Self::groups`].
    #[must_use]
    pub fn table(mut self, table: ConnectionTable) -> Self {
        self.table = table;
        self.groups = None;
        self
    }

    /// Grouped convolution; the table is derived at build time.
    #[must_use]
    pub const fn groups(mut self, groups: usize) -> Self {
        self.groups = Some(groups);
        self
    }

    /// Validates the configuration and derives every shape.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidParams`] for zero sizes or strides, a kernel
    ///   larger than the input under `valid`, a bad group count or
    ///   mismatched table dimensions.
    /// - [`KernelError::UnsupportedConfiguration`] for an even kernel under
    ///   `same` or a dilation other than 1.
    pub fn build(self) -> Result<ConvParams> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(KernelError::InvalidParams(format!(
                "channel counts must be non-zero (in {}, out {})",
                self.in_channels, self.out_channels
            )));
        }
        if self.w_dilation != 1 || self.h_dilation != 1 {
            return Err(KernelError::UnsupportedConfiguration(format!(
                "dilation {}x{} (only 1x1 is supported)",
                self.w_dilation, self.h_dilation
            )));
        }
        if self.padding == Padding::Same && (self.kernel_w % 2 == 0 || self.kernel_h % 2 == 0) {
            return Err(KernelError::UnsupportedConfiguration(format!(
                "even kernel {}x{} with same padding",
                self.kernel_w, self.kernel_h
            )));
        }

        let out_w = conv_out_length(self.in_width, self.kernel_w, self.w_stride, self.padding)?;
        let out_h = conv_out_length(self.in_height, self.kernel_h, self.h_stride, self.padding)?;

        let table = match self.groups {
            Some(groups) => ConnectionTable::from_groups(groups, self.in_channels, self.out_channels)?,
            None => self.table,
        };
        if !table.is_dense() && (table.rows() != self.in_channels || table.cols() != self.out_channels) {
            return Err(KernelError::InvalidParams(format!(
                "connection table {}x{} does not match {} input and {} output channels",
                table.rows(),
                table.cols(),
                self.in_channels,
                self.out_channels
            )));
        }

        let weight_depth = self
            .in_channels
            .checked_mul(self.out_channels)
            .ok_or_else(|| KernelError::InvalidParams("too many channels".into()))?;

        Ok(ConvParams {
            input: Shape3d::new(self.in_width, self.in_height, self.in_channels)?,
            in_padded: Shape3d::new(
                in_padded_length(self.in_width, self.kernel_w, self.padding),
                in_padded_length(self.in_height, self.kernel_h, self.padding),
                self.in_channels,
            )?,
            output: Shape3d::new(out_w, out_h, self.out_channels)?,
            weight: Shape3d::new(self.kernel_w, self.kernel_h, weight_depth)?,
            has_bias: self.has_bias,
            pad_type: self.padding,
            w_stride: self.w_stride,
            h_stride: self.h_stride,
            w_dilation: self.w_dilation,
            h_dilation: self.h_dilation,
            table,
        })
    }
}

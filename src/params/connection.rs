use crate::error::{KernelError, Result};

/// Boolean adjacency between input and output channels.
///
/// Rows are input channels, columns are output channels. An empty table is
/// dense: every pair is connected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionTable {
    connected: Vec<bool>,
    rows: usize,
    cols: usize,
}

impl ConnectionTable {
    /// The dense table.
    #[must_use]
    pub const fn dense() -> Self {
        Self {
            connected: Vec::new(),
            rows: 0,
            cols: 0,
        }
    }

    /// Builds a table from a row-major `rows x cols` matrix.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ShapeMismatch`] if `matrix.len() != rows * cols`,
    /// and [`KernelError::InvalidParams`] for an empty matrix.
    pub fn from_matrix(matrix: &[bool], rows: usize, cols: usize) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(KernelError::InvalidParams(
                "connection table must have at least one row and column".into(),
            ));
        }
        let expected = rows.checked_mul(cols).ok_or_else(|| {
            KernelError::InvalidParams(format!("connection table {rows}x{cols} is too large"))
        })?;
        if matrix.len() != expected {
            return Err(KernelError::ShapeMismatch {
                what: "connection table entries",
                expected,
                actual: matrix.len(),
            });
        }
        Ok(Self {
            connected: matrix.to_vec(),
            rows,
            cols,
        })
    }

    /// Block-diagonal table splitting `rows` inputs and `cols` outputs into
    /// `groups` independent groups.
    ///
    /// One group yields the dense table.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidParams`] if `groups` is zero or does not
    /// divide both channel counts.
    pub fn from_groups(groups: usize, rows: usize, cols: usize) -> Result<Self> {
        if groups == 0 || rows % groups != 0 || cols % groups != 0 {
            return Err(KernelError::InvalidParams(format!(
                "invalid group size {groups} for {rows} input and {cols} output channels"
            )));
        }
        if groups == 1 {
            return Ok(Self::dense());
        }

        let row_group = rows / groups;
        let col_group = cols / groups;
        let mut connected = vec![false; rows * cols];
        for g in 0..groups {
            for r in 0..row_group {
                let row = (r + g * row_group) * cols;
                for c in 0..col_group {
                    connected[row + c + g * col_group] = true;
                }
            }
        }
        Ok(Self {
            connected,
            rows,
            cols,
        })
    }

    /// `true` for the dense table.
    #[must_use]
    pub fn is_dense(&self) -> bool {
        self.connected.is_empty()
    }

    /// Whether output channel `out` reads input channel `input`.
    #[must_use]
    #[inline]
    pub fn is_connected(&self, out: usize, input: usize) -> bool {
        self.is_dense() || self.connected[input * self.cols + out]
    }

    /// Number of rows (input channels); zero when dense.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (output channels); zero when dense.
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }
}

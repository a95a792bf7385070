//! The compute-kernel contract.
//!
//! A kernel is the inner loop of the GEMM: given one packed run of each
//! operand it produces a native-size tile of 32-bit accumulators. The engine
//! never looks inside a kernel; anything satisfying [`Kernel`] is pluggable.
//! Architecture-specific SIMD kernels register here; the portable
//! [`generic::ReferenceKernel`] is always available and is what
//! [`default_kernel`] falls back to.

pub mod generic;

/// Storage order of elements within one packed cell.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CellOrder {
    /// Consecutive bytes share a width index and advance along depth last:
    /// the element at `(w, d)` lives at `w + d * width`.
    DepthMajor,
    /// Consecutive bytes share a depth index: `(w, d)` lives at
    /// `d + w * depth`.
    WidthMajor,
}

/// Shape of one packed cell: the kernel's register-level granularity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CellFormat {
    pub width: usize,
    pub depth: usize,
    pub order: CellOrder,
}

impl CellFormat {
    pub const fn new(width: usize, depth: usize, order: CellOrder) -> CellFormat {
        CellFormat {
            width,
            depth,
            order,
        }
    }

    pub const fn size(&self) -> usize {
        self.width * self.depth
    }
}

/// Byte offset of element `(w, d)` within a packed cell.
pub fn offset_into_cell(cell: &CellFormat, w: usize, d: usize) -> usize {
    debug_assert!(w < cell.width && d < cell.depth);
    match cell.order {
        CellOrder::DepthMajor => w + d * cell.width,
        CellOrder::WidthMajor => d + w * cell.depth,
    }
}

/// One operand side of a kernel format: a row of `cells` cells.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelSideFormat {
    pub cell: CellFormat,
    pub cells: usize,
}

impl KernelSideFormat {
    /// Total width handled per kernel invocation on this side.
    pub const fn width(&self) -> usize {
        self.cell.width * self.cells
    }
}

/// The native tile shape of a kernel.
///
/// The LHS side's width is the tile's row count, the RHS side's width its
/// column count. Both sides must share the same cell depth.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelFormat {
    pub lhs: KernelSideFormat,
    pub rhs: KernelSideFormat,
}

impl KernelFormat {
    pub const fn rows(&self) -> usize {
        self.lhs.width()
    }

    pub const fn cols(&self) -> usize {
        self.rhs.width()
    }

    /// Depth handled per cell step.
    pub fn depth(&self) -> usize {
        debug_assert_eq!(self.lhs.cell.depth, self.rhs.cell.depth);
        self.lhs.cell.depth
    }
}

/// A GEMM compute kernel.
///
/// Implementations are selected once at startup and shared read-only by all
/// worker threads, hence the `Sync` bound.
pub trait Kernel: Sync {
    /// The native tile shape this kernel consumes and produces.
    fn format(&self) -> &KernelFormat;

    /// Return a name for this kernel for use in diagnostics.
    fn name(&self) -> &'static str;

    /// Compute one native tile of 32-bit accumulators.
    ///
    /// `lhs` and `rhs` are packed runs laid out in this kernel's cell
    /// traversal order, each covering the native side width over `depth`
    /// elements of the contraction dimension. The destination tile is
    /// addressed as `dst[row * dst_row_stride + col * dst_col_stride]`.
    ///
    /// When `start_depth` is zero the destination is overwritten; otherwise
    /// the tile accumulates into the existing destination values.
    fn run(
        &self,
        dst: &mut [i32],
        dst_row_stride: usize,
        dst_col_stride: usize,
        lhs: &[u8],
        rhs: &[u8],
        start_depth: usize,
        depth: usize,
    );
}

/// Select the kernel to use on this system.
///
/// This is the seam where runtime feature detection would pick an
/// architecture-specific kernel. With none compiled in, the portable
/// reference kernel is used.
pub fn default_kernel() -> &'static dyn Kernel {
    &generic::ReferenceKernel
}

//! Portable reference kernel.
//!
//! This kernel works on any architecture and defines the semantics that
//! optimized kernels must reproduce bit-exactly. It is deliberately written
//! as plain scalar loops over the packed cell structure.

use super::{offset_into_cell, CellFormat, CellOrder, Kernel, KernelFormat, KernelSideFormat};

const KERNEL_ROWS: usize = 8;
const KERNEL_COLS: usize = 8;

static FORMAT: KernelFormat = KernelFormat {
    lhs: KernelSideFormat {
        cell: CellFormat::new(4, 4, CellOrder::DepthMajor),
        cells: 2,
    },
    rhs: KernelSideFormat {
        cell: CellFormat::new(4, 4, CellOrder::DepthMajor),
        cells: 2,
    },
};

/// Reference kernel with an 8x8 native tile built from two 4x4 depth-major
/// cells per side.
pub struct ReferenceKernel;

impl Kernel for ReferenceKernel {
    fn format(&self) -> &KernelFormat {
        &FORMAT
    }

    fn name(&self) -> &'static str {
        "reference-8x8"
    }

    fn run(
        &self,
        dst: &mut [i32],
        dst_row_stride: usize,
        dst_col_stride: usize,
        lhs: &[u8],
        rhs: &[u8],
        start_depth: usize,
        depth: usize,
    ) {
        let lhs_cell = FORMAT.lhs.cell;
        let rhs_cell = FORMAT.rhs.cell;
        let cell_depth = FORMAT.depth();

        assert!(depth > 0 && depth % cell_depth == 0);
        assert!(lhs.len() >= FORMAT.rows() * depth);
        assert!(rhs.len() >= FORMAT.cols() * depth);
        assert!(
            dst.len() > (KERNEL_ROWS - 1) * dst_row_stride + (KERNEL_COLS - 1) * dst_col_stride
        );

        let mut accumulator = [[0i32; KERNEL_COLS]; KERNEL_ROWS];
        if start_depth > 0 {
            for row in 0..KERNEL_ROWS {
                for col in 0..KERNEL_COLS {
                    accumulator[row][col] = dst[row * dst_row_stride + col * dst_col_stride];
                }
            }
        }

        // Packed runs are a stream of cells ordered by depth step first, then
        // by cell within the side, which makes the cell at depth step `dc`
        // and side position `c` start at `(dc * cells + c) * cell_size`.
        let depth_cells = depth / cell_depth;
        for dc in 0..depth_cells {
            for rc in 0..FORMAT.rhs.cells {
                let rhs_cell_data =
                    &rhs[(dc * FORMAT.rhs.cells + rc) * rhs_cell.size()..][..rhs_cell.size()];
                for lc in 0..FORMAT.lhs.cells {
                    let lhs_cell_data =
                        &lhs[(dc * FORMAT.lhs.cells + lc) * lhs_cell.size()..][..lhs_cell.size()];
                    for ri in 0..lhs_cell.width {
                        for ci in 0..rhs_cell.width {
                            let mut sum = 0i32;
                            for di in 0..cell_depth {
                                let lhs_val =
                                    lhs_cell_data[offset_into_cell(&lhs_cell, ri, di)] as i32;
                                let rhs_val =
                                    rhs_cell_data[offset_into_cell(&rhs_cell, ci, di)] as i32;
                                sum += lhs_val * rhs_val;
                            }
                            accumulator[lc * lhs_cell.width + ri][rc * rhs_cell.width + ci] += sum;
                        }
                    }
                }
            }
        }

        for row in 0..KERNEL_ROWS {
            for col in 0..KERNEL_COLS {
                dst[row * dst_row_stride + col * dst_col_stride] = accumulator[row][col];
            }
        }
    }
}

//! Driving the kernel over one packed block pair.
//!
//! The loops here walk the packed operands in exactly the order packing laid
//! them out: depth in L1-depth slices, then kernel-native tiles of the
//! output. Each kernel invocation consumes one packed run from each side and
//! updates one native tile of the packed result.

use crate::block::{range_chunks, BlockParams, REGISTER_SIZE};
use crate::kernels::Kernel;
use crate::packing::PackedSideBlockRef;

/// Compute `rows x cols` of raw accumulators over `depth` packed elements.
///
/// `rows`, `cols` and `depth` are the rounded-up extents of the current
/// block: multiples of the kernel's native tile sizes and of
/// [`REGISTER_SIZE`] respectively. `result` is the packed result buffer,
/// column-major with stride `result_stride`. `rhs_col_offset` locates this
/// block's first column within the packed RHS, which may cover a wider
/// column range than one compute call (the shared RHS block of the
/// multi-threaded path).
pub(crate) fn compute(
    kernel: &dyn Kernel,
    block_params: &BlockParams,
    result: &mut [i32],
    result_stride: usize,
    lhs: &PackedSideBlockRef,
    rhs: &PackedSideBlockRef,
    rhs_col_offset: usize,
    rows: usize,
    cols: usize,
    depth: usize,
) {
    let format = kernel.format();
    assert_eq!(rows % format.rows(), 0);
    assert_eq!(cols % format.cols(), 0);
    assert_eq!(depth % REGISTER_SIZE, 0);
    assert!(rows <= result_stride);
    // Both packed blocks must use the same depth slicing for their run
    // layouts to line up.
    assert_eq!(lhs.params.l1_depth, rhs.params.l1_depth);
    assert_eq!(lhs.params.l2_depth, rhs.params.l2_depth);

    for depth_chunk in range_chunks(0..depth, block_params.l1_depth) {
        for row_chunk in range_chunks(0..rows, block_params.l1_rows) {
            compute_l1(
                kernel,
                result,
                result_stride,
                lhs,
                rhs,
                rhs_col_offset,
                row_chunk.start,
                row_chunk.len(),
                cols,
                depth_chunk.start,
                depth_chunk.len(),
            );
        }
    }
}

fn compute_l1(
    kernel: &dyn Kernel,
    result: &mut [i32],
    result_stride: usize,
    lhs: &PackedSideBlockRef,
    rhs: &PackedSideBlockRef,
    rhs_col_offset: usize,
    start_row: usize,
    rows: usize,
    cols: usize,
    start_depth: usize,
    depth: usize,
) {
    let format = kernel.format();
    debug_assert_eq!(rows % format.rows(), 0);
    debug_assert_eq!(cols % format.cols(), 0);

    for col in (0..cols).step_by(format.cols()) {
        for row in (0..rows).step_by(format.rows()) {
            let lhs_run = lhs.run(start_row + row, start_depth, depth);
            let rhs_run = rhs.run(rhs_col_offset + col, start_depth, depth);
            let dst_offset = (start_row + row) + col * result_stride;
            kernel.run(
                &mut result[dst_offset..],
                1,
                result_stride,
                lhs_run,
                rhs_run,
                start_depth,
                depth,
            );
        }
    }
}

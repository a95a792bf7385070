//! Unpacking result blocks: offset correction and write-out.
//!
//! The kernel produces raw accumulators over (possibly requantized) packed
//! values. For each destination cell the true zero-point-corrected dot
//! product expands into four terms, each rescaled back to the original
//! 0..255 scale where requantization narrowed it, and the corrected value is
//! pushed through the output pipeline into the destination matrix.

use crate::allocator::{Allocator, Handle};
use crate::bit_depth::BitDepthParams;
use crate::block::BlockParams;
use crate::matrix::{MatrixBlockBounds, OffsetVector, ResultView};
use crate::output::OutputPipeline;

/// Arena-owned buffer of raw 32-bit accumulators for one outer tile, shaped
/// `l2_rows x l2_cols` in column-major order.
pub(crate) struct PackedResult {
    handle: Handle,
    rows: usize,
    cols: usize,
}

impl PackedResult {
    pub(crate) fn reserve(allocator: &mut Allocator, block_params: &BlockParams) -> PackedResult {
        let rows = block_params.l2_rows;
        let cols = block_params.l2_cols;
        PackedResult {
            handle: allocator.reserve::<i32>(rows * cols),
            rows,
            cols,
        }
    }

    /// Column stride of the accumulator buffer.
    pub(crate) fn stride(&self) -> usize {
        self.rows
    }

    /// # Safety
    ///
    /// `allocator` must be the committed allocator this block was reserved
    /// from and no mutable view may be live.
    pub(crate) unsafe fn as_slice<'a>(&self, allocator: &'a Allocator) -> &'a [i32] {
        unsafe { allocator.slice(self.handle, self.rows * self.cols) }
    }

    /// # Safety
    ///
    /// As for [`as_slice`](PackedResult::as_slice), and no other view of
    /// this block may be live at all.
    pub(crate) unsafe fn as_mut_slice<'a>(&self, allocator: &'a Allocator) -> &'a mut [i32] {
        unsafe { allocator.slice_mut(self.handle, self.rows * self.cols) }
    }
}

/// An exact rational multiply by `numerator / denominator`, decomposed into
/// an integer quotient plus a fixed-point correction for the remainder.
///
/// `apply(x)` equals `round(x * numerator / denominator)` for every `i32`
/// input, using only integer arithmetic. The remainder correction is a
/// Q0.31 multiply-high with a rounding nudge, so no precision is lost
/// relative to dividing in floating point.
pub(crate) struct ConstantFraction {
    identity: bool,
    int_quotient: i32,
    scaled_remaining_numerator: i32,
}

impl ConstantFraction {
    pub(crate) fn new(numerator: u32, denominator: u32) -> ConstantFraction {
        if numerator == denominator {
            return ConstantFraction {
                identity: true,
                int_quotient: 1,
                scaled_remaining_numerator: 0,
            };
        }
        let int_quotient = ((numerator + denominator / 2) / denominator) as i32;
        let remaining_numerator = numerator as i64 - int_quotient as i64 * denominator as i64;
        let scaled_remaining_numerator = ((remaining_numerator << 31) / denominator as i64) as i32;
        ConstantFraction {
            identity: false,
            int_quotient,
            scaled_remaining_numerator,
        }
    }

    pub(crate) fn apply(&self, x: i32) -> i32 {
        if self.identity {
            return x;
        }
        let scaled_remaining_product = x as i64 * self.scaled_remaining_numerator as i64;
        let nudge = if scaled_remaining_product > 0 {
            1i64 << 30
        } else {
            -(1i64 << 30)
        };
        let remaining_product = ((scaled_remaining_product + nudge) / (1i64 << 31)) as i32;
        x.wrapping_mul(self.int_quotient)
            .wrapping_add(remaining_product)
    }
}

/// Unpack one computed block into the destination matrix.
///
/// `src` holds raw accumulators with column stride `src_stride`; `depth` is
/// the true (unpadded) accumulation depth. `lhs_sums` are indexed by row
/// within the block, `rhs_sums` by column within the block, while the offset
/// vectors are indexed by absolute destination coordinates.
///
/// # Safety
///
/// No other thread may write cells inside `dst_block` concurrently, and the
/// destination storage must outlive the call.
pub(crate) unsafe fn unpack_result<P>(
    dst: &ResultView<P::Output>,
    dst_block: &MatrixBlockBounds,
    src: &[i32],
    src_stride: usize,
    depth: usize,
    lhs_sums: &[i32],
    rhs_sums: &[i32],
    lhs_offset: &OffsetVector,
    rhs_offset: &OffsetVector,
    bit_depth: &BitDepthParams,
    pipeline: &P,
) where
    P: OutputPipeline<i32>,
    P::Output: Copy,
{
    assert!(dst_block.start_row + dst_block.rows <= dst.rows());
    assert!(dst_block.start_col + dst_block.cols <= dst.cols());

    let lhs_max = bit_depth.lhs.max_value();
    let rhs_max = bit_depth.rhs.max_value();
    let rescale_xx = ConstantFraction::new(255 * 255, lhs_max * rhs_max);
    let rescale_x1 = ConstantFraction::new(255, lhs_max);
    let rescale_1x = ConstantFraction::new(255, rhs_max);

    for c in 0..dst_block.cols {
        let c_dst = c + dst_block.start_col;
        for r in 0..dst_block.rows {
            let r_dst = r + dst_block.start_row;
            // The truth value sum_k (lhs[r][k] - lhs_off) * (rhs[k][c] - rhs_off)
            // expands into four terms: xx (raw accumulator), the two cross
            // terms x1/1x built from the per-slice sums, and the constant
            // 11 term. Where requantization narrowed the operands, xx, x1
            // and 1x are first rescaled back to the 0..255 scale.
            let raw_xx = src[r + c * src_stride];
            let raw_x1 = -(lhs_sums[r] * rhs_offset.at(c_dst));
            let raw_1x = -(rhs_sums[c] * lhs_offset.at(r_dst));
            let term_xx = rescale_xx.apply(raw_xx);
            let term_x1 = rescale_x1.apply(raw_x1);
            let term_1x = rescale_1x.apply(raw_1x);
            let term_11 = lhs_offset.at(r_dst) * rhs_offset.at(c_dst) * depth as i32;
            let sum = term_xx + term_x1 + term_1x + term_11;

            let output = pipeline.eval(sum, r_dst, c_dst);
            unsafe { dst.write(r_dst, c_dst, output) };
        }
    }
}

//! Low-precision (8-bit operand) matrix multiplication for quantized
//! neural-network inference.
//!
//! The engine accepts two 8-bit matrices plus integer zero-point offsets,
//! computes exact 32-bit integer products, and emits the final result
//! through a configurable output pipeline (rescaling, bias, clamping,
//! activation, saturating cast).
//!
//! The computation is organized as packing, scheduled compute and
//! unpacking: operand blocks are cache-blocked and reformatted into the
//! layout the compute kernel consumes, work is distributed over a
//! persistent worker pool, and raw accumulators are corrected for the
//! zero-point offsets before flowing through the output pipeline.
//!
//! ## Usage
//!
//! Construct a [`GemmContext`] once and thread it through every call; it
//! owns the worker pool and scratch memory, so repeated calls amortize
//! thread creation and allocation.
//!
//! ```
//! use lowgemm::{
//!     gemm, BitDepthParams, GemmContext, MapOrder, MatrixMap, MatrixMapMut,
//! };
//!
//! let mut context = GemmContext::new();
//! let a = [1u8; 8]; // 2x4, row-major
//! let b = [1u8; 12]; // 4x3, row-major
//! let mut c = [0u8; 6];
//!
//! let lhs = MatrixMap::new(&a, 2, 4, MapOrder::RowMajor);
//! let rhs = MatrixMap::new(&b, 4, 3, MapOrder::RowMajor);
//! let mut result = MatrixMapMut::new(&mut c, 2, 3, MapOrder::RowMajor);
//!
//! gemm(
//!     &mut context,
//!     &lhs,
//!     &rhs,
//!     &mut result,
//!     0, // lhs zero point
//!     0, // rhs zero point
//!     0, // result offset
//!     1, // result multiplier
//!     0, // result shift
//!     &BitDepthParams::L8R8,
//! )
//! .unwrap();
//! assert_eq!(c, [4; 6]);
//! ```

mod allocator;
mod block;
mod compute;
mod errors;
mod fixedpoint;
mod gemm;
mod matrix;
mod output;
mod packing;
mod scheduler;
mod unpack;

pub mod bit_depth;
pub mod eight_bit;
pub mod kernels;

pub use bit_depth::{BitDepth, BitDepthParams, BitDepthSetting, RoundingMode};
pub use errors::{GemmError, GemmResult};
pub use gemm::GemmContext;
pub use matrix::{MapOrder, MatrixBlockBounds, MatrixMap, MatrixMapMut, OffsetVector};
pub use output::{
    make_standard_output_pipeline, BiasVector, OutputPipeline, OutputStage,
    OutputStageBiasAddition, OutputStageClamp, OutputStageQuantizeDownInt32ToUint8Scale,
    OutputStageQuantizeDownInt32ToUint8ScalePc, OutputStageSaturatingCastToUint8,
    OutputStageTanh, VectorShape,
};

use kernels::default_kernel;
use matrix::ResultView;

/// Compute a low-precision matrix product with per-index zero-point
/// offsets, feeding each corrected accumulator through `pipeline`.
///
/// `lhs` is `M x K`, `rhs` is `K x N` and `result` is `M x N`. The offsets
/// are subtracted from the operand values; a
/// [`Scalar`](OffsetVector::Scalar) offset broadcasts one zero point over
/// the whole side, while a [`Slice`](OffsetVector::Slice) offset supplies
/// one zero point per result row (LHS) or column (RHS).
///
/// The pipeline's first stage must accept `i32`; its final output type is
/// the destination element type. The empty pipeline `()` stores the raw
/// `i32` accumulators.
pub fn gemm_with_output_pipeline_pc<P>(
    context: &mut GemmContext,
    lhs: &MatrixMap<u8>,
    rhs: &MatrixMap<u8>,
    result: &mut MatrixMapMut<P::Output>,
    lhs_offset: &OffsetVector,
    rhs_offset: &OffsetVector,
    bit_depth: &BitDepthParams,
    pipeline: &P,
) -> GemmResult
where
    P: OutputPipeline<i32> + Sync,
    P::Output: Copy + Send,
{
    if lhs.cols() != rhs.rows() {
        return Err(GemmError::KSizeMismatch);
    }
    if result.rows() != lhs.rows() || result.cols() != rhs.cols() {
        return Err(GemmError::ResultSizeMismatch);
    }
    if let OffsetVector::Slice(values) = lhs_offset {
        if values.len() != result.rows() {
            return Err(GemmError::WrongOffsetSize);
        }
    }
    if let OffsetVector::Slice(values) = rhs_offset {
        if values.len() != result.cols() {
            return Err(GemmError::WrongOffsetSize);
        }
    }

    // Vacuous product: nothing to compute, nothing to store.
    if result.rows() == 0 || result.cols() == 0 || lhs.cols() == 0 {
        return Ok(());
    }

    let kernel = default_kernel();
    let result_view = ResultView::from_map(result);
    gemm::multi_thread_gemm(
        context,
        kernel,
        *lhs,
        *rhs,
        &result_view,
        lhs_offset,
        rhs_offset,
        bit_depth,
        pipeline,
    );
    Ok(())
}

/// Variant of [`gemm_with_output_pipeline_pc`] with one scalar zero point
/// per side.
pub fn gemm_with_output_pipeline<P>(
    context: &mut GemmContext,
    lhs: &MatrixMap<u8>,
    rhs: &MatrixMap<u8>,
    result: &mut MatrixMapMut<P::Output>,
    lhs_offset: i32,
    rhs_offset: i32,
    bit_depth: &BitDepthParams,
    pipeline: &P,
) -> GemmResult
where
    P: OutputPipeline<i32> + Sync,
    P::Output: Copy + Send,
{
    gemm_with_output_pipeline_pc(
        context,
        lhs,
        rhs,
        result,
        &OffsetVector::Scalar(lhs_offset),
        &OffsetVector::Scalar(rhs_offset),
        bit_depth,
        pipeline,
    )
}

/// Compute a low-precision matrix product through the standard output
/// pipeline: quantize-down with `(result_offset, result_mult_int,
/// result_shift)`, then saturating cast to `u8`.
pub fn gemm(
    context: &mut GemmContext,
    lhs: &MatrixMap<u8>,
    rhs: &MatrixMap<u8>,
    result: &mut MatrixMapMut<u8>,
    lhs_offset: i32,
    rhs_offset: i32,
    result_offset: i32,
    result_mult_int: i32,
    result_shift: i32,
    bit_depth: &BitDepthParams,
) -> GemmResult {
    let pipeline = make_standard_output_pipeline(result_offset, result_mult_int, result_shift);
    gemm_with_output_pipeline(
        context,
        lhs,
        rhs,
        result,
        lhs_offset,
        rhs_offset,
        bit_depth,
        &pipeline,
    )
}

#[cfg(test)]
mod tests;

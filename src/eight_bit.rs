//! Legacy scalar entry points.
//!
//! These preserve the historic call shapes: raw slices plus transpose flags
//! and leading strides for all three matrices, scalar zero-point offsets,
//! and output scaling given either as an integer `(mult, shift)` pair (u8
//! output) or as a float multiplier (f32 output). Each call maps directly
//! onto one invocation of the engine with the standard output pipeline.
//!
//! Where the original interface kept a process-global context, these
//! functions take an explicit [`GemmContext`] argument instead.

use crate::bit_depth::{BitDepthParams, BitDepthSetting};
use crate::errors::{GemmError, GemmResult};
use crate::gemm::GemmContext;
use crate::gemm_with_output_pipeline_pc;
use crate::matrix::{required_len as result_len, MapOrder, MatrixMap, MatrixMapMut, OffsetVector};
use crate::output::make_standard_output_pipeline;

/// Requantizing to fewer bits costs a pass over the operands, so it is only
/// worth doing if the compute-to-packing ratio is large enough.
const MINIMUM_WIDTH_FOR_REQUANTIZATION: usize = 100;

/// We pack `depth * (rows + cols)` values and compute `depth * rows * cols`
/// products, so the compute/packing cost ratio is `rows * cols /
/// (rows + cols)`.
fn is_requantization_worth_it(rows: usize, cols: usize) -> bool {
    2 * rows * cols >= (rows + cols) * MINIMUM_WIDTH_FOR_REQUANTIZATION
}

fn effective_bit_depth_params(setting: BitDepthSetting, rows: usize, cols: usize) -> BitDepthParams {
    match setting {
        BitDepthSetting::A8B8 => BitDepthParams::L8R8,
        BitDepthSetting::A5B7 => {
            if is_requantization_worth_it(rows, cols) {
                BitDepthParams::L7R5
            } else {
                BitDepthParams::L8R8
            }
        }
    }
}

fn order_for_transpose(transpose: bool) -> MapOrder {
    if transpose {
        MapOrder::RowMajor
    } else {
        MapOrder::ColMajor
    }
}

/// Compute `c = scale((a - a_offset) * (b - b_offset))` with `u8` output.
///
/// `a` is `m x k`, `b` is `k x n`, `c` is `m x n`; each matrix is
/// column-major unless its transpose flag is set, with the given leading
/// stride. The result scaling is
/// `((acc + c_offset) * c_mult_int + rounding) >> c_shift`, saturated to
/// `[0, 255]`.
pub fn eight_bit_int_gemm(
    context: &mut GemmContext,
    transpose_a: bool,
    transpose_b: bool,
    transpose_c: bool,
    m: usize,
    n: usize,
    k: usize,
    a: &[u8],
    a_offset: i32,
    lda: usize,
    b: &[u8],
    b_offset: i32,
    ldb: usize,
    c: &mut [u8],
    c_offset: i32,
    c_mult_int: i32,
    c_shift: i32,
    ldc: usize,
    bit_depth: BitDepthSetting,
) -> GemmResult {
    if m == 0 || n == 0 || k == 0 {
        return Ok(());
    }

    let result_order = order_for_transpose(transpose_c);
    if c.len() < result_len(m, n, result_order, ldc) {
        return Err(GemmError::OutputSizeMismatch);
    }

    let lhs = MatrixMap::with_stride(a, m, k, order_for_transpose(transpose_a), lda);
    let rhs = MatrixMap::with_stride(b, k, n, order_for_transpose(transpose_b), ldb);
    let mut result = MatrixMapMut::with_stride(c, m, n, result_order, ldc);

    let params = effective_bit_depth_params(bit_depth, m, n);
    let pipeline = make_standard_output_pipeline(c_offset, c_mult_int, c_shift);

    gemm_with_output_pipeline_pc(
        context,
        &lhs,
        &rhs,
        &mut result,
        &OffsetVector::Scalar(a_offset),
        &OffsetVector::Scalar(b_offset),
        &params,
        &pipeline,
    )
}

/// Variant of [`eight_bit_int_gemm`] with `f32` output: the raw `i32`
/// results are computed into a context-owned scratch buffer and scaled by
/// `c_offset`.
pub fn eight_bit_int_gemm_float(
    context: &mut GemmContext,
    transpose_a: bool,
    transpose_b: bool,
    transpose_c: bool,
    m: usize,
    n: usize,
    k: usize,
    a: &[u8],
    a_offset: i32,
    lda: usize,
    b: &[u8],
    b_offset: i32,
    ldb: usize,
    c: &mut [f32],
    c_offset: f32,
    ldc: usize,
    bit_depth: BitDepthSetting,
) -> GemmResult {
    if m == 0 || n == 0 || k == 0 {
        return Ok(());
    }

    let result_order = order_for_transpose(transpose_c);
    if c.len() < result_len(m, n, result_order, ldc) {
        return Err(GemmError::OutputSizeMismatch);
    }

    let scratch_len = match result_order {
        MapOrder::RowMajor => m * ldc,
        MapOrder::ColMajor => n * ldc,
    };
    let mut scratch = context.take_scratch(scratch_len);

    let status = {
        let lhs = MatrixMap::with_stride(a, m, k, order_for_transpose(transpose_a), lda);
        let rhs = MatrixMap::with_stride(b, k, n, order_for_transpose(transpose_b), ldb);
        let mut temp_result =
            MatrixMapMut::with_stride(&mut scratch[..scratch_len], m, n, result_order, ldc);

        let params = effective_bit_depth_params(bit_depth, m, n);
        // Empty pipeline: raw i32 accumulators.
        gemm_with_output_pipeline_pc(
            context,
            &lhs,
            &rhs,
            &mut temp_result,
            &OffsetVector::Scalar(a_offset),
            &OffsetVector::Scalar(b_offset),
            &params,
            &(),
        )
    };

    if status.is_ok() {
        match result_order {
            MapOrder::RowMajor => {
                for i in 0..m {
                    let dest_row = &mut c[i * ldc..i * ldc + n];
                    let src_row = &scratch[i * ldc..i * ldc + n];
                    for j in 0..n {
                        dest_row[j] = src_row[j] as f32 * c_offset;
                    }
                }
            }
            MapOrder::ColMajor => {
                for i in 0..n {
                    let dest_col = &mut c[i * ldc..i * ldc + m];
                    let src_col = &scratch[i * ldc..i * ldc + m];
                    for j in 0..m {
                        dest_col[j] = src_col[j] as f32 * c_offset;
                    }
                }
            }
        }
    }

    context.restore_scratch(scratch);
    status
}

/// Cap the number of threads used by GEMM calls through this context.
/// Zero restores automatic hardware detection.
pub fn set_max_num_threads(context: &mut GemmContext, max_num_threads: usize) {
    context.set_max_threads(max_num_threads);
}

/// Tear down the context's worker pool and scratch storage. Safe to call
/// between GEMM calls; the next call re-creates what it needs.
pub fn free_persistent_resources(context: &mut GemmContext) {
    context.free_persistent_resources();
}

#[cfg(test)]
mod tests {
    use super::{
        eight_bit_int_gemm, eight_bit_int_gemm_float, free_persistent_resources,
        is_requantization_worth_it, set_max_num_threads,
    };
    use crate::bit_depth::BitDepthSetting;
    use crate::errors::GemmError;
    use crate::gemm::GemmContext;

    #[test]
    fn test_requantization_worth_it_heuristic() {
        assert!(!is_requantization_worth_it(1, 1));
        assert!(!is_requantization_worth_it(50, 50));
        assert!(is_requantization_worth_it(100, 100));
        assert!(is_requantization_worth_it(1000, 1000));
    }

    /// The concrete all-ones scenario: L = 4x8 of ones, R = 8x4 of ones,
    /// zero offsets, identity scaling. Every output cell is the depth, 8.
    #[test]
    fn test_all_ones_gemm() {
        let mut context = GemmContext::new();
        let (m, n, k) = (4, 4, 8);
        let a = vec![1u8; m * k];
        let b = vec![1u8; k * n];
        let mut c = vec![0u8; m * n];

        eight_bit_int_gemm(
            &mut context,
            false,
            false,
            false,
            m,
            n,
            k,
            &a,
            0,
            m,
            &b,
            0,
            k,
            &mut c,
            0,
            1,
            0,
            m,
            BitDepthSetting::A8B8,
        )
        .unwrap();

        assert!(c.iter().all(|&x| x == 8));
    }

    /// Same matrices with both offsets at -1: the corrected product is
    /// (1 - (-1))^2 summed over depth 8, i.e. 32 per cell.
    #[test]
    fn test_all_ones_gemm_with_offsets() {
        let mut context = GemmContext::new();
        let (m, n, k) = (4, 4, 8);
        let a = vec![1u8; m * k];
        let b = vec![1u8; k * n];
        let mut c = vec![0u8; m * n];

        eight_bit_int_gemm(
            &mut context,
            false,
            false,
            false,
            m,
            n,
            k,
            &a,
            -1,
            m,
            &b,
            -1,
            k,
            &mut c,
            0,
            1,
            0,
            m,
            BitDepthSetting::A8B8,
        )
        .unwrap();

        assert!(c.iter().all(|&x| x == 32));
    }

    #[test]
    fn test_transpose_flags() {
        let mut context = GemmContext::new();
        // a = [[1, 2], [3, 4]] supplied row-major via the transpose flag.
        let a = [1u8, 2, 3, 4];
        // b = identity, column-major.
        let b = [1u8, 0, 0, 1];
        let mut c = vec![0u8; 4];

        eight_bit_int_gemm(
            &mut context,
            true,
            false,
            true,
            2,
            2,
            2,
            &a,
            0,
            2,
            &b,
            0,
            2,
            &mut c,
            0,
            1,
            0,
            2,
            BitDepthSetting::A8B8,
        )
        .unwrap();

        // Row-major result equals a.
        assert_eq!(c, &a[..]);
    }

    #[test]
    fn test_float_output_scaling() {
        let mut context = GemmContext::new();
        let (m, n, k) = (3, 3, 4);
        let a = vec![2u8; m * k];
        let b = vec![3u8; k * n];
        let mut c = vec![0f32; m * n];

        eight_bit_int_gemm_float(
            &mut context,
            false,
            false,
            false,
            m,
            n,
            k,
            &a,
            0,
            m,
            &b,
            0,
            k,
            &mut c,
            0.5,
            m,
            BitDepthSetting::A8B8,
        )
        .unwrap();

        // Each raw accumulator is 2 * 3 * 4 = 24; scaled by 0.5.
        assert!(c.iter().all(|&x| x == 12.0));
    }

    #[test]
    fn test_output_too_short() {
        let mut context = GemmContext::new();
        let a = [1u8; 4];
        let b = [1u8; 4];
        let mut c = [0u8; 3];
        let result = eight_bit_int_gemm(
            &mut context,
            false,
            false,
            false,
            2,
            2,
            2,
            &a,
            0,
            2,
            &b,
            0,
            2,
            &mut c,
            0,
            1,
            0,
            2,
            BitDepthSetting::A8B8,
        );
        assert_eq!(result, Err(GemmError::OutputSizeMismatch));
    }

    #[test]
    fn test_resource_release_and_reuse() {
        let mut context = GemmContext::new();
        set_max_num_threads(&mut context, 1);

        let a = vec![1u8; 16];
        let b = vec![1u8; 16];
        let mut c = vec![0u8; 16];
        for _ in 0..2 {
            eight_bit_int_gemm(
                &mut context,
                false,
                false,
                false,
                4,
                4,
                4,
                &a,
                0,
                4,
                &b,
                0,
                4,
                &mut c,
                0,
                1,
                0,
                4,
                BitDepthSetting::A8B8,
            )
            .unwrap();
            assert!(c.iter().all(|&x| x == 4));
            free_persistent_resources(&mut context);
        }
    }
}

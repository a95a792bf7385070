//! Crate-level correctness tests: the full pack / compute / unpack engine
//! against a naive reference implementation.

use crate::bit_depth::{BitDepth, BitDepthParams, RoundingMode, RoundingStrategy};
use crate::errors::GemmError;
use crate::gemm::GemmContext;
use crate::matrix::{MapOrder, MatrixMap, MatrixMapMut, OffsetVector};
use crate::output::{
    make_standard_output_pipeline, BiasVector, OutputStageBiasAddition, OutputStageClamp,
    OutputStageQuantizeDownInt32ToUint8ScalePc, OutputStageSaturatingCastToUint8, VectorShape,
};
use crate::{gemm, gemm_with_output_pipeline, gemm_with_output_pipeline_pc};

/// Simple, non-cryptographically secure random number generator.
struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    fn new(seed: u64) -> XorShiftRng {
        XorShiftRng { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut tmp = self.state;
        tmp ^= tmp << 13;
        tmp ^= tmp >> 7;
        tmp ^= tmp << 17;
        self.state = tmp;
        tmp
    }

    fn next_u8(&mut self) -> u8 {
        self.next_u64() as u8
    }

    fn fill_u8(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.next_u8()).collect()
    }

    /// Values restricted to {0, 255}, for which requantization to any bit
    /// depth is exact after rescaling.
    fn fill_extremes(&mut self, len: usize) -> Vec<u8> {
        (0..len)
            .map(|_| if self.next_u64() & 1 == 0 { 0 } else { 255 })
            .collect()
    }
}

/// Reference implementation: the zero-point-corrected product computed
/// directly in wide integer arithmetic, row-major output.
fn reference_gemm(
    lhs: &MatrixMap<u8>,
    rhs: &MatrixMap<u8>,
    lhs_offset: &OffsetVector,
    rhs_offset: &OffsetVector,
) -> Vec<i32> {
    let rows = lhs.rows();
    let cols = rhs.cols();
    let depth = lhs.cols();
    let mut output = vec![0i32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            let mut accum = 0i64;
            for k in 0..depth {
                let lhs_val = lhs.get(r, k) as i64 - lhs_offset.at(r) as i64;
                let rhs_val = rhs.get(k, c) as i64 - rhs_offset.at(c) as i64;
                accum += lhs_val * rhs_val;
            }
            output[r * cols + c] = accum as i32;
        }
    }
    output
}

/// Run the engine with the empty pipeline, returning raw i32 accumulators
/// in row-major order.
fn run_gemm_i32(
    context: &mut GemmContext,
    lhs: &MatrixMap<u8>,
    rhs: &MatrixMap<u8>,
    lhs_offset: &OffsetVector,
    rhs_offset: &OffsetVector,
    bit_depth: &BitDepthParams,
) -> Vec<i32> {
    let mut output = vec![0i32; lhs.rows() * rhs.cols()];
    let mut result = MatrixMapMut::new(&mut output, lhs.rows(), rhs.cols(), MapOrder::RowMajor);
    gemm_with_output_pipeline_pc(
        context,
        lhs,
        rhs,
        &mut result,
        lhs_offset,
        rhs_offset,
        bit_depth,
        &(),
    )
    .unwrap();
    output
}

/// Sizes chosen to fall below, at and above the kernel's native tile size
/// along each dimension, plus a couple of multi-tile cases.
#[test]
fn test_gemm_various_sizes_vs_reference() {
    let mut context = GemmContext::new();
    let mut rng = XorShiftRng::new(1234);

    let row_steps = [1, 2, 7, 8, 9, 16, 33];
    let depth_steps = [1, 3, 15, 16, 17, 40];
    let col_steps = [1, 2, 7, 8, 9, 24, 31];

    let mut cases = Vec::new();
    for &rows in &row_steps {
        cases.push((rows, 16, 8));
    }
    for &depth in &depth_steps {
        cases.push((8, depth, 8));
    }
    for &cols in &col_steps {
        cases.push((8, 16, cols));
    }
    // All dimensions irregular at once.
    cases.push((9, 17, 7));
    cases.push((33, 40, 31));

    for (rows, depth, cols) in cases {
        let lhs_data = rng.fill_u8(rows * depth);
        let rhs_data = rng.fill_u8(depth * cols);
        let lhs = MatrixMap::new(&lhs_data, rows, depth, MapOrder::RowMajor);
        let rhs = MatrixMap::new(&rhs_data, depth, cols, MapOrder::RowMajor);

        for (lhs_offset, rhs_offset) in [
            (OffsetVector::Scalar(0), OffsetVector::Scalar(0)),
            (OffsetVector::Scalar(12), OffsetVector::Scalar(-34)),
        ] {
            let actual = run_gemm_i32(
                &mut context,
                &lhs,
                &rhs,
                &lhs_offset,
                &rhs_offset,
                &BitDepthParams::L8R8,
            );
            let expected = reference_gemm(&lhs, &rhs, &lhs_offset, &rhs_offset);
            assert_eq!(actual, expected, "{}x{}x{}", rows, depth, cols);
        }
    }
}

#[test]
fn test_gemm_per_index_offsets() {
    let mut context = GemmContext::new();
    let mut rng = XorShiftRng::new(5678);

    let (rows, depth, cols) = (13, 21, 11);
    let lhs_data = rng.fill_u8(rows * depth);
    let rhs_data = rng.fill_u8(depth * cols);
    let lhs = MatrixMap::new(&lhs_data, rows, depth, MapOrder::RowMajor);
    let rhs = MatrixMap::new(&rhs_data, depth, cols, MapOrder::RowMajor);

    let lhs_offsets: Vec<i32> = (0..rows as i32).map(|r| r * 3 - 5).collect();
    let rhs_offsets: Vec<i32> = (0..cols as i32).map(|c| 7 - c).collect();
    let lhs_offset = OffsetVector::Slice(&lhs_offsets);
    let rhs_offset = OffsetVector::Slice(&rhs_offsets);

    let actual = run_gemm_i32(
        &mut context,
        &lhs,
        &rhs,
        &lhs_offset,
        &rhs_offset,
        &BitDepthParams::L8R8,
    );
    let expected = reference_gemm(&lhs, &rhs, &lhs_offset, &rhs_offset);
    assert_eq!(actual, expected);
}

/// Inputs in every storage order combination, including a strided
/// sub-matrix view, must all agree with the reference.
#[test]
fn test_gemm_storage_orders_and_strides() {
    let mut context = GemmContext::new();
    let mut rng = XorShiftRng::new(999);

    let (rows, depth, cols) = (5, 9, 6);
    let row_major = rng.fill_u8(rows * depth);
    let mut col_major = vec![0u8; rows * depth];
    for r in 0..rows {
        for k in 0..depth {
            col_major[k * rows + r] = row_major[r * depth + k];
        }
    }
    let rhs_data = rng.fill_u8(depth * cols);
    let rhs = MatrixMap::new(&rhs_data, depth, cols, MapOrder::ColMajor);

    let lhs_offset = OffsetVector::Scalar(3);
    let rhs_offset = OffsetVector::Scalar(-2);

    let lhs_rm = MatrixMap::new(&row_major, rows, depth, MapOrder::RowMajor);
    let lhs_cm = MatrixMap::new(&col_major, rows, depth, MapOrder::ColMajor);
    let expected = reference_gemm(&lhs_rm, &rhs, &lhs_offset, &rhs_offset);

    for lhs in [lhs_rm, lhs_cm] {
        let actual = run_gemm_i32(
            &mut context,
            &lhs,
            &rhs,
            &lhs_offset,
            &rhs_offset,
            &BitDepthParams::L8R8,
        );
        assert_eq!(actual, expected);
    }

    // A strided view: the same LHS embedded in a larger buffer.
    let padded_stride = depth + 4;
    let mut padded = vec![0xAAu8; rows * padded_stride];
    for r in 0..rows {
        padded[r * padded_stride..r * padded_stride + depth]
            .copy_from_slice(&row_major[r * depth..(r + 1) * depth]);
    }
    let lhs_strided =
        MatrixMap::with_stride(&padded, rows, depth, MapOrder::RowMajor, padded_stride);
    let actual = run_gemm_i32(
        &mut context,
        &lhs_strided,
        &rhs,
        &lhs_offset,
        &rhs_offset,
        &BitDepthParams::L8R8,
    );
    assert_eq!(actual, expected);
}

/// A deep accumulation spanning several inner depth blocks, exercising the
/// kernel's accumulate-on-revisit path.
#[test]
fn test_gemm_deep_accumulation() {
    let mut context = GemmContext::new();
    let mut rng = XorShiftRng::new(4321);

    let (rows, depth, cols) = (16, 2100, 16);
    let lhs_data = rng.fill_u8(rows * depth);
    let rhs_data = rng.fill_u8(depth * cols);
    let lhs = MatrixMap::new(&lhs_data, rows, depth, MapOrder::RowMajor);
    let rhs = MatrixMap::new(&rhs_data, depth, cols, MapOrder::RowMajor);

    let lhs_offset = OffsetVector::Scalar(100);
    let rhs_offset = OffsetVector::Scalar(100);

    let actual = run_gemm_i32(
        &mut context,
        &lhs,
        &rhs,
        &lhs_offset,
        &rhs_offset,
        &BitDepthParams::L8R8,
    );
    let expected = reference_gemm(&lhs, &rhs, &lhs_offset, &rhs_offset);
    assert_eq!(actual, expected);
}

/// Scheduling must not change results: forcing one thread and forcing
/// several must be bit-identical.
#[test]
fn test_thread_count_invariance() {
    let mut rng = XorShiftRng::new(777);

    let (rows, depth, cols) = (64, 64, 64);
    let lhs_data = rng.fill_u8(rows * depth);
    let rhs_data = rng.fill_u8(depth * cols);
    let lhs = MatrixMap::new(&lhs_data, rows, depth, MapOrder::RowMajor);
    let rhs = MatrixMap::new(&rhs_data, depth, cols, MapOrder::RowMajor);

    let lhs_offset = OffsetVector::Scalar(-3);
    let rhs_offset = OffsetVector::Scalar(5);

    let mut outputs = Vec::new();
    for threads in [1, 2, 4] {
        let mut context = GemmContext::new();
        context.set_max_threads(threads);
        outputs.push(run_gemm_i32(
            &mut context,
            &lhs,
            &rhs,
            &lhs_offset,
            &rhs_offset,
            &BitDepthParams::L8R8,
        ));
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], outputs[2]);

    let expected = reference_gemm(&lhs, &rhs, &lhs_offset, &rhs_offset);
    assert_eq!(outputs[0], expected);
}

/// Requantized GEMM on values restricted to {0, 255}: requantization and
/// the rescaling in unpack are exact for these values under every rounding
/// mode, so results must match the plain reference bit for bit.
#[test]
fn test_requantized_gemm_exact_extremes() {
    let mut context = GemmContext::new();
    let mut rng = XorShiftRng::new(31415);

    struct Case {
        rows: usize,
        depth: usize,
        cols: usize,
        params: BitDepthParams,
    }

    // Depth below the rounding threshold takes the round-to-nearest path;
    // a strategy with a zero threshold forces the dithered paths.
    let dithered_xorshift = BitDepthParams {
        lhs: BitDepth::new(7),
        rhs: BitDepth::new(5),
        rounding: RoundingStrategy {
            for_small_sizes: RoundingMode::Nearest,
            for_large_sizes: RoundingMode::ProbabilisticXorshift,
            size_threshold: 0,
        },
    };
    let dithered_addmod = BitDepthParams {
        lhs: BitDepth::new(7),
        rhs: BitDepth::new(5),
        rounding: RoundingStrategy {
            for_small_sizes: RoundingMode::Nearest,
            for_large_sizes: RoundingMode::ProbabilisticAddmod,
            size_threshold: 0,
        },
    };

    let cases = [
        Case {
            rows: 8,
            depth: 40,
            cols: 8,
            params: BitDepthParams::L7R5,
        },
        Case {
            rows: 11,
            depth: 400, // above the threshold: add/mod dithering
            cols: 9,
            params: BitDepthParams::L7R5,
        },
        Case {
            rows: 7,
            depth: 64,
            cols: 13,
            params: dithered_xorshift,
        },
        Case {
            rows: 7,
            depth: 64,
            cols: 13,
            params: dithered_addmod,
        },
    ];

    for Case {
        rows,
        depth,
        cols,
        params,
    } in cases
    {
        let lhs_data = rng.fill_extremes(rows * depth);
        let rhs_data = rng.fill_extremes(depth * cols);
        let lhs = MatrixMap::new(&lhs_data, rows, depth, MapOrder::RowMajor);
        let rhs = MatrixMap::new(&rhs_data, depth, cols, MapOrder::RowMajor);

        let lhs_offset = OffsetVector::Scalar(127);
        let rhs_offset = OffsetVector::Scalar(128);

        let actual = run_gemm_i32(&mut context, &lhs, &rhs, &lhs_offset, &rhs_offset, &params);
        let expected = reference_gemm(&lhs, &rhs, &lhs_offset, &rhs_offset);
        assert_eq!(actual, expected, "{}x{}x{}", rows, depth, cols);
    }
}

/// The standard pipeline applied on top of the reference accumulators.
#[test]
fn test_gemm_u8_standard_pipeline() {
    let mut context = GemmContext::new();
    let mut rng = XorShiftRng::new(271828);

    let (rows, depth, cols) = (9, 12, 10);
    let lhs_data = rng.fill_u8(rows * depth);
    let rhs_data = rng.fill_u8(depth * cols);
    let lhs = MatrixMap::new(&lhs_data, rows, depth, MapOrder::RowMajor);
    let rhs = MatrixMap::new(&rhs_data, depth, cols, MapOrder::RowMajor);

    let (result_offset, result_mult, result_shift) = (-16384, 3, 8);

    let mut output = vec![0u8; rows * cols];
    let mut result = MatrixMapMut::new(&mut output, rows, cols, MapOrder::RowMajor);
    gemm(
        &mut context,
        &lhs,
        &rhs,
        &mut result,
        127,
        127,
        result_offset,
        result_mult,
        result_shift,
        &BitDepthParams::L8R8,
    )
    .unwrap();

    let raw = reference_gemm(
        &lhs,
        &rhs,
        &OffsetVector::Scalar(127),
        &OffsetVector::Scalar(127),
    );
    let expected: Vec<u8> = raw
        .iter()
        .map(|&acc| {
            let rounding = 1 << (result_shift - 1);
            let scaled = ((acc + result_offset) * result_mult + rounding) >> result_shift;
            scaled.clamp(0, 255) as u8
        })
        .collect();
    assert_eq!(output, expected);
}

/// A longer pipeline: bias addition, clamp, per-channel quantize-down,
/// saturating cast.
#[test]
fn test_gemm_multi_stage_pipeline() {
    let mut context = GemmContext::new();
    let mut rng = XorShiftRng::new(161803);

    let (rows, depth, cols) = (6, 8, 4);
    let lhs_data = rng.fill_u8(rows * depth);
    let rhs_data = rng.fill_u8(depth * cols);
    let lhs = MatrixMap::new(&lhs_data, rows, depth, MapOrder::RowMajor);
    let rhs = MatrixMap::new(&rhs_data, depth, cols, MapOrder::RowMajor);

    let bias: Vec<i32> = (0..rows as i32).map(|r| r * 1000).collect();
    let channel_offsets: Vec<i32> = (0..cols as i32).map(|c| -c * 512).collect();
    let channel_mults: Vec<i32> = (0..cols as i32).map(|c| c + 1).collect();

    let pipeline = (
        OutputStageBiasAddition {
            bias_vector: BiasVector::Column(&bias),
        },
        OutputStageClamp {
            min: 0,
            max: 65535,
        },
        OutputStageQuantizeDownInt32ToUint8ScalePc {
            shape: VectorShape::Row,
            result_offset: &channel_offsets,
            result_mult_int: &channel_mults,
            result_shift: 8,
        },
        OutputStageSaturatingCastToUint8,
    );

    let mut output = vec![0u8; rows * cols];
    let mut result = MatrixMapMut::new(&mut output, rows, cols, MapOrder::RowMajor);
    gemm_with_output_pipeline(
        &mut context,
        &lhs,
        &rhs,
        &mut result,
        0,
        0,
        &BitDepthParams::L8R8,
        &pipeline,
    )
    .unwrap();

    let raw = reference_gemm(
        &lhs,
        &rhs,
        &OffsetVector::Scalar(0),
        &OffsetVector::Scalar(0),
    );
    for r in 0..rows {
        for c in 0..cols {
            let mut value = raw[r * cols + c] + bias[r];
            value = value.clamp(0, 65535);
            value = ((value + channel_offsets[c]) * channel_mults[c] + (1 << 7)) >> 8;
            let expected = value.clamp(0, 255) as u8;
            assert_eq!(output[r * cols + c], expected, "({}, {})", r, c);
        }
    }
}

/// Column-major destination with a stride larger than the row count.
#[test]
fn test_gemm_strided_destination() {
    let mut context = GemmContext::new();
    let mut rng = XorShiftRng::new(55);

    let (rows, depth, cols) = (4, 8, 3);
    let lhs_data = rng.fill_u8(rows * depth);
    let rhs_data = rng.fill_u8(depth * cols);
    let lhs = MatrixMap::new(&lhs_data, rows, depth, MapOrder::RowMajor);
    let rhs = MatrixMap::new(&rhs_data, depth, cols, MapOrder::RowMajor);

    let dst_stride = rows + 3;
    let mut output = vec![-1i32; dst_stride * cols];
    let mut result =
        MatrixMapMut::with_stride(&mut output, rows, cols, MapOrder::ColMajor, dst_stride);
    gemm_with_output_pipeline_pc(
        &mut context,
        &lhs,
        &rhs,
        &mut result,
        &OffsetVector::Scalar(0),
        &OffsetVector::Scalar(0),
        &BitDepthParams::L8R8,
        &(),
    )
    .unwrap();

    let expected = reference_gemm(
        &lhs,
        &rhs,
        &OffsetVector::Scalar(0),
        &OffsetVector::Scalar(0),
    );
    for r in 0..rows {
        for c in 0..cols {
            assert_eq!(output[c * dst_stride + r], expected[r * cols + c]);
        }
    }
    // Padding between columns is untouched.
    for c in 0..cols {
        for pad in rows..dst_stride {
            assert_eq!(output[c * dst_stride + pad], -1);
        }
    }
}

#[test]
fn test_gemm_input_errors() {
    let mut context = GemmContext::new();

    let a = [0u8; 6];
    let b = [0u8; 6];
    let lhs = MatrixMap::new(&a, 2, 3, MapOrder::RowMajor);
    let rhs = MatrixMap::new(&b, 3, 2, MapOrder::RowMajor);
    let rhs_bad_k = MatrixMap::new(&b, 2, 3, MapOrder::RowMajor);

    let mut out = [0i32; 4];
    let mut result = MatrixMapMut::new(&mut out, 2, 2, MapOrder::RowMajor);

    // K mismatch.
    let status = gemm_with_output_pipeline_pc(
        &mut context,
        &lhs,
        &rhs_bad_k,
        &mut result,
        &OffsetVector::Scalar(0),
        &OffsetVector::Scalar(0),
        &BitDepthParams::L8R8,
        &(),
    );
    assert_eq!(status, Err(GemmError::KSizeMismatch));

    // Result shape mismatch.
    let mut small = [0i32; 2];
    let mut bad_result = MatrixMapMut::new(&mut small, 1, 2, MapOrder::RowMajor);
    let status = gemm_with_output_pipeline_pc(
        &mut context,
        &lhs,
        &rhs,
        &mut bad_result,
        &OffsetVector::Scalar(0),
        &OffsetVector::Scalar(0),
        &BitDepthParams::L8R8,
        &(),
    );
    assert_eq!(status, Err(GemmError::ResultSizeMismatch));

    // Offset vector length mismatches.
    let short_offsets = [0i32; 1];
    let status = gemm_with_output_pipeline_pc(
        &mut context,
        &lhs,
        &rhs,
        &mut result,
        &OffsetVector::Slice(&short_offsets),
        &OffsetVector::Scalar(0),
        &BitDepthParams::L8R8,
        &(),
    );
    assert_eq!(status, Err(GemmError::WrongOffsetSize));
    let status = gemm_with_output_pipeline_pc(
        &mut context,
        &lhs,
        &rhs,
        &mut result,
        &OffsetVector::Scalar(0),
        &OffsetVector::Slice(&short_offsets),
        &BitDepthParams::L8R8,
        &(),
    );
    assert_eq!(status, Err(GemmError::WrongOffsetSize));
}

/// Repeated calls through one context must reuse its resources and keep
/// producing correct results, including after an explicit release.
#[test]
fn test_context_reuse() {
    let mut context = GemmContext::new();
    let mut rng = XorShiftRng::new(2024);

    for round in 0..5 {
        let (rows, depth, cols) = (8 + round, 16, 9);
        let lhs_data = rng.fill_u8(rows * depth);
        let rhs_data = rng.fill_u8(depth * cols);
        let lhs = MatrixMap::new(&lhs_data, rows, depth, MapOrder::RowMajor);
        let rhs = MatrixMap::new(&rhs_data, depth, cols, MapOrder::RowMajor);
        let lhs_offset = OffsetVector::Scalar(round as i32);
        let rhs_offset = OffsetVector::Scalar(-(round as i32));

        let actual = run_gemm_i32(
            &mut context,
            &lhs,
            &rhs,
            &lhs_offset,
            &rhs_offset,
            &BitDepthParams::L8R8,
        );
        assert_eq!(actual, reference_gemm(&lhs, &rhs, &lhs_offset, &rhs_offset));

        if round == 2 {
            context.free_persistent_resources();
        }
    }
}

/// The standard-pipeline wrapper used with offsets produces saturated u8
/// output; check the documented all-ones scenarios end to end through the
/// typed API (the legacy entry points have their own copies of these).
#[test]
fn test_standard_pipeline_scenarios() {
    let mut context = GemmContext::new();

    let lhs_data = vec![1u8; 4 * 8];
    let rhs_data = vec![1u8; 8 * 4];
    let lhs = MatrixMap::new(&lhs_data, 4, 8, MapOrder::RowMajor);
    let rhs = MatrixMap::new(&rhs_data, 8, 4, MapOrder::RowMajor);

    let pipeline = make_standard_output_pipeline(0, 1, 0);

    let mut output = vec![0u8; 16];
    let mut result = MatrixMapMut::new(&mut output, 4, 4, MapOrder::RowMajor);
    gemm_with_output_pipeline(
        &mut context,
        &lhs,
        &rhs,
        &mut result,
        0,
        0,
        &BitDepthParams::L8R8,
        &pipeline,
    )
    .unwrap();
    assert!(output.iter().all(|&x| x == 8));

    let mut output = vec![0u8; 16];
    let mut result = MatrixMapMut::new(&mut output, 4, 4, MapOrder::RowMajor);
    gemm_with_output_pipeline(
        &mut context,
        &lhs,
        &rhs,
        &mut result,
        -1,
        -1,
        &BitDepthParams::L8R8,
        &pipeline,
    )
    .unwrap();
    assert!(output.iter().all(|&x| x == 32));
}

//! Cache-blocking parameters for one GEMM call.
//!
//! The outer (L2) tile sizes bound the working set of one packed LHS/RHS
//! block pair plus the result tile so it fits the top-level cache budget.
//! The inner (L1) tile sizes match what the compute loop streams through the
//! per-core cache while invoking the kernel.

use crate::kernels::KernelFormat;

/// Standard cache line size, used for arena alignment. 64-byte lines are the
/// overwhelming majority; being wrong costs at most a 2x factor.
pub(crate) const DEFAULT_CACHE_LINE_SIZE: usize = 64;

// Cache budgets are fixed per-architecture constants rather than queried at
// runtime. The ARM values are tuned low enough to behave on common mobile
// parts; the x86-64 values assume desktop-class hardware.
#[cfg(target_arch = "x86_64")]
pub(crate) const DEFAULT_L1_CACHE_SIZE: usize = 32 * 1024;
#[cfg(target_arch = "x86_64")]
pub(crate) const DEFAULT_L2_CACHE_SIZE: usize = 4 * 1024 * 1024;

#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
pub(crate) const DEFAULT_L1_CACHE_SIZE: usize = 16 * 1024;
#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
pub(crate) const DEFAULT_L2_CACHE_SIZE: usize = 384 * 1024;

#[cfg(not(any(target_arch = "x86_64", target_arch = "arm", target_arch = "aarch64")))]
pub(crate) const DEFAULT_L1_CACHE_SIZE: usize = 16 * 1024;
#[cfg(not(any(target_arch = "x86_64", target_arch = "arm", target_arch = "aarch64")))]
pub(crate) const DEFAULT_L2_CACHE_SIZE: usize = 256 * 1024;

/// The proportion of the L2 cache budget spent on the packed RHS block. On
/// x86 the LHS is not blocked for L2, so the whole budget goes to the RHS.
#[cfg(target_arch = "x86_64")]
pub(crate) const DEFAULT_L2_RHS_FACTOR: f32 = 1.0;
#[cfg(not(target_arch = "x86_64"))]
pub(crate) const DEFAULT_L2_RHS_FACTOR: f32 = 0.75;

/// Granularity of the packing inner loop along the depth dimension, in
/// elements. Packed runs always cover a whole number of register blocks of
/// this depth, zero-padded at the matrix edge.
pub(crate) const REGISTER_SIZE: usize = 16;

/// Round `value` down to the nearest multiple of `modulus`.
pub(crate) fn round_down(value: usize, modulus: usize) -> usize {
    value - value % modulus
}

/// Round `value` up to the nearest multiple of `modulus`.
pub(crate) fn round_up(value: usize, modulus: usize) -> usize {
    round_down(value + modulus - 1, modulus)
}

/// Return `a / b` rounded up to the nearest integer.
pub(crate) fn ceil_quotient(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Split `range` into chunks of up to `chunk_size`, yielding each sub-range.
pub(crate) fn range_chunks(
    range: std::ops::Range<usize>,
    chunk_size: usize,
) -> impl Iterator<Item = std::ops::Range<usize>> {
    debug_assert!(chunk_size > 0);
    let mut start = range.start;
    std::iter::from_fn(move || {
        if start >= range.end {
            None
        } else {
            let chunk_start = start;
            let chunk_end = (start + chunk_size).min(range.end);
            start = chunk_end;
            Some(chunk_start..chunk_end)
        }
    })
}

/// Which operand a packed block or side parameter set refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Lhs,
    Rhs,
}

/// Cache-blocking sizes for one GEMM call.
///
/// Invariants: `l1_rows`/`l2_rows` are multiples of the kernel's native row
/// count, `l1_cols`/`l2_cols` of its native column count, and the depths of
/// [`REGISTER_SIZE`]. No field is ever zero.
#[derive(Copy, Clone, Debug)]
pub struct BlockParams {
    pub l1_rows: usize,
    pub l1_cols: usize,
    pub l1_depth: usize,
    pub l2_rows: usize,
    pub l2_cols: usize,
    pub l2_depth: usize,
}

impl BlockParams {
    /// Choose block sizes for a `rows x cols x depth` product computed by
    /// `num_threads` threads.
    pub fn init(
        rows: usize,
        cols: usize,
        depth: usize,
        num_threads: usize,
        format: &KernelFormat,
    ) -> BlockParams {
        debug_assert!(rows > 0 && cols > 0 && depth > 0 && num_threads > 0);

        let (l2_rows, l2_cols, l2_depth) =
            find_l2_block_sizes(rows, cols, depth, num_threads, format);
        let (l1_rows, l1_cols, l1_depth) = find_l1_block_sizes(l2_rows, l2_cols, l2_depth, format);

        BlockParams {
            l1_rows,
            l1_cols,
            l1_depth,
            l2_rows,
            l2_cols,
            l2_depth,
        }
    }
}

/// Choose L2 (outer) block sizes such that one packed RHS block plus each
/// thread's packed LHS panel and result tile fit the L2 cache budget.
fn find_l2_block_sizes(
    rows: usize,
    cols: usize,
    depth: usize,
    num_threads: usize,
    format: &KernelFormat,
) -> (usize, usize, usize) {
    // No L2 blocking in the depth dimension: splitting the accumulation
    // would force partial unpacking and lose exactness of the per-slice sums.
    let l2_depth = round_up(depth, REGISTER_SIZE);

    let max_cache_friendly_l2_cols = (((DEFAULT_L2_CACHE_SIZE as f32 * DEFAULT_L2_RHS_FACTOR)
        as usize)
        / l2_depth)
        .max(1);
    let min_l2_cols_blocks = ceil_quotient(cols, max_cache_friendly_l2_cols).max(1);
    let l2_cols = round_up(ceil_quotient(cols, min_l2_cols_blocks), format.cols());

    // Each thread's working set per row is one packed LHS row of `l2_depth`
    // bytes plus one result row of `l2_cols` i32 accumulators.
    let bytes_per_row = l2_depth + 4 * l2_cols;
    let max_cache_friendly_l2_rows = (DEFAULT_L2_CACHE_SIZE
        .saturating_sub(l2_cols * l2_depth)
        / (num_threads * bytes_per_row))
        .max(1);
    let min_l2_rows_blocks = ceil_quotient(rows, max_cache_friendly_l2_rows).max(1);
    let l2_rows = round_up(ceil_quotient(rows, min_l2_rows_blocks), format.rows());

    (l2_rows, l2_cols, l2_depth)
}

/// Choose L1 (inner) block sizes within one L2 block.
fn find_l1_block_sizes(
    rows: usize,
    cols: usize,
    depth: usize,
    format: &KernelFormat,
) -> (usize, usize, usize) {
    debug_assert_eq!(rows % format.rows(), 0);
    debug_assert_eq!(cols % format.cols(), 0);
    debug_assert_eq!(depth % REGISTER_SIZE, 0);

    // No L1 blocking in the rows dimension.
    let l1_rows = rows;

    let max_cache_friendly_l1_depth = (DEFAULT_L1_CACHE_SIZE
        .saturating_sub(32 * format.rows() + 32 * format.cols())
        / (format.rows() + format.cols()))
    .max(1);
    let min_l1_depth_blocks = ceil_quotient(depth, max_cache_friendly_l1_depth).max(1);
    let l1_depth = round_up(ceil_quotient(depth, min_l1_depth_blocks), REGISTER_SIZE);

    let max_cache_friendly_l1_cols = (DEFAULT_L1_CACHE_SIZE / l1_depth).max(1);
    let min_l1_cols_blocks = ceil_quotient(cols, max_cache_friendly_l1_cols).max(1);
    let l1_cols = round_up(ceil_quotient(cols, min_l1_cols_blocks), format.cols());

    (l1_rows, l1_cols, l1_depth)
}

/// The blocking parameters of one operand side, in width/depth terms.
///
/// For the LHS the width dimension is rows; for the RHS it is columns. This
/// lets the packing code treat both sides identically.
#[derive(Copy, Clone, Debug)]
pub struct SideBlockParams {
    pub l1_width: usize,
    pub l1_depth: usize,
    pub l2_width: usize,
    pub l2_depth: usize,
}

/// Project [`BlockParams`] onto one operand side.
pub fn side_block_params(side: Side, block_params: &BlockParams) -> SideBlockParams {
    let (l1_width, l2_width) = match side {
        Side::Lhs => (block_params.l1_rows, block_params.l2_rows),
        Side::Rhs => (block_params.l1_cols, block_params.l2_cols),
    };
    SideBlockParams {
        l1_width,
        l1_depth: block_params.l1_depth,
        l2_width,
        l2_depth: block_params.l2_depth,
    }
}

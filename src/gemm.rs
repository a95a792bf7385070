//! Single- and multi-threaded GEMM drivers and the persistent context.
//!
//! The single-threaded path shows the overall structure: plan blocks, pack
//! the RHS once per column block, pack an LHS slice per row block, compute,
//! unpack. The multi-threaded path keeps the same structure but hands row
//! ranges of each column tile to worker threads, with the dispatching
//! thread packing the shared RHS block up front and executing the final row
//! range itself.

use std::env;
use std::sync::OnceLock;

use crate::allocator::Allocator;
use crate::bit_depth::BitDepthParams;
use crate::block::{ceil_quotient, range_chunks, round_up, BlockParams, Side};
use crate::compute::compute;
use crate::kernels::Kernel;
use crate::matrix::{MatrixBlockBounds, MatrixMap, OffsetVector, ResultView};
use crate::output::OutputPipeline;
use crate::packing::{pack_lhs, pack_rhs, PackedSideBlock};
use crate::scheduler::{Task, WorkersPool};
use crate::unpack::{unpack_result, PackedResult};

/// Minimum rows of work to give one thread. Thinner workloads than this
/// lose more to dispatch overhead than they gain from parallelism.
const ABSOLUTE_MIN_ROWS_PER_THREAD: usize = 16;

/// Minimum rows*cols*depth of work per thread. Below this, extra threads
/// sit idle on tiny problems. Empirically determined.
const MIN_CUBIC_SIZE_PER_THREAD: u64 = 64 * 1024;

/// Environment variable overriding hardware thread-count detection for the
/// whole process. Clamped to the logical core count.
const NUM_THREADS_ENV_VAR: &str = "LOWGEMM_NUM_THREADS";

/// Hardware concurrency, detected once and cached: querying it is expensive
/// enough that per-call detection would show up on small GEMMs.
fn hardware_thread_count() -> usize {
    static COUNT: OnceLock<usize> = OnceLock::new();
    *COUNT.get_or_init(|| {
        let physical_cpus = num_cpus::get_physical().max(1);
        if let Some(threads_var) = env::var_os(NUM_THREADS_ENV_VAR) {
            match threads_var.to_string_lossy().parse::<usize>() {
                Ok(n_threads) => n_threads.clamp(1, num_cpus::get()),
                Err(_) => physical_cpus,
            }
        } else {
            physical_cpus
        }
    })
}

/// Persistent state shared by GEMM calls: the worker pool, the arenas and
/// the user thread-count cap.
///
/// Construct one context and thread it through every call. The pool and
/// arena storage grow lazily and are reused by subsequent calls, so
/// steady-state GEMMs neither spawn threads nor allocate.
pub struct GemmContext {
    max_num_threads: usize,
    allocator: Allocator,
    // For N-threaded operations we use N-1 workers and run the last
    // workload on the calling thread. That workload uses this dedicated
    // arena, so the same task code runs regardless of which thread it is on.
    main_thread_task_allocator: Allocator,
    workers_pool: WorkersPool,
    // Scratch for the float-output legacy entry point.
    scratch: Vec<i32>,
}

impl GemmContext {
    pub fn new() -> GemmContext {
        GemmContext {
            max_num_threads: 0,
            allocator: Allocator::new(),
            main_thread_task_allocator: Allocator::new(),
            workers_pool: WorkersPool::new(),
            scratch: Vec::new(),
        }
    }

    /// Cap the number of threads used per call. Zero restores automatic
    /// hardware detection.
    pub fn set_max_threads(&mut self, max_num_threads: usize) {
        self.max_num_threads = max_num_threads;
    }

    pub fn max_threads(&self) -> usize {
        self.max_num_threads
    }

    /// Tear down the worker pool and release all lazily-grown buffers.
    ///
    /// This is the only explicit teardown entry point. It must only be
    /// called while no GEMM is in flight, which the `&mut` receiver
    /// enforces for safe callers.
    pub fn free_persistent_resources(&mut self) {
        self.workers_pool = WorkersPool::new();
        self.allocator.clear();
        self.main_thread_task_allocator.clear();
        self.scratch = Vec::new();
    }

    /// Grow-only scratch buffer, taken and restored around the float-output
    /// path.
    pub(crate) fn take_scratch(&mut self, len: usize) -> Vec<i32> {
        let mut scratch = std::mem::take(&mut self.scratch);
        if scratch.len() < len {
            scratch.resize(len, 0);
        }
        scratch
    }

    pub(crate) fn restore_scratch(&mut self, scratch: Vec<i32>) {
        self.scratch = scratch;
    }
}

impl Default for GemmContext {
    fn default() -> Self {
        GemmContext::new()
    }
}

/// Decide how many threads to use for a `rows x cols x depth` product.
fn how_many_threads(
    max_num_threads: usize,
    rows: usize,
    cols: usize,
    depth: usize,
    kernel_rows: usize,
) -> usize {
    let max_count = if max_num_threads == 0 {
        hardware_thread_count()
    } else {
        max_num_threads
    };

    let min_rows_per_thread = kernel_rows.max(ABSOLUTE_MIN_ROWS_PER_THREAD);
    let mut thread_count = max_count.min(ceil_quotient(rows, min_rows_per_thread));

    // For small products thread_count is already 1. Otherwise, also check
    // that the cubic size is big enough to keep workers busy.
    if thread_count > 1 {
        let cubic_size = rows as u64 * cols as u64 * depth as u64;
        thread_count = thread_count.min((cubic_size / MIN_CUBIC_SIZE_PER_THREAD) as usize);
        if thread_count < 1 {
            thread_count = 1;
        }
    }

    assert!(thread_count >= 1 && thread_count <= max_count);
    thread_count
}

/// Single-threaded GEMM: no thread involvement, numerically identical to
/// the multi-threaded path.
pub(crate) fn single_thread_gemm<P>(
    allocator: &mut Allocator,
    kernel: &dyn Kernel,
    lhs: MatrixMap<u8>,
    rhs: MatrixMap<u8>,
    result: &ResultView<P::Output>,
    lhs_offset: &OffsetVector,
    rhs_offset: &OffsetVector,
    bit_depth: &BitDepthParams,
    pipeline: &P,
) where
    P: OutputPipeline<i32>,
    P::Output: Copy,
{
    assert_eq!(lhs.cols(), rhs.rows());
    let rows = result.rows();
    let cols = result.cols();
    let depth = lhs.cols();
    assert!(rows > 0 && cols > 0 && depth > 0);

    let format = kernel.format();
    let block_params = BlockParams::init(rows, cols, depth, 1, format);

    let packed_lhs = PackedSideBlock::reserve(Side::Lhs, format.lhs, allocator, &block_params);
    let packed_rhs = PackedSideBlock::reserve(Side::Rhs, format.rhs, allocator, &block_params);
    let packed_result = PackedResult::reserve(allocator, &block_params);
    allocator.commit();

    let pack_rhs_once = block_params.l2_cols >= cols;
    if pack_rhs_once {
        // Safety: the allocator is committed and no other view of the block
        // is live.
        unsafe { pack_rhs(&packed_rhs, allocator, rhs, bit_depth) };
    }

    for row_block in range_chunks(0..rows, block_params.l2_rows) {
        let rs = row_block.len();
        unsafe {
            pack_lhs(
                &packed_lhs,
                allocator,
                lhs.block(row_block.start, 0, rs, depth),
                bit_depth,
            )
        };

        for col_block in range_chunks(0..cols, block_params.l2_cols) {
            let cs = col_block.len();
            if !pack_rhs_once {
                unsafe {
                    pack_rhs(
                        &packed_rhs,
                        allocator,
                        rhs.block(0, col_block.start, depth, cs),
                        bit_depth,
                    )
                };
            }

            // Safety: packing of both blocks is complete, so shared views
            // are the only live views; the result block's mutable view does
            // not overlap them.
            unsafe {
                let lhs_view = packed_lhs.as_ref(allocator);
                let rhs_view = packed_rhs.as_ref(allocator);
                compute(
                    kernel,
                    &block_params,
                    packed_result.as_mut_slice(allocator),
                    packed_result.stride(),
                    &lhs_view,
                    &rhs_view,
                    0,
                    round_up(rs, format.rows()),
                    round_up(cs, format.cols()),
                    block_params.l2_depth,
                );
                unpack_result(
                    result,
                    &MatrixBlockBounds::new(row_block.start, col_block.start, rs, cs),
                    packed_result.as_slice(allocator),
                    packed_result.stride(),
                    depth,
                    lhs_view.sums,
                    rhs_view.sums,
                    lhs_offset,
                    rhs_offset,
                    bit_depth,
                    pipeline,
                );
            }
        }
    }

    allocator.decommit();
}

/// The task dispatched to each worker: a block of the RHS has been packed
/// by the dispatching thread; the task packs its own row range of the LHS
/// and accumulates the product of the packed blocks into its slice of the
/// result.
struct GemmWithPackedRhsTask<'a, P>
where
    P: OutputPipeline<i32>,
    P::Output: Copy,
{
    kernel: &'a dyn Kernel,
    lhs: MatrixMap<'a, u8>,
    packed_rhs: crate::packing::PackedSideBlockRef<'a>,
    result: ResultView<P::Output>,
    result_block: MatrixBlockBounds,
    lhs_offset: OffsetVector<'a>,
    rhs_offset: OffsetVector<'a>,
    bit_depth: BitDepthParams,
    pipeline: &'a P,
}

// Safety requirements for Send come from the members: the raw-pointer
// ResultView is Send by its disjoint-rows contract, everything else is
// shared read-only data.
impl<P> Task for GemmWithPackedRhsTask<'_, P>
where
    P: OutputPipeline<i32> + Sync,
    P::Output: Copy + Send,
{
    fn run(&mut self, local_allocator: &mut Allocator) {
        let rows = self.result_block.rows;
        let cols = self.result_block.cols;
        let depth = self.lhs.cols();
        let format = self.kernel.format();

        let block_params = BlockParams::init(rows, cols, depth, 1, format);

        let packed_lhs =
            PackedSideBlock::reserve(Side::Lhs, format.lhs, local_allocator, &block_params);
        let packed_result = PackedResult::reserve(local_allocator, &block_params);
        local_allocator.commit();

        for col_block in range_chunks(0..cols, block_params.l2_cols) {
            let cs = col_block.len();
            for row_block in range_chunks(0..rows, block_params.l2_rows) {
                let rs = row_block.len();
                // Safety: as in single_thread_gemm; the packed RHS view is
                // shared read-only across tasks, while the LHS and result
                // blocks are private to this worker's arena.
                unsafe {
                    pack_lhs(
                        &packed_lhs,
                        local_allocator,
                        self.lhs.block(row_block.start, 0, rs, depth),
                        &self.bit_depth,
                    );
                    let lhs_view = packed_lhs.as_ref(local_allocator);
                    compute(
                        self.kernel,
                        &block_params,
                        packed_result.as_mut_slice(local_allocator),
                        packed_result.stride(),
                        &lhs_view,
                        &self.packed_rhs,
                        col_block.start,
                        round_up(rs, format.rows()),
                        round_up(cs, format.cols()),
                        block_params.l2_depth,
                    );
                    unpack_result(
                        &self.result,
                        &MatrixBlockBounds::new(
                            self.result_block.start_row + row_block.start,
                            self.result_block.start_col + col_block.start,
                            rs,
                            cs,
                        ),
                        packed_result.as_slice(local_allocator),
                        packed_result.stride(),
                        depth,
                        lhs_view.sums,
                        &self.packed_rhs.sums[col_block.start..col_block.start + cs],
                        &self.lhs_offset,
                        &self.rhs_offset,
                        &self.bit_depth,
                        self.pipeline,
                    );
                }
            }
        }

        local_allocator.decommit();
    }
}

/// Multi-threaded GEMM.
///
/// The dispatching thread packs a block of the RHS per outer column tile,
/// then starts worker threads to each pack a row range of the LHS and
/// accumulate the corresponding products, running the final range itself.
pub(crate) fn multi_thread_gemm<P>(
    context: &mut GemmContext,
    kernel: &dyn Kernel,
    lhs: MatrixMap<u8>,
    rhs: MatrixMap<u8>,
    result: &ResultView<P::Output>,
    lhs_offset: &OffsetVector,
    rhs_offset: &OffsetVector,
    bit_depth: &BitDepthParams,
    pipeline: &P,
) where
    P: OutputPipeline<i32> + Sync,
    P::Output: Copy + Send,
{
    assert_eq!(lhs.cols(), rhs.rows());
    let rows = result.rows();
    let cols = result.cols();
    let depth = lhs.cols();
    assert!(rows > 0 && cols > 0 && depth > 0);

    let format = kernel.format();
    let thread_count =
        how_many_threads(context.max_num_threads, rows, cols, depth, format.rows());
    if thread_count == 1 {
        return single_thread_gemm(
            &mut context.allocator,
            kernel,
            lhs,
            rhs,
            result,
            lhs_offset,
            rhs_offset,
            bit_depth,
            pipeline,
        );
    }

    // One workload per thread: N-1 workers plus the calling thread.
    let workers_count = thread_count - 1;
    context.workers_pool.create_workers(workers_count);

    let GemmContext {
        allocator,
        main_thread_task_allocator,
        workers_pool,
        ..
    } = context;

    let block_params = BlockParams::init(rows, cols, depth, workers_count, format);

    let packed_rhs = PackedSideBlock::reserve(Side::Rhs, format.rhs, allocator, &block_params);
    allocator.commit();

    for col_block in range_chunks(0..cols, block_params.l2_cols) {
        let cs = col_block.len();

        // Pack a block of the RHS; it is read-only to every task for the
        // duration of this column tile.
        // Safety: no task is running yet, so no other view is live.
        unsafe {
            pack_rhs(
                &packed_rhs,
                allocator,
                rhs.block(0, col_block.start, depth, cs),
                bit_depth,
            )
        };
        let rhs_view = unsafe { packed_rhs.as_ref(&*allocator) };

        // Partition the rows into contiguous ranges, one per thread, each
        // rounded up to the kernel's row granularity except the last, which
        // absorbs the remainder.
        let mut tasks: Vec<Box<dyn Task + '_>> = Vec::with_capacity(thread_count);
        let mut next_start_row = 0;
        for thread in 0..thread_count {
            let start_row = next_start_row;
            next_start_row =
                rows.min(round_up(rows * (thread + 1) / thread_count, format.rows()));
            let block_rows = next_start_row - start_row;
            debug_assert!(block_rows > 0);

            tasks.push(Box::new(GemmWithPackedRhsTask::<P> {
                kernel,
                lhs: lhs.block(start_row, 0, block_rows, depth),
                packed_rhs: rhs_view,
                result: *result,
                result_block: MatrixBlockBounds::new(start_row, col_block.start, block_rows, cs),
                lhs_offset: *lhs_offset,
                rhs_offset: *rhs_offset,
                bit_depth: *bit_depth,
                pipeline,
            }));
        }

        // Fork-join: returns only after every task has completed, so the
        // shared RHS block can be reused for the next column tile.
        workers_pool.execute(tasks, main_thread_task_allocator);
    }

    allocator.decommit();
}

//! Packing blocks of the LHS and RHS into the layout the kernel expects.
//!
//! The LHS and RHS are handled by one piece of code by addressing them in
//! (width, depth) terms instead of (row, column): the width dimension is
//! rows for the LHS and columns for the RHS, and the depth dimension is the
//! shared contraction dimension. Packing also accumulates the per-width-index
//! sums of the packed values, which the unpacker later needs to reconstruct
//! the zero-point cross terms, and optionally requantizes values to fewer
//! than 8 bits on the way through.

use crate::allocator::{Allocator, Handle};
use crate::bit_depth::{BitDepth, BitDepthParams, RoundingMode};
use crate::block::{range_chunks, round_down, side_block_params, BlockParams, Side, SideBlockParams, REGISTER_SIZE};
use crate::kernels::{offset_into_cell, KernelSideFormat};
use crate::matrix::{MapOrder, MatrixMap};

/// Largest kernel side width the packing scratch buffer supports.
const MAX_KERNEL_WIDTH: usize = 16;

/// Storage order of a [`SideMap`]: WidthMajor means entries sharing a width
/// index are contiguous. For the LHS, width is the rows dimension, so
/// WidthMajor there means row-major; for the RHS it is the opposite.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SideMapOrder {
    WidthMajor,
    DepthMajor,
}

/// Like [`MatrixMap`], but in width/depth terms. Used to address blocks of
/// the input matrices while packing them.
#[derive(Copy, Clone)]
pub(crate) struct SideMap<'a> {
    data: &'a [u8],
    width: usize,
    depth: usize,
    stride: usize,
    order: SideMapOrder,
}

impl<'a> SideMap<'a> {
    fn new(
        data: &'a [u8],
        width: usize,
        depth: usize,
        stride: usize,
        order: SideMapOrder,
    ) -> SideMap<'a> {
        SideMap {
            data,
            width,
            depth,
            stride,
            order,
        }
    }

    fn width(&self) -> usize {
        self.width
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn width_stride(&self) -> usize {
        match self.order {
            SideMapOrder::WidthMajor => self.stride,
            SideMapOrder::DepthMajor => 1,
        }
    }

    fn depth_stride(&self) -> usize {
        match self.order {
            SideMapOrder::WidthMajor => 1,
            SideMapOrder::DepthMajor => self.stride,
        }
    }

    fn get(&self, w: usize, d: usize) -> u8 {
        debug_assert!(w < self.width && d < self.depth);
        self.data[w * self.width_stride() + d * self.depth_stride()]
    }

    fn block(&self, start_width: usize, start_depth: usize, width: usize, depth: usize) -> SideMap<'a> {
        debug_assert!(start_width + width <= self.width);
        debug_assert!(start_depth + depth <= self.depth);
        let offset = start_width * self.width_stride() + start_depth * self.depth_stride();
        SideMap {
            data: &self.data[offset..],
            width,
            depth,
            stride: self.stride,
            order: self.order,
        }
    }
}

/// Source of the rounding offsets used when requantizing to fewer than
/// 8 bits.
pub(crate) enum RoundingOffsetGenerator {
    Exact,
    Nearest,
    /// 8-bit Xorshift(7, 5, 3). Xorshift naturally generates uniform random
    /// nonzero bytes, i.e. 255 different values, so it only remains to
    /// subtract one.
    Xorshift {
        state: u8,
    },
    /// 8-bit add/mod low-discrepancy sequence. The constant 97 must be
    /// relatively prime to 255 for the sequence to be full-period, and
    /// 97/255 is close to the golden-ratio-ish 0.38 that gives low
    /// discrepancy.
    Addmod {
        state: u8,
    },
}

const ADDMOD_CONSTANT: u8 = 97;

impl RoundingOffsetGenerator {
    pub(crate) fn new(mode: RoundingMode) -> RoundingOffsetGenerator {
        match mode {
            RoundingMode::Exact => RoundingOffsetGenerator::Exact,
            RoundingMode::Nearest => RoundingOffsetGenerator::Nearest,
            RoundingMode::ProbabilisticXorshift => RoundingOffsetGenerator::Xorshift { state: 128 },
            // Start must be nonzero.
            RoundingMode::ProbabilisticAddmod => RoundingOffsetGenerator::Addmod { state: 1 },
        }
    }

    /// Next rounding offset in `[0..254]`.
    fn get(&mut self) -> u8 {
        match self {
            RoundingOffsetGenerator::Exact => {
                unreachable!("exact rounding uses no rounding offsets")
            }
            RoundingOffsetGenerator::Nearest => 127,
            RoundingOffsetGenerator::Xorshift { state } => {
                let result = state.wrapping_sub(1);
                let mut x = *state;
                x ^= x << 7;
                x ^= x >> 5;
                x ^= x << 3;
                *state = x;
                result
            }
            RoundingOffsetGenerator::Addmod { state } => {
                // The added boolean term skips the increment over 255
                // (recalling that 255 + 1 == 0 for a u8), implementing %255
                // without a division.
                let skip = (*state >= 255 - ADDMOD_CONSTANT) as u8;
                *state = state.wrapping_add(ADDMOD_CONSTANT + skip);
                *state
            }
        }
    }
}

/// Requantize a source value in `[0..255]` to `[0..2^bits - 1]`.
fn requantize(value: u8, bit_depth: BitDepth, generator: &mut RoundingOffsetGenerator) -> u8 {
    if bit_depth.bits() == 8 {
        return value;
    }
    let max_value = bit_depth.max_value() as u16;
    let scaled = value as u16 * max_value;
    let rounding_offset = generator.get() as u16;
    ((scaled + rounding_offset) / 255) as u8
}

/// A packed block of either the LHS or RHS, laid out in the storage order
/// the kernel format prescribes, together with the per-slice sums of its
/// packed values.
///
/// Both buffers live in an arena; the block itself only holds handles. The
/// packed data is written and read strictly sequentially (run by run), so
/// traversal state lives in cursors and offsets computed by
/// [`run_offset`](PackedSideBlock::run_offset) rather than in the block.
pub(crate) struct PackedSideBlock {
    params: SideBlockParams,
    format: KernelSideFormat,
    data_handle: Handle,
    sums_handle: Handle,
}

impl PackedSideBlock {
    pub(crate) fn reserve(
        side: Side,
        format: KernelSideFormat,
        allocator: &mut Allocator,
        block_params: &BlockParams,
    ) -> PackedSideBlock {
        let params = side_block_params(side, block_params);
        let data_handle = allocator.reserve::<u8>(params.l2_width * params.l2_depth);
        let sums_handle = allocator.reserve::<i32>(params.l2_width);
        PackedSideBlock {
            params,
            format,
            data_handle,
            sums_handle,
        }
    }

    /// Byte offset of the packed run covering widths
    /// `start_width..start_width + kernel_width` at `start_depth`.
    pub(crate) fn run_offset(params: &SideBlockParams, start_width: usize, start_depth: usize) -> usize {
        let kernel_run_depth = params.l1_depth.min(params.l2_depth - start_depth);
        params.l2_width * start_depth + start_width * kernel_run_depth
    }

    /// Return a read-only view of the packed data and sums.
    ///
    /// # Safety
    ///
    /// `allocator` must be the committed allocator this block was reserved
    /// from, the block must have been packed, and no mutable view of it may
    /// be live.
    pub(crate) unsafe fn as_ref<'a>(&self, allocator: &'a Allocator) -> PackedSideBlockRef<'a> {
        unsafe {
            PackedSideBlockRef {
                data: allocator.slice(self.data_handle, self.params.l2_width * self.params.l2_depth),
                sums: allocator.slice(self.sums_handle, self.params.l2_width),
                params: self.params,
                format: self.format,
            }
        }
    }
}

/// Read-only view of a packed side block. This is what the compute loop and
/// worker tasks hold; it is freely shareable across threads.
#[derive(Copy, Clone)]
pub(crate) struct PackedSideBlockRef<'a> {
    pub data: &'a [u8],
    pub sums: &'a [i32],
    pub params: SideBlockParams,
    pub format: KernelSideFormat,
}

impl PackedSideBlockRef<'_> {
    /// The packed run for `kernel_width` widths starting at `start_width`,
    /// covering depths `start_depth..start_depth + run_depth`.
    pub(crate) fn run(&self, start_width: usize, start_depth: usize, run_depth: usize) -> &[u8] {
        let offset = PackedSideBlock::run_offset(&self.params, start_width, start_depth);
        &self.data[offset..offset + self.format.width() * run_depth]
    }
}

/// Pack a block of the input LHS matrix.
///
/// # Safety
///
/// `allocator` must be the committed allocator `dst` was reserved from and
/// no other view of `dst`'s buffers may be live during the call.
pub(crate) unsafe fn pack_lhs(
    dst: &PackedSideBlock,
    allocator: &Allocator,
    src: MatrixMap<u8>,
    bit_depth: &BitDepthParams,
) {
    let order = match src.order() {
        MapOrder::RowMajor => SideMapOrder::WidthMajor,
        MapOrder::ColMajor => SideMapOrder::DepthMajor,
    };
    let side_map = SideMap::new(src.data(), src.rows(), src.cols(), src.stride(), order);
    unsafe { pack_side(dst, allocator, side_map, bit_depth.lhs, bit_depth.rounding.mode_for_depth(side_map.depth())) }
}

/// Pack a block of the input RHS matrix.
///
/// # Safety
///
/// As for [`pack_lhs`].
pub(crate) unsafe fn pack_rhs(
    dst: &PackedSideBlock,
    allocator: &Allocator,
    src: MatrixMap<u8>,
    bit_depth: &BitDepthParams,
) {
    let order = match src.order() {
        MapOrder::ColMajor => SideMapOrder::WidthMajor,
        MapOrder::RowMajor => SideMapOrder::DepthMajor,
    };
    let side_map = SideMap::new(src.data(), src.cols(), src.rows(), src.stride(), order);
    unsafe { pack_side(dst, allocator, side_map, bit_depth.rhs, bit_depth.rounding.mode_for_depth(side_map.depth())) }
}

unsafe fn pack_side(
    dst: &PackedSideBlock,
    allocator: &Allocator,
    src: SideMap,
    bit_depth: BitDepth,
    rounding_mode: RoundingMode,
) {
    let (data, sums) = unsafe {
        (
            allocator.slice_mut::<u8>(dst.data_handle, dst.params.l2_width * dst.params.l2_depth),
            allocator.slice_mut::<i32>(dst.sums_handle, dst.params.l2_width),
        )
    };
    let mut packer = PackSideBlockImpl {
        data,
        sums,
        params: dst.params,
        format: dst.format,
        src,
        bit_depth,
        generator: RoundingOffsetGenerator::new(rounding_mode),
        pos: 0,
    };
    packer.pack_l2();
}

/// The packing loops for one side block. `pos` is the explicit write cursor
/// into the packed buffer; it is seeked to the start of each run and then
/// advances cell by cell.
struct PackSideBlockImpl<'a, 's> {
    data: &'a mut [u8],
    sums: &'a mut [i32],
    params: SideBlockParams,
    format: KernelSideFormat,
    src: SideMap<'s>,
    bit_depth: BitDepth,
    generator: RoundingOffsetGenerator,
    pos: usize,
}

impl PackSideBlockImpl<'_, '_> {
    fn pack_l2(&mut self) {
        self.sums.fill(0);
        for depth_chunk in range_chunks(0..self.src.depth(), self.params.l1_depth) {
            for width_chunk in range_chunks(0..self.src.width(), self.params.l1_width) {
                self.pack_l1(
                    width_chunk.start,
                    width_chunk.len(),
                    depth_chunk.start,
                    depth_chunk.len(),
                );
            }
        }
    }

    fn pack_l1(&mut self, start_width: usize, width: usize, start_depth: usize, depth: usize) {
        let kernel_width = self.format.width();
        for chunk in range_chunks(0..width, kernel_width) {
            self.pos =
                PackedSideBlock::run_offset(&self.params, start_width + chunk.start, start_depth);
            self.pack_run(start_width + chunk.start, chunk.len(), start_depth, depth);
        }
    }

    /// Pack one run: the inner loop along the depth dimension for one
    /// kernel-width group of width indices.
    fn pack_run(&mut self, start_width: usize, width: usize, start_depth: usize, depth: usize) {
        let kernel_width = self.format.width();
        if width == kernel_width {
            let register_aligned_depth = round_down(depth, REGISTER_SIZE);
            for d in (0..register_aligned_depth).step_by(REGISTER_SIZE) {
                let block =
                    self.src
                        .block(start_width, start_depth + d, kernel_width, REGISTER_SIZE);
                self.pack_register_block(block, start_width);
            }
            if register_aligned_depth < depth {
                self.pack_padded_register_block(
                    self.src.block(
                        start_width,
                        start_depth + register_aligned_depth,
                        kernel_width,
                        depth - register_aligned_depth,
                    ),
                    start_width,
                );
            }
        } else {
            debug_assert!(width < kernel_width);
            for d in (0..depth).step_by(REGISTER_SIZE) {
                let ds = REGISTER_SIZE.min(depth - d);
                self.pack_padded_register_block(
                    self.src.block(start_width, start_depth + d, width, ds),
                    start_width,
                );
            }
        }
    }

    /// Zero-extend an incomplete source block into a local scratch buffer of
    /// exactly the native register-block size, then pack that. The zero
    /// padding requantizes to zero, so it contributes nothing to the
    /// accumulated sums and the kernel never reads out of bounds.
    fn pack_padded_register_block(&mut self, src: SideMap, start_width: usize) {
        let kernel_width = self.format.width();
        assert!(kernel_width <= MAX_KERNEL_WIDTH);

        let mut buf = [0u8; MAX_KERNEL_WIDTH * REGISTER_SIZE];
        let stride = match src.order {
            SideMapOrder::WidthMajor => {
                for w in 0..src.width() {
                    for d in 0..src.depth() {
                        buf[w * REGISTER_SIZE + d] = src.get(w, d);
                    }
                }
                REGISTER_SIZE
            }
            SideMapOrder::DepthMajor => {
                for d in 0..src.depth() {
                    for w in 0..src.width() {
                        buf[d * kernel_width + w] = src.get(w, d);
                    }
                }
                kernel_width
            }
        };
        let complete_src = SideMap::new(
            &buf[..kernel_width * REGISTER_SIZE],
            kernel_width,
            REGISTER_SIZE,
            stride,
            src.order,
        );
        self.pack_register_block(complete_src, start_width);
    }

    /// Pack one complete register block (`kernel_width x REGISTER_SIZE`)
    /// into the destination, cell by cell, accumulating per-width sums.
    fn pack_register_block(&mut self, src: SideMap, start_width: usize) {
        let cell = self.format.cell;
        let kernel_width = self.format.width();
        debug_assert_eq!(src.width(), kernel_width);
        debug_assert_eq!(src.depth(), REGISTER_SIZE);

        let mut pos = self.pos;
        for cell_start_depth in (0..REGISTER_SIZE).step_by(cell.depth) {
            for cell_start_width in (0..kernel_width).step_by(cell.width) {
                for w in 0..cell.width {
                    let mut sum = 0i32;
                    for d in 0..cell.depth {
                        let raw = src.get(cell_start_width + w, cell_start_depth + d);
                        let value = requantize(raw, self.bit_depth, &mut self.generator);
                        self.data[pos + offset_into_cell(&cell, w, d)] = value;
                        sum += value as i32;
                    }
                    self.sums[start_width + cell_start_width + w] += sum;
                }
                pos += cell.size();
            }
        }
        self.pos = pos;
    }
}

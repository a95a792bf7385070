//! Non-owning views over matrix and vector storage.
//!
//! These are thin descriptions of externally-owned storage: a base slice, a
//! shape, a storage order and a leading stride. Sub-matrix views share the
//! parent's storage and stride.

/// Storage order of a matrix: which index varies slowest in memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MapOrder {
    RowMajor,
    ColMajor,
}

/// A read-only view of a matrix held in caller-owned storage.
///
/// `stride` is the number of elements per major unit (row for row-major,
/// column for column-major) and may exceed the minor dimension for views of
/// a larger matrix.
#[derive(Copy, Clone)]
pub struct MatrixMap<'a, T> {
    data: &'a [T],
    rows: usize,
    cols: usize,
    stride: usize,
    order: MapOrder,
}

impl<'a, T: Copy> MatrixMap<'a, T> {
    /// Create a view with a tightly-packed stride.
    pub fn new(data: &'a [T], rows: usize, cols: usize, order: MapOrder) -> MatrixMap<'a, T> {
        let stride = match order {
            MapOrder::RowMajor => cols,
            MapOrder::ColMajor => rows,
        };
        Self::with_stride(data, rows, cols, order, stride)
    }

    /// Create a view with an explicit leading stride.
    ///
    /// The stride must be at least the minor dimension and `data` must cover
    /// every addressable element.
    pub fn with_stride(
        data: &'a [T],
        rows: usize,
        cols: usize,
        order: MapOrder,
        stride: usize,
    ) -> MatrixMap<'a, T> {
        let minor = match order {
            MapOrder::RowMajor => cols,
            MapOrder::ColMajor => rows,
        };
        assert!(stride >= minor, "stride must be >= minor dimension");
        assert!(data.len() >= required_len(rows, cols, order, stride));
        MatrixMap {
            data,
            rows,
            cols,
            stride,
            order,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn order(&self) -> MapOrder {
        self.order
    }

    pub fn row_stride(&self) -> usize {
        match self.order {
            MapOrder::RowMajor => self.stride,
            MapOrder::ColMajor => 1,
        }
    }

    pub fn col_stride(&self) -> usize {
        match self.order {
            MapOrder::RowMajor => 1,
            MapOrder::ColMajor => self.stride,
        }
    }

    pub fn data(&self) -> &'a [T] {
        self.data
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[row * self.row_stride() + col * self.col_stride()]
    }

    /// Return a sub-matrix view sharing this view's storage and stride.
    pub fn block(
        &self,
        start_row: usize,
        start_col: usize,
        rows: usize,
        cols: usize,
    ) -> MatrixMap<'a, T> {
        assert!(start_row + rows <= self.rows);
        assert!(start_col + cols <= self.cols);
        let offset = start_row * self.row_stride() + start_col * self.col_stride();
        MatrixMap {
            data: &self.data[offset..],
            rows,
            cols,
            stride: self.stride,
            order: self.order,
        }
    }
}

/// A mutable view of a matrix held in caller-owned storage.
pub struct MatrixMapMut<'a, T> {
    data: &'a mut [T],
    rows: usize,
    cols: usize,
    stride: usize,
    order: MapOrder,
}

impl<'a, T: Copy> MatrixMapMut<'a, T> {
    /// Create a mutable view with a tightly-packed stride.
    pub fn new(data: &'a mut [T], rows: usize, cols: usize, order: MapOrder) -> MatrixMapMut<'a, T> {
        let stride = match order {
            MapOrder::RowMajor => cols,
            MapOrder::ColMajor => rows,
        };
        Self::with_stride(data, rows, cols, order, stride)
    }

    /// Create a mutable view with an explicit leading stride.
    pub fn with_stride(
        data: &'a mut [T],
        rows: usize,
        cols: usize,
        order: MapOrder,
        stride: usize,
    ) -> MatrixMapMut<'a, T> {
        let minor = match order {
            MapOrder::RowMajor => cols,
            MapOrder::ColMajor => rows,
        };
        assert!(stride >= minor, "stride must be >= minor dimension");
        assert!(data.len() >= required_len(rows, cols, order, stride));
        MatrixMapMut {
            data,
            rows,
            cols,
            stride,
            order,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn order(&self) -> MapOrder {
        self.order
    }

    pub fn row_stride(&self) -> usize {
        match self.order {
            MapOrder::RowMajor => self.stride,
            MapOrder::ColMajor => 1,
        }
    }

    pub fn col_stride(&self) -> usize {
        match self.order {
            MapOrder::RowMajor => 1,
            MapOrder::ColMajor => self.stride,
        }
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[row * self.row_stride() + col * self.col_stride()]
    }

    pub fn set(&mut self, row: usize, col: usize, value: T) {
        debug_assert!(row < self.rows && col < self.cols);
        let offset = row * self.row_stride() + col * self.col_stride();
        self.data[offset] = value;
    }

    /// Return a read-only view of the same matrix.
    pub fn as_map(&self) -> MatrixMap<'_, T> {
        MatrixMap {
            data: self.data,
            rows: self.rows,
            cols: self.cols,
            stride: self.stride,
            order: self.order,
        }
    }
}

/// Number of storage elements a view of the given shape addresses.
pub(crate) fn required_len(rows: usize, cols: usize, order: MapOrder, stride: usize) -> usize {
    if rows == 0 || cols == 0 {
        return 0;
    }
    match order {
        MapOrder::RowMajor => (rows - 1) * stride + cols,
        MapOrder::ColMajor => (cols - 1) * stride + rows,
    }
}

/// Rectangular region of a destination matrix, in absolute coordinates.
#[derive(Copy, Clone, Debug)]
pub struct MatrixBlockBounds {
    pub start_row: usize,
    pub start_col: usize,
    pub rows: usize,
    pub cols: usize,
}

impl MatrixBlockBounds {
    pub fn new(start_row: usize, start_col: usize, rows: usize, cols: usize) -> MatrixBlockBounds {
        MatrixBlockBounds {
            start_row,
            start_col,
            rows,
            cols,
        }
    }
}

/// A per-row (LHS) or per-column (RHS) zero-point, either broadcast from a
/// single value or given per index.
///
/// Offsets are subtracted from operand values: the engine computes
/// `sum_k (lhs[r][k] - lhs_offset[r]) * (rhs[k][c] - rhs_offset[c])`.
#[derive(Copy, Clone, Debug)]
pub enum OffsetVector<'a> {
    /// The same offset for every index.
    Scalar(i32),
    /// One offset per row/column of the result.
    Slice(&'a [i32]),
}

impl OffsetVector<'_> {
    pub fn at(&self, index: usize) -> i32 {
        match self {
            OffsetVector::Scalar(value) => *value,
            OffsetVector::Slice(values) => values[index],
        }
    }
}

/// Wrapper around the result matrix which can be shared across worker
/// threads. Each worker writes a disjoint range of rows.
///
/// This trades the borrow checker for a documented protocol, in the same way
/// a tiled output would: the dispatching code guarantees no two tasks ever
/// receive overlapping bounds.
pub(crate) struct ResultView<T> {
    data: *mut T,
    rows: usize,
    cols: usize,
    stride: usize,
    order: MapOrder,
}

impl<T> Clone for ResultView<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ResultView<T> {}

// Safety: Callers must ensure they do not write overlapping cells
// concurrently. The multi-threaded GEMM partitions the row dimension into
// disjoint ranges, one per task.
unsafe impl<T> Send for ResultView<T> {}
unsafe impl<T> Sync for ResultView<T> {}

impl<T: Copy> ResultView<T> {
    pub fn from_map(map: &mut MatrixMapMut<T>) -> ResultView<T> {
        ResultView {
            data: map.data.as_mut_ptr(),
            rows: map.rows,
            cols: map.cols,
            stride: map.stride,
            order: map.order,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Write one destination cell.
    ///
    /// # Safety
    ///
    /// No other thread may write the same cell concurrently, and the view's
    /// backing storage must outlive the call.
    pub unsafe fn write(&self, row: usize, col: usize, value: T) {
        debug_assert!(row < self.rows && col < self.cols);
        let (row_stride, col_stride) = match self.order {
            MapOrder::RowMajor => (self.stride, 1),
            MapOrder::ColMajor => (1, self.stride),
        };
        unsafe {
            *self.data.add(row * row_stride + col * col_stride) = value;
        }
    }
}

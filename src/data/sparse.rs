//! Compressed Sparse Row (CSR) matrix for row-coupled loss algebra.
//!
//! CSR keeps each coupling row contiguous, which is what every consumer here
//! iterates: matrix-vector products against per-event vectors, transposed
//! scatter products, and row-wise projection onto leaf indicators.

use ndarray::ArrayView2;

/// Compressed Sparse Row matrix over `f64`.
///
/// # Structure
///
/// - `values`: non-zero values, stored row by row
/// - `col_indices`: column index for each value
/// - `row_ptrs`: starting index in values/col_indices for each row
///
/// For row `i`, the values are `values[row_ptrs[i]..row_ptrs[i+1]]` with
/// corresponding columns `col_indices[row_ptrs[i]..row_ptrs[i+1]]`.
///
/// # Example
///
/// ```
/// use uniboost::CsrMatrix;
///
/// let rows = vec![
///     vec![(0, 1.0), (2, 2.0)],
///     vec![(1, 3.0)],
/// ];
/// let m = CsrMatrix::from_rows(&rows, 3);
///
/// assert_eq!(m.nnz(), 3);
/// assert_eq!(m.dot(&[1.0, 1.0, 1.0]), vec![3.0, 3.0]);
/// ```
#[derive(Debug, Clone)]
pub struct CsrMatrix {
    /// Non-zero values stored row by row.
    values: Box<[f64]>,
    /// Column index for each value.
    col_indices: Box<[u32]>,
    /// Row pointers: row_ptrs[i] is the start index for row i.
    /// Length is n_rows + 1, with row_ptrs[n_rows] = nnz.
    row_ptrs: Box<[u32]>,
    /// Number of rows.
    n_rows: usize,
    /// Number of columns.
    n_cols: usize,
}

impl CsrMatrix {
    /// Create a CSR matrix from per-row `(column, value)` lists.
    ///
    /// Duplicate columns within a row are kept as separate entries; products
    /// accumulate them, matching coordinate-style construction.
    ///
    /// # Panics
    ///
    /// Panics if any column index is out of bounds.
    pub fn from_rows(rows: &[Vec<(u32, f64)>], n_cols: usize) -> Self {
        let nnz: usize = rows.iter().map(|r| r.len()).sum();
        let mut values = Vec::with_capacity(nnz);
        let mut col_indices = Vec::with_capacity(nnz);
        let mut row_ptrs = Vec::with_capacity(rows.len() + 1);
        row_ptrs.push(0u32);

        for row in rows {
            for &(col, value) in row {
                assert!(
                    (col as usize) < n_cols,
                    "column {} out of bounds for {} columns",
                    col,
                    n_cols
                );
                values.push(value);
                col_indices.push(col);
            }
            row_ptrs.push(values.len() as u32);
        }

        Self {
            values: values.into_boxed_slice(),
            col_indices: col_indices.into_boxed_slice(),
            row_ptrs: row_ptrs.into_boxed_slice(),
            n_rows: rows.len(),
            n_cols,
        }
    }

    /// Create a CSR matrix from a dense matrix, dropping exact zeros.
    pub fn from_dense(dense: ArrayView2<'_, f64>) -> Self {
        let n_rows = dense.nrows();
        let n_cols = dense.ncols();

        let mut values = Vec::new();
        let mut col_indices = Vec::new();
        let mut row_ptrs = Vec::with_capacity(n_rows + 1);
        row_ptrs.push(0u32);

        for row in dense.rows() {
            for (col, &value) in row.iter().enumerate() {
                if value != 0.0 {
                    values.push(value);
                    col_indices.push(col as u32);
                }
            }
            row_ptrs.push(values.len() as u32);
        }

        Self {
            values: values.into_boxed_slice(),
            col_indices: col_indices.into_boxed_slice(),
            row_ptrs: row_ptrs.into_boxed_slice(),
            n_rows,
            n_cols,
        }
    }

    /// Stack matrices vertically. All parts must have the same column count.
    pub fn vstack(parts: &[CsrMatrix]) -> Self {
        assert!(!parts.is_empty(), "cannot stack zero matrices");
        let n_cols = parts[0].n_cols;
        for part in parts {
            assert_eq!(part.n_cols, n_cols, "column counts differ across parts");
        }

        let nnz: usize = parts.iter().map(|p| p.nnz()).sum();
        let n_rows: usize = parts.iter().map(|p| p.n_rows).sum();
        let mut values = Vec::with_capacity(nnz);
        let mut col_indices = Vec::with_capacity(nnz);
        let mut row_ptrs = Vec::with_capacity(n_rows + 1);
        row_ptrs.push(0u32);

        for part in parts {
            values.extend_from_slice(&part.values);
            col_indices.extend_from_slice(&part.col_indices);
            let base = *row_ptrs.last().unwrap();
            for &ptr in &part.row_ptrs[1..] {
                row_ptrs.push(base + ptr);
            }
        }

        Self {
            values: values.into_boxed_slice(),
            col_indices: col_indices.into_boxed_slice(),
            row_ptrs: row_ptrs.into_boxed_slice(),
            n_rows,
            n_cols,
        }
    }

    /// Assemble a block-diagonal matrix from square or rectangular blocks.
    pub fn block_diag(blocks: &[CsrMatrix]) -> Self {
        assert!(!blocks.is_empty(), "cannot assemble zero blocks");

        let nnz: usize = blocks.iter().map(|b| b.nnz()).sum();
        let n_rows: usize = blocks.iter().map(|b| b.n_rows).sum();
        let n_cols: usize = blocks.iter().map(|b| b.n_cols).sum();
        let mut values = Vec::with_capacity(nnz);
        let mut col_indices = Vec::with_capacity(nnz);
        let mut row_ptrs = Vec::with_capacity(n_rows + 1);
        row_ptrs.push(0u32);

        let mut col_offset = 0u32;
        for block in blocks {
            values.extend_from_slice(&block.values);
            col_indices.extend(block.col_indices.iter().map(|&c| c + col_offset));
            let base = *row_ptrs.last().unwrap();
            for &ptr in &block.row_ptrs[1..] {
                row_ptrs.push(base + ptr);
            }
            col_offset += block.n_cols as u32;
        }

        Self {
            values: values.into_boxed_slice(),
            col_indices: col_indices.into_boxed_slice(),
            row_ptrs: row_ptrs.into_boxed_slice(),
            n_rows,
            n_cols,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of rows.
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of columns.
    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Number of stored elements.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Ratio of stored elements to total elements.
    pub fn density(&self) -> f64 {
        let total = self.n_rows * self.n_cols;
        if total == 0 {
            return 1.0;
        }
        self.nnz() as f64 / total as f64
    }

    /// Iterate over `(column, value)` pairs in a row.
    #[inline]
    pub fn row(&self, row: usize) -> RowIter<'_> {
        assert!(row < self.n_rows, "row {} out of bounds", row);
        let start = self.row_ptrs[row] as usize;
        let end = self.row_ptrs[row + 1] as usize;
        RowIter {
            values: &self.values[start..end],
            col_indices: &self.col_indices[start..end],
            pos: 0,
        }
    }

    // =========================================================================
    // Linear algebra
    // =========================================================================

    /// Matrix-vector product `A·x`, length `n_rows`.
    pub fn dot(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.n_cols, "vector length must match n_cols");
        let mut result = vec![0.0; self.n_rows];
        for (i, out) in result.iter_mut().enumerate() {
            let start = self.row_ptrs[i] as usize;
            let end = self.row_ptrs[i + 1] as usize;
            let mut acc = 0.0;
            for k in start..end {
                acc += self.values[k] * x[self.col_indices[k] as usize];
            }
            *out = acc;
        }
        result
    }

    /// Transposed matrix-vector product `Aᵀ·x`, length `n_cols`.
    pub fn transpose_dot(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.n_rows, "vector length must match n_rows");
        let mut result = vec![0.0; self.n_cols];
        for i in 0..self.n_rows {
            let xi = x[i];
            if xi == 0.0 {
                continue;
            }
            let start = self.row_ptrs[i] as usize;
            let end = self.row_ptrs[i + 1] as usize;
            for k in start..end {
                result[self.col_indices[k] as usize] += self.values[k] * xi;
            }
        }
        result
    }

    /// Elementwise square: same sparsity pattern, each value squared.
    pub fn elementwise_square(&self) -> CsrMatrix {
        let values: Vec<f64> = self.values.iter().map(|v| v * v).collect();
        Self {
            values: values.into_boxed_slice(),
            col_indices: self.col_indices.clone(),
            row_ptrs: self.row_ptrs.clone(),
            n_rows: self.n_rows,
            n_cols: self.n_cols,
        }
    }
}

/// Iterator over `(column, value)` pairs in a CSR row.
#[derive(Debug, Clone)]
pub struct RowIter<'a> {
    values: &'a [f64],
    col_indices: &'a [u32],
    pos: usize,
}

impl Iterator for RowIter<'_> {
    type Item = (usize, f64);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.pos < self.values.len() {
            let col = self.col_indices[self.pos] as usize;
            let val = self.values[self.pos];
            self.pos += 1;
            Some((col, val))
        } else {
            None
        }
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.values.len() - self.pos;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RowIter<'_> {}
impl std::iter::FusedIterator for RowIter<'_> {}

// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Minimal tile multiply-accumulate engine.
//!
//! Operands are strided row-major views; the accumulator is an f32 tile.
//! Operand reads past a view's logical extent return zero, which is how
//! partial tiles are handled without a separate code path.

use super::element::KernelElement;

/// Anything that can feed a tile multiply.
pub trait TileSource {
    /// Logical rows.
    fn rows(&self) -> usize;
    /// Logical columns.
    fn cols(&self) -> usize;
    /// Element at `(row, col)`; zero outside the logical extent.
    fn at(&self, row: usize, col: usize) -> f32;
}

/// Read-only strided view into a storage buffer.
#[derive(Debug, Clone, Copy)]
pub struct MatrixRef<'a, T> {
    data: &'a [T],
    offset: usize,
    rows: usize,
    cols: usize,
    stride: usize,
}

impl<'a, T: KernelElement> MatrixRef<'a, T> {
    /// View `rows x cols` starting at `offset` with row stride `stride`.
    #[must_use]
    pub fn new(data: &'a [T], offset: usize, rows: usize, cols: usize, stride: usize) -> Self {
        Self {
            data,
            offset,
            rows,
            cols,
            stride,
        }
    }

    /// Sub-view of up to `rows x cols` elements at `(row, col)`, clamped to this view.
    #[must_use]
    pub fn tile(&self, row: usize, col: usize, rows: usize, cols: usize) -> Self {
        let rows = rows.min(self.rows.saturating_sub(row));
        let cols = cols.min(self.cols.saturating_sub(col));
        Self {
            data: self.data,
            offset: self.offset + row * self.stride + col,
            rows,
            cols,
            stride: self.stride,
        }
    }

    /// Contiguous row slice.
    #[must_use]
    pub fn row(&self, row: usize) -> &'a [T] {
        let start = self.offset + row * self.stride;
        &self.data[start..start + self.cols]
    }
}

impl<T: KernelElement> TileSource for MatrixRef<'_, T> {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> f32 {
        if row < self.rows && col < self.cols {
            self.data[self.offset + row * self.stride + col].to_accum()
        } else {
            0.0
        }
    }
}

/// Shared-storage tile, row-major with a fixed leading dimension.
#[derive(Debug, Clone, Copy)]
pub struct SmemTile<'a, T> {
    data: &'a [T],
    rows: usize,
    cols: usize,
    ld: usize,
}

impl<'a, T: KernelElement> SmemTile<'a, T> {
    /// View `rows x cols` of a tile whose rows are `ld` apart.
    #[must_use]
    pub fn new(data: &'a [T], rows: usize, cols: usize, ld: usize) -> Self {
        Self {
            data,
            rows,
            cols,
            ld,
        }
    }
}

impl<T: KernelElement> TileSource for SmemTile<'_, T> {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> f32 {
        if row < self.rows && col < self.cols {
            self.data[row * self.ld + col].to_accum()
        } else {
            0.0
        }
    }
}

/// f32 accumulator tile.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumTile {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl AccumTile {
    /// Zeroed `rows x cols` tile.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Reset to zero.
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    /// Element at `(row, col)`.
    #[inline]
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    /// Mutable element at `(row, col)`.
    #[inline]
    pub fn get_mut(&mut self, row: usize, col: usize) -> &mut f32 {
        &mut self.data[row * self.cols + col]
    }

    /// Raw row-major storage.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Raw mutable row-major storage.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Multiply every element by `alpha`.
    pub fn scale(&mut self, alpha: f32) {
        for v in &mut self.data {
            *v *= alpha;
        }
    }
}

/// `acc[m, n] += sum_k a[m, k] * b[n, k]` over `k < depth`.
pub fn mma_abt<A: TileSource, B: TileSource>(acc: &mut AccumTile, a: &A, b: &B, depth: usize) {
    let rows = acc.rows.min(a.rows());
    let cols = acc.cols.min(b.rows());
    for m in 0..rows {
        for n in 0..cols {
            let mut sum = 0.0;
            for k in 0..depth {
                sum += a.at(m, k) * b.at(n, k);
            }
            *acc.get_mut(m, n) += sum;
        }
    }
}

/// `acc[m, n] += sum_k a[k, m] * b[k, n]` over `k < depth`.
pub fn mma_atb<A: TileSource, B: TileSource>(acc: &mut AccumTile, a: &A, b: &B, depth: usize) {
    let rows = acc.rows.min(a.cols());
    let cols = acc.cols.min(b.cols());
    for k in 0..depth {
        for m in 0..rows {
            let a_km = a.at(k, m);
            if a_km == 0.0 {
                continue;
            }
            for n in 0..cols {
                *acc.get_mut(m, n) += a_km * b.at(k, n);
            }
        }
    }
}

/// `acc[m, n] += sum_k a[m, k] * b[k, n]` over `k < depth`.
pub fn mma_ab<A: TileSource, B: TileSource>(acc: &mut AccumTile, a: &A, b: &B, depth: usize) {
    let rows = acc.rows.min(a.rows());
    let cols = acc.cols.min(b.cols());
    for m in 0..rows {
        for k in 0..depth {
            let a_mk = a.at(m, k);
            if a_mk == 0.0 {
                continue;
            }
            for n in 0..cols {
                *acc.get_mut(m, n) += a_mk * b.at(k, n);
            }
        }
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Writing accumulators to gradient outputs.

use super::config::KernelConfig;
use super::element::KernelElement;
use super::gemm::AccumTile;

/// Write or add the valid `extent` of `acc` into a row-major destination.
///
/// With `first` the destination is overwritten; otherwise the accumulator is
/// added to what is already there. The sum is formed in f32 and rounded once.
pub fn accumulate_in_output<T: KernelElement>(
    acc: &AccumTile,
    dest: &mut [T],
    stride: usize,
    origin: (usize, usize),
    extent: (usize, usize),
    first: bool,
) {
    let (row0, col0) = origin;
    let rows = extent.0.min(acc.rows());
    let cols = extent.1.min(acc.cols());
    for r in 0..rows {
        let base = (row0 + r) * stride + col0;
        for (c, slot) in dest[base..base + cols].iter_mut().enumerate() {
            let v = acc.get(r, c);
            *slot = if first {
                T::from_accum(v)
            } else {
                T::from_accum(slot.to_accum() + v)
            };
        }
    }
}

/// dK and dV accumulators kept resident across a key tile's query loop.
///
/// Only used when the whole head dimension fits in one output tile.
#[derive(Debug, Clone)]
pub struct OutputFragments {
    /// `block_j x block_i` value-gradient accumulator.
    pub grad_value: AccumTile,
    /// `block_j x block_i` key-gradient accumulator.
    pub grad_key: AccumTile,
}

impl OutputFragments {
    /// Fragments sized for `config`.
    #[must_use]
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            grad_value: AccumTile::zeros(config.block_j, config.grad_kv_tile_cols()),
            grad_key: AccumTile::zeros(config.block_j, config.grad_kv_tile_cols()),
        }
    }

    /// Reset before a new key tile.
    pub fn clear(&mut self) {
        self.grad_value.clear();
        self.grad_key.clear();
    }

    /// Flush after the last query tile of the key tile at `key_start`.
    #[allow(clippy::too_many_arguments)]
    pub fn write_to<T: KernelElement>(
        &self,
        key_start: usize,
        num_keys_in_block: usize,
        grad_key: &mut [T],
        head_dim: usize,
        grad_value: &mut [T],
        head_dim_value: usize,
    ) {
        accumulate_in_output(
            &self.grad_value,
            grad_value,
            head_dim_value,
            (key_start, 0),
            (num_keys_in_block, head_dim_value),
            true,
        );
        accumulate_in_output(
            &self.grad_key,
            grad_key,
            head_dim,
            (key_start, 0),
            (num_keys_in_block, head_dim),
            true,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::backward::config::{Arch, MaxK, Precision};
    use half::f16;

    fn ramp(rows: usize, cols: usize) -> AccumTile {
        let mut acc = AccumTile::zeros(rows, cols);
        for (i, v) in acc.as_mut_slice().iter_mut().enumerate() {
            *v = i as f32;
        }
        acc
    }

    #[test]
    fn test_first_overwrites_then_adds() {
        let acc = ramp(2, 2);
        let mut dest = vec![100.0f32; 3 * 4];
        accumulate_in_output(&acc, &mut dest, 4, (1, 1), (2, 2), true);
        assert_eq!(&dest[4..8], &[100.0, 0.0, 1.0, 100.0]);
        accumulate_in_output(&acc, &mut dest, 4, (1, 1), (2, 2), false);
        assert_eq!(&dest[8..12], &[100.0, 4.0, 6.0, 100.0]);
        assert_eq!(dest[0], 100.0);
    }

    #[test]
    fn test_partial_extent() {
        let acc = ramp(4, 4);
        let mut dest = vec![0.0f32; 6];
        accumulate_in_output(&acc, &mut dest, 3, (0, 0), (2, 3), true);
        assert_eq!(dest, vec![0.0, 1.0, 2.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_half_sum_rounds_once() {
        let mut acc = AccumTile::zeros(1, 1);
        *acc.get_mut(0, 0) = 1e-4;
        let mut dest = vec![f16::from_f32(1.0)];
        accumulate_in_output(&acc, &mut dest, 1, (0, 0), (1, 1), false);
        assert_eq!(dest[0], f16::from_f32(1.0 + 1e-4));
    }

    #[test]
    fn test_fragments_flush() {
        let config = KernelConfig::new(Arch::Sm80, Precision::F16, MaxK::K64);
        let mut frags = OutputFragments::new(&config);
        *frags.grad_value.get_mut(0, 0) = 2.0;
        *frags.grad_key.get_mut(1, 3) = 3.0;
        let mut dk = vec![f16::from_f32(9.0); 70 * 4];
        let mut dv = vec![f16::from_f32(9.0); 70 * 2];
        frags.write_to(64, 6, &mut dk, 4, &mut dv, 2);
        assert_eq!(dv[64 * 2].to_f32(), 2.0);
        assert_eq!(dv[65 * 2].to_f32(), 0.0);
        assert_eq!(dk[65 * 4 + 3].to_f32(), 3.0);
        assert_eq!(dk[63 * 4].to_f32(), 9.0);

        frags.clear();
        assert!(frags.grad_key.as_slice().iter().all(|&v| v == 0.0));
    }
}

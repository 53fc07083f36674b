// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Row delta: `D[i] = sum_c O[i, c] * dO[i, c]`.
//!
//! With this per-row scalar the softmax backward collapses to
//! `dS = P * (dP - D)`, so it is computed once per block before the main loop.

use super::element::KernelElement;
use super::gemm::MatrixRef;

/// Elements one lane reads per access when the row length allows a 128-bit load.
#[must_use]
pub const fn optimal_elements<T>() -> usize {
    128 / (std::mem::size_of::<T>() * 8)
}

/// Compute the row delta for every query row of one block.
///
/// Rows are handled `block_i` at a time. Each row is shared by
/// `num_threads / block_i` lanes; lane `l` sums the accesses
/// `l, l + lanes, l + 2 * lanes, ...` and the lane partials are combined with
/// a butterfly reduction.
#[must_use]
pub fn compute_delta<T: KernelElement>(
    output: &MatrixRef<'_, T>,
    grad_output: &MatrixRef<'_, T>,
    block_i: usize,
    num_threads: usize,
) -> Vec<f32> {
    use super::gemm::TileSource;

    let num_queries = output.rows();
    let head_dim_value = output.cols();
    let elements_per_access = if head_dim_value % optimal_elements::<T>() == 0 {
        optimal_elements::<T>()
    } else {
        1
    };
    let lanes = (num_threads / block_i.max(1)).max(1).next_power_of_two();
    let accesses = head_dim_value / elements_per_access;

    let mut delta = vec![0.0f32; num_queries];
    let mut partial = vec![0.0f32; lanes];

    for query_start in (0..num_queries).step_by(block_i.max(1)) {
        let query_end = (query_start + block_i).min(num_queries);
        for (row, slot) in delta[query_start..query_end].iter_mut().enumerate() {
            let out_row = output.row(query_start + row);
            let grad_row = grad_output.row(query_start + row);

            partial.fill(0.0);
            for access in 0..accesses {
                let lane = access % lanes;
                let start = access * elements_per_access;
                let end = start + elements_per_access;
                partial[lane] += out_row[start..end]
                    .iter()
                    .zip(&grad_row[start..end])
                    .map(|(o, g)| o.to_accum() * g.to_accum())
                    .sum::<f32>();
            }

            let mut width = lanes / 2;
            while width > 0 {
                for lane in 0..width {
                    partial[lane] += partial[lane + width];
                }
                width /= 2;
            }
            *slot = partial[0];
        }
    }

    delta
}

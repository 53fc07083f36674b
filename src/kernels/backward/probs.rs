// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Probability recompute, masking and dropout-mask regeneration.
//!
//! The forward pass saved only `lse[i] = log(sum_j exp(s[i, j]))`, so each
//! tile recovers its probabilities as `P = exp(scale * Q K^T + B - lse)`
//! without the full matrix ever existing in memory.

use super::element::KernelElement;
use super::gemm::{mma_abt, AccumTile, MatrixRef, TileSource};
use super::rng::{dropout_keep_scale, Philox4x32};
use super::schedule::TileStep;

/// Rows and columns a step touches, honoring the unchecked fast path.
#[must_use]
pub fn tile_extent(step: &TileStep, block_i: usize, block_j: usize) -> (usize, usize) {
    if step.skip_bounds_checks {
        (block_i, block_j)
    } else {
        (step.num_queries_in_block, step.num_keys_in_block)
    }
}

/// Operands of the probability recompute for one block.
pub struct ProbsOperands<'a, 'b, T> {
    /// Query rows of this (batch, head).
    pub query: &'b MatrixRef<'a, T>,
    /// Key rows of this (batch, head).
    pub key: &'b MatrixRef<'a, T>,
    /// Additive bias, `Mq x Mk`.
    pub bias: Option<&'b MatrixRef<'a, T>>,
    /// Log-normalizer per query row.
    pub logsumexp: &'b [f32],
}

/// Recompute the probability tile of `step` into `attn` (`block_i x block_j`).
///
/// Entries outside the problem are written as zero. Causally masked entries
/// and entries whose score is `-inf` become exactly zero.
#[allow(clippy::too_many_arguments)]
pub fn recompute_probabilities<T: KernelElement>(
    step: &TileStep,
    block_i: usize,
    block_j: usize,
    scale: f32,
    causal: bool,
    operands: &ProbsOperands<'_, '_, T>,
    attn: &mut [T],
    bias_smem: &mut [T],
) {
    let (rows, cols) = tile_extent(step, block_i, block_j);
    let head_dim = operands.query.cols();
    let (qs, ks) = (step.query_start, step.key_start);

    let q_tile = operands.query.tile(qs, 0, rows, head_dim);
    let k_tile = operands.key.tile(ks, 0, cols, head_dim);

    let mut scores = AccumTile::zeros(block_i, block_j);
    mma_abt(&mut scores, &q_tile, &k_tile, head_dim);
    scores.scale(scale);

    if let Some(bias) = operands.bias {
        let bias_tile = bias.tile(qs, ks, rows, cols);
        for i in 0..block_i {
            for j in 0..block_j {
                bias_smem[i * block_j + j] = T::from_accum(bias_tile.at(i, j));
            }
        }
        for i in 0..rows {
            for j in 0..cols {
                *scores.get_mut(i, j) += bias_smem[i * block_j + j].to_accum();
            }
        }
    }

    if causal {
        for i in 0..rows {
            for j in 0..cols {
                if ks + j > qs + i {
                    *scores.get_mut(i, j) = f32::NEG_INFINITY;
                }
            }
        }
    }

    for i in 0..block_i {
        let lse = if i < rows { operands.logsumexp[qs + i] } else { 0.0 };
        for j in 0..block_j {
            let p = if i < rows && j < cols {
                let s = scores.get(i, j);
                if s == f32::NEG_INFINITY {
                    0.0
                } else {
                    (s - lse).exp()
                }
            } else {
                0.0
            };
            attn[i * block_j + j] = T::from_accum(p);
        }
    }
}

/// Regenerate the dropout keep/scale tile of `step` into `zij`.
///
/// Every row seeks its own copy of `stream` to
/// `(query_start + i) * num_keys + key_start` and draws its columns
/// contiguously, four at a time.
pub fn generate_dropout_tile<T: KernelElement>(
    step: &TileStep,
    block_i: usize,
    block_j: usize,
    num_keys: usize,
    dropout_prob: f32,
    stream: &Philox4x32,
    zij: &mut [T],
) {
    let (rows, cols) = tile_extent(step, block_i, block_j);
    zij.fill(T::from_accum(0.0));

    for i in 0..rows {
        let mut row_stream = *stream;
        row_stream.skip_ahead(((step.query_start + i) * num_keys + step.key_start) as u64);
        for j in (0..cols).step_by(4) {
            let quad = row_stream.uniform4();
            for (t, &u) in quad.iter().enumerate() {
                if j + t < cols {
                    zij[i * block_j + j + t] = T::from_accum(dropout_keep_scale(u, dropout_prob));
                }
            }
        }
    }
}

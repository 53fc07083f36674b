// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Score gradient: `dS = P * (dP * Z - D)`, with `dP = dO V^T`.
//!
//! The unscaled product is the bias gradient; the softmax scale is applied
//! afterwards so `dS` can feed the dQ and dK multiplies directly.

use super::element::KernelElement;
use super::epilogue::accumulate_in_output;
use super::gemm::{mma_abt, AccumTile, MatrixRef, TileSource};
use super::probs::tile_extent;
use super::schedule::TileStep;

/// Shared-storage tiles the score gradient reads.
pub struct ScoreInputs<'a, T> {
    /// Recomputed probabilities, `block_i x block_j`.
    pub attn: &'a [T],
    /// Dropout keep/scale factors, when dropout is active.
    pub zij: Option<&'a [T]>,
    /// Row deltas of the current query tile.
    pub di: &'a [f32],
}

/// Compute `dS` for one tile into `grad_score` (`block_i x block_j`).
///
/// When `grad_bias` is given (row-major `Mq x Mk`) the unscaled `dS` is
/// written there first.
#[allow(clippy::too_many_arguments)]
pub fn compute_grad_score<T: KernelElement>(
    step: &TileStep,
    block_i: usize,
    block_j: usize,
    scale: f32,
    inputs: &ScoreInputs<'_, T>,
    grad_output: &MatrixRef<'_, T>,
    value: &MatrixRef<'_, T>,
    grad_score: &mut [T],
    grad_bias: Option<&mut [T]>,
) {
    let (rows, cols) = tile_extent(step, block_i, block_j);
    let head_dim_value = value.cols();

    let mut acc = AccumTile::zeros(block_i, block_j);
    mma_abt(
        &mut acc,
        &grad_output.tile(step.query_start, 0, rows, head_dim_value),
        &value.tile(step.key_start, 0, cols, head_dim_value),
        head_dim_value,
    );

    for i in 0..block_i {
        for j in 0..block_j {
            let slot = acc.get_mut(i, j);
            if i < rows && j < cols {
                let idx = i * block_j + j;
                let mut dp = *slot;
                if let Some(zij) = inputs.zij {
                    dp *= zij[idx].to_accum();
                }
                *slot = inputs.attn[idx].to_accum() * (dp - inputs.di[i]);
            } else {
                *slot = 0.0;
            }
        }
    }

    if let Some(grad_bias) = grad_bias {
        accumulate_in_output(
            &acc,
            grad_bias,
            value.rows(),
            (step.query_start, step.key_start),
            (rows, cols),
            true,
        );
    }

    acc.scale(scale);
    for (slot, &v) in grad_score.iter_mut().zip(acc.as_slice()) {
        *slot = T::from_accum(v);
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Query gradient: `dQ += dS K`.

use super::config::KernelVariant;
use super::element::KernelElement;
use super::epilogue::accumulate_in_output;
use super::gemm::{mma_ab, AccumTile, MatrixRef, SmemTile, TileSource};
use super::probs::tile_extent;
use super::schedule::TileStep;
use super::workspace::{grad_query_storage_id, load_tile, store_tile};

/// Add one key tile's contribution to the query gradient of its query tile.
///
/// Partial sums are carried in `workspace` between key tiles when the output
/// precision needs it; the last key tile writes the rounded total.
pub fn accumulate_grad_query<T: KernelElement>(
    variant: &KernelVariant,
    step: &TileStep,
    grad_score: &[T],
    key: &MatrixRef<'_, T>,
    workspace: &mut [f32],
    grad_query: &mut [T],
) {
    let config = &variant.config;
    let head_dim = key.cols();
    let (rows, cols) = tile_extent(step, config.block_i, config.block_j);
    let ds = SmemTile::new(grad_score, rows, cols, config.block_j);

    let needs_accum = config.needs_accum_grad_q;
    let tile_cols = config.grad_q_tile_cols();
    for col in (0..head_dim).step_by(tile_cols) {
        let storage_id = grad_query_storage_id(step.query_start, col, config, head_dim);
        let mut acc = AccumTile::zeros(config.block_i, tile_cols);
        if needs_accum && !step.is_first_key {
            load_tile(workspace, storage_id, &mut acc);
        }

        mma_ab(&mut acc, &ds, &key.tile(step.key_start, col, cols, tile_cols), cols);

        if needs_accum && !step.is_last_key {
            store_tile(workspace, storage_id, &acc);
        } else {
            accumulate_in_output(
                &acc,
                grad_query,
                head_dim,
                (step.query_start, col),
                (rows, tile_cols.min(head_dim - col)),
                step.is_first_key || needs_accum,
            );
        }
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Key gradient: `dK += dS^T Q`.

use super::config::KernelVariant;
use super::element::KernelElement;
use super::epilogue::{accumulate_in_output, OutputFragments};
use super::gemm::{mma_atb, AccumTile, MatrixRef, SmemTile, TileSource};
use super::probs::tile_extent;
use super::schedule::TileStep;
use super::workspace::{grad_kv_storage_id, load_tile, store_tile};

/// Add one query tile's contribution to the key gradient of its key tile.
///
/// Follows the same resident / spill / write-through policy as the value
/// gradient, keyed on the dK accumulation flag.
pub fn accumulate_grad_key<T: KernelElement>(
    variant: &KernelVariant,
    step: &TileStep,
    grad_score: &[T],
    query: &MatrixRef<'_, T>,
    frags: &mut OutputFragments,
    workspace: &mut [f32],
    grad_key: &mut [T],
) {
    let config = &variant.config;
    let head_dim = query.cols();
    let (rows, cols) = tile_extent(step, config.block_i, config.block_j);
    let ds = SmemTile::new(grad_score, rows, cols, config.block_j);

    if config.output_in_rf {
        let q = query.tile(step.query_start, 0, rows, head_dim);
        mma_atb(&mut frags.grad_key, &ds, &q, rows);
        return;
    }

    let needs_accum = config.needs_accum_grad_k;
    let tile_cols = config.grad_kv_tile_cols();
    for col in (0..head_dim).step_by(tile_cols) {
        let storage_id = grad_kv_storage_id(step.key_start, col, config, head_dim);
        let mut acc = AccumTile::zeros(config.block_j, tile_cols);
        if needs_accum && !step.is_first_query {
            load_tile(workspace, storage_id, &mut acc);
        }

        mma_atb(&mut acc, &ds, &query.tile(step.query_start, col, rows, tile_cols), rows);

        if needs_accum && !step.is_last_query {
            store_tile(workspace, storage_id, &acc);
        } else {
            accumulate_in_output(
                &acc,
                grad_key,
                head_dim,
                (step.key_start, col),
                (cols, tile_cols.min(head_dim - col)),
                step.is_first_query || needs_accum,
            );
        }
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Value gradient: `dV += (P * Z)^T dO`.

use super::config::KernelVariant;
use super::element::KernelElement;
use super::epilogue::{accumulate_in_output, OutputFragments};
use super::gemm::{mma_atb, AccumTile, MatrixRef, TileSource};
use super::probs::tile_extent;
use super::schedule::TileStep;
use super::workspace::{grad_kv_storage_id, load_tile, store_tile};

/// The probability tile with the dropout keep/scale factors applied on read.
#[derive(Debug, Clone, Copy)]
pub struct DroppedProbs<'a, T> {
    attn: &'a [T],
    zij: Option<&'a [T]>,
    rows: usize,
    cols: usize,
    ld: usize,
}

impl<'a, T: KernelElement> DroppedProbs<'a, T> {
    /// View the valid `rows x cols` of shared tiles with leading dimension `ld`.
    #[must_use]
    pub fn new(attn: &'a [T], zij: Option<&'a [T]>, rows: usize, cols: usize, ld: usize) -> Self {
        Self {
            attn,
            zij,
            rows,
            cols,
            ld,
        }
    }
}

impl<T: KernelElement> TileSource for DroppedProbs<'_, T> {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> f32 {
        if row >= self.rows || col >= self.cols {
            return 0.0;
        }
        let idx = row * self.ld + col;
        let p = self.attn[idx].to_accum();
        match self.zij {
            Some(zij) => p * zij[idx].to_accum(),
            None => p,
        }
    }
}

/// Add one query tile's contribution to the value gradient of its key tile.
///
/// In register-resident mode the sum stays in `frags` until the key tile is
/// done. Otherwise each output column tile is either spilled to `workspace`
/// or written through the epilogue, depending on whether later query tiles
/// still contribute and whether the output precision can absorb repeated adds.
pub fn accumulate_grad_value<T: KernelElement>(
    variant: &KernelVariant,
    step: &TileStep,
    probs: &DroppedProbs<'_, T>,
    grad_output: &MatrixRef<'_, T>,
    frags: &mut OutputFragments,
    workspace: &mut [f32],
    grad_value: &mut [T],
) {
    let config = &variant.config;
    let head_dim_value = grad_output.cols();
    let (rows, cols) = tile_extent(step, config.block_i, config.block_j);

    if config.output_in_rf {
        let dout = grad_output.tile(step.query_start, 0, rows, head_dim_value);
        mma_atb(&mut frags.grad_value, probs, &dout, rows);
        return;
    }

    let needs_accum = config.needs_accum_grad_v;
    let tile_cols = config.grad_kv_tile_cols();
    for col in (0..head_dim_value).step_by(tile_cols) {
        let storage_id = grad_kv_storage_id(step.key_start, col, config, head_dim_value);
        let mut acc = AccumTile::zeros(config.block_j, tile_cols);
        if needs_accum && !step.is_first_query {
            load_tile(workspace, storage_id, &mut acc);
        }

        let dout = grad_output.tile(step.query_start, col, rows, tile_cols);
        mma_atb(&mut acc, probs, &dout, rows);

        if needs_accum && !step.is_last_query {
            store_tile(workspace, storage_id, &acc);
        } else {
            accumulate_in_output(
                &acc,
                grad_value,
                head_dim_value,
                (step.key_start, col),
                (cols, tile_cols.min(head_dim_value - col)),
                step.is_first_query || needs_accum,
            );
        }
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Global f32 workspace for gradients that cannot be accumulated in place.
//!
//! Half-precision gradients would lose accuracy if every query (or key) tile
//! added into the storage-precision output, so partial sums are spilled to an
//! f32 scratch slab and only the final sum is rounded. Each (batch, head) owns
//! one slab of `stride_bh` floats, laid out as `[gk | gv | gq]`.

use super::config::KernelConfig;
use super::gemm::AccumTile;
use super::params::ProblemDims;

/// Slab stride granularity, in floats.
const SLAB_ALIGNMENT: usize = 4;

const fn align_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Per-(batch, head) workspace partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkspaceLayout {
    /// Floats reserved for dK partial sums.
    pub elements_gk: usize,
    /// Floats reserved for dV partial sums.
    pub elements_gv: usize,
    /// Floats reserved for dQ partial sums.
    pub elements_gq: usize,
    /// Floats between consecutive (batch, head) slabs.
    pub stride_bh: usize,
    /// Floats in one spilled tile.
    pub tile_elements: usize,
}

impl WorkspaceLayout {
    /// Partition for one problem under one configuration.
    #[must_use]
    pub fn new(config: &KernelConfig, dims: &ProblemDims) -> Self {
        let (bi, bj) = (config.block_i, config.block_j);
        let keys = align_up(dims.num_keys, bj);

        let elements_gk = if config.needs_accum_grad_k {
            keys * align_up(dims.head_dim, bi)
        } else {
            0
        };
        let elements_gv = if config.needs_accum_grad_v {
            keys * align_up(dims.head_dim_value, bi)
        } else {
            0
        };
        // A single key tile means dQ never has to be carried across tiles.
        let elements_gq = if config.needs_accum_grad_q && dims.num_keys > bj {
            align_up(dims.num_queries, bi) * align_up(dims.head_dim, bj)
        } else {
            0
        };

        Self {
            elements_gk,
            elements_gv,
            elements_gq,
            stride_bh: align_up(elements_gk + elements_gv + elements_gq, SLAB_ALIGNMENT),
            tile_elements: bi * bj,
        }
    }

    /// Floats the whole launch needs.
    #[must_use]
    pub const fn total_elements(&self, dims: &ProblemDims) -> usize {
        dims.num_blocks() * self.stride_bh
    }

    /// Bytes the whole launch needs.
    #[must_use]
    pub const fn total_bytes(&self, dims: &ProblemDims) -> usize {
        self.total_elements(dims) * std::mem::size_of::<f32>()
    }

    /// Whether any gradient spills.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.stride_bh == 0
    }
}

/// Workspace bytes a launch of `config` on `dims` requires.
#[must_use]
pub fn workspace_size(config: &KernelConfig, dims: &ProblemDims) -> usize {
    WorkspaceLayout::new(config, dims).total_bytes(dims)
}

/// One (batch, head) slab, split into its three regions.
#[derive(Debug, Default)]
pub struct BlockWorkspace<'a> {
    /// dK partial sums.
    pub grad_key: &'a mut [f32],
    /// dV partial sums.
    pub grad_value: &'a mut [f32],
    /// dQ partial sums.
    pub grad_query: &'a mut [f32],
    tile_elements: usize,
}

impl<'a> BlockWorkspace<'a> {
    /// Split a slab according to `layout`.
    #[must_use]
    pub fn split(slab: &'a mut [f32], layout: &WorkspaceLayout) -> Self {
        let (grad_key, rest) = slab.split_at_mut(layout.elements_gk);
        let (grad_value, rest) = rest.split_at_mut(layout.elements_gv);
        let grad_query = &mut rest[..layout.elements_gq];
        Self {
            grad_key,
            grad_value,
            grad_query,
            tile_elements: layout.tile_elements,
        }
    }

    /// Floats in one spilled tile.
    #[must_use]
    pub fn tile_elements(&self) -> usize {
        self.tile_elements
    }
}

/// Storage id of a dK/dV tile: one id per output column tile of a key tile.
#[must_use]
pub const fn grad_kv_storage_id(key_start: usize, col: usize, config: &KernelConfig, head_dim: usize) -> usize {
    let col_tiles = head_dim.div_ceil(config.block_i);
    (key_start / config.block_j) * col_tiles + col / config.block_i
}

/// Storage id of a dQ tile.
#[must_use]
pub const fn grad_query_storage_id(query_start: usize, col: usize, config: &KernelConfig, head_dim: usize) -> usize {
    col / config.block_j + (query_start / config.block_i) * head_dim.div_ceil(config.block_j)
}

/// Load a spilled accumulator.
pub fn load_tile(region: &[f32], storage_id: usize, acc: &mut AccumTile) {
    let n = acc.as_slice().len();
    let start = storage_id * n;
    acc.as_mut_slice().copy_from_slice(&region[start..start + n]);
}

/// Spill an accumulator.
pub fn store_tile(region: &mut [f32], storage_id: usize, acc: &AccumTile) {
    let n = acc.as_slice().len();
    let start = storage_id * n;
    region[start..start + n].copy_from_slice(acc.as_slice());
}

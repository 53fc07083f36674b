// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Block scheduling: the key-tile / query-tile double loop.
//!
//! Key tiles form the outer loop so dV and dK for one key tile can stay
//! resident across every query tile that touches it. Under causal masking a
//! key tile starting at `k` skips query tiles that end before `k`, since all
//! of their entries are masked.

use super::config::KernelConfig;

/// One key tile of the outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTile {
    /// First key row.
    pub start: usize,
    /// Rows in this tile (`block_j` unless it is the trailing partial tile).
    pub len: usize,
    /// Whether the tile is full, allowing the unchecked fast path.
    pub full: bool,
}

/// One (query tile, key tile) iteration and its accumulation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileStep {
    /// First query row.
    pub query_start: usize,
    /// First key row.
    pub key_start: usize,
    /// Query rows in this tile.
    pub num_queries_in_block: usize,
    /// Key rows in this tile.
    pub num_keys_in_block: usize,
    /// Both tiles are full; bounds checks can be skipped.
    pub skip_bounds_checks: bool,
    /// First query tile contributing to this key tile's dV/dK.
    pub is_first_query: bool,
    /// Last query tile contributing to this key tile's dV/dK.
    pub is_last_query: bool,
    /// First key tile contributing to this query tile's dQ.
    pub is_first_key: bool,
    /// Last key tile contributing to this query tile's dQ.
    pub is_last_key: bool,
}

/// Iteration order over tiles of one (batch, head) slice.
#[derive(Debug, Clone, Copy)]
pub struct BlockScheduler {
    num_queries: usize,
    num_keys: usize,
    block_i: usize,
    block_j: usize,
    causal: bool,
}

impl BlockScheduler {
    /// Scheduler for a problem under a kernel configuration.
    #[must_use]
    pub fn new(config: &KernelConfig, num_queries: usize, num_keys: usize, causal: bool) -> Self {
        Self::with_tiles(config.block_i, config.block_j, num_queries, num_keys, causal)
    }

    /// Scheduler with explicit tile sizes.
    #[must_use]
    pub fn with_tiles(
        block_i: usize,
        block_j: usize,
        num_queries: usize,
        num_keys: usize,
        causal: bool,
    ) -> Self {
        Self {
            num_queries,
            num_keys,
            block_i,
            block_j,
            causal,
        }
    }

    /// First query tile visited for the key tile starting at `key_start`.
    #[must_use]
    pub fn query_start(&self, key_start: usize) -> usize {
        if self.causal {
            (key_start / self.block_i) * self.block_i
        } else {
            0
        }
    }

    /// The pair following `(query_start, key_start)` in iteration order.
    #[must_use]
    pub fn next(&self, query_start: usize, key_start: usize) -> (usize, usize) {
        let next_query = query_start + self.block_i;
        if next_query >= self.num_queries {
            let next_key = key_start + self.block_j;
            (self.query_start(next_key), next_key)
        } else {
            (next_query, key_start)
        }
    }

    /// Key tiles in processing order; the partial tail comes last.
    pub fn key_tiles(&self) -> impl Iterator<Item = KeyTile> + '_ {
        let full_end = self.num_keys / self.block_j * self.block_j;
        (0..self.num_keys)
            .step_by(self.block_j.max(1))
            .map(move |start| KeyTile {
                start,
                len: self.block_j.min(self.num_keys - start),
                full: start < full_end,
            })
    }

    /// Query tiles visited for one key tile, with their flags.
    pub fn query_tiles(&self, key: KeyTile) -> impl Iterator<Item = TileStep> + '_ {
        let first = self.query_start(key.start);
        let full_end = first + (self.num_queries.saturating_sub(first)) / self.block_i * self.block_i;
        (first..self.num_queries)
            .step_by(self.block_i.max(1))
            .map(move |query_start| self.step(key, query_start, query_start < full_end))
    }

    /// Every step of the pass, flattened.
    pub fn steps(&self) -> impl Iterator<Item = TileStep> + '_ {
        self.key_tiles().flat_map(move |key| self.query_tiles(key))
    }

    fn step(&self, key: KeyTile, query_start: usize, query_full: bool) -> TileStep {
        let key_start = key.start;
        let (_, next_key) = self.next(query_start, key_start);

        // dQ for this query tile: is any later key tile going to revisit it?
        let (next_query_for_q, next_key_for_q) = self.next(self.num_queries, key_start);
        let is_last_key = (self.causal && next_query_for_q > query_start)
            || next_key_for_q >= self.num_keys;

        TileStep {
            query_start,
            key_start,
            num_queries_in_block: self.block_i.min(self.num_queries - query_start),
            num_keys_in_block: key.len,
            skip_bounds_checks: key.full && query_full,
            is_first_query: query_start == 0 || (self.causal && query_start <= key_start),
            is_last_query: next_key != key_start,
            is_first_key: key_start == 0,
            is_last_key,
        }
    }
}

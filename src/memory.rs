// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Shared-storage management for one execution unit.
//!
//! A block owns a single fixed-capacity arena. Its phases reinterpret the
//! same bytes as different typed views:
//!
//! ```text
//! | attn (P)   | zij (dropout) | scratch          | di     |
//! |            |               | probs: bias tile |        |
//! |            |               | grads: dS tile   |        |
//! ```
//!
//! `attn`, `zij` and `di` live for a whole (query-tile, key-tile) iteration.
//! `scratch` holds the bias tile while probabilities are recomputed and the
//! score gradient afterwards. Phase views borrow the arena mutably, so a view
//! must be dropped before the next phase is entered.

use bytemuck::Pod;

use crate::error::{BackwardError, Result};

/// Byte alignment of every arena region (one 128-bit access).
pub const SHARED_ALIGN: usize = 16;

const fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Bump allocator over a fixed byte budget.
#[derive(Debug)]
pub struct MemoryPool {
    /// Total allocated bytes
    allocated: usize,
    /// Memory limit (if set)
    limit: Option<usize>,
}

impl MemoryPool {
    /// Create a new memory pool.
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            allocated: 0,
            limit,
        }
    }

    /// Reserve `bytes` and return the aligned offset of the reservation.
    ///
    /// # Errors
    /// Returns `OutOfMemory` if the limit would be exceeded.
    pub fn allocate(&mut self, bytes: usize) -> Result<usize> {
        let offset = align_up(self.allocated, SHARED_ALIGN);
        let new_total = offset + bytes;

        if let Some(limit) = self.limit {
            if new_total > limit {
                return Err(BackwardError::OutOfMemory {
                    required: new_total,
                    available: limit.saturating_sub(self.allocated),
                });
            }
        }

        self.allocated = new_total;
        Ok(offset)
    }

    /// Get current allocation.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

/// A typed region of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    /// Byte offset from the arena start.
    pub offset: usize,
    /// Length in elements of the region's type.
    pub len: usize,
    /// Reserved bytes, padded to [`SHARED_ALIGN`].
    pub bytes: usize,
}

impl Region {
    fn reserve(pool: &mut MemoryPool, len: usize, elem_bytes: usize) -> Result<Self> {
        let bytes = align_up(len * elem_bytes, SHARED_ALIGN);
        let offset = pool.allocate(bytes)?;
        Ok(Self { offset, len, bytes })
    }

    const fn words(&self) -> usize {
        self.bytes / 4
    }
}

/// Offsets of every region of a block's shared storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedLayout {
    /// Probability tile, `block_i x block_j`, storage precision.
    pub attn: Region,
    /// Dropout keep/scale tile, `block_i x block_j` (empty without dropout).
    pub zij: Region,
    /// Bias tile, then score-gradient tile, `block_i x block_j`.
    pub scratch: Region,
    /// Row deltas for the current query tile, `block_i` f32.
    pub di: Region,
    /// Storage element size in bytes.
    pub elem_bytes: usize,
    /// Arena size in bytes.
    pub total_bytes: usize,
}

impl SharedLayout {
    /// Lay out the arena, failing if it exceeds `budget` bytes.
    ///
    /// # Errors
    /// Returns `OutOfMemory` when the regions do not fit.
    pub fn new(
        block_i: usize,
        block_j: usize,
        elem_bytes: usize,
        dropout: bool,
        budget: usize,
    ) -> Result<Self> {
        let tile = block_i * block_j;
        let mut pool = MemoryPool::new(Some(budget));
        let attn = Region::reserve(&mut pool, tile, elem_bytes)?;
        let zij = Region::reserve(&mut pool, if dropout { tile } else { 0 }, elem_bytes)?;
        let scratch = Region::reserve(&mut pool, tile, elem_bytes)?;
        let di = Region::reserve(&mut pool, block_i, std::mem::size_of::<f32>())?;
        let total_bytes = pool.allocated();

        debug_assert_eq!(
            total_bytes,
            Self::total_bytes_for(block_i, block_j, elem_bytes, dropout)
        );

        Ok(Self {
            attn,
            zij,
            scratch,
            di,
            elem_bytes,
            total_bytes,
        })
    }

    /// Arena size for a tile shape, computable at compile time.
    #[must_use]
    pub const fn total_bytes_for(
        block_i: usize,
        block_j: usize,
        elem_bytes: usize,
        dropout: bool,
    ) -> usize {
        let tile = align_up(block_i * block_j * elem_bytes, SHARED_ALIGN);
        let zij = if dropout { tile } else { 0 };
        let di = align_up(block_i * 4, SHARED_ALIGN);
        tile + zij + tile + di
    }
}

// The largest arena (sm80, 128x128 f16 tiles with dropout) must fit in 160 KiB.
const _: () = assert!(SharedLayout::total_bytes_for(128, 128, 2, true) <= 160 * 1024);
// And the f32 64x64 arena must fit the smallest budget.
const _: () = assert!(SharedLayout::total_bytes_for(64, 64, 4, true) <= 64 * 1024);

/// Views used while recomputing probabilities and the dropout mask.
pub struct ProbsPhase<'a, T> {
    /// Probability tile (written).
    pub attn: &'a mut [T],
    /// Dropout tile (written).
    pub zij: &'a mut [T],
    /// Bias tile (loaded once per iteration).
    pub bias: &'a mut [T],
    /// Row deltas.
    pub di: &'a mut [f32],
}

/// Views used while computing and consuming the score gradient.
pub struct GradPhase<'a, T> {
    /// Probability tile (read).
    pub attn: &'a [T],
    /// Dropout tile (read).
    pub zij: &'a [T],
    /// Score-gradient tile, aliasing the bias bytes.
    pub grad_score: &'a mut [T],
    /// Row deltas.
    pub di: &'a [f32],
}

/// The arena itself.
#[derive(Debug)]
pub struct SharedStorage {
    words: Vec<u32>,
    layout: SharedLayout,
}

impl SharedStorage {
    /// Allocate a zeroed arena for a layout.
    #[must_use]
    pub fn new(layout: SharedLayout) -> Self {
        Self {
            words: vec![0; layout.total_bytes / 4],
            layout,
        }
    }

    /// Layout of this arena.
    #[must_use]
    pub fn layout(&self) -> &SharedLayout {
        &self.layout
    }

    fn split(&mut self) -> [&mut [u32]; 4] {
        let l = self.layout;
        let (attn, rest) = self.words.split_at_mut(l.attn.words());
        let (zij, rest) = rest.split_at_mut(l.zij.words());
        let (scratch, rest) = rest.split_at_mut(l.scratch.words());
        let di = &mut rest[..l.di.words()];
        [attn, zij, scratch, di]
    }

    /// Enter the probability phase.
    pub fn probs_phase<T: Pod>(&mut self) -> ProbsPhase<'_, T> {
        debug_assert_eq!(std::mem::size_of::<T>(), self.layout.elem_bytes);
        let l = self.layout;
        let [attn, zij, scratch, di] = self.split();
        ProbsPhase {
            attn: &mut bytemuck::cast_slice_mut(attn)[..l.attn.len],
            zij: &mut bytemuck::cast_slice_mut(zij)[..l.zij.len],
            bias: &mut bytemuck::cast_slice_mut(scratch)[..l.scratch.len],
            di: &mut bytemuck::cast_slice_mut(di)[..l.di.len],
        }
    }

    /// Enter the score-gradient phase.
    pub fn grad_phase<T: Pod>(&mut self) -> GradPhase<'_, T> {
        debug_assert_eq!(std::mem::size_of::<T>(), self.layout.elem_bytes);
        let l = self.layout;
        let [attn, zij, scratch, di] = self.split();
        GradPhase {
            attn: &bytemuck::cast_slice(attn)[..l.attn.len],
            zij: &bytemuck::cast_slice(zij)[..l.zij.len],
            grad_score: &mut bytemuck::cast_slice_mut(scratch)[..l.scratch.len],
            di: &bytemuck::cast_slice(di)[..l.di.len],
        }
    }
}

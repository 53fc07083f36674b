// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Counter-based random numbers for dropout-mask regeneration.
//!
//! Philox4x32-10 maps a 128-bit counter and a 64-bit key to four 32-bit
//! words. Draw `n` of a stream is word `n % 4` of the block at counter
//! `n / 4`, so any position can be reached in O(1) with [`Philox4x32::skip_ahead`].
//!
//! Each element `(q, k)` of the attention matrix for `(batch, head)` owns
//! draw `offset + batch * (H * Mq * Mk) + head * (Mq * Mk) + q * Mk + k`.

const PHILOX_W32_0: u32 = 0x9E37_79B9;
const PHILOX_W32_1: u32 = 0xBB67_AE85;
const PHILOX_M4X32_0: u32 = 0xD251_1F53;
const PHILOX_M4X32_1: u32 = 0xCD9E_8D57;

/// 2^-32
const TWO_POW_32_INV: f32 = 2.328_306_4e-10;

#[inline]
fn mulhilo32(a: u32, b: u32) -> (u32, u32) {
    let product = u64::from(a) * u64::from(b);
    #[allow(clippy::cast_possible_truncation)]
    ((product >> 32) as u32, product as u32)
}

#[inline]
fn philox4x32_round(ctr: &mut [u32; 4], key: &[u32; 2]) {
    let (hi0, lo0) = mulhilo32(PHILOX_M4X32_0, ctr[0]);
    let (hi1, lo1) = mulhilo32(PHILOX_M4X32_1, ctr[2]);

    *ctr = [hi1 ^ ctr[1] ^ key[0], lo1, hi0 ^ ctr[3] ^ key[1], lo0];
}

#[inline]
fn philox4x32_bumpkey(key: &mut [u32; 2]) {
    key[0] = key[0].wrapping_add(PHILOX_W32_0);
    key[1] = key[1].wrapping_add(PHILOX_W32_1);
}

/// Ten-round Philox bijection.
#[must_use]
pub fn philox4x32_10(mut ctr: [u32; 4], mut key: [u32; 2]) -> [u32; 4] {
    philox4x32_round(&mut ctr, &key);
    for _ in 0..9 {
        philox4x32_bumpkey(&mut key);
        philox4x32_round(&mut ctr, &key);
    }
    ctr
}

/// Map a raw word to a uniform in (0, 1].
#[inline]
#[must_use]
pub fn uniform_from_u32(x: u32) -> f32 {
    #[allow(clippy::cast_precision_loss)]
    let x = x as f32;
    x * TWO_POW_32_INV + TWO_POW_32_INV / 2.0
}

/// Seekable Philox stream.
///
/// Copies are cheap; a tile takes a copy of the per-block base state and
/// seeks it to each row's first element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Philox4x32 {
    key: [u32; 2],
    counter: u128,
    word: u8,
}

impl Philox4x32 {
    /// Stream for `seed`, positioned `subsequence * 2^66 + offset` draws in.
    #[must_use]
    pub fn new(seed: u64, subsequence: u64, offset: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let key = [seed as u32, (seed >> 32) as u32];
        let mut state = Self {
            key,
            counter: u128::from(subsequence) << 64,
            word: 0,
        };
        state.skip_ahead(offset);
        state
    }

    /// Advance by `n` single draws.
    pub fn skip_ahead(&mut self, n: u64) {
        let word = u64::from(self.word) + (n & 3);
        self.counter = self
            .counter
            .wrapping_add(u128::from(n >> 2) + u128::from(word >> 2));
        #[allow(clippy::cast_possible_truncation)]
        {
            self.word = (word & 3) as u8;
        }
    }

    fn block(&self) -> [u32; 4] {
        #[allow(clippy::cast_possible_truncation)]
        let ctr = [
            self.counter as u32,
            (self.counter >> 32) as u32,
            (self.counter >> 64) as u32,
            (self.counter >> 96) as u32,
        ];
        philox4x32_10(ctr, self.key)
    }

    /// Next raw 32-bit draw.
    pub fn next_u32(&mut self) -> u32 {
        let value = self.block()[usize::from(self.word)];
        self.skip_ahead(1);
        value
    }

    /// Next uniform in (0, 1].
    pub fn uniform(&mut self) -> f32 {
        uniform_from_u32(self.next_u32())
    }

    /// Next four uniforms.
    pub fn uniform4(&mut self) -> [f32; 4] {
        if self.word == 0 {
            let block = self.block();
            self.counter = self.counter.wrapping_add(1);
            return block.map(uniform_from_u32);
        }
        [self.uniform(), self.uniform(), self.uniform(), self.uniform()]
    }
}

/// Seed and base offset of the dropout stream for one launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhiloxState {
    /// Generator key.
    pub seed: u64,
    /// Draw offset added to every element's position.
    pub offset: u64,
}

impl PhiloxState {
    /// New seed/offset pair.
    #[must_use]
    pub const fn new(seed: u64, offset: u64) -> Self {
        Self { seed, offset }
    }

    /// Base stream for a (batch, head) slice; initialized once per block.
    #[must_use]
    pub fn block_stream(&self, batch_head_offset: u64) -> Philox4x32 {
        Philox4x32::new(self.seed, 0, self.offset + batch_head_offset)
    }
}

/// Keep/scale factor for one uniform draw.
#[inline]
#[must_use]
pub fn dropout_keep_scale(uniform: f32, dropout_prob: f32) -> f32 {
    if uniform > dropout_prob {
        1.0 / (1.0 - dropout_prob)
    } else {
        0.0
    }
}

/// Materialize the full `[batch, heads, num_queries, num_keys]` mask.
///
/// The kernel never does this; it exists to feed dense reference checks and
/// uses exactly the per-element stream positions the kernel uses.
#[must_use]
pub fn dropout_mask(
    state: PhiloxState,
    dims: (usize, usize, usize, usize),
    dropout_prob: f32,
) -> Vec<f32> {
    let (batch, heads, num_queries, num_keys) = dims;
    let per_head = (num_queries * num_keys) as u64;
    let mut mask = Vec::with_capacity(batch * heads * num_queries * num_keys);
    for b in 0..batch {
        for h in 0..heads {
            let base = state.block_stream((b * heads + h) as u64 * per_head);
            for q in 0..num_queries {
                let mut row = base;
                row.skip_ahead((q * num_keys) as u64);
                for _ in 0..num_keys {
                    mask.push(dropout_keep_scale(row.uniform(), dropout_prob));
                }
            }
        }
    }
    mask
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Problem descriptor and per-(batch, head) execution context.

use super::config::KernelVariant;
use super::rng::PhiloxState;
use crate::error::{BackwardError, Result};

/// The log-normalizer row stride must be a multiple of this many elements.
pub const LSE_ALIGNMENT: usize = 8;

/// Problem dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemDims {
    /// Batch count.
    pub batch: usize,
    /// Head count.
    pub heads: usize,
    /// Query length (Mq).
    pub num_queries: usize,
    /// Key length (Mk).
    pub num_keys: usize,
    /// Query/key head dimension (K).
    pub head_dim: usize,
    /// Value head dimension (Kv).
    pub head_dim_value: usize,
}

impl ProblemDims {
    /// Number of independent execution units.
    #[must_use]
    pub const fn num_blocks(&self) -> usize {
        self.batch * self.heads
    }

    /// `max(head_dim, head_dim_value)`, the dispatch key.
    #[must_use]
    pub const fn max_head_dim(&self) -> usize {
        if self.head_dim > self.head_dim_value {
            self.head_dim
        } else {
            self.head_dim_value
        }
    }
}

/// Placement of a rank-4 tensor inside a flat buffer, in elements.
///
/// The innermost (head-dim or key) axis is always contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorLayout {
    /// Offset of element `[0, 0, 0, 0]`.
    pub offset: usize,
    /// Stride between batches.
    pub batch: usize,
    /// Stride between heads.
    pub head: usize,
    /// Stride between rows (sequence positions).
    pub row: usize,
}

impl TensorLayout {
    /// `[batch, seq, heads, dim]`, contiguous.
    #[must_use]
    pub const fn bmhk(seq_len: usize, heads: usize, dim: usize) -> Self {
        Self {
            offset: 0,
            batch: seq_len * heads * dim,
            head: dim,
            row: heads * dim,
        }
    }

    /// `[batch, heads, seq, dim]`, contiguous.
    #[must_use]
    pub const fn bhmk(seq_len: usize, heads: usize, dim: usize) -> Self {
        Self {
            offset: 0,
            batch: heads * seq_len * dim,
            head: seq_len * dim,
            row: dim,
        }
    }

    /// Shift the base offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Offset of row 0 of one (batch, head) slice.
    #[must_use]
    pub const fn slice_base(&self, batch: usize, head: usize) -> usize {
        self.offset + batch * self.batch + head * self.head
    }

    /// One past the last element addressed for the given extents.
    #[must_use]
    pub const fn extent(&self, batch: usize, heads: usize, rows: usize, cols: usize) -> usize {
        if batch == 0 || heads == 0 || rows == 0 || cols == 0 {
            return self.offset;
        }
        self.slice_base(batch - 1, heads - 1) + (rows - 1) * self.row + cols
    }
}

/// Everything the kernel needs to know about one launch.
#[derive(Debug, Clone)]
pub struct BackwardParams {
    /// Dimensions.
    pub dims: ProblemDims,
    /// Softmax scale applied to `Q K^T`.
    pub scale: f32,
    /// Mask out keys after the query position.
    pub causal: bool,
    /// Dropout probability in `[0, 1)`.
    pub dropout_prob: f32,
    /// Dropout stream seed and offset.
    pub rng: PhiloxState,
    /// Query `[B, Mq, H, K]`.
    pub query: TensorLayout,
    /// Key `[B, Mk, H, K]`.
    pub key: TensorLayout,
    /// Value `[B, Mk, H, Kv]`.
    pub value: TensorLayout,
    /// Additive bias `[B, H, Mq, Mk]`.
    pub bias: Option<TensorLayout>,
    /// Forward output `[B, Mq, H, Kv]`.
    pub output: TensorLayout,
    /// Output gradient `[B, Mq, H, Kv]`.
    pub grad_output: TensorLayout,
    /// Row stride of the `[B, H, lse_stride_m]` log-normalizer.
    pub lse_stride_m: usize,
    /// Query gradient.
    pub grad_query: TensorLayout,
    /// Key gradient.
    pub grad_key: TensorLayout,
    /// Value gradient.
    pub grad_value: TensorLayout,
    /// Bias gradient, when requested.
    pub grad_bias: Option<TensorLayout>,
}

impl BackwardParams {
    /// Contiguous BMHK layouts for every tensor, dense bias if `with_bias`.
    #[must_use]
    pub fn contiguous(dims: ProblemDims, scale: f32, with_bias: bool) -> Self {
        let ProblemDims {
            heads,
            num_queries,
            num_keys,
            head_dim,
            head_dim_value,
            ..
        } = dims;
        let bias = with_bias.then(|| TensorLayout::bhmk(num_queries, heads, num_keys));
        Self {
            dims,
            scale,
            causal: false,
            dropout_prob: 0.0,
            rng: PhiloxState::default(),
            query: TensorLayout::bmhk(num_queries, heads, head_dim),
            key: TensorLayout::bmhk(num_keys, heads, head_dim),
            value: TensorLayout::bmhk(num_keys, heads, head_dim_value),
            bias,
            output: TensorLayout::bmhk(num_queries, heads, head_dim_value),
            grad_output: TensorLayout::bmhk(num_queries, heads, head_dim_value),
            lse_stride_m: num_queries.div_ceil(LSE_ALIGNMENT) * LSE_ALIGNMENT,
            grad_query: TensorLayout::bmhk(num_queries, heads, head_dim),
            grad_key: TensorLayout::bmhk(num_keys, heads, head_dim),
            grad_value: TensorLayout::bmhk(num_keys, heads, head_dim_value),
            grad_bias: bias,
        }
    }

    /// Enable causal masking.
    #[must_use]
    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    /// Enable dropout.
    #[must_use]
    pub fn with_dropout(mut self, dropout_prob: f32, rng: PhiloxState) -> Self {
        self.dropout_prob = dropout_prob;
        self.rng = rng;
        self
    }

    /// Elements the log-normalizer buffer must hold.
    #[must_use]
    pub const fn lse_len(&self) -> usize {
        self.dims.num_blocks() * self.lse_stride_m
    }

    /// Elements of a `[B, H, Mq]` row-delta buffer.
    #[must_use]
    pub const fn delta_len(&self) -> usize {
        self.dims.num_blocks() * self.dims.num_queries
    }
}

/// Buffer lengths the caller passes to a launch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferExtents {
    /// Query buffer length.
    pub query: usize,
    /// Key buffer length.
    pub key: usize,
    /// Value buffer length.
    pub value: usize,
    /// Bias buffer length (0 when absent).
    pub bias: usize,
    /// Output buffer length.
    pub output: usize,
    /// Output-gradient buffer length.
    pub grad_output: usize,
    /// Log-normalizer buffer length.
    pub logsumexp: usize,
    /// Query-gradient buffer length.
    pub grad_query: usize,
    /// Key-gradient buffer length.
    pub grad_key: usize,
    /// Value-gradient buffer length.
    pub grad_value: usize,
    /// Bias-gradient buffer length (0 when absent).
    pub grad_bias: usize,
}

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(BackwardError::Precondition(message()))
    }
}

fn check_extent(name: &str, layout: &TensorLayout, dims: (usize, usize, usize, usize), len: usize) -> Result<()> {
    let needed = layout.extent(dims.0, dims.1, dims.2, dims.3);
    check(needed <= len, || {
        format!("{name} buffer holds {len} elements, layout addresses {needed}")
    })
}

/// Validate a launch before any block runs.
///
/// # Errors
/// Returns `Precondition` describing the first violated requirement.
pub fn check_supported(
    variant: &KernelVariant,
    params: &BackwardParams,
    extents: &BufferExtents,
) -> Result<()> {
    let dims = params.dims;
    let align = variant.config.min_alignment;

    check(
        variant.supports_head_dims(dims.head_dim, dims.head_dim_value),
        || {
            format!(
                "head dims ({}, {}) exceed variant bucket {:?}",
                dims.head_dim, dims.head_dim_value, variant.config.max_k
            )
        },
    )?;
    check(variant.causal == params.causal, || {
        "variant causal flag does not match the problem".to_string()
    })?;
    check(
        (0.0..1.0).contains(&params.dropout_prob),
        || format!("dropout probability {} not in [0, 1)", params.dropout_prob),
    )?;
    check(variant.dropout || params.dropout_prob == 0.0, || {
        "dropout requested on a variant built without dropout".to_string()
    })?;

    for (name, layout) in [
        ("query", &params.query),
        ("key", &params.key),
        ("value", &params.value),
        ("output", &params.output),
        ("grad_output", &params.grad_output),
    ] {
        check(layout.offset % align == 0, || {
            format!("{name} is not aligned to {align} elements")
        })?;
    }
    check(params.lse_stride_m % LSE_ALIGNMENT == 0, || {
        "LSE is not correctly aligned".to_string()
    })?;
    check(params.lse_stride_m >= dims.num_queries, || {
        format!(
            "LSE row stride {} shorter than {} queries",
            params.lse_stride_m, dims.num_queries
        )
    })?;
    check(params.query.head % align == 0, || "query is not correctly aligned".to_string())?;
    check(params.key.head % align == 0, || "key is not correctly aligned".to_string())?;
    check(params.value.head % align == 0, || "value is not correctly aligned".to_string())?;

    let (b, h) = (dims.batch, dims.heads);
    let (mq, mk, k, kv) = (dims.num_queries, dims.num_keys, dims.head_dim, dims.head_dim_value);
    check_extent("query", &params.query, (b, h, mq, k), extents.query)?;
    check_extent("key", &params.key, (b, h, mk, k), extents.key)?;
    check_extent("value", &params.value, (b, h, mk, kv), extents.value)?;
    check_extent("output", &params.output, (b, h, mq, kv), extents.output)?;
    check_extent("grad_output", &params.grad_output, (b, h, mq, kv), extents.grad_output)?;
    check_extent("grad_query", &params.grad_query, (b, h, mq, k), extents.grad_query)?;
    check_extent("grad_key", &params.grad_key, (b, h, mk, k), extents.grad_key)?;
    check_extent("grad_value", &params.grad_value, (b, h, mk, kv), extents.grad_value)?;
    check(params.lse_len() <= extents.logsumexp, || {
        format!(
            "logsumexp buffer holds {} elements, need {}",
            extents.logsumexp,
            params.lse_len()
        )
    })?;

    match &params.bias {
        Some(layout) => check_extent("bias", layout, (b, h, mq, mk), extents.bias)?,
        None => check(params.grad_bias.is_none(), || {
            "bias gradient requested without a bias".to_string()
        })?,
    }
    if let Some(layout) = &params.grad_bias {
        check_extent("grad_bias", layout, (b, h, mq, mk), extents.grad_bias)?;
    }

    Ok(())
}

/// Base offsets of one (batch, head) slice, derived once at block entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    /// Batch index.
    pub batch: usize,
    /// Head index.
    pub head: usize,
    /// Query row 0.
    pub query: usize,
    /// Key row 0.
    pub key: usize,
    /// Value row 0.
    pub value: usize,
    /// Bias row 0.
    pub bias: Option<usize>,
    /// Output row 0.
    pub output: usize,
    /// Output-gradient row 0.
    pub grad_output: usize,
    /// First log-normalizer entry.
    pub logsumexp: usize,
    /// First row-delta entry.
    pub delta: usize,
    /// Dropout stream position of element `(0, 0)`.
    pub dropout_offset: u64,
}

impl BlockContext {
    /// Advance every base pointer to `(batch, head)`.
    #[must_use]
    pub fn advance_to_block(params: &BackwardParams, batch: usize, head: usize) -> Self {
        let dims = params.dims;
        let block_id = batch * dims.heads + head;
        let per_head = (dims.num_queries * dims.num_keys) as u64;
        Self {
            batch,
            head,
            query: params.query.slice_base(batch, head),
            key: params.key.slice_base(batch, head),
            value: params.value.slice_base(batch, head),
            bias: params.bias.map(|layout| layout.slice_base(batch, head)),
            output: params.output.slice_base(batch, head),
            grad_output: params.grad_output.slice_base(batch, head),
            logsumexp: block_id * params.lse_stride_m,
            delta: block_id * dims.num_queries,
            dropout_offset: batch as u64 * (dims.heads as u64 * per_head)
                + head as u64 * per_head,
        }
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! The per-(batch, head) backward pass.
//!
//! One call of [`run_block`] is one execution unit: it walks every key tile,
//! and for each key tile every query tile that survives the causal skip,
//! recomputing probabilities and accumulating all four gradients.

use super::config::KernelVariant;
use super::delta::compute_delta;
use super::element::KernelElement;
use super::epilogue::OutputFragments;
use super::gemm::MatrixRef;
use super::grad_key::accumulate_grad_key;
use super::grad_query::accumulate_grad_query;
use super::grad_score::{compute_grad_score, ScoreInputs};
use super::grad_value::{accumulate_grad_value, DroppedProbs};
use super::params::{BackwardParams, BlockContext, ProblemDims};
use super::probs::{generate_dropout_tile, recompute_probabilities, tile_extent, ProbsOperands};
use super::rng::Philox4x32;
use super::schedule::{BlockScheduler, TileStep};
use super::workspace::{BlockWorkspace, WorkspaceLayout};
use crate::memory::{GradPhase, ProbsPhase, SharedStorage};

/// Flat input buffers of a launch; [`BackwardParams`] says where each tensor lives.
#[derive(Debug, Clone, Copy)]
pub struct KernelInputs<'a, T> {
    /// Query.
    pub query: &'a [T],
    /// Key.
    pub key: &'a [T],
    /// Value.
    pub value: &'a [T],
    /// Optional additive bias.
    pub bias: Option<&'a [T]>,
    /// Forward output.
    pub output: &'a [T],
    /// Output gradient.
    pub grad_output: &'a [T],
    /// Forward log-normalizer, `[B, H, lse_stride_m]`.
    pub logsumexp: &'a [f32],
}

/// Strided views of one (batch, head) slice.
pub struct BlockOperands<'a, T> {
    /// `Mq x K`.
    pub query: MatrixRef<'a, T>,
    /// `Mk x K`.
    pub key: MatrixRef<'a, T>,
    /// `Mk x Kv`.
    pub value: MatrixRef<'a, T>,
    /// `Mq x Mk`.
    pub bias: Option<MatrixRef<'a, T>>,
    /// `Mq x Kv`.
    pub output: MatrixRef<'a, T>,
    /// `Mq x Kv`.
    pub grad_output: MatrixRef<'a, T>,
    /// `Mq` entries.
    pub logsumexp: &'a [f32],
}

impl<'a, T: KernelElement> BlockOperands<'a, T> {
    /// Resolve every view for the slice described by `ctx`.
    #[must_use]
    pub fn new(params: &BackwardParams, ctx: &BlockContext, inputs: &KernelInputs<'a, T>) -> Self {
        let ProblemDims {
            num_queries: mq,
            num_keys: mk,
            head_dim: k,
            head_dim_value: kv,
            ..
        } = params.dims;
        let bias = match (inputs.bias, params.bias, ctx.bias) {
            (Some(data), Some(layout), Some(base)) => {
                Some(MatrixRef::new(data, base, mq, mk, layout.row))
            }
            _ => None,
        };
        Self {
            query: MatrixRef::new(inputs.query, ctx.query, mq, k, params.query.row),
            key: MatrixRef::new(inputs.key, ctx.key, mk, k, params.key.row),
            value: MatrixRef::new(inputs.value, ctx.value, mk, kv, params.value.row),
            bias,
            output: MatrixRef::new(inputs.output, ctx.output, mq, kv, params.output.row),
            grad_output: MatrixRef::new(
                inputs.grad_output,
                ctx.grad_output,
                mq,
                kv,
                params.grad_output.row,
            ),
            logsumexp: &inputs.logsumexp[ctx.logsumexp..ctx.logsumexp + mq],
        }
    }
}

/// Gradients of one (batch, head) slice, row-major and densely packed.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockGradients<T> {
    /// `Mq x K`.
    pub grad_query: Vec<T>,
    /// `Mk x K`.
    pub grad_key: Vec<T>,
    /// `Mk x Kv`.
    pub grad_value: Vec<T>,
    /// `Mq x Mk`, when requested.
    pub grad_bias: Option<Vec<T>>,
}

impl<T: KernelElement> BlockGradients<T> {
    /// Zeroed gradients. Rows no tile ever reaches keep this value.
    #[must_use]
    pub fn zeros(dims: &ProblemDims, with_bias: bool) -> Self {
        let zero = T::from_accum(0.0);
        Self {
            grad_query: vec![zero; dims.num_queries * dims.head_dim],
            grad_key: vec![zero; dims.num_keys * dims.head_dim],
            grad_value: vec![zero; dims.num_keys * dims.head_dim_value],
            grad_bias: with_bias.then(|| vec![zero; dims.num_queries * dims.num_keys]),
        }
    }
}

struct BlockState<'w, T> {
    shared: SharedStorage,
    frags: OutputFragments,
    workspace: BlockWorkspace<'w>,
    delta: Vec<f32>,
    stream: Option<Philox4x32>,
    grads: BlockGradients<T>,
}

/// Run the backward pass for one (batch, head) slice.
///
/// `host_delta` is the launch-wide `[B, H, Mq]` row delta; it is read only by
/// variants that do not compute the delta themselves. `slab` is this slice's
/// share of the workspace and may be empty when `layout` needs none.
pub fn run_block<T: KernelElement>(
    variant: &KernelVariant,
    params: &BackwardParams,
    ctx: &BlockContext,
    inputs: &KernelInputs<'_, T>,
    host_delta: Option<&[f32]>,
    layout: &WorkspaceLayout,
    slab: &mut [f32],
) -> BlockGradients<T> {
    let config = &variant.config;
    let dims = params.dims;
    let operands = BlockOperands::new(params, ctx, inputs);

    let delta = match host_delta {
        Some(delta) if !config.kernel_computes_delta => {
            delta[ctx.delta..ctx.delta + dims.num_queries].to_vec()
        }
        _ => compute_delta(
            &operands.output,
            &operands.grad_output,
            config.block_i,
            config.num_threads(),
        ),
    };

    let mut state = BlockState {
        shared: SharedStorage::new(*variant.shared_layout()),
        frags: OutputFragments::new(config),
        workspace: BlockWorkspace::split(slab, layout),
        delta,
        stream: variant
            .dropout
            .then(|| params.rng.block_stream(ctx.dropout_offset)),
        grads: BlockGradients::zeros(&dims, params.grad_bias.is_some()),
    };

    let scheduler = BlockScheduler::new(config, dims.num_queries, dims.num_keys, variant.causal);
    for key in scheduler.key_tiles() {
        tracing::trace!(
            batch = ctx.batch,
            head = ctx.head,
            key_start = key.start,
            "backward key tile"
        );
        state.frags.clear();
        for step in scheduler.query_tiles(key) {
            process_tile(variant, params, &operands, &step, &mut state);
        }
        if config.output_in_rf {
            state.frags.write_to(
                key.start,
                key.len,
                &mut state.grads.grad_key,
                dims.head_dim,
                &mut state.grads.grad_value,
                dims.head_dim_value,
            );
        }
    }

    state.grads
}

fn process_tile<T: KernelElement>(
    variant: &KernelVariant,
    params: &BackwardParams,
    operands: &BlockOperands<'_, T>,
    step: &TileStep,
    state: &mut BlockState<'_, T>,
) {
    let (block_i, block_j) = (variant.config.block_i, variant.config.block_j);
    let (rows, cols) = tile_extent(step, block_i, block_j);

    {
        let ProbsPhase {
            attn,
            zij,
            bias,
            di,
        } = state.shared.probs_phase::<T>();

        for (i, slot) in di.iter_mut().enumerate() {
            *slot = if i < rows {
                state.delta[step.query_start + i]
            } else {
                0.0
            };
        }

        let probs_operands = ProbsOperands {
            query: &operands.query,
            key: &operands.key,
            bias: operands.bias.as_ref(),
            logsumexp: operands.logsumexp,
        };
        recompute_probabilities(
            step,
            block_i,
            block_j,
            params.scale,
            variant.causal,
            &probs_operands,
            attn,
            bias,
        );
        if let Some(stream) = &state.stream {
            generate_dropout_tile(
                step,
                block_i,
                block_j,
                params.dims.num_keys,
                params.dropout_prob,
                stream,
                zij,
            );
        }
    }

    let GradPhase {
        attn,
        zij,
        grad_score,
        di,
    } = state.shared.grad_phase::<T>();
    let zij = state.stream.is_some().then_some(zij);
    let grads = &mut state.grads;
    let workspace = &mut state.workspace;

    let probs = DroppedProbs::new(attn, zij, rows, cols, block_j);
    accumulate_grad_value(
        variant,
        step,
        &probs,
        &operands.grad_output,
        &mut state.frags,
        workspace.grad_value,
        &mut grads.grad_value,
    );

    compute_grad_score(
        step,
        block_i,
        block_j,
        params.scale,
        &ScoreInputs { attn, zij, di },
        &operands.grad_output,
        &operands.value,
        grad_score,
        grads.grad_bias.as_deref_mut(),
    );

    accumulate_grad_query(
        variant,
        step,
        grad_score,
        &operands.key,
        workspace.grad_query,
        &mut grads.grad_query,
    );
    accumulate_grad_key(
        variant,
        step,
        grad_score,
        &operands.query,
        &mut state.frags,
        workspace.grad_key,
        &mut grads.grad_key,
    );
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Grid launch: validation, the parallel per-(batch, head) pass, and the
//! scatter of per-block gradients into the caller's strided outputs.

use rayon::prelude::*;

use super::config::{Arch, KernelVariant};
use super::element::KernelElement;
use super::kernel::{run_block, BlockGradients, KernelInputs};
use super::params::{check_supported, BackwardParams, BlockContext, BufferExtents, TensorLayout};
use super::workspace::WorkspaceLayout;
use crate::error::{BackwardError, Result};

/// Caller-owned gradient buffers, addressed through [`BackwardParams`].
#[derive(Debug)]
pub struct KernelOutputs<'a, T> {
    /// Query gradient.
    pub grad_query: &'a mut [T],
    /// Key gradient.
    pub grad_key: &'a mut [T],
    /// Value gradient.
    pub grad_value: &'a mut [T],
    /// Bias gradient; broadcast layouts receive the sum over aliased slices.
    pub grad_bias: Option<&'a mut [T]>,
}

/// Launch `variant` over every (batch, head) of `params`.
///
/// `host_delta` must hold the `[B, H, Mq]` row delta when the variant does
/// not compute it. `workspace` must hold
/// [`workspace_size`](super::workspace::workspace_size) bytes of f32 when
/// that is non-zero; its contents on entry are ignored.
///
/// # Errors
/// - `ArchitectureMismatch` if the device cannot run the variant
/// - `UnsupportedDType` if `T` is not the variant's precision
/// - `Precondition` for alignment, stride, extent or missing-delta violations
/// - `WorkspaceMissing` if spilling is needed and the workspace is absent or short
pub fn launch<T: KernelElement>(
    variant: &KernelVariant,
    device: Arch,
    params: &BackwardParams,
    inputs: &KernelInputs<'_, T>,
    host_delta: Option<&[f32]>,
    workspace: Option<&mut [f32]>,
    outputs: &mut KernelOutputs<'_, T>,
) -> Result<()> {
    variant.check_device(device)?;
    if T::PRECISION != variant.config.precision {
        return Err(BackwardError::UnsupportedDType(format!(
            "{:?} buffers passed to a {:?} variant",
            T::PRECISION,
            variant.config.precision
        )));
    }

    let extents = BufferExtents {
        query: inputs.query.len(),
        key: inputs.key.len(),
        value: inputs.value.len(),
        bias: inputs.bias.map_or(0, <[T]>::len),
        output: inputs.output.len(),
        grad_output: inputs.grad_output.len(),
        logsumexp: inputs.logsumexp.len(),
        grad_query: outputs.grad_query.len(),
        grad_key: outputs.grad_key.len(),
        grad_value: outputs.grad_value.len(),
        grad_bias: outputs.grad_bias.as_deref().map_or(0, <[T]>::len),
    };
    check_supported(variant, params, &extents)?;

    if inputs.bias.is_some() != params.bias.is_some() {
        return Err(BackwardError::Precondition(
            "bias buffer and bias layout must be given together".to_string(),
        ));
    }
    if outputs.grad_bias.is_some() != params.grad_bias.is_some() {
        return Err(BackwardError::Precondition(
            "bias-gradient buffer and layout must be given together".to_string(),
        ));
    }

    let config = &variant.config;
    if !config.kernel_computes_delta {
        let have = host_delta.map_or(0, <[f32]>::len);
        if have < params.delta_len() {
            return Err(BackwardError::Precondition(format!(
                "{} variant needs a precomputed row delta of {} elements, got {have}",
                config.arch,
                params.delta_len()
            )));
        }
    }

    let dims = params.dims;
    let layout = WorkspaceLayout::new(config, &dims);
    let required = layout.total_elements(&dims);
    let workspace = match workspace {
        _ if layout.is_empty() => None,
        Some(ws) if ws.len() >= required => Some(&mut ws[..required]),
        _ => {
            return Err(BackwardError::WorkspaceMissing {
                required: layout.total_bytes(&dims),
            })
        }
    };

    tracing::debug!(
        arch = %config.arch,
        precision = ?config.precision,
        block_i = config.block_i,
        block_j = config.block_j,
        output_in_rf = config.output_in_rf,
        causal = variant.causal,
        dropout = variant.dropout,
        blocks = dims.num_blocks(),
        query_tiles = config.num_query_tiles(dims.num_queries),
        key_tiles = config.num_key_tiles(dims.num_keys),
        shared_bytes = config.shared_memory_bytes(variant.dropout),
        workspace_bytes = layout.total_bytes(&dims),
        "launching attention backward"
    );

    let run = |block_id: usize, slab: &mut [f32]| {
        let ctx = BlockContext::advance_to_block(params, block_id / dims.heads, block_id % dims.heads);
        let grads = run_block(variant, params, &ctx, inputs, host_delta, &layout, slab);
        (ctx, grads)
    };

    let blocks: Vec<(BlockContext, BlockGradients<T>)> = match workspace {
        Some(ws) => ws
            .par_chunks_mut(layout.stride_bh)
            .enumerate()
            .map(|(block_id, slab)| run(block_id, slab))
            .collect(),
        None => (0..dims.num_blocks())
            .into_par_iter()
            .map(|block_id| run(block_id, &mut []))
            .collect(),
    };

    scatter(params, &blocks, outputs);
    Ok(())
}

fn scatter<T: KernelElement>(
    params: &BackwardParams,
    blocks: &[(BlockContext, BlockGradients<T>)],
    outputs: &mut KernelOutputs<'_, T>,
) {
    let dims = params.dims;
    for (ctx, grads) in blocks {
        let (b, h) = (ctx.batch, ctx.head);
        copy_rows(outputs.grad_query, &params.grad_query, b, h, &grads.grad_query, dims.head_dim);
        copy_rows(outputs.grad_key, &params.grad_key, b, h, &grads.grad_key, dims.head_dim);
        copy_rows(
            outputs.grad_value,
            &params.grad_value,
            b,
            h,
            &grads.grad_value,
            dims.head_dim_value,
        );
    }

    let (Some(dest), Some(layout)) = (outputs.grad_bias.as_deref_mut(), params.grad_bias) else {
        return;
    };
    let zero = T::from_accum(0.0);
    for (ctx, _) in blocks {
        let base = layout.slice_base(ctx.batch, ctx.head);
        for r in 0..dims.num_queries {
            let start = base + r * layout.row;
            dest[start..start + dims.num_keys].fill(zero);
        }
    }
    for (ctx, grads) in blocks {
        if let Some(src) = &grads.grad_bias {
            add_rows(dest, &layout, ctx.batch, ctx.head, src, dims.num_keys);
        }
    }
}

fn copy_rows<T: KernelElement>(
    dest: &mut [T],
    layout: &TensorLayout,
    batch: usize,
    head: usize,
    src: &[T],
    cols: usize,
) {
    if cols == 0 {
        return;
    }
    let base = layout.slice_base(batch, head);
    for (r, row) in src.chunks_exact(cols).enumerate() {
        let start = base + r * layout.row;
        dest[start..start + cols].copy_from_slice(row);
    }
}

fn add_rows<T: KernelElement>(
    dest: &mut [T],
    layout: &TensorLayout,
    batch: usize,
    head: usize,
    src: &[T],
    cols: usize,
) {
    if cols == 0 {
        return;
    }
    let base = layout.slice_base(batch, head);
    for (r, row) in src.chunks_exact(cols).enumerate() {
        let start = base + r * layout.row;
        for (d, s) in dest[start..start + cols].iter_mut().zip(row) {
            *d = T::from_accum(d.to_accum() + s.to_accum());
        }
    }
}

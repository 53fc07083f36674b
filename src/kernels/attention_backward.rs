// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Candle entry point for the blocked attention backward pass.
//!
//! [`attention_backward`] takes the forward inputs, forward output,
//! log-normalizer and output gradient as candle tensors, validates them,
//! picks a kernel variant for the target architecture, runs the kernel on the
//! host and returns the gradients as tensors.
//!
//! ## Layouts
//!
//! - query `[batch, Mq, heads, K]`, key `[batch, Mk, heads, K]`
//! - value `[batch, Mk, heads, Kv]`, output and output gradient `[batch, Mq, heads, Kv]`
//! - bias and bias gradient `[batch, heads, Mq, Mk]`
//! - log-normalizer `[batch, heads, L]`, `L >= Mq`, f32

use candle_core::{DType, Tensor, D};
use half::{bf16, f16};

use super::backward::{
    dispatch, launch, Arch, BackwardParams, DispatchKey, KernelElement, KernelInputs,
    KernelOutputs, PhiloxState, ProblemDims, WorkspaceLayout,
};
use super::interop::{host_to_tensor, precision_of, tensor_to_host};
use crate::error::{BackwardError, Result};

/// Launch options.
///
/// # Example
///
/// ```rust
/// use sdpa_backward::kernels::{Arch, BackwardOptions};
///
/// let options = BackwardOptions::default()
///     .with_arch(Arch::Sm75)
///     .with_causal()
///     .with_dropout(0.1, 42, 0);
/// assert!(options.causal);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackwardOptions {
    /// Target architecture; selects tile shapes and validates the variant.
    pub arch: Arch,
    /// Mask keys after the query position.
    pub causal: bool,
    /// Dropout probability used in the forward pass, `[0, 1)`.
    pub dropout_prob: f32,
    /// Dropout generator seed.
    pub seed: u64,
    /// Dropout stream offset.
    pub offset: u64,
    /// Softmax scale; `1 / sqrt(K)` when unset.
    pub scale: Option<f64>,
    /// Also return the bias gradient (requires a bias).
    pub compute_bias_grad: bool,
}

impl Default for BackwardOptions {
    fn default() -> Self {
        Self {
            arch: Arch::Sm80,
            causal: false,
            dropout_prob: 0.0,
            seed: 0,
            offset: 0,
            scale: None,
            compute_bias_grad: false,
        }
    }
}

impl BackwardOptions {
    /// Target a specific architecture.
    #[must_use]
    pub const fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    /// Enable causal masking.
    #[must_use]
    pub const fn with_causal(mut self) -> Self {
        self.causal = true;
        self
    }

    /// Replay the forward pass's dropout.
    #[must_use]
    pub const fn with_dropout(mut self, dropout_prob: f32, seed: u64, offset: u64) -> Self {
        self.dropout_prob = dropout_prob;
        self.seed = seed;
        self.offset = offset;
        self
    }

    /// Override the softmax scale.
    #[must_use]
    pub const fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Request the bias gradient.
    #[must_use]
    pub const fn with_bias_grad(mut self) -> Self {
        self.compute_bias_grad = true;
        self
    }
}

/// Tensors consumed by the backward pass.
#[derive(Debug, Clone, Copy)]
pub struct BackwardInputs<'a> {
    /// Query `[B, Mq, H, K]`.
    pub query: &'a Tensor,
    /// Key `[B, Mk, H, K]`.
    pub key: &'a Tensor,
    /// Value `[B, Mk, H, Kv]`.
    pub value: &'a Tensor,
    /// Optional additive bias `[B, H, Mq, Mk]`.
    pub bias: Option<&'a Tensor>,
    /// Forward output `[B, Mq, H, Kv]`.
    pub output: &'a Tensor,
    /// Output gradient `[B, Mq, H, Kv]`.
    pub grad_output: &'a Tensor,
    /// Log-normalizer `[B, H, L]` with `L >= Mq`, f32.
    pub logsumexp: &'a Tensor,
}

/// Gradients returned by [`attention_backward`], in the input layouts.
#[derive(Debug, Clone)]
pub struct Gradients {
    /// `[B, Mq, H, K]`.
    pub grad_query: Tensor,
    /// `[B, Mk, H, K]`.
    pub grad_key: Tensor,
    /// `[B, Mk, H, Kv]`.
    pub grad_value: Tensor,
    /// `[B, H, Mq, Mk]`, when requested.
    pub grad_bias: Option<Tensor>,
}

fn expect_dims(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        tracing::debug!("{name} shape {:?} does not match {:?}", tensor.dims(), expected);
        Err(BackwardError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: tensor.dims().to_vec(),
        })
    }
}

/// Check shapes and dtypes and derive the problem dimensions.
///
/// # Errors
/// - `InvalidConfig` if a tensor is not rank 4 (rank 3 for the log-normalizer)
/// - `ShapeMismatch` if shapes disagree
/// - `UnsupportedDType` if dtypes differ or are not f32/f16/bf16
pub fn validate_backward_inputs(
    inputs: &BackwardInputs<'_>,
    options: &BackwardOptions,
) -> Result<ProblemDims> {
    let q_shape = inputs.query.dims();
    let k_shape = inputs.key.dims();
    let v_shape = inputs.value.dims();
    if q_shape.len() != 4 || k_shape.len() != 4 || v_shape.len() != 4 {
        return Err(BackwardError::InvalidConfig(format!(
            "Expected 4D tensors, got Q: {q_shape:?}, K: {k_shape:?}, V: {v_shape:?}"
        )));
    }

    let (batch, num_queries, heads, head_dim) = inputs.query.dims4()?;
    let num_keys = k_shape[1];
    let head_dim_value = v_shape[3];

    expect_dims("key", inputs.key, &[batch, num_keys, heads, head_dim])?;
    expect_dims("value", inputs.value, &[batch, num_keys, heads, head_dim_value])?;
    expect_dims("output", inputs.output, &[batch, num_queries, heads, head_dim_value])?;
    expect_dims(
        "grad_output",
        inputs.grad_output,
        &[batch, num_queries, heads, head_dim_value],
    )?;
    if let Some(bias) = inputs.bias {
        expect_dims("bias", bias, &[batch, heads, num_queries, num_keys])?;
    }

    let lse_dims = inputs.logsumexp.dims();
    if lse_dims.len() != 3
        || lse_dims[0] != batch
        || lse_dims[1] != heads
        || lse_dims[2] < num_queries
    {
        return Err(BackwardError::ShapeMismatch {
            expected: vec![batch, heads, num_queries],
            actual: lse_dims.to_vec(),
        });
    }
    if inputs.logsumexp.dtype() != DType::F32 {
        return Err(BackwardError::UnsupportedDType(format!(
            "logsumexp must be f32, got {:?}",
            inputs.logsumexp.dtype()
        )));
    }

    let dtype = inputs.query.dtype();
    precision_of(dtype)?;
    let tensors = [
        inputs.key,
        inputs.value,
        inputs.output,
        inputs.grad_output,
    ];
    if let Some(other) = tensors
        .iter()
        .copied()
        .chain(inputs.bias)
        .find(|t| t.dtype() != dtype)
    {
        return Err(BackwardError::UnsupportedDType(format!(
            "mixed dtypes: query is {dtype:?}, found {:?}",
            other.dtype()
        )));
    }

    if options.compute_bias_grad && inputs.bias.is_none() {
        return Err(BackwardError::InvalidConfig(
            "bias gradient requested without a bias".to_string(),
        ));
    }

    Ok(ProblemDims {
        batch,
        heads,
        num_queries,
        num_keys,
        head_dim,
        head_dim_value,
    })
}

/// Attention backward pass.
///
/// # Errors
/// Returns the validation errors of [`validate_backward_inputs`], plus
/// `ArchitectureMismatch` when the architecture has no kernel for the dtype
/// and `Precondition` when a launch requirement is violated.
///
/// # Example
/// ```rust,ignore
/// use sdpa_backward::kernels::{attention_backward, BackwardInputs, BackwardOptions};
///
/// let grads = attention_backward(&inputs, &BackwardOptions::default().with_causal())?;
/// ```
pub fn attention_backward(inputs: &BackwardInputs<'_>, options: &BackwardOptions) -> Result<Gradients> {
    let dims = validate_backward_inputs(inputs, options)?;
    tracing::debug!(
        "Attention backward: batch={}, heads={}, q={}, k={}, dim={}/{}, dtype={:?}",
        dims.batch,
        dims.heads,
        dims.num_queries,
        dims.num_keys,
        dims.head_dim,
        dims.head_dim_value,
        inputs.query.dtype()
    );

    match inputs.query.dtype() {
        DType::F32 => backward_typed::<f32>(inputs, options, dims),
        DType::F16 => backward_typed::<f16>(inputs, options, dims),
        DType::BF16 => backward_typed::<bf16>(inputs, options, dims),
        other => Err(BackwardError::UnsupportedDType(format!("{other:?}"))),
    }
}

fn backward_typed<T: KernelElement>(
    inputs: &BackwardInputs<'_>,
    options: &BackwardOptions,
    dims: ProblemDims,
) -> Result<Gradients> {
    #[allow(clippy::cast_precision_loss)]
    let scale = options
        .scale
        .unwrap_or_else(|| 1.0 / (dims.head_dim.max(1) as f64).sqrt());
    #[allow(clippy::cast_possible_truncation)]
    let scale = scale as f32;

    let variant = dispatch(
        options.arch,
        DispatchKey {
            precision: T::PRECISION,
            causal: options.causal,
            dropout: options.dropout_prob > 0.0,
            max_head_dim: dims.max_head_dim(),
        },
    )?;

    let mut params = BackwardParams::contiguous(dims, scale, inputs.bias.is_some())
        .with_causal(options.causal)
        .with_dropout(
            options.dropout_prob,
            PhiloxState::new(options.seed, options.offset),
        );
    if !options.compute_bias_grad {
        params.grad_bias = None;
    }

    let query = tensor_to_host::<T>(inputs.query)?;
    let key = tensor_to_host::<T>(inputs.key)?;
    let value = tensor_to_host::<T>(inputs.value)?;
    let bias = inputs.bias.map(tensor_to_host::<T>).transpose()?;
    let output = tensor_to_host::<T>(inputs.output)?;
    let grad_output = tensor_to_host::<T>(inputs.grad_output)?;
    let logsumexp = pack_logsumexp(inputs.logsumexp, &dims, params.lse_stride_m)?;

    let delta = if variant.config.kernel_computes_delta {
        None
    } else {
        tracing::debug!("{} variant takes its row delta from the host", variant.config.arch);
        Some(host_delta(inputs.output, inputs.grad_output)?)
    };

    let layout = WorkspaceLayout::new(&variant.config, &dims);
    let mut workspace = vec![0.0f32; layout.total_elements(&dims)];

    let zero = T::from_accum(0.0);
    let mut grad_query = vec![zero; query.len()];
    let mut grad_key = vec![zero; key.len()];
    let mut grad_value = vec![zero; value.len()];
    let mut grad_bias = params
        .grad_bias
        .map(|_| vec![zero; dims.num_blocks() * dims.num_queries * dims.num_keys]);

    let kernel_inputs = KernelInputs {
        query: &query,
        key: &key,
        value: &value,
        bias: bias.as_deref(),
        output: &output,
        grad_output: &grad_output,
        logsumexp: &logsumexp,
    };
    let mut outputs = KernelOutputs {
        grad_query: &mut grad_query,
        grad_key: &mut grad_key,
        grad_value: &mut grad_value,
        grad_bias: grad_bias.as_deref_mut(),
    };
    let workspace = (!workspace.is_empty()).then_some(workspace.as_mut_slice());
    launch(
        &variant,
        options.arch,
        &params,
        &kernel_inputs,
        delta.as_deref(),
        workspace,
        &mut outputs,
    )?;

    let device = inputs.query.device();
    let ProblemDims {
        batch: b,
        heads: h,
        num_queries: mq,
        num_keys: mk,
        head_dim: k,
        head_dim_value: kv,
    } = dims;
    Ok(Gradients {
        grad_query: host_to_tensor(grad_query, (b, mq, h, k), device)?,
        grad_key: host_to_tensor(grad_key, (b, mk, h, k), device)?,
        grad_value: host_to_tensor(grad_value, (b, mk, h, kv), device)?,
        grad_bias: grad_bias
            .map(|g| host_to_tensor(g, (b, h, mq, mk), device))
            .transpose()?,
    })
}

/// Copy the log-normalizer into a `[B, H, stride]` f32 buffer.
fn pack_logsumexp(lse: &Tensor, dims: &ProblemDims, stride: usize) -> Result<Vec<f32>> {
    let rows = lse.narrow(D::Minus1, 0, dims.num_queries)?;
    let rows = tensor_to_host::<f32>(&rows)?;
    let mut packed = vec![0.0f32; dims.num_blocks() * stride];
    if dims.num_queries > 0 {
        for (dst, src) in packed
            .chunks_exact_mut(stride)
            .zip(rows.chunks_exact(dims.num_queries))
        {
            dst[..dims.num_queries].copy_from_slice(src);
        }
    }
    Ok(packed)
}

/// `D[b, h, i] = sum_c O[b, i, h, c] * dO[b, i, h, c]`, as `[B, H, Mq]` f32.
fn host_delta(output: &Tensor, grad_output: &Tensor) -> Result<Vec<f32>> {
    let product = (output.to_dtype(DType::F32)? * grad_output.to_dtype(DType::F32)?)?;
    let delta = product.sum(D::Minus1)?.transpose(1, 2)?;
    tensor_to_host::<f32>(&delta)
}

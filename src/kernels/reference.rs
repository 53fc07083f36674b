// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Dense, unblocked attention forward and backward built from candle ops.
//!
//! Everything here materializes the full `[B, H, Mq, Mk]` score matrix, so it
//! is only suitable for validation. Inputs use the same BMHK layout as the
//! kernel; all computation and results are f32.

use candle_core::{DType, Device, Tensor, D};

use super::backward::rng::{dropout_mask, PhiloxState};
use crate::error::Result;

/// Dense gradients, BMHK (bias gradient BHMK), f32.
#[derive(Debug, Clone)]
pub struct DenseGradients {
    /// `[B, Mq, H, K]`.
    pub grad_query: Tensor,
    /// `[B, Mk, H, K]`.
    pub grad_key: Tensor,
    /// `[B, Mk, H, Kv]`.
    pub grad_value: Tensor,
    /// `[B, H, Mq, Mk]`.
    pub grad_bias: Tensor,
}

/// Inputs shared by the dense forward and backward.
#[derive(Debug, Clone, Copy)]
pub struct DenseProblem<'a> {
    /// `[B, Mq, H, K]`.
    pub query: &'a Tensor,
    /// `[B, Mk, H, K]`.
    pub key: &'a Tensor,
    /// `[B, Mk, H, Kv]`.
    pub value: &'a Tensor,
    /// `[B, H, Mq, Mk]`.
    pub bias: Option<&'a Tensor>,
    /// Softmax scale.
    pub scale: f64,
    /// Causal masking.
    pub causal: bool,
    /// Dropout keep/scale matrix `[B, H, Mq, Mk]`.
    pub dropout_mask: Option<&'a Tensor>,
}

fn to_bhmk(t: &Tensor) -> Result<Tensor> {
    Ok(t.to_dtype(DType::F32)?.transpose(1, 2)?.contiguous()?)
}

fn to_bmhk(t: &Tensor) -> Result<Tensor> {
    Ok(t.transpose(1, 2)?.contiguous()?)
}

fn causal_mask(num_queries: usize, num_keys: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..num_queries)
        .flat_map(|q| (0..num_keys).map(move |k| if k > q { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (num_queries, num_keys), device)?)
}

impl DenseProblem<'_> {
    /// Scaled, biased, masked scores `[B, H, Mq, Mk]`.
    fn scores(&self, q: &Tensor, k: &Tensor) -> Result<Tensor> {
        let mut scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        if let Some(bias) = self.bias {
            scores = scores.broadcast_add(&bias.to_dtype(DType::F32)?)?;
        }
        if self.causal {
            let (_, _, mq, mk) = scores.dims4()?;
            scores = scores.broadcast_add(&causal_mask(mq, mk, scores.device())?)?;
        }
        Ok(scores)
    }

    fn apply_dropout(&self, probs: &Tensor) -> Result<Tensor> {
        Ok(match self.dropout_mask {
            Some(mask) => (probs * mask.to_dtype(DType::F32)?)?,
            None => probs.clone(),
        })
    }

    /// Forward output `[B, Mq, H, Kv]` and log-normalizer `[B, H, Mq]`.
    ///
    /// # Errors
    /// Returns error on shape mismatch between the inputs.
    pub fn forward(&self) -> Result<(Tensor, Tensor)> {
        let (q, k, v) = (to_bhmk(self.query)?, to_bhmk(self.key)?, to_bhmk(self.value)?);
        let scores = self.scores(&q, &k)?;

        let max = scores.max_keepdim(D::Minus1)?;
        let sum = scores.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?;
        let lse = (max + sum.log()?)?.squeeze(D::Minus1)?;

        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let output = self.apply_dropout(&probs)?.matmul(&v)?;
        Ok((to_bmhk(&output)?, lse))
    }

    /// Full-matrix gradients for output gradient `grad_output` `[B, Mq, H, Kv]`.
    ///
    /// # Errors
    /// Returns error on shape mismatch between the inputs.
    pub fn backward(&self, grad_output: &Tensor) -> Result<DenseGradients> {
        let (q, k, v) = (to_bhmk(self.query)?, to_bhmk(self.key)?, to_bhmk(self.value)?);
        let dout = to_bhmk(grad_output)?;
        let probs = candle_nn::ops::softmax_last_dim(&self.scores(&q, &k)?)?;

        let dropped = self.apply_dropout(&probs)?;
        let grad_value = dropped.transpose(2, 3)?.contiguous()?.matmul(&dout)?;

        let grad_probs = self.apply_dropout(&dout.matmul(&v.transpose(2, 3)?.contiguous()?)?)?;
        let delta = (&grad_probs * &probs)?.sum_keepdim(D::Minus1)?;
        let grad_bias = (&probs * grad_probs.broadcast_sub(&delta)?)?;
        let grad_scores = (&grad_bias * self.scale)?;

        let grad_query = grad_scores.matmul(&k)?;
        let grad_key = grad_scores.transpose(2, 3)?.contiguous()?.matmul(&q)?;

        Ok(DenseGradients {
            grad_query: to_bmhk(&grad_query)?,
            grad_key: to_bmhk(&grad_key)?,
            grad_value: to_bmhk(&grad_value)?,
            grad_bias,
        })
    }
}

/// The dropout keep/scale matrix a kernel launch with `state` regenerates.
///
/// # Errors
/// Returns error if tensor creation fails.
pub fn dropout_mask_tensor(
    state: PhiloxState,
    dims: (usize, usize, usize, usize),
    dropout_prob: f32,
    device: &Device,
) -> Result<Tensor> {
    let mask = dropout_mask(state, dims, dropout_prob);
    Ok(Tensor::from_vec(mask, dims, device)?)
}

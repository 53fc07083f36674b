// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Attention backward example.
//!
//! This example shows how to:
//! - Run a dense forward pass to get the output and log-normalizer
//! - Compute dQ, dK, dV with the blocked backward kernel
//! - Compare the result with the dense reference gradients
//!
//! Run with: `RUST_LOG=sdpa_backward=debug cargo run --example backward_demo`

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use sdpa_backward::kernels::{
    attention_backward, Arch, BackwardInputs, BackwardOptions, DenseProblem,
};
use tracing_subscriber::EnvFilter;

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff = (a.to_dtype(DType::F32)? - b.to_dtype(DType::F32)?)?;
    Ok(diff.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Attention Backward Example ===\n");

    let device = Device::Cpu;
    let (batch, seq_len, heads, head_dim) = (2, 256, 4, 64);
    let scale = 1.0 / (head_dim as f64).sqrt();

    let query = Tensor::randn(0.0f32, 1.0, (batch, seq_len, heads, head_dim), &device)?;
    let key = Tensor::randn(0.0f32, 1.0, (batch, seq_len, heads, head_dim), &device)?;
    let value = Tensor::randn(0.0f32, 1.0, (batch, seq_len, heads, head_dim), &device)?;
    let grad_output = Tensor::randn(0.0f32, 1.0, (batch, seq_len, heads, head_dim), &device)?;

    println!("Input shapes:");
    println!("  Q:  {:?}", query.shape());
    println!("  K:  {:?}", key.shape());
    println!("  V:  {:?}", value.shape());
    println!("  dO: {:?}", grad_output.shape());

    let dense = DenseProblem {
        query: &query,
        key: &key,
        value: &value,
        bias: None,
        scale,
        causal: true,
        dropout_mask: None,
    };
    let (output, logsumexp) = dense.forward()?;
    println!("\nForward output: {:?}, log-normalizer: {:?}", output.shape(), logsumexp.shape());

    for (label, dtype, arch) in [
        ("f32 on sm80", DType::F32, Arch::Sm80),
        ("f16 on sm80", DType::F16, Arch::Sm80),
        ("f16 on sm70", DType::F16, Arch::Sm70),
    ] {
        let cast = |t: &Tensor| t.to_dtype(dtype);
        let (q, k, v, o, d_o) = (
            cast(&query)?,
            cast(&key)?,
            cast(&value)?,
            cast(&output)?,
            cast(&grad_output)?,
        );
        let inputs = BackwardInputs {
            query: &q,
            key: &k,
            value: &v,
            bias: None,
            output: &o,
            grad_output: &d_o,
            logsumexp: &logsumexp,
        };
        let options = BackwardOptions::default().with_arch(arch).with_causal();

        let start = std::time::Instant::now();
        let grads = attention_backward(&inputs, &options)?;
        let elapsed = start.elapsed();

        let reference = dense.backward(&grad_output)?;
        println!("\n{label} ({elapsed:.2?}):");
        println!(
            "  max |dQ - ref| = {:.2e}",
            max_abs_diff(&grads.grad_query, &reference.grad_query)?
        );
        println!(
            "  max |dK - ref| = {:.2e}",
            max_abs_diff(&grads.grad_key, &reference.grad_key)?
        );
        println!(
            "  max |dV - ref| = {:.2e}",
            max_abs_diff(&grads.grad_value, &reference.grad_value)?
        );
    }

    println!("\n=== Example Complete ===");
    Ok(())
}

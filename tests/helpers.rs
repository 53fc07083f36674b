//! Test utilities and fixtures for attention backward integration tests.
//!
//! This module provides deterministic input generation, a forward-pass
//! fixture built on the dense reference, and tolerance checks.

#![allow(dead_code)]

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use sdpa_backward::kernels::{BackwardInputs, DenseProblem};

/// Deterministic values in `[-1, 1)` (splitmix64).
pub fn seeded_values(len: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    (0..len)
        .map(|_| {
            state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^= z >> 31;
            ((z >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}

/// Deterministic f32 tensor of `shape`.
pub fn seeded_tensor(shape: &[usize], seed: u64, device: &Device) -> Result<Tensor> {
    let len = shape.iter().product();
    Ok(Tensor::from_vec(seeded_values(len, seed), shape, device)?)
}

/// Problem shape and switches for a [`Fixture`].
#[derive(Debug, Clone)]
pub struct ProblemSpec {
    /// Batch count.
    pub batch: usize,
    /// Head count.
    pub heads: usize,
    /// Query length.
    pub num_queries: usize,
    /// Key length.
    pub num_keys: usize,
    /// Query/key head dim.
    pub head_dim: usize,
    /// Value head dim.
    pub head_dim_value: usize,
    /// Causal masking.
    pub causal: bool,
    /// Add a bias tensor.
    pub with_bias: bool,
    /// Storage dtype.
    pub dtype: DType,
    /// Input seed.
    pub seed: u64,
}

impl Default for ProblemSpec {
    fn default() -> Self {
        Self {
            batch: 1,
            heads: 1,
            num_queries: 4,
            num_keys: 4,
            head_dim: 8,
            head_dim_value: 8,
            causal: false,
            with_bias: false,
            dtype: DType::F32,
            seed: 42,
        }
    }
}

impl ProblemSpec {
    /// Default softmax scale.
    pub fn scale(&self) -> f64 {
        1.0 / (self.head_dim as f64).sqrt()
    }
}

/// Inputs plus the forward output and log-normalizer they produce.
pub struct Fixture {
    /// Shape and switches.
    pub spec: ProblemSpec,
    /// `[B, Mq, H, K]`.
    pub query: Tensor,
    /// `[B, Mk, H, K]`.
    pub key: Tensor,
    /// `[B, Mk, H, Kv]`.
    pub value: Tensor,
    /// `[B, H, Mq, Mk]`.
    pub bias: Option<Tensor>,
    /// `[B, Mq, H, Kv]`, storage dtype.
    pub output: Tensor,
    /// `[B, Mq, H, Kv]`.
    pub grad_output: Tensor,
    /// `[B, H, Mq]`, f32.
    pub logsumexp: Tensor,
    /// Dropout keep/scale matrix used for the forward pass.
    pub dropout_mask: Option<Tensor>,
}

impl Fixture {
    /// Build inputs and run the dense forward pass.
    pub fn new(spec: ProblemSpec) -> Result<Self> {
        Self::with_dropout(spec, None)
    }

    /// Build inputs and run the dense forward pass with a dropout mask.
    pub fn with_dropout(spec: ProblemSpec, dropout_mask: Option<Tensor>) -> Result<Self> {
        let device = Device::Cpu;
        let (b, h, mq, mk) = (spec.batch, spec.heads, spec.num_queries, spec.num_keys);
        let (k, kv) = (spec.head_dim, spec.head_dim_value);
        let cast = |t: Tensor| -> Result<Tensor> { Ok(t.to_dtype(spec.dtype)?) };

        let query = cast(seeded_tensor(&[b, mq, h, k], spec.seed, &device)?)?;
        let key = cast(seeded_tensor(&[b, mk, h, k], spec.seed + 1, &device)?)?;
        let value = cast(seeded_tensor(&[b, mk, h, kv], spec.seed + 2, &device)?)?;
        let grad_output = cast(seeded_tensor(&[b, mq, h, kv], spec.seed + 3, &device)?)?;
        let bias = if spec.with_bias {
            Some(cast((seeded_tensor(&[b, h, mq, mk], spec.seed + 4, &device)? * 0.5)?)?)
        } else {
            None
        };

        let (output, logsumexp) = DenseProblem {
            query: &query,
            key: &key,
            value: &value,
            bias: bias.as_ref(),
            scale: spec.scale(),
            causal: spec.causal,
            dropout_mask: dropout_mask.as_ref(),
        }
        .forward()?;

        Ok(Self {
            output: cast(output)?,
            spec,
            query,
            key,
            value,
            bias,
            grad_output,
            logsumexp,
            dropout_mask,
        })
    }

    /// Kernel inputs borrowing this fixture.
    pub fn inputs(&self) -> BackwardInputs<'_> {
        BackwardInputs {
            query: &self.query,
            key: &self.key,
            value: &self.value,
            bias: self.bias.as_ref(),
            output: &self.output,
            grad_output: &self.grad_output,
            logsumexp: &self.logsumexp,
        }
    }

    /// Dense reference over the same (storage-precision) inputs.
    pub fn dense(&self) -> DenseProblem<'_> {
        DenseProblem {
            query: &self.query,
            key: &self.key,
            value: &self.value,
            bias: self.bias.as_ref(),
            scale: self.spec.scale(),
            causal: self.spec.causal,
            dropout_mask: self.dropout_mask.as_ref(),
        }
    }
}

/// Accuracy metrics for numerical validation.
#[derive(Debug, Clone)]
pub struct AccuracyMetrics {
    /// Mean absolute error.
    pub mae: f32,
    /// Maximum absolute error.
    pub max_error: f32,
    /// Largest absolute value of the expected tensor.
    pub max_expected: f32,
    /// Cosine similarity between tensors.
    pub cosine_similarity: f32,
}

impl AccuracyMetrics {
    /// Compare two tensors of equal shape (any float dtype).
    pub fn compare(actual: &Tensor, expected: &Tensor) -> Result<Self> {
        ensure!(
            actual.dims() == expected.dims(),
            "shape {:?} vs {:?}",
            actual.dims(),
            expected.dims()
        );
        let a: Vec<f32> = actual.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let e: Vec<f32> = expected.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

        let n = a.len().max(1) as f32;
        let mut sum_abs = 0.0f32;
        let mut max_error = 0.0f32;
        let mut max_expected = 0.0f32;
        let (mut dot, mut na, mut ne) = (0.0f64, 0.0f64, 0.0f64);
        for (&x, &y) in a.iter().zip(&e) {
            let err = (x - y).abs();
            sum_abs += err;
            max_error = max_error.max(err);
            max_expected = max_expected.max(y.abs());
            dot += f64::from(x) * f64::from(y);
            na += f64::from(x) * f64::from(x);
            ne += f64::from(y) * f64::from(y);
        }
        let cosine_similarity = if na == 0.0 || ne == 0.0 {
            if na == ne {
                1.0
            } else {
                0.0
            }
        } else {
            (dot / (na.sqrt() * ne.sqrt())) as f32
        };

        Ok(Self {
            mae: sum_abs / n,
            max_error,
            max_expected,
            cosine_similarity,
        })
    }

    /// Maximum error relative to the largest expected magnitude.
    pub fn relative_error(&self) -> f32 {
        self.max_error / self.max_expected.max(f32::MIN_POSITIVE)
    }
}

/// Fail unless `actual` is within `rel` (relative to the largest expected
/// magnitude) of `expected`.
pub fn assert_close(name: &str, actual: &Tensor, expected: &Tensor, rel: f32) -> Result<()> {
    let metrics = AccuracyMetrics::compare(actual, expected)?;
    ensure!(
        metrics.relative_error() <= rel,
        "{name}: relative error {} > {rel} ({metrics:?})",
        metrics.relative_error()
    );
    Ok(())
}

/// Elements of a tensor as f32.
pub fn to_f32_vec(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?)
}

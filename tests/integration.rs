//! Integration tests for the sdpa-backward attention gradient kernel.
//!
//! Every kernel configuration is checked against the dense candle reference
//! in `sdpa_backward::kernels::reference`, which materializes the full score
//! matrix.
//!
//! ## Test Coverage
//!
//! ### Numerical agreement
//! - Single-tile and multi-tile problems, f32/f16/bf16
//! - Every architecture family: sm50, sm70 (host delta), sm75, sm80
//! - Register-resident dK/dV, workspace spills for large head dims
//! - Causal masking, additive bias and the bias gradient
//! - Dropout replay against the regenerated mask
//!
//! ### Invariants
//! - Softmax rows make the key and bias gradients sum to zero
//! - Fully masked keys get exactly zero gradient
//! - Dropout at p = 0 is bit-identical to the non-dropout kernel
//!
//! ### Error handling
//! - Architecture, alignment and workspace violations
//!
//! ## Running the Tests
//!
//! ```bash
//! cargo test --test integration
//!
//! # With kernel logging
//! RUST_LOG=sdpa_backward=debug cargo test --test integration -- --nocapture
//! ```

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use half::f16;
use sdpa_backward::kernels::backward::{
    launch, BackwardParams, KernelElement, KernelInputs, KernelOutputs, PhiloxState, ProblemDims,
};
use sdpa_backward::kernels::reference::dropout_mask_tensor;
use sdpa_backward::kernels::{
    attention_backward, workspace_size, Arch, BackwardOptions, Gradients, KernelConfig,
    KernelVariant, MaxK, Precision,
};
use sdpa_backward::BackwardError;

mod helpers;

use helpers::{assert_close, to_f32_vec, AccuracyMetrics, Fixture, ProblemSpec};

/// Run the kernel and compare all gradients with the dense reference.
fn check_against_reference(
    spec: ProblemSpec,
    options: BackwardOptions,
    rel: f32,
) -> Result<Gradients> {
    let fixture = Fixture::new(spec)?;
    let grads = attention_backward(&fixture.inputs(), &options)?;
    let dense = fixture.dense().backward(&fixture.grad_output)?;

    assert_eq!(grads.grad_query.dtype(), fixture.spec.dtype);
    assert_close("grad_query", &grads.grad_query, &dense.grad_query, rel)?;
    assert_close("grad_key", &grads.grad_key, &dense.grad_key, rel)?;
    assert_close("grad_value", &grads.grad_value, &dense.grad_value, rel)?;
    if let Some(grad_bias) = &grads.grad_bias {
        assert_close("grad_bias", grad_bias, &dense.grad_bias, rel)?;
    }
    Ok(grads)
}

fn multi_tile(dtype: DType, head_dim: usize) -> ProblemSpec {
    ProblemSpec {
        batch: 2,
        heads: 2,
        num_queries: 150,
        num_keys: 100,
        head_dim,
        head_dim_value: head_dim,
        dtype,
        ..ProblemSpec::default()
    }
}

/// Host buffers for driving [`launch`] directly.
struct HostProblem<T> {
    params: BackwardParams,
    query: Vec<T>,
    key: Vec<T>,
    value: Vec<T>,
    output: Vec<T>,
    grad_output: Vec<T>,
    logsumexp: Vec<f32>,
}

impl<T: KernelElement> HostProblem<T> {
    /// `num_queries` must be a multiple of 8 so the lse needs no padding.
    fn new(fixture: &Fixture) -> Result<Self> {
        let s = &fixture.spec;
        assert_eq!(s.num_queries % 8, 0);
        let dims = ProblemDims {
            batch: s.batch,
            heads: s.heads,
            num_queries: s.num_queries,
            num_keys: s.num_keys,
            head_dim: s.head_dim,
            head_dim_value: s.head_dim_value,
        };
        #[allow(clippy::cast_possible_truncation)]
        let params = BackwardParams::contiguous(dims, s.scale() as f32, false);
        let host = |t: &Tensor| -> Result<Vec<T>> {
            Ok(t.flatten_all()?.to_vec1::<f32>()?.into_iter().map(T::from_accum).collect())
        };
        let f32_of = |t: &Tensor| -> Result<Tensor> { Ok(t.to_dtype(DType::F32)?) };
        Ok(Self {
            params,
            query: host(&f32_of(&fixture.query)?)?,
            key: host(&f32_of(&fixture.key)?)?,
            value: host(&f32_of(&fixture.value)?)?,
            output: host(&f32_of(&fixture.output)?)?,
            grad_output: host(&f32_of(&fixture.grad_output)?)?,
            logsumexp: fixture.logsumexp.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    fn inputs(&self) -> KernelInputs<'_, T> {
        KernelInputs {
            query: &self.query,
            key: &self.key,
            value: &self.value,
            bias: None,
            output: &self.output,
            grad_output: &self.grad_output,
            logsumexp: &self.logsumexp,
        }
    }

    fn run(
        &self,
        variant: &KernelVariant,
        params: &BackwardParams,
        workspace: Option<&mut [f32]>,
    ) -> sdpa_backward::Result<(Vec<T>, Vec<T>, Vec<T>)> {
        let zero = T::from_accum(0.0);
        let mut grad_query = vec![zero; self.query.len()];
        let mut grad_key = vec![zero; self.key.len()];
        let mut grad_value = vec![zero; self.value.len()];
        let mut outputs = KernelOutputs {
            grad_query: &mut grad_query,
            grad_key: &mut grad_key,
            grad_value: &mut grad_value,
            grad_bias: None,
        };
        launch(variant, variant.config.arch, params, &self.inputs(), None, workspace, &mut outputs)?;
        Ok((grad_query, grad_key, grad_value))
    }
}

// ============================================================================
// NUMERICAL AGREEMENT
// ============================================================================

#[test]
fn test_small_f32_matches_reference() -> Result<()> {
    check_against_reference(ProblemSpec::default(), BackwardOptions::default(), 1e-3)?;
    Ok(())
}

#[test]
fn test_multi_tile_f32_sm80() -> Result<()> {
    check_against_reference(multi_tile(DType::F32, 32), BackwardOptions::default(), 1e-3)?;
    Ok(())
}

#[test]
fn test_multi_tile_f32_sm50() -> Result<()> {
    let options = BackwardOptions::default().with_arch(Arch::Sm50);
    check_against_reference(multi_tile(DType::F32, 24), options, 1e-3)?;
    Ok(())
}

#[test]
fn test_f32_sm70_uses_host_delta() -> Result<()> {
    assert!(!KernelConfig::new(Arch::Sm70, Precision::F32, MaxK::K64).kernel_computes_delta);
    let options = BackwardOptions::default().with_arch(Arch::Sm70);
    check_against_reference(multi_tile(DType::F32, 16), options, 1e-3)?;
    Ok(())
}

#[test]
fn test_f16_sm80_register_resident_outputs() -> Result<()> {
    assert!(KernelConfig::new(Arch::Sm80, Precision::F16, MaxK::K64).output_in_rf);
    check_against_reference(multi_tile(DType::F16, 64), BackwardOptions::default(), 2e-2)?;
    Ok(())
}

#[test]
fn test_f16_sm80_k96() -> Result<()> {
    check_against_reference(multi_tile(DType::F16, 96), BackwardOptions::default(), 2e-2)?;
    Ok(())
}

#[test]
fn test_f16_sm75_large_head_dim_spills_to_workspace() -> Result<()> {
    let spec = ProblemSpec {
        batch: 1,
        heads: 2,
        num_queries: 150,
        num_keys: 100,
        head_dim: 160,
        head_dim_value: 136,
        dtype: DType::F16,
        ..ProblemSpec::default()
    };
    let config = KernelConfig::new(Arch::Sm75, Precision::F16, MaxK::Unbounded);
    assert!(config.needs_accum_grad_k && config.needs_accum_grad_v);
    let options = BackwardOptions::default().with_arch(Arch::Sm75);
    check_against_reference(spec, options, 2e-2)?;
    Ok(())
}

#[test]
fn test_f16_sm70_large_head_dim_uses_host_delta() -> Result<()> {
    assert!(!KernelConfig::new(Arch::Sm70, Precision::F16, MaxK::Unbounded).kernel_computes_delta);
    let spec = ProblemSpec {
        heads: 1,
        ..multi_tile(DType::F16, 144)
    };
    let options = BackwardOptions::default().with_arch(Arch::Sm70);
    check_against_reference(spec, options, 2e-2)?;
    Ok(())
}

#[test]
fn test_bf16_sm80() -> Result<()> {
    check_against_reference(multi_tile(DType::BF16, 64), BackwardOptions::default(), 8e-2)?;
    Ok(())
}

#[test]
fn test_causal_multi_tile() -> Result<()> {
    let spec = ProblemSpec {
        causal: true,
        ..multi_tile(DType::F32, 32)
    };
    check_against_reference(spec, BackwardOptions::default().with_causal(), 1e-3)?;
    Ok(())
}

#[test]
fn test_causal_f16() -> Result<()> {
    let spec = ProblemSpec {
        causal: true,
        num_queries: 200,
        num_keys: 200,
        ..multi_tile(DType::F16, 64)
    };
    check_against_reference(spec, BackwardOptions::default().with_causal(), 2e-2)?;
    Ok(())
}

#[test]
fn test_bias_and_bias_gradient() -> Result<()> {
    let spec = ProblemSpec {
        with_bias: true,
        ..multi_tile(DType::F32, 32)
    };
    let grads = check_against_reference(spec, BackwardOptions::default().with_bias_grad(), 1e-3)?;
    assert!(grads.grad_bias.is_some());
    Ok(())
}

#[test]
fn test_bias_without_bias_gradient() -> Result<()> {
    let spec = ProblemSpec {
        with_bias: true,
        causal: true,
        ..multi_tile(DType::F16, 64)
    };
    let grads = check_against_reference(spec, BackwardOptions::default().with_causal(), 2e-2)?;
    assert!(grads.grad_bias.is_none());
    Ok(())
}

#[test]
fn test_explicit_scale() -> Result<()> {
    // The default scale for a head dim of 16 is exactly 0.25.
    let fixture = Fixture::new(multi_tile(DType::F32, 16))?;
    let default = attention_backward(&fixture.inputs(), &BackwardOptions::default())?;
    let explicit = attention_backward(&fixture.inputs(), &BackwardOptions::default().with_scale(0.25))?;
    let metrics = AccuracyMetrics::compare(&explicit.grad_key, &default.grad_key)?;
    assert_eq!(metrics.max_error, 0.0);
    Ok(())
}

// ============================================================================
// DROPOUT
// ============================================================================

#[test]
fn test_dropout_matches_reference_mask() -> Result<()> {
    let spec = multi_tile(DType::F32, 32);
    let (p, seed, offset) = (0.2f32, 1234u64, 17u64);
    let mask = dropout_mask_tensor(
        PhiloxState::new(seed, offset),
        (spec.batch, spec.heads, spec.num_queries, spec.num_keys),
        p,
        &Device::Cpu,
    )?;

    let fixture = Fixture::with_dropout(spec, Some(mask))?;
    let grads = attention_backward(
        &fixture.inputs(),
        &BackwardOptions::default().with_dropout(p, seed, offset),
    )?;
    let dense = fixture.dense().backward(&fixture.grad_output)?;

    assert_close("grad_query", &grads.grad_query, &dense.grad_query, 1e-3)?;
    assert_close("grad_key", &grads.grad_key, &dense.grad_key, 1e-3)?;
    assert_close("grad_value", &grads.grad_value, &dense.grad_value, 1e-3)?;
    Ok(())
}

#[test]
fn test_dropout_f16_causal_matches_reference_mask() -> Result<()> {
    let spec = ProblemSpec {
        causal: true,
        ..multi_tile(DType::F16, 64)
    };
    let (p, seed, offset) = (0.1f32, 99u64, 0u64);
    let mask = dropout_mask_tensor(
        PhiloxState::new(seed, offset),
        (spec.batch, spec.heads, spec.num_queries, spec.num_keys),
        p,
        &Device::Cpu,
    )?;

    let fixture = Fixture::with_dropout(spec, Some(mask))?;
    let options = BackwardOptions::default()
        .with_causal()
        .with_dropout(p, seed, offset);
    let grads = attention_backward(&fixture.inputs(), &options)?;
    let dense = fixture.dense().backward(&fixture.grad_output)?;

    assert_close("grad_query", &grads.grad_query, &dense.grad_query, 2e-2)?;
    assert_close("grad_key", &grads.grad_key, &dense.grad_key, 2e-2)?;
    assert_close("grad_value", &grads.grad_value, &dense.grad_value, 2e-2)?;
    Ok(())
}

#[test]
fn test_dropout_is_deterministic_per_seed() -> Result<()> {
    let fixture = Fixture::new(multi_tile(DType::F32, 16))?;
    let run = |seed: u64| -> Result<Vec<f32>> {
        let options = BackwardOptions::default().with_dropout(0.3, seed, 0);
        to_f32_vec(&attention_backward(&fixture.inputs(), &options)?.grad_value)
    };

    let first = run(5)?;
    assert_eq!(first, run(5)?);
    assert_ne!(first, run(6)?);
    Ok(())
}

#[test]
fn test_dropout_variant_at_zero_probability_is_exact() -> Result<()> {
    let spec = ProblemSpec {
        num_queries: 72,
        num_keys: 90,
        head_dim: 16,
        head_dim_value: 16,
        ..ProblemSpec::default()
    };
    let fixture = Fixture::new(spec)?;
    let host = HostProblem::<f32>::new(&fixture)?;

    let plain = KernelVariant::new(Arch::Sm80, Precision::F32, MaxK::K64, false, false)?;
    let dropout = KernelVariant::new(Arch::Sm80, Precision::F32, MaxK::K64, false, true)?;
    let params = host
        .params
        .clone()
        .with_dropout(0.0, PhiloxState::new(77, 3));

    assert_eq!(host.run(&plain, &host.params, None)?, host.run(&dropout, &params, None)?);
    Ok(())
}

// ============================================================================
// INVARIANTS
// ============================================================================

#[test]
fn test_key_and_bias_gradients_sum_to_zero() -> Result<()> {
    // Each softmax row's score gradient sums to zero, so summing dK over keys
    // and the bias gradient over a row both vanish.
    let spec = ProblemSpec {
        with_bias: true,
        ..multi_tile(DType::F32, 32)
    };
    let fixture = Fixture::new(spec)?;
    let grads = attention_backward(&fixture.inputs(), &BackwardOptions::default().with_bias_grad())?;

    let key_sum = grads.grad_key.sum(1)?;
    let key_scale = grads.grad_key.abs()?.max_keepdim(1)?.squeeze(1)?;
    let key_ratio = to_f32_vec(&(key_sum.abs()? / (key_scale + 1e-6)?)?)?;
    assert!(key_ratio.iter().all(|&r| r < 1e-2), "{key_ratio:?}");

    let grad_bias = grads.grad_bias.as_ref().expect("bias gradient requested");
    let row_sums = to_f32_vec(&grad_bias.sum(D::Minus1)?)?;
    assert!(row_sums.iter().all(|&s| s.abs() < 1e-4));
    Ok(())
}

#[test]
fn test_causal_masked_keys_get_zero_gradient() -> Result<()> {
    let spec = ProblemSpec {
        causal: true,
        ..ProblemSpec::default()
    };
    let mut fixture = Fixture::new(spec)?;

    // Only query row 0 carries gradient; under causal masking it sees key 0 only.
    let mut grad_output = vec![0.0f32; 4 * 8];
    for (c, value) in grad_output.iter_mut().take(8).enumerate() {
        *value = 0.25 * (c as f32) - 0.5;
    }
    fixture.grad_output = Tensor::from_vec(grad_output, (1, 4, 1, 8), &Device::Cpu)?;

    let grads = attention_backward(&fixture.inputs(), &BackwardOptions::default().with_causal())?;
    let grad_key = grads.grad_key.squeeze(0)?.squeeze(1)?.to_vec2::<f32>()?;
    let grad_value = grads.grad_value.squeeze(0)?.squeeze(1)?.to_vec2::<f32>()?;
    for row in 1..4 {
        assert!(grad_key[row].iter().all(|&v| v == 0.0), "dK row {row}: {:?}", grad_key[row]);
        assert!(grad_value[row].iter().all(|&v| v == 0.0), "dV row {row}: {:?}", grad_value[row]);
    }

    let dense = fixture.dense().backward(&fixture.grad_output)?;
    assert_close("grad_query", &grads.grad_query, &dense.grad_query, 1e-3)?;
    Ok(())
}

#[test]
fn test_gradients_land_in_every_head() -> Result<()> {
    let spec = ProblemSpec {
        batch: 3,
        heads: 4,
        num_queries: 9,
        num_keys: 70,
        head_dim: 8,
        head_dim_value: 12,
        seed: 7,
        ..ProblemSpec::default()
    };
    let fixture = Fixture::new(spec)?;
    let grads = attention_backward(&fixture.inputs(), &BackwardOptions::default())?;
    let dense = fixture.dense().backward(&fixture.grad_output)?;

    for (b, h) in [(0, 0), (1, 2), (2, 3)] {
        let pick = |t: &Tensor| -> Result<Tensor> { Ok(t.narrow(0, b, 1)?.narrow(2, h, 1)?) };
        assert_close(
            "grad_value slice",
            &pick(&grads.grad_value)?,
            &pick(&dense.grad_value)?,
            1e-3,
        )?;
    }
    Ok(())
}

// ============================================================================
// WORKSPACE SIZING
// ============================================================================

#[test]
fn test_workspace_size_properties() {
    let dims = |num_keys: usize, head_dim: usize| ProblemDims {
        batch: 2,
        heads: 3,
        num_queries: 100,
        num_keys,
        head_dim,
        head_dim_value: head_dim,
    };

    // f32 accumulates straight into the outputs.
    let f32_config = KernelConfig::new(Arch::Sm80, Precision::F32, MaxK::Unbounded);
    assert_eq!(workspace_size(&f32_config, &dims(500, 200)), 0);

    // Register-resident dK/dV and a single key tile: dQ never spills.
    let rf = KernelConfig::new(Arch::Sm80, Precision::F16, MaxK::K64);
    assert_eq!(workspace_size(&rf, &dims(64, 64)), 0);
    let spilled = workspace_size(&rf, &dims(65, 64));
    assert!(spilled > 0);
    assert_eq!(spilled % (4 * 4 * 6), 0);

    let unbounded = KernelConfig::new(Arch::Sm80, Precision::F16, MaxK::Unbounded);
    assert!(workspace_size(&unbounded, &dims(65, 200)) > spilled);
    assert!(workspace_size(&unbounded, &dims(64, 200)) > 0);
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

#[test]
fn test_bf16_needs_sm80() -> Result<()> {
    let fixture = Fixture::new(ProblemSpec {
        dtype: DType::BF16,
        ..ProblemSpec::default()
    })?;
    let result = attention_backward(&fixture.inputs(), &BackwardOptions::default().with_arch(Arch::Sm75));
    assert!(matches!(
        result,
        Err(BackwardError::ArchitectureMismatch {
            required: 80,
            actual: 75
        })
    ));
    Ok(())
}

#[test]
fn test_misaligned_head_stride_is_rejected() -> Result<()> {
    // f16 on sm80 needs 8-element alignment; a head dim of 12 breaks it.
    let fixture = Fixture::new(ProblemSpec {
        head_dim: 12,
        head_dim_value: 12,
        dtype: DType::F16,
        ..ProblemSpec::default()
    })?;
    let result = attention_backward(&fixture.inputs(), &BackwardOptions::default());
    assert!(matches!(result, Err(BackwardError::Precondition(_))));

    // sm50 has no alignment requirement for f32.
    let fixture = Fixture::new(ProblemSpec {
        head_dim: 5,
        head_dim_value: 3,
        ..ProblemSpec::default()
    })?;
    attention_backward(&fixture.inputs(), &BackwardOptions::default().with_arch(Arch::Sm50))?;
    Ok(())
}

#[test]
fn test_missing_workspace_is_reported() -> Result<()> {
    let fixture = Fixture::new(ProblemSpec {
        num_queries: 16,
        num_keys: 130,
        head_dim: 64,
        head_dim_value: 64,
        dtype: DType::F16,
        ..ProblemSpec::default()
    })?;
    let host = HostProblem::<f16>::new(&fixture)?;
    let variant = KernelVariant::new(Arch::Sm80, Precision::F16, MaxK::K64, false, false)?;
    let required = workspace_size(&variant.config, &host.params.dims);
    assert!(required > 0);

    let result = host.run(&variant, &host.params, None);
    assert!(matches!(result, Err(BackwardError::WorkspaceMissing { required: r }) if r == required));

    let mut workspace = vec![f32::NAN; required / 4];
    host.run(&variant, &host.params, Some(&mut workspace))?;
    Ok(())
}

#[test]
fn test_dropout_probability_out_of_range() -> Result<()> {
    let fixture = Fixture::new(ProblemSpec::default())?;
    let result = attention_backward(
        &fixture.inputs(),
        &BackwardOptions::default().with_dropout(1.0, 0, 0),
    );
    assert!(matches!(result, Err(BackwardError::Precondition(_))));
    Ok(())
}

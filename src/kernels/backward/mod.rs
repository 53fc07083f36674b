// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Blocked attention backward kernel.
//!
//! Computes dQ, dK, dV (and optionally the bias gradient) of
//! `softmax(scale * Q K^T + B) V` from the forward output and log-normalizer,
//! without materializing the attention matrix.
//!
//! ## Structure
//!
//! - [`config`] - architecture/precision tile heuristics and the variant table
//! - [`params`] - problem descriptor, launch validation, per-block offsets
//! - [`schedule`] - key-tile / query-tile iteration and accumulation flags
//! - [`probs`] - probability recompute and dropout-mask regeneration
//! - [`grad_value`], [`grad_score`], [`grad_query`], [`grad_key`] - gradient stages
//! - [`epilogue`], [`workspace`] - output writes and f32 partial-sum spills
//! - [`kernel`] - one (batch, head) unit
//! - [`launch`] - validation, the parallel grid and the output scatter

pub mod config;
pub mod delta;
pub mod element;
pub mod epilogue;
pub mod gemm;
pub mod grad_key;
pub mod grad_query;
pub mod grad_score;
pub mod grad_value;
pub mod kernel;
pub mod launch;
pub mod params;
pub mod probs;
pub mod rng;
pub mod schedule;
pub mod workspace;

pub use config::{dispatch, Arch, DispatchKey, KernelConfig, KernelVariant, MaxK, Precision, VariantTable};
pub use element::KernelElement;
pub use kernel::{BlockGradients, KernelInputs};
pub use launch::{launch, KernelOutputs};
pub use params::{BackwardParams, BlockContext, BufferExtents, ProblemDims, TensorLayout, LSE_ALIGNMENT};
pub use rng::PhiloxState;
pub use workspace::{workspace_size, WorkspaceLayout};

//! # sdpa-backward
//!
//! Memory-efficient backward pass for scaled dot-product attention.
//!
//! Given `Q`, `K`, `V`, an optional additive bias, the forward output `O`,
//! the forward log-normalizer and the output gradient `dO`, this crate
//! computes `dQ`, `dK`, `dV` and optionally the bias gradient, without ever
//! materializing the full `[Mq, Mk]` attention matrix:
//!
//! - Tiled recompute of the attention probabilities from the log-normalizer
//! - Causal masking with whole-tile skipping
//! - Dropout replay from a counter-based generator (no stored mask)
//! - f32, f16 and bf16 storage with f32 accumulation
//! - Per-architecture tile heuristics and a closed table of kernel variants
//!
//! ## Status
//!
//! The kernel runs on the host CPU, one rayon task per (batch, head) slice.
//! Tile shapes, alignment rules and shared-storage budgets follow the GPU
//! architectures they are named after.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sdpa_backward::kernels::{attention_backward, BackwardInputs, BackwardOptions};
//!
//! let inputs = BackwardInputs {
//!     query: &q,
//!     key: &k,
//!     value: &v,
//!     bias: None,
//!     output: &out,
//!     grad_output: &grad_out,
//!     logsumexp: &lse,
//! };
//! let grads = attention_backward(&inputs, &BackwardOptions::default().with_causal())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod kernels;
pub mod memory;

pub use error::{BackwardError, Result};

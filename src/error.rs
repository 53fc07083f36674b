// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Error types for sdpa-backward.

use thiserror::Error;

/// Result type alias for sdpa-backward operations.
pub type Result<T> = std::result::Result<T, BackwardError>;

/// Errors that can occur before or while launching the backward kernel.
///
/// Every variant is raised before the grid starts; a launch that gets past
/// validation always runs to completion.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackwardError {
    /// A launch precondition (alignment, stride, buffer extent) does not hold.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The scratch workspace is required for this problem but was not provided.
    #[error("workspace required: {required} bytes, none provided")]
    WorkspaceMissing {
        /// Required workspace in bytes
        required: usize,
    },

    /// The variant was built for a newer architecture than the target device.
    #[error("architecture mismatch: variant requires sm{required}, device is sm{actual}")]
    ArchitectureMismatch {
        /// Minimum compute capability of the variant
        required: u32,
        /// Compute capability of the device
        actual: u32,
    },

    /// Shared-storage budget exceeded.
    #[error("out of memory: required {required} bytes, available {available} bytes")]
    OutOfMemory {
        /// Required memory in bytes
        required: usize,
        /// Available memory in bytes
        available: usize,
    },

    /// Shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Tensor element type not handled by any kernel variant.
    #[error("unsupported dtype: {0}")]
    UnsupportedDType(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

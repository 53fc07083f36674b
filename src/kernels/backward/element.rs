// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Storage element types understood by the backward kernel.

use candle_core::WithDType;
use half::{bf16, f16};

use super::config::Precision;

/// Element type of the kernel's input and gradient buffers.
///
/// Accumulation always happens in `f32`; values are widened when read and
/// narrowed (rounded) when written to a buffer or to shared storage.
pub trait KernelElement: WithDType + bytemuck::Pod + Default {
    /// Precision tag used for variant dispatch.
    const PRECISION: Precision;

    /// Widen to the accumulator type.
    fn to_accum(self) -> f32;

    /// Round an accumulator value to the storage type.
    fn from_accum(value: f32) -> Self;

    /// Round-trip through the storage type.
    #[inline]
    fn quantize(value: f32) -> f32 {
        Self::from_accum(value).to_accum()
    }
}

impl KernelElement for f32 {
    const PRECISION: Precision = Precision::F32;

    #[inline]
    fn to_accum(self) -> f32 {
        self
    }

    #[inline]
    fn from_accum(value: f32) -> Self {
        value
    }
}

impl KernelElement for f16 {
    const PRECISION: Precision = Precision::F16;

    #[inline]
    fn to_accum(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_accum(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl KernelElement for bf16 {
    const PRECISION: Precision = Precision::BF16;

    #[inline]
    fn to_accum(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline]
    fn from_accum(value: f32) -> Self {
        bf16::from_f32(value)
    }
}

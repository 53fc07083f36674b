// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Candle ↔ host buffer conversion utilities.
//!
//! The backward kernel works on flat host slices. These helpers move tensors
//! in and out of that form:
//!
//! - [`tensor_to_host`] - contiguous copy of a tensor's elements
//! - [`host_to_tensor`] - wrap a flat buffer back into a tensor
//! - [`precision_of`] - map a candle dtype to a kernel precision

use candle_core::{DType, Device, Shape, Tensor};

use super::backward::{KernelElement, Precision};
use crate::error::{BackwardError, Result};

/// Kernel precision for a candle dtype.
///
/// # Errors
/// Returns `UnsupportedDType` for anything other than f32, f16 and bf16.
pub fn precision_of(dtype: DType) -> Result<Precision> {
    match dtype {
        DType::F32 => Ok(Precision::F32),
        DType::F16 => Ok(Precision::F16),
        DType::BF16 => Ok(Precision::BF16),
        other => Err(BackwardError::UnsupportedDType(format!(
            "{other:?} (expected f32, f16 or bf16)"
        ))),
    }
}

/// Copy a tensor's elements, in row-major order, into a host vector.
///
/// Non-contiguous tensors are made contiguous first, which may copy.
///
/// # Errors
/// Returns `UnsupportedDType` if the tensor's dtype is not `T`.
pub fn tensor_to_host<T: KernelElement>(tensor: &Tensor) -> Result<Vec<T>> {
    if tensor.dtype() != T::DTYPE {
        return Err(BackwardError::UnsupportedDType(format!(
            "tensor is {:?}, expected {:?}",
            tensor.dtype(),
            T::DTYPE
        )));
    }
    let tensor = tensor.contiguous()?;
    Ok(tensor.flatten_all()?.to_vec1::<T>()?)
}

/// Build a tensor of `shape` from a flat host buffer.
///
/// # Errors
/// Returns error if the buffer length does not match the shape.
pub fn host_to_tensor<T: KernelElement, S: Into<Shape>>(
    data: Vec<T>,
    shape: S,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    if data.len() != shape.elem_count() {
        return Err(BackwardError::ShapeMismatch {
            expected: shape.dims().to_vec(),
            actual: vec![data.len()],
        });
    }
    Ok(Tensor::from_vec(data, shape, device)?)
}

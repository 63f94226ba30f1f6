//! Conversions between `ndarray` arrays and burn tensors.

use crate::core::{MapError, MapResult};
use burn::prelude::*;
use ndarray::{Array1, Array2};

/// Copy a row-major matrix to the device.
pub fn ndarray2_to_tensor<B: Backend>(arr: &Array2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = arr.dim();
    let data: Vec<f32> = arr.iter().copied().collect();
    Tensor::from_data(TensorData::new(data, [rows, cols]), device)
}

pub fn ndarray1_to_tensor<B: Backend>(arr: &Array1<f32>, device: &B::Device) -> Tensor<B, 1> {
    let data: Vec<f32> = arr.iter().copied().collect();
    Tensor::from_data(TensorData::new(data, [arr.len()]), device)
}

/// Read a matrix back from the device.
///
/// # Errors
/// - `ShapeMismatch` if the tensor data cannot be read as `f32` of its own shape
pub fn tensor_to_ndarray2<B: Backend>(tensor: Tensor<B, 2>) -> MapResult<Array2<f32>> {
    let [rows, cols] = tensor.dims();
    let data: Vec<f32> = tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| MapError::ShapeMismatch(format!("tensor readback failed: {e:?}")))?;
    Array2::from_shape_vec((rows, cols), data)
        .map_err(|e| MapError::ShapeMismatch(format!("tensor readback failed: {e}")))
}

/// # Errors
/// - `ShapeMismatch` if the tensor data cannot be read as `f32`
pub fn tensor_to_ndarray1<B: Backend>(tensor: Tensor<B, 1>) -> MapResult<Array1<f32>> {
    let data: Vec<f32> = tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| MapError::ShapeMismatch(format!("tensor readback failed: {e:?}")))?;
    Ok(Array1::from(data))
}

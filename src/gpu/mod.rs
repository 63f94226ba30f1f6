//! Batched inference of a fitted temporal conv predictor on a burn backend.
//!
//! Weights are uploaded once; each behaviour block is uploaded, run through the
//! network on the device and read back with a single sync. The temporal convolution
//! is expressed as an unfold followed by one matmul:
//! ```text
//! Zpad = [0_{K/2}; Z1; 0_{K/2}]                       (T + K - 1) × m
//! U[(t, c), τ] = Zpad[t + τ, c]                       T·m × K
//! H = reshape(U · kernelsᵀ + β, [T, m·F])             column c·F + f
//! ```
//! which matches the CPU layout exactly.

pub mod convert;

#[cfg(all(feature = "cuda", feature = "wgpu"))]
compile_error!("Features `cuda` and `wgpu` are mutually exclusive.");

/// Backend type alias, resolved at compile time from the feature flags.
#[cfg(feature = "cuda")]
pub type GpuBackend = burn::backend::CudaJit;
#[cfg(all(feature = "wgpu", not(feature = "cuda")))]
pub type GpuBackend = burn::backend::wgpu::Wgpu;
#[cfg(not(any(feature = "wgpu", feature = "cuda")))]
pub type GpuBackend = burn::backend::NdArray<f32>;

use burn::prelude::*;
use burn::tensor::activation::relu;
use ndarray::Array2;
use tracing::debug;

use crate::core::{MapError, MapResult};
use crate::prediction::TemporalConvPredictor;
use crate::ConvConfig;
use convert::{ndarray1_to_tensor, ndarray2_to_tensor, tensor_to_ndarray2};

/// Initialise the device for the active backend.
#[cfg(feature = "cuda")]
pub fn init_device() -> <GpuBackend as Backend>::Device {
    burn::backend::cuda_jit::CudaDevice { index: 0 }
}

/// Initialise the device for the active backend.
#[cfg(all(feature = "wgpu", not(feature = "cuda")))]
pub fn init_device() -> <GpuBackend as Backend>::Device {
    burn::backend::wgpu::WgpuDevice::default()
}

/// Initialise the device for the active backend.
#[cfg(not(any(feature = "wgpu", feature = "cuda")))]
pub fn init_device() -> <GpuBackend as Backend>::Device {
    Default::default()
}

/// Fitted conv predictor weights held as device tensors.
pub struct GpuConvPredictor<B: Backend> {
    config: ConvConfig,
    w_in: Tensor<B, 2>,
    b_in: Tensor<B, 1>,
    /// Kernels transposed: kernel_size × n_filters
    kernels_t: Tensor<B, 2>,
    conv_bias: Tensor<B, 1>,
    core: Vec<(Tensor<B, 2>, Tensor<B, 1>)>,
    w_out: Tensor<B, 2>,
    b_out: Tensor<B, 1>,
    device: B::Device,
}

/// `x + b` with `b` broadcast over rows.
fn add_row_bias<B: Backend>(x: Tensor<B, 2>, b: &Tensor<B, 1>) -> Tensor<B, 2> {
    let [rows, _] = x.dims();
    x + b.clone().unsqueeze::<2>().repeat_dim(0, rows)
}

impl<B: Backend> GpuConvPredictor<B> {
    /// Copy the weights of a fitted CPU model to `device`.
    ///
    /// # Errors
    /// - `NotFitted` if the model has not been fitted
    pub fn from_cpu(model: &TemporalConvPredictor, device: &B::Device) -> MapResult<Self> {
        let network = model.network()?;
        let kernels_t = network.kernels.t().to_owned();
        Ok(Self {
            config: network.config().clone(),
            w_in: ndarray2_to_tensor(&network.w_in, device),
            b_in: ndarray1_to_tensor(&network.b_in, device),
            kernels_t: ndarray2_to_tensor(&kernels_t, device),
            conv_bias: ndarray1_to_tensor(&network.conv_bias, device),
            core: network
                .core_w
                .iter()
                .zip(&network.core_b)
                .map(|(w, b)| (ndarray2_to_tensor(w, device), ndarray1_to_tensor(b, device)))
                .collect(),
            w_out: ndarray2_to_tensor(&network.w_out, device),
            b_out: ndarray1_to_tensor(&network.b_out, device),
            device: device.clone(),
        })
    }

    /// Device-side forward pass of one T × n_in block.
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let [t_len, _] = x.dims();
        let m = self.config.n_kp;
        let n_filters = self.config.n_filters;
        let k = self.config.kernel_size;
        let half = k / 2;

        let z1 = add_row_bias(x.matmul(self.w_in.clone()), &self.b_in);
        let z_pad = if half > 0 {
            let pad = Tensor::<B, 2>::zeros([half, m], &self.device);
            Tensor::cat(vec![pad.clone(), z1, pad], 0)
        } else {
            z1
        };
        let columns: Vec<Tensor<B, 2>> = (0..k)
            .map(|tau| z_pad.clone().slice([tau..tau + t_len]).reshape([t_len * m, 1]))
            .collect();
        let unfolded = Tensor::cat(columns, 1);
        let h = add_row_bias(unfolded.matmul(self.kernels_t.clone()), &self.conv_bias)
            .reshape([t_len, m * n_filters]);
        let mut a = if self.config.relu_wavelets { relu(h) } else { h };

        for (w, b) in &self.core {
            let pre = add_row_bias(a.matmul(w.clone()), b);
            a = if self.config.relu_latents { relu(pre) } else { pre };
        }
        add_row_bias(a.matmul(self.w_out.clone()), &self.b_out)
    }

    /// Predict one aligned behaviour block (T × n_in).
    ///
    /// # Errors
    /// - `ShapeMismatch` if the block does not have n_in columns or is empty
    pub fn predict(&self, behavior: &Array2<f32>) -> MapResult<Array2<f32>> {
        self.check_block(behavior)?;
        let x = ndarray2_to_tensor(behavior, &self.device);
        tensor_to_ndarray2(self.forward(x))
    }

    /// Predict several blocks; each block is convolved independently.
    ///
    /// # Errors
    /// - `ShapeMismatch` if any block does not have n_in columns or is empty
    pub fn predict_batch(&self, blocks: &[Array2<f32>]) -> MapResult<Vec<Array2<f32>>> {
        for block in blocks {
            self.check_block(block)?;
        }
        // Outputs stay on the device until the single concatenated readback
        let lengths: Vec<usize> = blocks.iter().map(Array2::nrows).collect();
        let outputs: Vec<Tensor<B, 2>> = blocks
            .iter()
            .map(|b| self.forward(ndarray2_to_tensor(b, &self.device)))
            .collect();
        if outputs.is_empty() {
            return Ok(Vec::new());
        }
        let all = tensor_to_ndarray2(Tensor::cat(outputs, 0))?;
        debug!(
            target: "neuromap::gpu",
            blocks = blocks.len(),
            rows = all.nrows(),
            "batched inference"
        );

        let mut start = 0;
        Ok(lengths
            .into_iter()
            .map(|len| {
                let block = all.slice(ndarray::s![start..start + len, ..]).to_owned();
                start += len;
                block
            })
            .collect())
    }

    fn check_block(&self, block: &Array2<f32>) -> MapResult<()> {
        if block.ncols() != self.config.n_in || block.nrows() == 0 {
            return Err(MapError::ShapeMismatch(format!(
                "behaviour block is {:?}, expected T × {} with T > 0",
                block.dim(),
                self.config.n_in
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FitConfig;
    use burn::backend::NdArray;
    use convert::tensor_to_ndarray1;
    use ndarray::Array1;

    type TestBackend = NdArray<f32>;

    fn test_device() -> <TestBackend as Backend>::Device {
        Default::default()
    }

    fn fitted() -> (TemporalConvPredictor, Array2<f32>) {
        let config = ConvConfig {
            n_kp: 3,
            n_filters: 2,
            kernel_size: 7,
            n_core_layers: 2,
            n_latents: 5,
            ..ConvConfig::new(2, 3)
        };
        let mut model = TemporalConvPredictor::new(config).expect("model");
        let x = Array2::from_shape_fn((80, 2), |(i, j)| ((i * (j + 1)) as f32 * 0.13).cos());
        let y = Array2::from_shape_fn((80, 3), |(i, j)| x[[i, j % 2]] * (j as f32 + 1.0));
        let fit = FitConfig {
            delay: 0,
            n_iterations: 10,
            n_segs: 4,
            ..FitConfig::default()
        };
        model.fit_aligned(x.view(), y.view(), &fit).expect("fit");
        (model, x)
    }

    #[test]
    fn test_convert_round_trip_array2() {
        let arr = ndarray::arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let device = test_device();
        let tensor: Tensor<TestBackend, 2> = ndarray2_to_tensor(&arr, &device);
        let back = tensor_to_ndarray2(tensor).expect("readback");
        assert_eq!(arr, back);
    }

    #[test]
    fn test_convert_round_trip_array1() {
        let arr = Array1::from(vec![1.0f32, -2.0, 3.5]);
        let device = test_device();
        let tensor: Tensor<TestBackend, 1> = ndarray1_to_tensor(&arr, &device);
        assert_eq!(tensor_to_ndarray1(tensor).expect("readback"), arr);
    }

    #[test]
    fn test_device_matches_cpu() {
        let (model, x) = fitted();
        let device = test_device();
        let gpu: GpuConvPredictor<TestBackend> =
            GpuConvPredictor::from_cpu(&model, &device).expect("upload");
        let cpu_pred = model.predict(x.view()).expect("cpu");
        let dev_pred = gpu.predict(&x).expect("device");
        assert_eq!(cpu_pred.dim(), dev_pred.dim());
        for (a, b) in cpu_pred.iter().zip(dev_pred.iter()) {
            assert!((a - b).abs() < 1e-4, "cpu {a} vs device {b}");
        }
    }

    #[test]
    fn test_batch_splits_back() {
        let (model, x) = fitted();
        let device = test_device();
        let gpu: GpuConvPredictor<TestBackend> =
            GpuConvPredictor::from_cpu(&model, &device).expect("upload");
        let blocks = vec![
            x.slice(ndarray::s![..30, ..]).to_owned(),
            x.slice(ndarray::s![30.., ..]).to_owned(),
        ];
        let out = gpu.predict_batch(&blocks).expect("batch");
        assert_eq!(out[0].nrows(), 30);
        assert_eq!(out[1].nrows(), 50);
        let single = gpu.predict(&blocks[1]).expect("single");
        for (a, b) in out[1].iter().zip(single.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_unfitted_model_rejected() {
        let model = TemporalConvPredictor::new(ConvConfig::new(2, 2)).expect("model");
        let device = test_device();
        let result: MapResult<GpuConvPredictor<TestBackend>> =
            GpuConvPredictor::from_cpu(&model, &device);
        assert!(matches!(result, Err(MapError::NotFitted(_))));
    }
}

//! Temporal convolutional network with a hand-written backward pass.
//!
//! ## Layers
//!
//! ```text
//! Z1 = X W_in + b_in                                   T × m        (m = n_kp)
//! H[t, c·F + f] = Σ_τ k[f, τ] Z1[t + τ - K/2, c] + β_f T × m·F      (zero padded)
//! A0 = σ_w(H)
//! A_l = σ_l(A_{l-1} W_l + b_l)                          T × n_latents
//! Y  = A_L W_out + b_out                                T × n_out
//! ```
//!
//! The F kernels are shared by all m latents, so each kernel is a temporal filter
//! applied to every behavioural latent.
//!
//! ## Parameter order
//!
//! `w_in, b_in, kernels, conv_bias, (core_w[l], core_b[l])…, w_out, b_out`, used by
//! both [`ConvNetwork::parameters_mut`] and [`Gradients::into_tensors`].

use crate::core::{activation_for, MapError, MapResult};
use crate::ConvConfig;
use ndarray::{Array1, Array2, ArrayD, ArrayView2, ArrayViewMutD, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Weights of the behaviour → neural-component network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvNetwork {
    pub(crate) config: ConvConfig,
    /// Behaviour compression: n_in × n_kp
    pub w_in: Array2<f32>,
    pub b_in: Array1<f32>,
    /// Temporal kernels: n_filters × kernel_size
    pub kernels: Array2<f32>,
    pub conv_bias: Array1<f32>,
    /// Dense layers: first is (n_kp·n_filters) × n_latents, the rest n_latents × n_latents
    pub core_w: Vec<Array2<f32>>,
    pub core_b: Vec<Array1<f32>>,
    /// Readout: n_latents × n_out
    pub w_out: Array2<f32>,
    pub b_out: Array1<f32>,
}

/// Intermediate activations kept for the backward pass.
#[derive(Debug, Clone)]
pub struct ForwardCache {
    z1: Array2<f32>,
    h_pre: Array2<f32>,
    /// Input of every dense layer (A0 … A_{L-1}) followed by the readout input A_L
    layer_inputs: Vec<Array2<f32>>,
    /// Pre-activation of every dense layer
    core_pre: Vec<Array2<f32>>,
}

/// Parameter gradients, shaped like the parameters.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub w_in: Array2<f32>,
    pub b_in: Array1<f32>,
    pub kernels: Array2<f32>,
    pub conv_bias: Array1<f32>,
    pub core_w: Vec<Array2<f32>>,
    pub core_b: Vec<Array1<f32>>,
    pub w_out: Array2<f32>,
    pub b_out: Array1<f32>,
}

impl Gradients {
    /// Accumulate `other` into `self`.
    pub fn add_assign(&mut self, other: &Gradients) {
        self.w_in += &other.w_in;
        self.b_in += &other.b_in;
        self.kernels += &other.kernels;
        self.conv_bias += &other.conv_bias;
        for (a, b) in self.core_w.iter_mut().zip(&other.core_w) {
            *a += b;
        }
        for (a, b) in self.core_b.iter_mut().zip(&other.core_b) {
            *a += b;
        }
        self.w_out += &other.w_out;
        self.b_out += &other.b_out;
    }

    /// Flatten into dynamic tensors in parameter order.
    pub fn into_tensors(self) -> Vec<ArrayD<f32>> {
        let mut out = vec![
            self.w_in.into_dyn(),
            self.b_in.into_dyn(),
            self.kernels.into_dyn(),
            self.conv_bias.into_dyn(),
        ];
        for (w, b) in self.core_w.into_iter().zip(self.core_b) {
            out.push(w.into_dyn());
            out.push(b.into_dyn());
        }
        out.push(self.w_out.into_dyn());
        out.push(self.b_out.into_dyn());
        out
    }
}

/// Gaussian weights scaled by `1/√fan_in`.
fn init_weights(rng: &mut StdRng, rows: usize, cols: usize, fan_in: usize) -> Array2<f32> {
    #[allow(clippy::cast_precision_loss)]
    let scale = 1.0 / (fan_in.max(1) as f32).sqrt();
    Array2::random_using((rows, cols), StandardNormal, rng) * scale
}

/// Cross-correlate every column of `z` with every kernel; 'same' length, zero padding.
pub(crate) fn temporal_conv(
    z: ArrayView2<f32>,
    kernels: &Array2<f32>,
    bias: &Array1<f32>,
) -> Array2<f32> {
    let (t_len, m) = z.dim();
    let (n_filters, k) = kernels.dim();
    let half = k / 2;
    let mut out = Array2::<f32>::zeros((t_len, m * n_filters));
    for t in 0..t_len {
        for tau in 0..k {
            let Some(s) = (t + tau).checked_sub(half).filter(|&s| s < t_len) else {
                continue;
            };
            for c in 0..m {
                let zc = z[[s, c]];
                for f in 0..n_filters {
                    out[[t, c * n_filters + f]] += kernels[[f, tau]] * zc;
                }
            }
        }
    }
    for c in 0..m {
        for f in 0..n_filters {
            out.column_mut(c * n_filters + f).mapv_inplace(|v| v + bias[f]);
        }
    }
    out
}

impl ConvNetwork {
    /// Initialise weights from `config.seed`.
    ///
    /// # Errors
    /// - `InvalidInput` if the configuration is out of range
    pub fn new(config: ConvConfig) -> MapResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let conv_width = config.n_kp * config.n_filters;

        let w_in = init_weights(&mut rng, config.n_in, config.n_kp, config.n_in);
        let kernels =
            init_weights(&mut rng, config.n_filters, config.kernel_size, config.kernel_size);

        let mut core_w = Vec::with_capacity(config.n_core_layers);
        let mut core_b = Vec::with_capacity(config.n_core_layers);
        let mut width = conv_width;
        for _ in 0..config.n_core_layers {
            core_w.push(init_weights(&mut rng, width, config.n_latents, width));
            core_b.push(Array1::zeros(config.n_latents));
            width = config.n_latents;
        }
        let w_out = init_weights(&mut rng, config.n_latents, config.n_out, config.n_latents);

        Ok(Self {
            b_in: Array1::zeros(config.n_kp),
            conv_bias: Array1::zeros(config.n_filters),
            b_out: Array1::zeros(config.n_out),
            w_in,
            kernels,
            core_w,
            core_b,
            w_out,
            config,
        })
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    /// Run the network on a T × n_in behaviour block.
    ///
    /// # Errors
    /// - `ShapeMismatch` if the input does not have n_in columns
    pub fn forward(&self, x: ArrayView2<f32>) -> MapResult<(Array2<f32>, ForwardCache)> {
        if x.ncols() != self.config.n_in {
            return Err(MapError::ShapeMismatch(format!(
                "network expects {} behavioural features, got {}",
                self.config.n_in,
                x.ncols()
            )));
        }
        let wavelet_act = activation_for(self.config.relu_wavelets);
        let latent_act = activation_for(self.config.relu_latents);

        let z1 = x.dot(&self.w_in) + &self.b_in;
        let h_pre = temporal_conv(z1.view(), &self.kernels, &self.conv_bias);
        let mut a = wavelet_act.apply_matrix(&h_pre);

        let mut layer_inputs = Vec::with_capacity(self.core_w.len() + 1);
        let mut core_pre = Vec::with_capacity(self.core_w.len());
        for (w, b) in self.core_w.iter().zip(&self.core_b) {
            let pre = a.dot(w) + b;
            let next = latent_act.apply_matrix(&pre);
            layer_inputs.push(a);
            core_pre.push(pre);
            a = next;
        }
        let y = a.dot(&self.w_out) + &self.b_out;
        layer_inputs.push(a);

        Ok((
            y,
            ForwardCache {
                z1,
                h_pre,
                layer_inputs,
                core_pre,
            },
        ))
    }

    /// Output only.
    ///
    /// # Errors
    /// - `ShapeMismatch` if the input does not have n_in columns
    pub fn predict(&self, x: ArrayView2<f32>) -> MapResult<Array2<f32>> {
        Ok(self.forward(x)?.0)
    }

    /// Backpropagate `d_out` (∂L/∂Y) to the parameters and to the latent Z1.
    ///
    /// Without `x` the input-layer weight gradient is left at zero.
    fn backward_to_latent(
        &self,
        x: Option<ArrayView2<f32>>,
        cache: &ForwardCache,
        d_out: &Array2<f32>,
    ) -> (Gradients, Array2<f32>) {
        let wavelet_act = activation_for(self.config.relu_wavelets);
        let latent_act = activation_for(self.config.relu_latents);
        let n_layers = self.core_w.len();

        // Readout
        let readout_in = &cache.layer_inputs[n_layers];
        let w_out = readout_in.t().dot(d_out);
        let b_out = d_out.sum_axis(Axis(0));
        let mut d_a = d_out.dot(&self.w_out.t());

        // Dense layers, last to first
        let mut core_w = vec![Array2::zeros((0, 0)); n_layers];
        let mut core_b = vec![Array1::zeros(0); n_layers];
        for l in (0..n_layers).rev() {
            let d_pre = d_a * latent_act.derivative_matrix(&cache.core_pre[l]);
            core_w[l] = cache.layer_inputs[l].t().dot(&d_pre);
            core_b[l] = d_pre.sum_axis(Axis(0));
            d_a = d_pre.dot(&self.core_w[l].t());
        }

        // Temporal convolution
        let d_h = d_a * wavelet_act.derivative_matrix(&cache.h_pre);
        let (t_len, m) = cache.z1.dim();
        let (n_filters, k) = self.kernels.dim();
        let half = k / 2;
        let mut kernels = Array2::<f32>::zeros((n_filters, k));
        let mut conv_bias = Array1::<f32>::zeros(n_filters);
        let mut d_z1 = Array2::<f32>::zeros((t_len, m));
        for t in 0..t_len {
            for c in 0..m {
                for f in 0..n_filters {
                    conv_bias[f] += d_h[[t, c * n_filters + f]];
                }
            }
            for tau in 0..k {
                let Some(s) = (t + tau).checked_sub(half).filter(|&s| s < t_len) else {
                    continue;
                };
                for c in 0..m {
                    let z = cache.z1[[s, c]];
                    let mut acc = 0.0f32;
                    for f in 0..n_filters {
                        let g = d_h[[t, c * n_filters + f]];
                        kernels[[f, tau]] += g * z;
                        acc += g * self.kernels[[f, tau]];
                    }
                    d_z1[[s, c]] += acc;
                }
            }
        }

        let w_in = match x {
            Some(x) => x.t().dot(&d_z1),
            None => Array2::zeros(self.w_in.dim()),
        };
        let b_in = d_z1.sum_axis(Axis(0));

        (
            Gradients {
                w_in,
                b_in,
                kernels,
                conv_bias,
                core_w,
                core_b,
                w_out,
                b_out,
            },
            d_z1,
        )
    }

    /// Parameter gradients for upstream gradient `d_out`.
    pub fn backward(
        &self,
        x: ArrayView2<f32>,
        cache: &ForwardCache,
        d_out: &Array2<f32>,
    ) -> Gradients {
        self.backward_to_latent(Some(x), cache, d_out).0
    }

    /// Gradient with respect to the input behaviour (T × n_in); parameters untouched.
    pub fn input_gradient(&self, cache: &ForwardCache, d_out: &Array2<f32>) -> Array2<f32> {
        let (_, d_z1) = self.backward_to_latent(None, cache, d_out);
        d_z1.dot(&self.w_in.t())
    }

    /// Zero gradients shaped like the parameters.
    pub fn zero_gradients(&self) -> Gradients {
        Gradients {
            w_in: Array2::zeros(self.w_in.dim()),
            b_in: Array1::zeros(self.b_in.len()),
            kernels: Array2::zeros(self.kernels.dim()),
            conv_bias: Array1::zeros(self.conv_bias.len()),
            core_w: self.core_w.iter().map(|w| Array2::zeros(w.dim())).collect(),
            core_b: self.core_b.iter().map(|b| Array1::zeros(b.len())).collect(),
            w_out: Array2::zeros(self.w_out.dim()),
            b_out: Array1::zeros(self.b_out.len()),
        }
    }

    /// Mutable views of all parameters in gradient order.
    pub fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut out = vec![
            self.w_in.view_mut().into_dyn(),
            self.b_in.view_mut().into_dyn(),
            self.kernels.view_mut().into_dyn(),
            self.conv_bias.view_mut().into_dyn(),
        ];
        for (w, b) in self.core_w.iter_mut().zip(self.core_b.iter_mut()) {
            out.push(w.view_mut().into_dyn());
            out.push(b.view_mut().into_dyn());
        }
        out.push(self.w_out.view_mut().into_dyn());
        out.push(self.b_out.view_mut().into_dyn());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn small_config() -> ConvConfig {
        ConvConfig {
            n_kp: 2,
            n_filters: 3,
            kernel_size: 5,
            n_core_layers: 1,
            n_latents: 4,
            relu_wavelets: false,
            relu_latents: false,
            seed: 3,
            ..ConvConfig::new(2, 2)
        }
    }

    fn input(t: usize) -> Array2<f32> {
        Array2::from_shape_fn((t, 2), |(i, j)| ((i + 3 * j) as f32 * 0.4).sin())
    }

    /// L = ½ Σ Y², so ∂L/∂Y = Y.
    fn half_sq(net: &ConvNetwork, x: &Array2<f32>) -> f32 {
        let y = net.predict(x.view()).expect("forward");
        0.5 * y.iter().map(|v| v * v).sum::<f32>()
    }

    #[test]
    fn test_temporal_conv_identity_kernel() {
        let z = array![[1.0], [2.0], [3.0]];
        let kernels = array![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]];
        let out = temporal_conv(z.view(), &kernels, &array![0.0, 0.5]);
        // Centre tap copies, left tap looks one step back
        assert_eq!(out.column(0).to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(out.column(1).to_vec(), vec![0.5, 1.5, 2.5]);
    }

    #[test]
    fn test_output_shape() {
        let net = ConvNetwork::new(small_config()).expect("network");
        let y = net.predict(input(12).view()).expect("forward");
        assert_eq!(y.dim(), (12, 2));
    }

    #[test]
    fn test_kernel_gradient_matches_finite_difference() {
        let mut net = ConvNetwork::new(small_config()).expect("network");
        let x = input(10);
        let (y, cache) = net.forward(x.view()).expect("forward");
        let grads = net.backward(x.view(), &cache, &y);

        let eps = 1e-2;
        let original = net.kernels[[1, 2]];
        net.kernels[[1, 2]] = original + eps;
        let up = half_sq(&net, &x);
        net.kernels[[1, 2]] = original - eps;
        let down = half_sq(&net, &x);
        let numeric = (up - down) / (2.0 * eps);
        let analytic = grads.kernels[[1, 2]];
        assert!(
            (numeric - analytic).abs() < 1e-2 * analytic.abs().max(1.0),
            "numeric {numeric} vs analytic {analytic}"
        );
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let net = ConvNetwork::new(small_config()).expect("network");
        let mut x = input(9);
        let (y, cache) = net.forward(x.view()).expect("forward");
        let d_x = net.input_gradient(&cache, &y);

        let eps = 1e-2;
        let original = x[[4, 1]];
        x[[4, 1]] = original + eps;
        let up = half_sq(&net, &x);
        x[[4, 1]] = original - eps;
        let down = half_sq(&net, &x);
        let numeric = (up - down) / (2.0 * eps);
        assert!(
            (numeric - d_x[[4, 1]]).abs() < 1e-2 * d_x[[4, 1]].abs().max(1.0),
            "numeric {numeric} vs analytic {}",
            d_x[[4, 1]]
        );
    }

    #[test]
    fn test_parameter_and_gradient_order_agree() {
        let mut net = ConvNetwork::new(small_config()).expect("network");
        let shapes: Vec<Vec<usize>> = net
            .zero_gradients()
            .into_tensors()
            .iter()
            .map(|g| g.shape().to_vec())
            .collect();
        let param_shapes: Vec<Vec<usize>> =
            net.parameters_mut().iter().map(|p| p.shape().to_vec()).collect();
        assert_eq!(shapes, param_shapes);
    }

    #[test]
    fn test_rejects_wrong_width() {
        let net = ConvNetwork::new(small_config()).expect("network");
        let x = Array2::<f32>::zeros((5, 3));
        assert!(matches!(net.forward(x.view()), Err(MapError::ShapeMismatch(_))));
    }
}

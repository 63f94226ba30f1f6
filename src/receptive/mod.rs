//! Maximum-stimulus receptive fields of a fitted temporal conv predictor.
//!
//! For every target response profile `r_m` (a vector over the predicted
//! components), a behaviour trace `X_m` (window × n_in) is optimised by gradient
//! ascent on
//! ```text
//! J(X_m) = ⟨f(X_m)[centre], r_m⟩ - (λ/2)·‖X_m‖²
//! ```
//! where `f` is the frozen network. Only the input receives updates; the network is
//! borrowed immutably for the whole run. Targets are independent and run in
//! parallel.

use crate::core::{MapError, MapResult};
use crate::prediction::{ConvNetwork, TemporalConvPredictor};
use crate::training::AdamW;
use crate::ReceptiveFieldConfig;
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::debug;

/// Scale of the random trace initialisation.
const INIT_SCALE: f32 = 0.1;

/// Synthesises receptive fields by input-space gradient ascent.
#[derive(Debug, Clone)]
pub struct ReceptiveFieldEstimator {
    config: ReceptiveFieldConfig,
}

impl ReceptiveFieldEstimator {
    /// # Errors
    /// - `InvalidInput` if the configuration is out of range
    pub fn new(config: ReceptiveFieldConfig) -> MapResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ReceptiveFieldConfig {
        &self.config
    }

    /// One receptive field per row of `targets` (M × n_out): M × window × n_in.
    ///
    /// # Errors
    /// - `NotFitted` if the model has not been fitted
    /// - `ShapeMismatch` if `targets` does not have n_out columns
    /// - `NumericalInstability` if a trace becomes non-finite
    pub fn estimate(
        &self,
        model: &TemporalConvPredictor,
        targets: ArrayView2<f32>,
    ) -> MapResult<Array3<f32>> {
        let network = model.network()?;
        let config = network.config();
        if targets.ncols() != config.n_out {
            return Err(MapError::ShapeMismatch(format!(
                "targets have {} components, model predicts {}",
                targets.ncols(),
                config.n_out
            )));
        }
        let window = self.config.window.unwrap_or(config.kernel_size);
        let n_in = config.n_in;

        let fields: Vec<MapResult<Array2<f32>>> = (0..targets.nrows())
            .into_par_iter()
            .map(|m| self.ascend(network, targets.row(m), window, m))
            .collect();

        let mut out = Array3::<f32>::zeros((targets.nrows(), window, n_in));
        for (mut slot, field) in out.axis_iter_mut(Axis(0)).zip(fields) {
            slot.assign(&field?);
        }
        Ok(out)
    }

    /// Gradient ascent for one target.
    fn ascend(
        &self,
        network: &ConvNetwork,
        target: ArrayView1<f32>,
        window: usize,
        index: usize,
    ) -> MapResult<Array2<f32>> {
        let n_in = network.config().n_in;
        let centre = window / 2;
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(index as u64));
        let mut trace =
            Array2::<f32>::random_using((window, n_in), StandardNormal, &mut rng) * INIT_SCALE;
        let mut optimiser = AdamW::new(0.0);

        let mut d_out = Array2::<f32>::zeros((window, network.config().n_out));
        d_out.row_mut(centre).assign(&target.mapv(|v| -v));

        for iteration in 0..self.config.n_iterations {
            let (_, cache) = network.forward(trace.view())?;
            // Descend on -J
            let grad = network.input_gradient(&cache, &d_out) + &trace * self.config.l2_penalty;
            optimiser.update(
                vec![trace.view_mut().into_dyn()],
                &[grad.into_dyn()],
                self.config.learning_rate,
            )?;
            if trace.iter().any(|v| !v.is_finite()) {
                return Err(MapError::NumericalInstability(format!(
                    "receptive-field trace for target {index} diverged at iteration {}",
                    iteration + 1
                )));
            }
        }

        let response = network.predict(trace.view())?.row(centre).dot(&target);
        debug!(
            target: "neuromap::receptive",
            target_index = index,
            response,
            "receptive field done"
        );
        Ok(trace)
    }
}

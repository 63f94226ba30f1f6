//! Behaviour → neural-component prediction with a temporal convolutional network.
//!
//! ## Lifecycle
//!
//! ```text
//! new(config) ──▶ Uninitialized ──fit──▶ Fitting ──▶ Fitted ──predict──▶ …
//!                      ▲                    │
//!                      └──── error ─────────┘  (weights re-initialised)
//! ```
//!
//! `fit` aligns behaviour to the neural timestamps, applies the delay, splits the
//! aligned time axis into interleaved train/test segments, and trains on the train
//! segments (one batch item per segment) with [`Trainer`]. The returned report
//! scores the predictions on the test segments only.

pub mod align;
pub mod network;

pub use network::{ConvNetwork, ForwardCache, Gradients};

use crate::core::{MapError, MapResult};
use crate::regression::{variance_explained, variance_explained_per_column};
use crate::split::{SplitMask, TrainTestSplitter};
use crate::training::{Trainable, Trainer, TrainingStatus};
use crate::{ConvConfig, FitConfig};
use ndarray::{s, Array1, Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewMutD, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Training state of a [`TemporalConvPredictor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitState {
    Uninitialized,
    Fitting,
    Fitted,
}

/// Outcome of [`TemporalConvPredictor::fit`].
#[derive(Debug, Clone)]
pub struct FitReport {
    /// Predictions for every aligned timepoint (train and test), T × n_out
    pub predictions: Array2<f32>,
    /// Aligned, delayed targets the predictions are compared against, T × n_out
    pub targets: Array2<f32>,
    /// Overall variance explained on the test timepoints
    pub variance_explained: f32,
    /// Per-component variance explained on the test timepoints
    pub variance_explained_per_component: Array1<f32>,
    /// Train/test partition of the aligned time axis
    pub test_mask: SplitMask,
    /// Training loss per iteration
    pub loss_history: Vec<f32>,
    /// How training ended
    pub status: TrainingStatus,
}

/// Train segments of one fit, borrowed alongside the network being trained.
struct SegmentBatch<'a> {
    network: &'a mut ConvNetwork,
    inputs: Vec<Array2<f32>>,
    targets: Vec<Array2<f32>>,
    n_values: usize,
}

impl Trainable for SegmentBatch<'_> {
    /// Mean squared error over every train value; segments run in parallel.
    fn loss_and_gradients(&self) -> MapResult<(f32, Vec<ArrayD<f32>>)> {
        let network = &*self.network;
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / self.n_values as f32;

        let per_segment: Vec<MapResult<(f32, Gradients)>> = self
            .inputs
            .par_iter()
            .zip(self.targets.par_iter())
            .map(|(x, y)| {
                let (pred, cache) = network.forward(x.view())?;
                let residual = pred - y;
                let sse: f32 = residual.iter().map(|r| r * r).sum();
                let d_out = residual * (2.0 * scale);
                Ok((sse, network.backward(x.view(), &cache, &d_out)))
            })
            .collect();

        // Reduce in segment order so the sum does not depend on scheduling
        let mut total = network.zero_gradients();
        let mut sse = 0.0f32;
        for item in per_segment {
            let (segment_sse, grads) = item?;
            sse += segment_sse;
            total.add_assign(&grads);
        }
        Ok((sse * scale, total.into_tensors()))
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        self.network.parameters_mut()
    }
}

/// Temporal convolutional predictor of neural components from behaviour.
#[derive(Debug, Clone)]
pub struct TemporalConvPredictor {
    network: ConvNetwork,
    state: FitState,
}

impl TemporalConvPredictor {
    /// Build an untrained predictor.
    ///
    /// # Errors
    /// - `InvalidInput` if the configuration is out of range
    pub fn new(config: ConvConfig) -> MapResult<Self> {
        Ok(Self {
            network: ConvNetwork::new(config)?,
            state: FitState::Uninitialized,
        })
    }

    pub fn state(&self) -> FitState {
        self.state
    }

    pub fn config(&self) -> &ConvConfig {
        self.network.config()
    }

    /// Weights of a fitted model.
    ///
    /// # Errors
    /// - `NotFitted` before a successful [`Self::fit`]
    pub fn network(&self) -> MapResult<&ConvNetwork> {
        self.ensure_fitted()?;
        Ok(&self.network)
    }

    fn ensure_fitted(&self) -> MapResult<()> {
        if self.state == FitState::Fitted {
            Ok(())
        } else {
            Err(MapError::NotFitted(format!(
                "temporal conv predictor is {:?}",
                self.state
            )))
        }
    }

    /// Fit from a camera-rate behaviour stream and neural targets.
    ///
    /// `behavior` is T_cam × n_in sampled at `time_cam`; `targets` is T_neural × n_out
    /// sampled at `time_neural`.
    ///
    /// # Errors
    /// - `InvalidInput` on bad settings or timestamps, or if the model is already fitted
    /// - `ShapeMismatch` if feature counts disagree with the configuration, or the time
    ///   axes disagree after alignment
    /// - `NumericalInstability` if the training loss becomes non-finite
    pub fn fit(
        &mut self,
        behavior: ArrayView2<f32>,
        targets: ArrayView2<f32>,
        time_cam: ArrayView1<f64>,
        time_neural: ArrayView1<f64>,
        fit: &FitConfig,
    ) -> MapResult<FitReport> {
        fit.validate()?;
        self.check_widths(behavior, targets)?;
        let aligned = align::resample(behavior, time_cam, time_neural, fit.smoothing_sigma)?;
        self.fit_aligned(aligned.view(), targets, fit)
    }

    /// Fit from behaviour already sampled on the neural time base.
    ///
    /// # Errors
    /// Same as [`Self::fit`], without the timestamp checks.
    pub fn fit_aligned(
        &mut self,
        behavior: ArrayView2<f32>,
        targets: ArrayView2<f32>,
        fit: &FitConfig,
    ) -> MapResult<FitReport> {
        if self.state == FitState::Fitted {
            return Err(MapError::InvalidInput(
                "predictor is already fitted; construct a new one to refit".to_string(),
            ));
        }
        fit.validate()?;
        self.check_widths(behavior, targets)?;
        let (x, y) = align::apply_delay(behavior, targets, fit.delay)?;
        let mask = TrainTestSplitter.split(x.nrows(), fit.n_segs, fit.test_fraction)?;

        self.state = FitState::Fitting;
        match self.train(&x, &y, &mask, fit) {
            Ok(report) => {
                self.state = FitState::Fitted;
                Ok(report)
            }
            Err(e) => {
                self.network = ConvNetwork::new(self.network.config().clone())?;
                self.state = FitState::Uninitialized;
                Err(e)
            }
        }
    }

    fn train(
        &mut self,
        x: &Array2<f32>,
        y: &Array2<f32>,
        mask: &SplitMask,
        fit: &FitConfig,
    ) -> MapResult<FitReport> {
        let inputs: Vec<Array2<f32>> = mask
            .train_segments
            .iter()
            .map(|r| x.slice(s![r.clone(), ..]).to_owned())
            .collect();
        let targets: Vec<Array2<f32>> = mask
            .train_segments
            .iter()
            .map(|r| y.slice(s![r.clone(), ..]).to_owned())
            .collect();
        let n_values = targets.iter().map(Array2::len).sum::<usize>();
        if n_values == 0 {
            return Err(MapError::InvalidInput("no training timepoints".to_string()));
        }

        let mut trainer = Trainer::new(fit)?;
        let mut batch = SegmentBatch {
            network: &mut self.network,
            inputs,
            targets,
            n_values,
        };
        let status = trainer.run(&mut batch)?;

        let predictions = self.network.predict(x.view())?;
        let test = mask.test_indices();
        let y_test = y.select(Axis(0), &test);
        let p_test = predictions.select(Axis(0), &test);
        let report = FitReport {
            variance_explained: variance_explained(y_test.view(), p_test.view()),
            variance_explained_per_component: variance_explained_per_column(
                y_test.view(),
                p_test.view(),
            ),
            predictions,
            targets: y.clone(),
            test_mask: mask.clone(),
            loss_history: trainer.loss_history().to_vec(),
            status,
        };
        info!(
            target: "neuromap::prediction",
            iterations = trainer.iteration(),
            variance_explained = report.variance_explained,
            "temporal conv predictor fitted"
        );
        Ok(report)
    }

    fn check_widths(&self, behavior: ArrayView2<f32>, targets: ArrayView2<f32>) -> MapResult<()> {
        let config = self.network.config();
        if behavior.ncols() != config.n_in {
            return Err(MapError::ShapeMismatch(format!(
                "behaviour has {} features, model expects {}",
                behavior.ncols(),
                config.n_in
            )));
        }
        if targets.ncols() != config.n_out {
            return Err(MapError::ShapeMismatch(format!(
                "targets have {} components, model predicts {}",
                targets.ncols(),
                config.n_out
            )));
        }
        Ok(())
    }

    /// Predict neural components for an aligned behaviour block (T × n_in).
    ///
    /// Pure function of the fitted weights and the input.
    ///
    /// # Errors
    /// - `NotFitted` before a successful fit
    /// - `ShapeMismatch` if the input width differs from n_in
    pub fn predict(&self, behavior: ArrayView2<f32>) -> MapResult<Array2<f32>> {
        self.ensure_fitted()?;
        self.network.predict(behavior)
    }
}

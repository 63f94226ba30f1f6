//! Gradient-descent training as an explicit state machine.
//!
//! ```text
//! Initialized ──step──▶ Running ──step──▶ … ──▶ Converged
//!                                          └──▶ MaxIterationsReached
//! ```
//!
//! Every [`Trainer::step`] performs one full iteration: the model computes its loss
//! and parameter gradients on its training batch (forward + backward), the loss is
//! checked for finiteness, and [`AdamW`] updates the parameters in place. The
//! iteration count, the current status and the full loss history are observable
//! between steps.
//!
//! ## Learning-rate schedule
//!
//! The last `anneal_fraction` of the iteration budget runs at one tenth of the base
//! learning rate.
//!
//! ## Failure policy
//!
//! - A non-finite loss aborts with `NumericalInstability`
//! - Running out of iterations while the loss is still far from settled is logged
//!   with `warn!`; the parameters reached so far are kept

use crate::core::{MapError, MapResult};
use crate::FitConfig;
use ndarray::{ArrayD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A model that can be trained by [`Trainer`].
pub trait Trainable {
    /// Mean loss over the training batch and its gradient for every parameter
    /// tensor, in the order of [`Trainable::parameters_mut`].
    ///
    /// # Errors
    /// Returns `Err` if the forward or backward pass fails.
    fn loss_and_gradients(&self) -> MapResult<(f32, Vec<ArrayD<f32>>)>;

    /// Mutable views of all trainable tensors.
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>>;
}

/// Where a training run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingStatus {
    /// No step taken yet
    Initialized,
    /// At least one step taken, budget not exhausted
    Running,
    /// Relative loss change fell below the tolerance
    Converged,
    /// Iteration budget exhausted
    MaxIterationsReached,
}

impl TrainingStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Converged | Self::MaxIterationsReached)
    }
}

/// Metrics of a single iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    /// 1-based iteration number
    pub iteration: usize,
    /// Training loss before the update
    pub loss: f32,
    /// Learning rate used for the update
    pub learning_rate: f32,
    /// L2 norm of the full gradient
    pub gradient_norm: f32,
}

/// Adam with decoupled weight decay.
///
/// ```text
/// θ ← θ - lr·λ·θ
/// m ← β1 m + (1-β1) g          v ← β2 v + (1-β2) g²
/// θ ← θ - lr · m̂ / (√v̂ + ε)    m̂ = m/(1-β1ᵗ), v̂ = v/(1-β2ᵗ)
/// ```
#[derive(Debug, Clone)]
pub struct AdamW {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    first_moment: Vec<ArrayD<f32>>,
    second_moment: Vec<ArrayD<f32>>,
    steps: i32,
}

impl AdamW {
    pub fn new(weight_decay: f32) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            first_moment: Vec::new(),
            second_moment: Vec::new(),
            steps: 0,
        }
    }

    /// Apply one update to `params` given `grads` (same order and shapes).
    ///
    /// # Errors
    /// - `ShapeMismatch` if the tensor count or any tensor shape differs from the
    ///   gradients, or from the tensors seen on the first call
    pub fn update(
        &mut self,
        mut params: Vec<ArrayViewMutD<'_, f32>>,
        grads: &[ArrayD<f32>],
        learning_rate: f32,
    ) -> MapResult<()> {
        if params.len() != grads.len() {
            return Err(MapError::ShapeMismatch(format!(
                "{} parameter tensors but {} gradients",
                params.len(),
                grads.len()
            )));
        }
        if self.first_moment.is_empty() {
            self.first_moment = grads.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
            self.second_moment = self.first_moment.clone();
        }
        if self.first_moment.len() != grads.len() {
            return Err(MapError::ShapeMismatch(
                "parameter set changed between updates".to_string(),
            ));
        }

        self.steps += 1;
        let bias1 = 1.0 - self.beta1.powi(self.steps);
        let bias2 = 1.0 - self.beta2.powi(self.steps);
        let (b1, b2, eps, decay) = (self.beta1, self.beta2, self.epsilon, self.weight_decay);

        for (i, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
            let m = &mut self.first_moment[i];
            let v = &mut self.second_moment[i];
            if param.shape() != grad.shape() || m.shape() != grad.shape() {
                return Err(MapError::ShapeMismatch(format!(
                    "tensor {i}: parameter {:?}, gradient {:?}",
                    param.shape(),
                    grad.shape()
                )));
            }
            Zip::from(param.view_mut())
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *p -= learning_rate * decay * *p;
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= learning_rate * m_hat / (v_hat.sqrt() + eps);
                });
        }
        Ok(())
    }
}

/// Drives a [`Trainable`] model through its iteration budget.
#[derive(Debug, Clone)]
pub struct Trainer {
    optimizer: AdamW,
    base_learning_rate: f32,
    max_iterations: usize,
    anneal_start: usize,
    tolerance: f32,
    log_every: usize,
    status: TrainingStatus,
    iteration: usize,
    loss_history: Vec<f32>,
}

impl Trainer {
    /// Create a trainer from validated fit settings.
    ///
    /// # Errors
    /// - `InvalidInput` if the settings are out of range
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
    pub fn new(config: &FitConfig) -> MapResult<Self> {
        config.validate()?;
        let annealed = (config.n_iterations as f32 * config.anneal_fraction).round() as usize;
        Ok(Self {
            optimizer: AdamW::new(config.weight_decay),
            base_learning_rate: config.learning_rate,
            max_iterations: config.n_iterations,
            anneal_start: config.n_iterations.saturating_sub(annealed),
            tolerance: config.tolerance,
            log_every: config.log_every,
            status: TrainingStatus::Initialized,
            iteration: 0,
            loss_history: Vec::with_capacity(config.n_iterations),
        })
    }

    pub fn status(&self) -> TrainingStatus {
        self.status
    }

    /// Number of completed iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Loss before every completed update.
    pub fn loss_history(&self) -> &[f32] {
        &self.loss_history
    }

    /// Learning rate the next step will use.
    pub fn current_learning_rate(&self) -> f32 {
        if self.iteration >= self.anneal_start {
            self.base_learning_rate / 10.0
        } else {
            self.base_learning_rate
        }
    }

    /// Run one iteration: loss and gradients, finiteness check, parameter update.
    ///
    /// # Errors
    /// - `InvalidInput` if training has already finished
    /// - `NumericalInstability` if the loss is not finite
    /// - Any error from the model or the optimiser
    pub fn step<M: Trainable>(&mut self, model: &mut M) -> MapResult<StepMetrics> {
        if self.status.is_finished() {
            return Err(MapError::InvalidInput(format!(
                "training already finished ({:?})",
                self.status
            )));
        }
        self.status = TrainingStatus::Running;

        let (loss, grads) = model.loss_and_gradients()?;
        if !loss.is_finite() {
            return Err(MapError::NumericalInstability(format!(
                "loss became non-finite at iteration {}",
                self.iteration + 1
            )));
        }
        let gradient_norm = grads
            .iter()
            .map(|g| g.iter().map(|x| x * x).sum::<f32>())
            .sum::<f32>()
            .sqrt();

        let learning_rate = self.current_learning_rate();
        self.optimizer
            .update(model.parameters_mut(), &grads, learning_rate)?;

        let previous = self.loss_history.last().copied();
        self.iteration += 1;
        self.loss_history.push(loss);

        if self.log_every > 0 && self.iteration % self.log_every == 0 {
            debug!(
                target: "neuromap::training",
                iteration = self.iteration,
                loss,
                learning_rate,
                gradient_norm,
                "training step"
            );
        }

        let settled = previous.is_some_and(|prev| {
            self.tolerance > 0.0
                && (prev - loss).abs() <= self.tolerance * prev.abs().max(f32::EPSILON)
        });
        if settled {
            self.status = TrainingStatus::Converged;
        } else if self.iteration >= self.max_iterations {
            self.status = TrainingStatus::MaxIterationsReached;
        }

        Ok(StepMetrics {
            iteration: self.iteration,
            loss,
            learning_rate,
            gradient_norm,
        })
    }

    /// Step until converged or out of iterations.
    ///
    /// # Errors
    /// Propagates the first failing [`Trainer::step`].
    pub fn run<M: Trainable>(&mut self, model: &mut M) -> MapResult<TrainingStatus> {
        while !self.status.is_finished() {
            self.step(model)?;
        }

        if self.status == TrainingStatus::MaxIterationsReached && !self.improved_recently() {
            warn!(
                target: "neuromap::training",
                iterations = self.iteration,
                final_loss = self.loss_history.last().copied().unwrap_or(f32::NAN),
                "loss stopped improving before the iteration budget ran out; \
                 keeping best-effort parameters"
            );
        }
        info!(
            target: "neuromap::training",
            status = ?self.status,
            iterations = self.iteration,
            final_loss = self.loss_history.last().copied().unwrap_or(f32::NAN),
            "training finished"
        );
        Ok(self.status)
    }

    /// True if the last quarter of the history reached a lower loss than what came before it.
    fn improved_recently(&self) -> bool {
        let n = self.loss_history.len();
        if n < 4 {
            return true;
        }
        let split = n - n / 4;
        let before = self.loss_history[..split]
            .iter()
            .copied()
            .fold(f32::INFINITY, f32::min);
        let after = self.loss_history[split..]
            .iter()
            .copied()
            .fold(f32::INFINITY, f32::min);
        after < before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Ix1};

    /// f(θ) = Σ (θ - target)²
    struct Quadratic {
        theta: ArrayD<f32>,
        target: Array1<f32>,
    }

    impl Trainable for Quadratic {
        fn loss_and_gradients(&self) -> MapResult<(f32, Vec<ArrayD<f32>>)> {
            let theta = self
                .theta
                .view()
                .into_dimensionality::<Ix1>()
                .map_err(|e| MapError::ShapeMismatch(e.to_string()))?;
            let diff = &theta - &self.target;
            let loss = diff.dot(&diff);
            Ok((loss, vec![(diff * 2.0).into_dyn()]))
        }

        fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
            vec![self.theta.view_mut()]
        }
    }

    struct Exploding;

    impl Trainable for Exploding {
        fn loss_and_gradients(&self) -> MapResult<(f32, Vec<ArrayD<f32>>)> {
            Ok((f32::NAN, Vec::new()))
        }

        fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
            Vec::new()
        }
    }

    fn quadratic() -> Quadratic {
        Quadratic {
            theta: array![0.0f32, 0.0, 0.0].into_dyn(),
            target: array![1.0, -2.0, 0.5],
        }
    }

    #[test]
    fn test_state_machine_reaches_budget() {
        let config = FitConfig {
            learning_rate: 0.05,
            weight_decay: 0.0,
            n_iterations: 500,
            ..FitConfig::default()
        };
        let mut trainer = Trainer::new(&config).expect("trainer");
        let mut model = quadratic();
        assert_eq!(trainer.status(), TrainingStatus::Initialized);

        let first = trainer.step(&mut model).expect("step");
        assert_eq!(first.iteration, 1);
        assert_eq!(trainer.status(), TrainingStatus::Running);

        let status = trainer.run(&mut model).expect("run");
        assert_eq!(status, TrainingStatus::MaxIterationsReached);
        assert_eq!(trainer.iteration(), 500);
        assert_eq!(trainer.loss_history().len(), 500);

        let last = trainer.loss_history()[499];
        assert!(last < first.loss * 1e-3, "loss {last} did not drop from {}", first.loss);
        assert!(trainer.step(&mut model).is_err(), "finished trainer must refuse to step");
    }

    #[test]
    fn test_converges_with_tolerance() {
        let config = FitConfig {
            learning_rate: 0.05,
            weight_decay: 0.0,
            n_iterations: 10_000,
            tolerance: 1e-3,
            ..FitConfig::default()
        };
        let mut trainer = Trainer::new(&config).expect("trainer");
        let status = trainer.run(&mut quadratic()).expect("run");
        assert_eq!(status, TrainingStatus::Converged);
        assert!(trainer.iteration() < 10_000);
    }

    #[test]
    fn test_annealing_schedule() {
        let config = FitConfig {
            learning_rate: 1.0,
            n_iterations: 10,
            anneal_fraction: 0.2,
            ..FitConfig::default()
        };
        let mut trainer = Trainer::new(&config).expect("trainer");
        let mut model = quadratic();
        let rates: Vec<f32> = (0..10)
            .map(|_| trainer.step(&mut model).expect("step").learning_rate)
            .collect();
        assert_eq!(&rates[..8], &[1.0; 8]);
        assert_eq!(&rates[8..], &[0.1, 0.1]);
    }

    #[test]
    fn test_non_finite_loss_is_error() {
        let mut trainer = Trainer::new(&FitConfig::default()).expect("trainer");
        assert!(matches!(
            trainer.step(&mut Exploding),
            Err(MapError::NumericalInstability(_))
        ));
    }

    #[test]
    fn test_adamw_shape_mismatch() {
        let mut opt = AdamW::new(0.0);
        let mut p = array![1.0f32, 2.0].into_dyn();
        let g = array![1.0f32].into_dyn();
        assert!(opt.update(vec![p.view_mut()], &[g], 0.1).is_err());
    }
}

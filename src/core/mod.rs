//! Core types shared by the sorting and prediction engines.
//!
//! This module provides:
//! - The error taxonomy ([`MapError`]) and result alias used by every public call
//! - The [`Activation`] trait for the non-linearities of the convolutional predictor
//! - [`SingularComponents`], the truncated decomposition both engines consume
//!
//! ## Decomposition Convention
//!
//! An activity matrix `X` (N neurons × T timepoints) is summarised by
//! ```text
//! X ≈ U diag(s) Vᵀ
//!
//! V: T × k time-courses, unit-norm columns, decreasing variance
//! U: N × k loadings, U = X V / s (unit-norm columns)
//! ```

use ndarray::{Array1, Array2, ArrayView2, Axis};
use thiserror::Error;

/// Error type for all neuromap operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapError {
    /// Malformed shapes or out-of-range parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Inference requested before training
    #[error("Not fitted: {0}")]
    NotFitted(String),
    /// Singular or ill-conditioned system, or a non-finite loss
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),
    /// Misaligned axes between two inputs
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
}

pub type MapResult<T> = Result<T, MapError>;

/// Activation function trait for layer nonlinearities.
///
/// Implementations provide both the activation and its derivative, evaluated at the
/// pre-activation, so the hand-written backward pass can gate error signals.
pub trait Activation: Send + Sync + std::fmt::Debug {
    /// Apply activation to a matrix (elementwise): f(X)
    fn apply_matrix(&self, x: &Array2<f32>) -> Array2<f32>;

    /// Derivative of activation applied to matrix (elementwise): f'(X)
    fn derivative_matrix(&self, x: &Array2<f32>) -> Array2<f32>;

    /// Name for debugging
    fn name(&self) -> &'static str;
}

/// Identity activation: f(x) = x, f'(x) = 1
#[derive(Debug, Clone, Copy)]
pub struct IdentityActivation;

impl Activation for IdentityActivation {
    fn apply_matrix(&self, x: &Array2<f32>) -> Array2<f32> {
        x.clone()
    }

    fn derivative_matrix(&self, x: &Array2<f32>) -> Array2<f32> {
        Array2::ones(x.dim())
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

/// Rectified linear activation: f(x) = max(x, 0), f'(x) = 1 for x > 0 else 0
#[derive(Debug, Clone, Copy)]
pub struct ReluActivation;

impl Activation for ReluActivation {
    fn apply_matrix(&self, x: &Array2<f32>) -> Array2<f32> {
        x.mapv(|v| v.max(0.0))
    }

    fn derivative_matrix(&self, x: &Array2<f32>) -> Array2<f32> {
        x.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
    }

    fn name(&self) -> &'static str {
        "relu"
    }
}

/// Select the layer non-linearity from a configuration flag.
pub fn activation_for(use_nonlinearity: bool) -> &'static dyn Activation {
    if use_nonlinearity {
        &ReluActivation
    } else {
        &IdentityActivation
    }
}

/// Truncated singular decomposition of an activity matrix.
#[derive(Debug, Clone)]
pub struct SingularComponents {
    /// V: T × k time-courses, unit-norm columns ordered by decreasing variance
    pub time_courses: Array2<f32>,
    /// U: N × k neuron loadings, unit-norm columns
    pub loadings: Array2<f32>,
    /// s: k singular values, non-increasing
    pub singular_values: Array1<f32>,
}

impl SingularComponents {
    /// Assemble a decomposition, checking that the three parts agree on k.
    ///
    /// # Errors
    /// - `InvalidInput` if k < 1
    /// - `ShapeMismatch` if the component counts disagree
    pub fn new(
        time_courses: Array2<f32>,
        loadings: Array2<f32>,
        singular_values: Array1<f32>,
    ) -> MapResult<Self> {
        let k = loadings.ncols();
        if k < 1 {
            return Err(MapError::InvalidInput(
                "decomposition needs at least one component".to_string(),
            ));
        }
        if time_courses.ncols() != k || singular_values.len() != k {
            return Err(MapError::ShapeMismatch(format!(
                "components disagree: loadings k={}, time-courses k={}, singular values k={}",
                k,
                time_courses.ncols(),
                singular_values.len()
            )));
        }
        Ok(Self {
            time_courses,
            loadings,
            singular_values,
        })
    }

    /// Rebuild loadings from an activity matrix and fixed time-courses.
    ///
    /// `U = X V`, then each column is divided by its norm, which becomes the
    /// singular value for that component.
    ///
    /// # Errors
    /// - `ShapeMismatch` if `activity` has a different number of timepoints than `time_courses`
    pub fn from_time_courses(
        activity: ArrayView2<f32>,
        time_courses: Array2<f32>,
    ) -> MapResult<Self> {
        if activity.ncols() != time_courses.nrows() {
            return Err(MapError::ShapeMismatch(format!(
                "activity has {} timepoints, time-courses have {}",
                activity.ncols(),
                time_courses.nrows()
            )));
        }
        let mut loadings = activity.dot(&time_courses);
        let singular_values = loadings.map_axis(Axis(0), |col| col.dot(&col).sqrt());
        for (mut col, &s) in loadings.axis_iter_mut(Axis(1)).zip(singular_values.iter()) {
            if s > f32::EPSILON {
                col /= s;
            }
        }
        Self::new(time_courses, loadings, singular_values)
    }

    /// Number of neurons (rows of U).
    pub fn n_neurons(&self) -> usize {
        self.loadings.nrows()
    }

    /// Number of timepoints (rows of V).
    pub fn n_time(&self) -> usize {
        self.time_courses.nrows()
    }

    /// Number of retained components k.
    pub fn n_components(&self) -> usize {
        self.loadings.ncols()
    }

    /// Loadings scaled by the singular values: `U diag(s)`.
    pub fn scaled_loadings(&self) -> Array2<f32> {
        &self.loadings * &self.singular_values.view().insert_axis(Axis(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_relu_and_derivative() {
        let x = array![[-1.0, 0.0, 2.0]];
        assert_eq!(ReluActivation.apply_matrix(&x), array![[0.0, 0.0, 2.0]]);
        assert_eq!(ReluActivation.derivative_matrix(&x), array![[0.0, 0.0, 1.0]]);
        assert_eq!(activation_for(false).name(), "identity");
    }

    #[test]
    fn test_components_shape_check() {
        let v = Array2::<f32>::zeros((10, 2));
        let u = Array2::<f32>::zeros((4, 3));
        let s = Array1::<f32>::ones(2);
        assert!(matches!(
            SingularComponents::new(v, u, s),
            Err(MapError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_from_time_courses_unit_columns() {
        let x = array![[1.0, 0.0, -1.0], [2.0, 0.0, -2.0], [0.0, 1.0, 0.0]];
        let v = array![[1.0], [0.0], [-1.0]] / 2f32.sqrt();
        let comps = SingularComponents::from_time_courses(x.view(), v).expect("components");
        let norm: f32 = comps.loadings.column(0).iter().map(|u| u * u).sum();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((comps.singular_values[0] - 10f32.sqrt()).abs() < 1e-4);
        assert_eq!(comps.n_neurons(), 3);
    }
}

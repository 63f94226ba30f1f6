//! Ridge regression from behavioural features to neural components.
//!
//! ```text
//! (XᵀX + λI) A = XᵀY        X: T × p, Y: T × k, A: p × k
//! Ŷ = X A
//! ```
//!
//! Variance explained is measured against the raw sum of squares of the targets,
//! which are z-scored components with zero mean:
//! ```text
//! ve_j    = 1 - Σ_t (Y_tj - Ŷ_tj)² / Σ_t Y_tj²
//! ve_all  = 1 - Σ_tj (Y - Ŷ)²     / Σ_tj Y²
//! ```
//! The overall value sums residuals and totals over every column before dividing,
//! so high-variance components dominate it.

use crate::core::{MapError, MapResult};
use crate::linalg::cholesky_solve;
use crate::split::SplitMask;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Fitted ridge weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearPredictor {
    weights: Array2<f32>,
    ridge_lambda: f32,
}

/// Held-out evaluation of a [`LinearPredictor`].
#[derive(Debug, Clone)]
pub struct RegressionReport {
    /// Predictions for every timepoint (train and test), T × k
    pub predictions: Array2<f32>,
    /// Overall variance explained on the test timepoints
    pub variance_explained: f32,
    /// Per-column variance explained on the test timepoints
    pub variance_explained_per_column: Array1<f32>,
}

impl LinearPredictor {
    /// Solve the regularised normal equations.
    ///
    /// # Errors
    /// - `InvalidInput` if `ridge_lambda` is negative or not finite, or X is empty
    /// - `ShapeMismatch` if X and Y have different numbers of timepoints
    /// - `NumericalInstability` if `XᵀX + λI` is singular to working precision
    pub fn fit(x: ArrayView2<f32>, y: ArrayView2<f32>, ridge_lambda: f32) -> MapResult<Self> {
        if !(ridge_lambda.is_finite() && ridge_lambda >= 0.0) {
            return Err(MapError::InvalidInput(format!(
                "ridge_lambda must be finite and >= 0, got {ridge_lambda}"
            )));
        }
        if x.nrows() != y.nrows() {
            return Err(MapError::ShapeMismatch(format!(
                "X has {} timepoints, Y has {}",
                x.nrows(),
                y.nrows()
            )));
        }
        if x.is_empty() || y.ncols() == 0 {
            return Err(MapError::InvalidInput("empty regression problem".to_string()));
        }

        let p = x.ncols();
        let mut gram = x.t().dot(&x);
        for i in 0..p {
            gram[[i, i]] += ridge_lambda;
        }
        let cross = x.t().dot(&y);
        let weights = cholesky_solve(&gram, &cross)?;

        Ok(Self {
            weights,
            ridge_lambda,
        })
    }

    /// Fit on the train timepoints of `mask` and score on its test timepoints.
    ///
    /// # Errors
    /// - Same as [`Self::fit`]; `ShapeMismatch` if the mask length differs from T
    pub fn fit_split(
        x: ArrayView2<f32>,
        y: ArrayView2<f32>,
        mask: &SplitMask,
        ridge_lambda: f32,
    ) -> MapResult<(Self, RegressionReport)> {
        if mask.len() != x.nrows() || mask.len() != y.nrows() {
            return Err(MapError::ShapeMismatch(format!(
                "mask covers {} timepoints, X has {}, Y has {}",
                mask.len(),
                x.nrows(),
                y.nrows()
            )));
        }
        let train = mask.train_indices();
        let test = mask.test_indices();

        let model = Self::fit(
            x.select(Axis(0), &train).view(),
            y.select(Axis(0), &train).view(),
            ridge_lambda,
        )?;
        let predictions = model.predict(x)?;

        let y_test = y.select(Axis(0), &test);
        let pred_test = predictions.select(Axis(0), &test);
        let report = RegressionReport {
            variance_explained: variance_explained(y_test.view(), pred_test.view()),
            variance_explained_per_column: variance_explained_per_column(
                y_test.view(),
                pred_test.view(),
            ),
            predictions,
        };
        info!(
            target: "neuromap::regression",
            lambda = ridge_lambda,
            variance_explained = report.variance_explained,
            "ridge regression evaluated"
        );
        Ok((model, report))
    }

    /// `X · A`.
    ///
    /// # Errors
    /// - `ShapeMismatch` if X does not have p columns
    pub fn predict(&self, x: ArrayView2<f32>) -> MapResult<Array2<f32>> {
        if x.ncols() != self.weights.nrows() {
            return Err(MapError::ShapeMismatch(format!(
                "model expects {} features, got {}",
                self.weights.nrows(),
                x.ncols()
            )));
        }
        Ok(x.dot(&self.weights))
    }

    /// Weight matrix A (p × k).
    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    pub fn ridge_lambda(&self) -> f32 {
        self.ridge_lambda
    }
}

/// Overall variance explained, residual and total sums pooled over all columns.
///
/// Returns 0 when the targets are identically zero.
pub fn variance_explained(y: ArrayView2<f32>, prediction: ArrayView2<f32>) -> f32 {
    let mut residual = 0.0f64;
    let mut total = 0.0f64;
    for (&a, &b) in y.iter().zip(prediction.iter()) {
        residual += f64::from(a - b).powi(2);
        total += f64::from(a).powi(2);
    }
    ratio(residual, total)
}

/// Variance explained of each column separately.
pub fn variance_explained_per_column(
    y: ArrayView2<f32>,
    prediction: ArrayView2<f32>,
) -> Array1<f32> {
    Array1::from_iter(
        y.axis_iter(Axis(1))
            .zip(prediction.axis_iter(Axis(1)))
            .map(|(col, pred)| {
                let mut residual = 0.0f64;
                let mut total = 0.0f64;
                for (&a, &b) in col.iter().zip(pred.iter()) {
                    residual += f64::from(a - b).powi(2);
                    total += f64::from(a).powi(2);
                }
                ratio(residual, total)
            }),
    )
}

fn ratio(residual: f64, total: f64) -> f32 {
    if total <= 0.0 {
        0.0
    } else {
        (1.0 - residual / total) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::TrainTestSplitter;
    use ndarray::array;

    fn design(t: usize) -> Array2<f32> {
        Array2::from_shape_fn((t, 3), |(i, j)| ((i * (j + 2)) as f32 * 0.17).sin() + j as f32 * 0.1)
    }

    #[test]
    fn test_recovers_exact_weights() {
        let x = design(80);
        let a_true = array![[1.0, -0.5], [0.25, 2.0], [-1.5, 0.0]];
        let y = x.dot(&a_true);
        let model = LinearPredictor::fit(x.view(), y.view(), 0.0).expect("fit");
        for (w, t) in model.weights().iter().zip(a_true.iter()) {
            assert!((w - t).abs() < 1e-3, "weight {w} vs {t}");
        }
        let pred = model.predict(x.view()).expect("predict");
        assert!((variance_explained(y.view(), pred.view()) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_overall_pools_sums() {
        // Column 0 has 100x the energy of column 1
        let y = array![[10.0, 0.1], [-10.0, -0.1]];
        let pred = array![[10.0, 0.0], [-10.0, 0.0]];
        let per = variance_explained_per_column(y.view(), pred.view());
        assert!((per[0] - 1.0).abs() < 1e-6);
        assert!(per[1].abs() < 1e-6);
        let overall = variance_explained(y.view(), pred.view());
        assert!(overall > 0.99, "pooled value {overall} should follow the big column");
    }

    #[test]
    fn test_fit_split_scores_test_only() {
        let x = design(200);
        let a_true = array![[0.5], [1.0], [-0.3]];
        let y = x.dot(&a_true);
        let mask = TrainTestSplitter.split(200, 5, 0.25).expect("split");
        let (_, report) = LinearPredictor::fit_split(x.view(), y.view(), &mask, 1e-4).expect("fit");
        assert_eq!(report.predictions.dim(), (200, 1));
        assert!(report.variance_explained > 0.999);
    }

    #[test]
    fn test_shape_errors() {
        let x = design(10);
        let y = Array2::<f32>::zeros((9, 2));
        assert!(matches!(
            LinearPredictor::fit(x.view(), y.view(), 1.0),
            Err(MapError::ShapeMismatch(_))
        ));
        assert!(LinearPredictor::fit(x.view(), x.view(), -1.0).is_err());
    }

    #[test]
    fn test_singular_system() {
        let x = Array2::<f32>::zeros((10, 3));
        let y = Array2::<f32>::ones((10, 1));
        assert!(matches!(
            LinearPredictor::fit(x.view(), y.view(), 0.0),
            Err(MapError::NumericalInstability(_))
        ));
    }
}

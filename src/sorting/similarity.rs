//! Time-lagged similarity between activity traces.
//!
//! Two groups of neurons driven by the same signal with a propagation delay are
//! weakly correlated at zero lag but strongly correlated at the right shift. The
//! similarity of a pair is therefore the maximum correlation over a window of lags:
//! ```text
//! c_ij(δ) = 1/(T-|δ|) Σ_t z_i[t] z_j[t+δ]      δ ∈ [-L, L]
//! S_ij    = max_δ c_ij(δ)
//! ```

use crate::core::{MapError, MapResult};
use crate::linalg::zscore_rows;
use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

/// Pairwise similarity of a set of traces, with the lag that achieved it.
#[derive(Debug, Clone)]
pub struct SimilarityStructure {
    /// Symmetric similarity matrix, unit diagonal
    pub matrix: Array2<f32>,
    /// `best_lag[[i, j]] = δ` means trace j best matches trace i shifted by δ samples;
    /// antisymmetric
    pub best_lag: Array2<i32>,
    /// Largest lag examined (L)
    pub max_lag: usize,
}

impl SimilarityStructure {
    /// Number of traces compared.
    pub fn len(&self) -> usize {
        self.matrix.nrows()
    }

    /// True if no traces were compared.
    pub fn is_empty(&self) -> bool {
        self.matrix.nrows() == 0
    }

    /// Reorder rows and columns so that row `p` describes trace `order[p]`.
    pub fn permuted(&self, order: &[usize]) -> Self {
        let n = order.len();
        let matrix = Array2::from_shape_fn((n, n), |(p, q)| self.matrix[[order[p], order[q]]]);
        let best_lag = Array2::from_shape_fn((n, n), |(p, q)| self.best_lag[[order[p], order[q]]]);
        Self {
            matrix,
            best_lag,
            max_lag: self.max_lag,
        }
    }
}

/// Lags in examination order: 0, -1, +1, -2, +2, ...
///
/// A later lag must be strictly better to win, so ties go to the smallest |δ| and
/// then to the negative shift.
fn lag_sequence(max_lag: usize) -> Vec<i32> {
    let mut lags = vec![0i32];
    for l in 1..=max_lag as i32 {
        lags.push(-l);
        lags.push(l);
    }
    lags
}

/// Correlation of two z-scored traces with `b` shifted by `lag` samples.
fn lagged_correlation(a: ArrayView1<f32>, b: ArrayView1<f32>, lag: i32) -> f32 {
    let t = a.len();
    let shift = lag.unsigned_abs() as usize;
    if shift >= t {
        return 0.0;
    }
    let overlap = t - shift;
    let sum: f32 = if lag >= 0 {
        (0..overlap).map(|i| a[i] * b[i + shift]).sum()
    } else {
        (0..overlap).map(|i| a[i + shift] * b[i]).sum()
    };
    sum / overlap as f32
}

/// Maximum-over-lags correlation between every pair of rows of `traces` (n × T).
///
/// Rows are z-scored internally.
///
/// # Errors
/// - `InvalidInput` if `max_lag` is not smaller than the number of timepoints
pub fn lagged_similarity(
    traces: ArrayView2<f32>,
    max_lag: usize,
) -> MapResult<SimilarityStructure> {
    let (n, t) = traces.dim();
    if max_lag >= t {
        return Err(MapError::InvalidInput(format!(
            "time_lag_window ({max_lag}) must be smaller than the number of timepoints ({t})"
        )));
    }

    let z = zscore_rows(traces);
    let lags = lag_sequence(max_lag);

    let upper: Vec<Vec<(f32, i32)>> = (0..n)
        .into_par_iter()
        .map(|i| {
            ((i + 1)..n)
                .map(|j| {
                    let mut best = (f32::NEG_INFINITY, 0i32);
                    for &lag in &lags {
                        let c = lagged_correlation(z.row(i), z.row(j), lag);
                        if c > best.0 {
                            best = (c, lag);
                        }
                    }
                    best
                })
                .collect()
        })
        .collect();

    let mut matrix = Array2::<f32>::eye(n);
    let mut best_lag = Array2::<i32>::zeros((n, n));
    for (i, row) in upper.into_iter().enumerate() {
        for (offset, (c, lag)) in row.into_iter().enumerate() {
            let j = i + 1 + offset;
            matrix[[i, j]] = c;
            matrix[[j, i]] = c;
            best_lag[[i, j]] = lag;
            best_lag[[j, i]] = -lag;
        }
    }

    Ok(SimilarityStructure {
        matrix,
        best_lag,
        max_lag,
    })
}

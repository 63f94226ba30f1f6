//! Truncated SVD of an activity matrix.
//!
//! Both engines only need the top few singular components of an N × T recording, so
//! the reduction is a seam ([`DimensionalityReducer`]) with one seeded default
//! implementation based on randomized subspace iteration.
//!
//! ## Algorithm
//!
//! ```text
//! Q ← orth(randn(T, k + p))
//! repeat q times:  Q ← orth(Xᵀ orth(X Q))
//! B = X Q,  Bᵀ B = W Λ Wᵀ
//! V = Q W[:, :k],  U = X V / ‖X V‖
//! ```

use crate::core::{MapError, MapResult, SingularComponents};
use crate::linalg::{orthonormalize_columns, symmetric_eigen};
use ndarray::{s, Array2, ArrayView2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Projects an N × T matrix onto its top-k singular components.
pub trait DimensionalityReducer {
    /// Compute at most `n_components` components of `activity`.
    ///
    /// # Errors
    /// - `InvalidInput` on an empty matrix or `n_components == 0`
    fn reduce(
        &self,
        activity: ArrayView2<f32>,
        n_components: usize,
    ) -> MapResult<SingularComponents>;
}

/// Randomized subspace-iteration SVD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubspaceSvd {
    /// Number of power iterations (sharpens the spectrum). Default 4.
    pub n_power_iter: usize,
    /// Extra random directions beyond k. Default 10.
    pub oversample: usize,
    /// Seed for the random starting subspace. Default 0.
    pub seed: u64,
}

impl Default for SubspaceSvd {
    fn default() -> Self {
        Self {
            n_power_iter: 4,
            oversample: 10,
            seed: 0,
        }
    }
}

impl DimensionalityReducer for SubspaceSvd {
    fn reduce(
        &self,
        activity: ArrayView2<f32>,
        n_components: usize,
    ) -> MapResult<SingularComponents> {
        let (n, t) = activity.dim();
        if n == 0 || t == 0 {
            return Err(MapError::InvalidInput(format!(
                "cannot decompose an empty {n}x{t} matrix"
            )));
        }
        if n_components == 0 {
            return Err(MapError::InvalidInput(
                "n_components must be at least 1".to_string(),
            ));
        }

        let k = n_components.min(n).min(t);
        if k < n_components {
            debug!(
                target: "neuromap::reduce",
                requested = n_components,
                k,
                "clamped component count"
            );
        }
        let width = (k + self.oversample).min(n).min(t);

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut q: Array2<f32> = Array2::random_using((t, width), StandardNormal, &mut rng);
        orthonormalize_columns(&mut q);

        for _ in 0..self.n_power_iter {
            let mut y = activity.dot(&q);
            orthonormalize_columns(&mut y);
            q = activity.t().dot(&y);
            orthonormalize_columns(&mut q);
        }

        let b = activity.dot(&q);
        let gram = b.t().dot(&b);
        let (_, w) = symmetric_eigen(&gram)?;
        let mut v = q.dot(&w.slice(s![.., ..k]));

        // Sign convention: largest-magnitude entry of every time-course is positive.
        for mut col in v.axis_iter_mut(Axis(1)) {
            let peak = col
                .iter()
                .copied()
                .fold(0.0f32, |best, x| if x.abs() > best.abs() { x } else { best });
            if peak < 0.0 {
                col.mapv_inplace(|x| -x);
            }
        }

        SingularComponents::from_time_courses(activity, v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    /// Rank-2 matrix with well separated singular values.
    fn rank_two(n: usize, t: usize) -> Array2<f32> {
        let a = Array1::from_shape_fn(t, |i| (i as f32 * 0.3).sin());
        let b = Array1::from_shape_fn(t, |i| (i as f32 * 0.11).cos());
        Array2::from_shape_fn((n, t), |(r, c)| {
            3.0 * (r as f32 * 0.7).cos() * a[c] + 0.5 * (r as f32 * 0.2).sin() * b[c]
        })
    }

    #[test]
    fn test_reduce_recovers_rank_two() {
        let x = rank_two(30, 80);
        let comps = SubspaceSvd::default().reduce(x.view(), 2).expect("svd");
        assert_eq!(comps.n_components(), 2);
        assert!(comps.singular_values[0] >= comps.singular_values[1]);

        let recon = comps.scaled_loadings().dot(&comps.time_courses.t());
        let err: f32 = (&recon - &x).iter().map(|e| e * e).sum();
        let total: f32 = x.iter().map(|e| e * e).sum();
        assert!(err / total < 1e-4, "relative reconstruction error {}", err / total);
    }

    #[test]
    fn test_reduce_clamps_components() {
        let x = rank_two(3, 20);
        let comps = SubspaceSvd::default().reduce(x.view(), 10).expect("svd");
        assert_eq!(comps.n_components(), 3);
    }

    #[test]
    fn test_reduce_is_seeded() {
        let x = rank_two(20, 40);
        let a = SubspaceSvd::default().reduce(x.view(), 2).expect("svd");
        let b = SubspaceSvd::default().reduce(x.view(), 2).expect("svd");
        assert_eq!(a.time_courses, b.time_courses);
    }

    #[test]
    fn test_reduce_rejects_empty() {
        let x = Array2::<f32>::zeros((0, 5));
        assert!(SubspaceSvd::default().reduce(x.view(), 1).is_err());
    }
}

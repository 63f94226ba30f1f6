//! Small dense linear-algebra kernels on `ndarray`.
//!
//! Everything here operates on matrices whose smaller side is at most a few hundred
//! (normal equations, cluster similarity matrices, subspace projections), so plain
//! O(n³) routines are used. Accumulation happens in `f64`. Symmetric
//! eigen-decomposition goes through `nalgebra`.

use crate::core::{MapError, MapResult};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Iteration cap for the implicit QR eigen solver.
const MAX_EIGEN_ITERATIONS: usize = 10_000;

/// Relative pivot threshold below which a Cholesky factorisation is rejected.
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Solve `A X = B` for symmetric positive-definite `A` via Cholesky factorisation.
///
/// # Errors
/// - `ShapeMismatch` if `A` is not square or `B` has a different row count
/// - `NumericalInstability` if a pivot falls below working precision
pub fn cholesky_solve(a: &Array2<f32>, b: &Array2<f32>) -> MapResult<Array2<f32>> {
    let n = a.nrows();
    if a.ncols() != n || b.nrows() != n {
        return Err(MapError::ShapeMismatch(format!(
            "cholesky_solve: A is {:?}, B is {:?}",
            a.dim(),
            b.dim()
        )));
    }

    let scale = a.diag().iter().fold(0.0f64, |m, &d| m.max(f64::from(d).abs()));
    if scale == 0.0 {
        return Err(MapError::NumericalInstability(
            "system matrix is identically zero".to_string(),
        ));
    }

    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut d = f64::from(a[[j, j]]);
        for k in 0..j {
            d -= l[[j, k]] * l[[j, k]];
        }
        if !(d > scale * PIVOT_TOLERANCE) {
            return Err(MapError::NumericalInstability(format!(
                "matrix is singular to working precision (pivot {j} = {d:e})"
            )));
        }
        let ljj = d.sqrt();
        l[[j, j]] = ljj;
        for i in (j + 1)..n {
            let mut s = f64::from(a[[i, j]]);
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / ljj;
        }
    }

    let mut x = Array2::<f32>::zeros(b.dim());
    for (col_idx, rhs) in b.axis_iter(Axis(1)).enumerate() {
        // Forward: L y = b
        let mut y = vec![0.0f64; n];
        for i in 0..n {
            let mut s = f64::from(rhs[i]);
            for k in 0..i {
                s -= l[[i, k]] * y[k];
            }
            y[i] = s / l[[i, i]];
        }
        // Backward: Lᵀ x = y
        let mut sol = vec![0.0f64; n];
        for i in (0..n).rev() {
            let mut s = y[i];
            for k in (i + 1)..n {
                s -= l[[k, i]] * sol[k];
            }
            sol[i] = s / l[[i, i]];
        }
        for (i, v) in sol.into_iter().enumerate() {
            x[[i, col_idx]] = v as f32;
        }
    }
    Ok(x)
}

/// Eigen-decomposition of a symmetric matrix.
///
/// Returns eigenvalues in non-increasing order and the matching unit eigenvectors as
/// columns. Equal eigenvalues keep the order nalgebra reports them in.
///
/// # Errors
/// - `ShapeMismatch` if `a` is not square
/// - `NumericalInstability` if `a` has non-finite entries or the QR iteration does not
///   converge
pub fn symmetric_eigen(a: &Array2<f32>) -> MapResult<(Array1<f32>, Array2<f32>)> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(MapError::ShapeMismatch(format!(
            "symmetric_eigen: matrix is {:?}",
            a.dim()
        )));
    }
    if n == 0 {
        return Ok((Array1::zeros(0), Array2::zeros((0, 0))));
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(MapError::NumericalInstability(
            "symmetric_eigen: matrix has non-finite entries".to_string(),
        ));
    }

    let m = DMatrix::from_fn(n, n, |i, j| f64::from(a[[i, j]]));
    let eigen = SymmetricEigen::try_new(m, f64::EPSILON, MAX_EIGEN_ITERATIONS).ok_or_else(|| {
        MapError::NumericalInstability(format!(
            "symmetric_eigen: no convergence within {MAX_EIGEN_ITERATIONS} iterations"
        ))
    })?;

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| eigen.eigenvalues[j].total_cmp(&eigen.eigenvalues[i]));

    let values = Array1::from_iter(order.iter().map(|&i| eigen.eigenvalues[i] as f32));
    let vectors = Array2::from_shape_fn((n, n), |(k, dst)| {
        eigen.eigenvectors[(k, order[dst])] as f32
    });
    Ok((values, vectors))
}

/// Orthonormalise the columns of `m` in place (modified Gram-Schmidt, two passes).
///
/// Columns that are numerically dependent on earlier ones are set to zero.
pub fn orthonormalize_columns(m: &mut Array2<f32>) {
    let k = m.ncols();
    for _ in 0..2 {
        for j in 0..k {
            for i in 0..j {
                let proj = m.column(i).dot(&m.column(j));
                let qi = m.column(i).to_owned();
                m.column_mut(j).scaled_add(-proj, &qi);
            }
            let norm = m.column(j).dot(&m.column(j)).sqrt();
            if norm > 1e-6 {
                m.column_mut(j).mapv_inplace(|x| x / norm);
            } else {
                m.column_mut(j).fill(0.0);
            }
        }
    }
}

/// Z-score each row: zero mean, unit (population) standard deviation.
///
/// Constant rows become all zeros.
pub fn zscore_rows(x: ArrayView2<f32>) -> Array2<f32> {
    let mut out = x.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let n = row.len().max(1) as f32;
        let mean = row.sum() / n;
        row.mapv_inplace(|v| v - mean);
        let std = (row.dot(&row) / n).sqrt();
        if std > f32::EPSILON {
            row.mapv_inplace(|v| v / std);
        } else {
            row.fill(0.0);
        }
    }
    out
}

/// Scale each row to unit L2 norm. Zero rows stay zero.
pub fn normalize_rows(x: ArrayView2<f32>) -> Array2<f32> {
    let mut out = x.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > f32::EPSILON {
            row.mapv_inplace(|v| v / norm);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_cholesky_solve_spd() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let b = array![[1.0], [2.0]];
        let x = cholesky_solve(&a, &b).expect("solve");
        let back = a.dot(&x);
        for (p, q) in back.iter().zip(b.iter()) {
            assert!((p - q).abs() < 1e-5);
        }
    }

    #[test]
    fn test_cholesky_rejects_singular() {
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        let b = array![[1.0], [1.0]];
        assert!(matches!(
            cholesky_solve(&a, &b),
            Err(MapError::NumericalInstability(_))
        ));
    }

    #[test]
    fn test_symmetric_eigen_reconstructs() {
        let a = array![[2.0, 1.0, 0.0], [1.0, 2.0, 0.0], [0.0, 0.0, 5.0]];
        let (vals, vecs) = symmetric_eigen(&a).expect("eigen");
        assert!((vals[0] - 5.0).abs() < 1e-5);
        assert!((vals[1] - 3.0).abs() < 1e-5);
        assert!((vals[2] - 1.0).abs() < 1e-5);

        let recon = vecs.dot(&Array2::from_diag(&vals)).dot(&vecs.t());
        for (p, q) in recon.iter().zip(a.iter()) {
            assert!((p - q).abs() < 1e-4, "reconstruction off: {p} vs {q}");
        }
    }

    #[test]
    fn test_symmetric_eigen_orthonormal_and_sorted() {
        let a = Array2::from_shape_fn((6, 6), |(i, j)| 1.0 / (1.0 + i.abs_diff(j) as f32));
        let (vals, vecs) = symmetric_eigen(&a).expect("eigen");
        assert!(vals.windows(2).into_iter().all(|w| w[0] >= w[1]), "not sorted: {vals}");
        let gram = vecs.t().dot(&vecs);
        for ((i, j), g) in gram.indexed_iter() {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert!((g - expected).abs() < 1e-4, "gram[{i},{j}] = {g}");
        }
    }

    #[test]
    fn test_symmetric_eigen_rejects_bad_input() {
        assert!(matches!(
            symmetric_eigen(&Array2::zeros((2, 3))),
            Err(MapError::ShapeMismatch(_))
        ));
        let a = array![[1.0, f32::NAN], [f32::NAN, 1.0]];
        assert!(matches!(
            symmetric_eigen(&a),
            Err(MapError::NumericalInstability(_))
        ));
    }

    #[test]
    fn test_orthonormalize_columns() {
        let mut m = array![[1.0, 1.0], [0.0, 1.0], [0.0, 0.0]];
        orthonormalize_columns(&mut m);
        let gram = m.t().dot(&m);
        assert!((gram[[0, 0]] - 1.0).abs() < 1e-5);
        assert!((gram[[1, 1]] - 1.0).abs() < 1e-5);
        assert!(gram[[0, 1]].abs() < 1e-5);
    }

    #[test]
    fn test_zscore_rows_constant_row() {
        let x = array![[1.0, 2.0, 3.0], [4.0, 4.0, 4.0]];
        let z = zscore_rows(x.view());
        assert!(z.row(0).sum().abs() < 1e-5);
        assert!(z.row(1).iter().all(|&v| v == 0.0));
    }
}

//! Upsampling of the sorted cluster scaffold to single-neuron resolution.
//!
//! Consecutive sorted centroids are joined by straight lines in loading space and
//! sampled `factor` times per segment. Every neuron is then placed at the node it
//! correlates with best, which orders neurons inside a cluster by how far they lean
//! towards the neighbouring clusters.

use crate::linalg::normalize_rows;
use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;

/// Linearly interpolate `(n - 1) * factor + 1` nodes through the rows of `sorted_centroids`.
pub fn upsample_nodes(sorted_centroids: ArrayView2<f32>, factor: usize) -> Array2<f32> {
    let (n, k) = sorted_centroids.dim();
    let factor = factor.max(1);
    if n <= 1 {
        return sorted_centroids.to_owned();
    }
    let n_nodes = (n - 1) * factor + 1;
    let mut nodes = Array2::<f32>::zeros((n_nodes, k));
    for node in 0..n_nodes {
        let seg = (node / factor).min(n - 2);
        let frac = (node - seg * factor) as f32 / factor as f32;
        let a = sorted_centroids.row(seg);
        let b = sorted_centroids.row(seg + 1);
        let mut row = nodes.row_mut(node);
        row.assign(&a);
        row *= 1.0 - frac;
        row.scaled_add(frac, &b);
    }
    nodes
}

/// Continuous position of every neuron along the node chain, in cluster units.
///
/// Position = (index of the best-correlated node) / `factor`; ties go to the
/// earliest node.
pub fn assign_positions(
    features: ArrayView2<f32>,
    nodes: &Array2<f32>,
    factor: usize,
) -> Array1<f32> {
    let factor = factor.max(1) as f32;
    let unit_nodes = normalize_rows(nodes.view());
    let unit_features = normalize_rows(features);
    let positions: Vec<f32> = (0..unit_features.nrows())
        .into_par_iter()
        .map(|i| {
            let scores = unit_nodes.dot(&unit_features.row(i));
            let mut best = (0usize, f32::NEG_INFINITY);
            for (node, &s) in scores.iter().enumerate() {
                if s > best.1 {
                    best = (node, s);
                }
            }
            best.0 as f32 / factor
        })
        .collect();
    Array1::from(positions)
}

/// Neuron indices sorted by position, ties by index.
pub fn order_by_position(positions: &Array1<f32>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..positions.len()).collect();
    order.sort_by(|&a, &b| positions[a].total_cmp(&positions[b]).then(a.cmp(&b)));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_upsample_endpoints_and_midpoints() {
        let centroids = array![[1.0, 0.0], [0.0, 1.0], [-1.0, 0.0]];
        let nodes = upsample_nodes(centroids.view(), 4);
        assert_eq!(nodes.nrows(), 9);
        assert_eq!(nodes.row(0), centroids.row(0));
        assert_eq!(nodes.row(4), centroids.row(1));
        assert_eq!(nodes.row(8), centroids.row(2));
        assert!((nodes[[2, 0]] - 0.5).abs() < 1e-6);
        assert!((nodes[[2, 1]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_positions_follow_direction() {
        let centroids = array![[1.0, 0.0], [0.0, 1.0]];
        let nodes = upsample_nodes(centroids.view(), 10);
        let features = array![[0.0, 2.0], [3.0, 0.1], [1.0, 1.0]];
        let pos = assign_positions(features.view(), &nodes, 10);
        assert!(pos[1] < pos[2] && pos[2] < pos[0]);
        assert_eq!(order_by_position(&pos), vec![1, 2, 0]);
    }

    #[test]
    fn test_single_centroid() {
        let centroids = array![[1.0, 2.0]];
        let nodes = upsample_nodes(centroids.view(), 10);
        assert_eq!(nodes.nrows(), 1);
        let pos = assign_positions(array![[1.0, 0.0], [0.0, 1.0]].view(), &nodes, 10);
        assert_eq!(pos, array![0.0, 0.0]);
    }
}

//! Spherical k-means used as the coarse scaffold of the embedding.
//!
//! Neurons are compared by the cosine of their (scaled) loading vectors, which for
//! z-scored activity is the correlation of their low-rank reconstructions.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

/// Cluster labels and unit-norm centroids.
#[derive(Debug, Clone)]
pub struct KMeans {
    /// `labels[i]` is the cluster of neuron `i`
    pub labels: Vec<usize>,
    /// Unit-norm centroids, one row per cluster
    pub centroids: Array2<f32>,
    /// Iterations run before labels stopped changing
    pub iterations: usize,
}

/// Cluster unit-norm `features` (N × k) into `n_clusters` groups.
///
/// # Algorithm
/// 1. Rank neurons by `init_key` (ties by index) and cut the ranking into
///    `n_clusters` equal-size runs: the initial labels
/// 2. Centroid = normalised mean of members
/// 3. Reassign every neuron to the centroid with maximal cosine (ties: lowest cluster)
/// 4. Re-seed any empty cluster with the worst-fitting neuron
/// 5. Repeat 2-4 until labels are stable or `max_iter` is reached
///
/// With `n_clusters >= N` every neuron is its own cluster.
pub fn spherical_kmeans(
    features: ArrayView2<f32>,
    init_key: ArrayView1<f32>,
    n_clusters: usize,
    max_iter: usize,
) -> KMeans {
    let n = features.nrows();
    let n_clusters = n_clusters.clamp(1, n.max(1));

    if n_clusters >= n {
        return KMeans {
            labels: (0..n).collect(),
            centroids: features.to_owned(),
            iterations: 0,
        };
    }

    let mut ranked: Vec<usize> = (0..n).collect();
    ranked.sort_by(|&a, &b| init_key[a].total_cmp(&init_key[b]).then(a.cmp(&b)));
    let mut labels = vec![0usize; n];
    for (rank, &neuron) in ranked.iter().enumerate() {
        labels[neuron] = rank * n_clusters / n;
    }

    let mut centroids = compute_centroids(features, &labels, n_clusters);
    let mut iterations = 0;

    for iter in 0..max_iter {
        iterations = iter + 1;
        let assigned: Vec<(usize, f32)> = (0..n)
            .into_par_iter()
            .map(|i| best_centroid(features.row(i), &centroids))
            .collect();

        let mut new_labels: Vec<usize> = assigned.iter().map(|&(c, _)| c).collect();
        reseed_empty(&mut new_labels, &assigned, n_clusters);

        let changed = new_labels != labels;
        labels = new_labels;
        centroids = compute_centroids(features, &labels, n_clusters);
        if !changed {
            break;
        }
    }

    KMeans {
        labels,
        centroids,
        iterations,
    }
}

/// Index and cosine of the closest centroid (first maximum wins).
fn best_centroid(row: ArrayView1<f32>, centroids: &Array2<f32>) -> (usize, f32) {
    let mut best = (0usize, f32::NEG_INFINITY);
    for (c, centroid) in centroids.axis_iter(Axis(0)).enumerate() {
        let score = row.dot(&centroid);
        if score > best.1 {
            best = (c, score);
        }
    }
    best
}

/// Move the worst-fitting neurons into clusters that lost all members.
fn reseed_empty(labels: &mut [usize], assigned: &[(usize, f32)], n_clusters: usize) {
    let mut counts = vec![0usize; n_clusters];
    for &l in labels.iter() {
        counts[l] += 1;
    }

    let mut by_fit: Vec<usize> = (0..labels.len()).collect();
    by_fit.sort_by(|&a, &b| assigned[a].1.total_cmp(&assigned[b].1).then(a.cmp(&b)));
    let mut candidates = by_fit.into_iter();

    for c in 0..n_clusters {
        if counts[c] > 0 {
            continue;
        }
        // Take the next worst-fitting neuron whose cluster can spare it
        for neuron in candidates.by_ref() {
            let from = labels[neuron];
            if counts[from] > 1 {
                counts[from] -= 1;
                labels[neuron] = c;
                counts[c] = 1;
                break;
            }
        }
    }
}

/// Normalised member means, one row per cluster.
fn compute_centroids(
    features: ArrayView2<f32>,
    labels: &[usize],
    n_clusters: usize,
) -> Array2<f32> {
    let mut centroids = Array2::<f32>::zeros((n_clusters, features.ncols()));
    for (row, &l) in features.axis_iter(Axis(0)).zip(labels.iter()) {
        let mut c = centroids.row_mut(l);
        c += &row;
    }
    for mut c in centroids.axis_iter_mut(Axis(0)) {
        let norm = c.dot(&c).sqrt();
        if norm > f32::EPSILON {
            c /= norm;
        }
    }
    centroids
}

/// Mean of `values` rows per cluster label.
pub fn cluster_means(values: ArrayView2<f32>, labels: &[usize], n_clusters: usize) -> Array2<f32> {
    let mut sums = Array2::<f32>::zeros((n_clusters, values.ncols()));
    let mut counts = Array1::<f32>::zeros(n_clusters);
    for (row, &l) in values.axis_iter(Axis(0)).zip(labels.iter()) {
        let mut s = sums.row_mut(l);
        s += &row;
        counts[l] += 1.0;
    }
    for (mut s, &count) in sums.axis_iter_mut(Axis(0)).zip(counts.iter()) {
        if count > 0.0 {
            s /= count;
        }
    }
    sums
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::normalize_rows;
    use ndarray::array;

    #[test]
    fn test_kmeans_separates_directions() {
        let raw = array![
            [1.0, 0.1],
            [0.0, 1.0],
            [1.0, 0.0],
            [0.1, 1.0],
            [0.9, 0.05],
            [0.05, 0.9]
        ];
        let features = normalize_rows(raw.view());
        let key = raw.column(1).to_owned();
        let km = spherical_kmeans(features.view(), key.view(), 2, 10);
        assert_eq!(km.labels[0], km.labels[2]);
        assert_eq!(km.labels[0], km.labels[4]);
        assert_eq!(km.labels[1], km.labels[3]);
        assert_ne!(km.labels[0], km.labels[1]);
    }

    #[test]
    fn test_kmeans_one_neuron_per_cluster() {
        let features = normalize_rows(array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]].view());
        let key = features.column(0).to_owned();
        let km = spherical_kmeans(features.view(), key.view(), 10, 5);
        assert_eq!(km.labels, vec![0, 1, 2]);
    }

    #[test]
    fn test_no_cluster_left_empty() {
        // All neurons identical: assignment collapses onto one centroid
        let features = normalize_rows(Array2::<f32>::ones((6, 3)).view());
        let key = Array1::from_iter((0..6).map(|i| i as f32));
        let km = spherical_kmeans(features.view(), key.view(), 3, 5);
        for c in 0..3 {
            assert!(km.labels.contains(&c), "cluster {c} is empty");
        }
    }

    #[test]
    fn test_cluster_means() {
        let values = array![[1.0, 2.0], [3.0, 4.0], [10.0, 10.0]];
        let means = cluster_means(values.view(), &[0, 0, 1], 2);
        assert_eq!(means, array![[2.0, 3.0], [10.0, 10.0]]);
    }
}

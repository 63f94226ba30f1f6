//! Contiguous clustering of an ordered sequence of neurons.
//!
//! Given a 1-D ordering, the aggregator cuts it into `n_clusters` contiguous runs.
//! Boundaries start at equal spacing and are then moved one at a time to the position
//! that minimises the dissimilarity of the two runs they separate, until no boundary
//! moves. Only strict improvements move a boundary, so among equally good cuts the
//! one closest to equal spacing is kept.
//!
//! The dissimilarity of a run is pluggable through [`SegmentCost`]:
//! - [`SimilarityCost`]: sum of `1 - s_ij` over pairs in the run (full N × N matrix)
//! - [`FeatureCost`]: sum of squared deviations of feature rows from the run mean

use crate::core::{MapError, MapResult};
use crate::sorting::matching::is_permutation;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Dissimilarity of contiguous runs of an ordered sequence.
pub trait SegmentCost {
    /// Length of the ordered sequence.
    fn len(&self) -> usize;

    /// Cost of the run of positions `[start, end)`. Empty runs cost zero.
    fn cost(&self, start: usize, end: usize) -> f64;

    /// True if the sequence is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pairwise dissimilarity `1 - s_ij` summed over each run, via 2-D prefix sums.
#[derive(Debug, Clone)]
pub struct SimilarityCost {
    /// prefix[[i, j]] = Σ_{p<i, q<j} (1 - S[o_p, o_q]), diagonal excluded
    prefix: Array2<f64>,
}

impl SimilarityCost {
    /// Build from an ordering and an N × N similarity matrix indexed by neuron.
    pub fn new(ordering: &[usize], similarity: ArrayView2<f32>) -> Self {
        let n = ordering.len();
        let mut prefix = Array2::<f64>::zeros((n + 1, n + 1));
        for p in 0..n {
            for q in 0..n {
                let d = if p == q {
                    0.0
                } else {
                    1.0 - f64::from(similarity[[ordering[p], ordering[q]]])
                };
                prefix[[p + 1, q + 1]] =
                    d + prefix[[p, q + 1]] + prefix[[p + 1, q]] - prefix[[p, q]];
            }
        }
        Self { prefix }
    }
}

impl SegmentCost for SimilarityCost {
    fn len(&self) -> usize {
        self.prefix.nrows() - 1
    }

    fn cost(&self, start: usize, end: usize) -> f64 {
        if end <= start {
            return 0.0;
        }
        let p = &self.prefix;
        0.5 * (p[[end, end]] - p[[start, end]] - p[[end, start]] + p[[start, start]])
    }
}

/// Within-run sum of squared deviations of feature rows, via prefix sums.
#[derive(Debug, Clone)]
pub struct FeatureCost {
    /// prefix_sum[[i, :]] = Σ_{p<i} x[o_p]
    prefix_sum: Array2<f64>,
    /// prefix_sq[i] = Σ_{p<i} |x[o_p]|²
    prefix_sq: Vec<f64>,
}

impl FeatureCost {
    /// Build from an ordering and N × k features indexed by neuron.
    pub fn new(ordering: &[usize], features: ArrayView2<f32>) -> Self {
        let n = ordering.len();
        let k = features.ncols();
        let mut prefix_sum = Array2::<f64>::zeros((n + 1, k));
        let mut prefix_sq = vec![0.0f64; n + 1];
        for (p, &neuron) in ordering.iter().enumerate() {
            let row = features.row(neuron);
            let mut sq = 0.0f64;
            for j in 0..k {
                let v = f64::from(row[j]);
                prefix_sum[[p + 1, j]] = prefix_sum[[p, j]] + v;
                sq += v * v;
            }
            prefix_sq[p + 1] = prefix_sq[p] + sq;
        }
        Self {
            prefix_sum,
            prefix_sq,
        }
    }
}

impl SegmentCost for FeatureCost {
    fn len(&self) -> usize {
        self.prefix_sq.len() - 1
    }

    fn cost(&self, start: usize, end: usize) -> f64 {
        if end <= start {
            return 0.0;
        }
        let len = (end - start) as f64;
        let mut mean_sq = 0.0f64;
        for j in 0..self.prefix_sum.ncols() {
            let s = self.prefix_sum[[end, j]] - self.prefix_sum[[start, j]];
            mean_sq += s * s;
        }
        (self.prefix_sq[end] - self.prefix_sq[start] - mean_sq / len).max(0.0)
    }
}

/// Mapping from neuron to cluster, contiguous under the ordering it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    /// `labels[neuron]` is the cluster of that neuron; clusters are numbered along the ordering
    pub labels: Vec<usize>,
    /// `runs[c]` is the range of ordering positions covered by cluster `c`
    pub runs: Vec<Range<usize>>,
}

impl ClusterAssignment {
    /// Build from an ordering and run boundaries `0 = b_0 < b_1 < ... < b_n = N`.
    pub fn from_boundaries(ordering: &[usize], boundaries: &[usize]) -> Self {
        let runs: Vec<Range<usize>> = boundaries.windows(2).map(|w| w[0]..w[1]).collect();
        let mut labels = vec![0usize; ordering.len()];
        for (c, run) in runs.iter().enumerate() {
            for &neuron in &ordering[run.clone()] {
                labels[neuron] = c;
            }
        }
        Self { labels, runs }
    }

    /// Number of clusters.
    pub fn n_clusters(&self) -> usize {
        self.runs.len()
    }

    /// Neurons of cluster `c`, in ordering order.
    pub fn members<'a>(&self, ordering: &'a [usize], c: usize) -> &'a [usize] {
        &ordering[self.runs[c].clone()]
    }

    /// True if every cluster occupies one contiguous run of `ordering`.
    pub fn is_contiguous_under(&self, ordering: &[usize]) -> bool {
        let mut last_seen = None;
        let mut closed = vec![false; self.n_clusters()];
        for &neuron in ordering {
            let c = self.labels[neuron];
            if last_seen != Some(c) {
                if closed[c] {
                    return false;
                }
                if let Some(prev) = last_seen {
                    closed[prev] = true;
                }
                last_seen = Some(c);
            }
        }
        true
    }
}

/// Cuts an ordered sequence into contiguous clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAggregator {
    /// Maximum passes over all boundaries. Default 100.
    pub max_sweeps: usize,
}

impl Default for ClusterAggregator {
    fn default() -> Self {
        Self { max_sweeps: 100 }
    }
}

impl ClusterAggregator {
    /// Partition `ordering` using an N × N similarity matrix indexed by neuron.
    ///
    /// `n_clusters` larger than N is clamped to N (one neuron per cluster).
    ///
    /// # Errors
    /// - `InvalidInput` if `ordering` is not a permutation, it is empty, or `n_clusters == 0`
    /// - `ShapeMismatch` if `similarity` is not N × N
    pub fn cluster(
        &self,
        ordering: &[usize],
        similarity: ArrayView2<f32>,
        n_clusters: usize,
    ) -> MapResult<ClusterAssignment> {
        let n = ordering.len();
        if similarity.dim() != (n, n) {
            return Err(MapError::ShapeMismatch(format!(
                "similarity is {:?}, ordering has {} neurons",
                similarity.dim(),
                n
            )));
        }
        validate(ordering, n_clusters)?;
        let cost = SimilarityCost::new(ordering, similarity);
        let boundaries = self.partition(&cost, n_clusters);
        Ok(ClusterAssignment::from_boundaries(ordering, &boundaries))
    }

    /// Partition `ordering` using N × k feature rows indexed by neuron.
    ///
    /// # Errors
    /// - `InvalidInput` if `ordering` is not a permutation, it is empty, or `n_clusters == 0`
    /// - `ShapeMismatch` if `features` does not have N rows
    pub fn cluster_features(
        &self,
        ordering: &[usize],
        features: ArrayView2<f32>,
        n_clusters: usize,
    ) -> MapResult<ClusterAssignment> {
        if features.nrows() != ordering.len() {
            return Err(MapError::ShapeMismatch(format!(
                "features have {} rows, ordering has {} neurons",
                features.nrows(),
                ordering.len()
            )));
        }
        validate(ordering, n_clusters)?;
        let cost = FeatureCost::new(ordering, features);
        let boundaries = self.partition(&cost, n_clusters);
        Ok(ClusterAssignment::from_boundaries(ordering, &boundaries))
    }

    /// Boundaries `0 = b_0 < ... < b_g = N` with `g = min(n_clusters, N)`.
    pub fn partition<C: SegmentCost>(&self, cost: &C, n_clusters: usize) -> Vec<usize> {
        let n = cost.len();
        let g = n_clusters.clamp(1, n.max(1));

        // Equal sizes, remainder to the earliest runs
        let mut bounds = Vec::with_capacity(g + 1);
        bounds.push(0);
        for c in 0..g {
            let size = n / g + usize::from(c < n % g);
            bounds.push(bounds[c] + size);
        }
        let targets = bounds.clone();

        for _ in 0..self.max_sweeps {
            let mut moved = false;
            for i in 1..g {
                let (lo, hi) = (bounds[i - 1], bounds[i + 1]);
                let mut best = bounds[i];
                let mut best_cost = cost.cost(lo, best) + cost.cost(best, hi);
                for p in (lo + 1)..hi {
                    if p == bounds[i] {
                        continue;
                    }
                    let c = cost.cost(lo, p) + cost.cost(p, hi);
                    let eps = 1e-9 * best_cost.abs().max(1.0);
                    let better = c < best_cost - eps;
                    let tie_closer = (c - best_cost).abs() <= eps
                        && p.abs_diff(targets[i]) < best.abs_diff(targets[i]);
                    if better || tie_closer {
                        best = p;
                        best_cost = c;
                    }
                }
                if best != bounds[i] {
                    bounds[i] = best;
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
        bounds
    }
}

fn validate(ordering: &[usize], n_clusters: usize) -> MapResult<()> {
    if ordering.is_empty() {
        return Err(MapError::InvalidInput("ordering is empty".to_string()));
    }
    if n_clusters == 0 {
        return Err(MapError::InvalidInput("n_clusters must be at least 1".to_string()));
    }
    if !is_permutation(ordering, ordering.len()) {
        return Err(MapError::InvalidInput(
            "ordering is not a permutation of the neuron indices".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_feature_cost_matches_direct_sse() {
        let features = array![[1.0, 0.0], [3.0, 0.0], [0.0, 2.0]];
        let cost = FeatureCost::new(&[0, 1, 2], features.view());
        // Rows 0,1: mean (2,0), SSE = 1 + 1
        assert!((cost.cost(0, 2) - 2.0).abs() < 1e-9);
        assert_eq!(cost.cost(1, 1), 0.0);
    }

    #[test]
    fn test_similarity_cost_block() {
        let sim = array![[1.0, 0.5, 0.0], [0.5, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let cost = SimilarityCost::new(&[0, 1, 2], sim.view());
        assert!((cost.cost(0, 2) - 0.5).abs() < 1e-9);
        assert!((cost.cost(0, 3) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_cluster_finds_block_boundary() {
        let ordering = vec![3, 1, 0, 2, 4, 5];
        // 3/3 split along the ordering: equal-size start is already optimal
        let group = [0, 0, 1, 0, 1, 1];
        let sim =
            Array2::from_shape_fn((6, 6), |(i, j)| if group[i] == group[j] { 1.0 } else { 0.0 });
        // 4/2 split: the boundary has to move
        let group2 = [0, 0, 0, 0, 1, 1];
        let sim2 =
            Array2::from_shape_fn((6, 6), |(i, j)| if group2[i] == group2[j] { 1.0 } else { 0.0 });

        let agg = ClusterAggregator::default();
        let a = agg.cluster(&ordering, sim.view(), 2).expect("cluster");
        assert_eq!(a.runs, vec![0..3, 3..6]);

        let b = agg.cluster(&ordering, sim2.view(), 2).expect("cluster");
        assert_eq!(b.runs, vec![0..4, 4..6]);
        assert!(b.is_contiguous_under(&ordering));
        assert_eq!(b.members(&ordering, 1), &[4, 5]);
    }

    #[test]
    fn test_cluster_clamps_to_one_per_neuron() {
        let ordering = vec![2, 0, 1];
        let features = array![[1.0], [2.0], [3.0]];
        let a = ClusterAggregator::default()
            .cluster_features(&ordering, features.view(), 10)
            .expect("cluster");
        assert_eq!(a.n_clusters(), 3);
        assert_eq!(a.labels, vec![1, 2, 0]);
    }

    #[test]
    fn test_cluster_ties_stay_equal_sized() {
        let ordering: Vec<usize> = (0..8).collect();
        let features = Array2::<f32>::ones((8, 2));
        let a = ClusterAggregator::default()
            .cluster_features(&ordering, features.view(), 4)
            .expect("cluster");
        assert_eq!(a.runs, vec![0..2, 2..4, 4..6, 6..8]);
    }

    #[test]
    fn test_cluster_rejects_non_permutation() {
        let features = array![[1.0], [2.0]];
        assert!(ClusterAggregator::default()
            .cluster_features(&[0, 0], features.view(), 1)
            .is_err());
    }

    #[test]
    fn test_contiguity_check() {
        let a = ClusterAssignment {
            labels: vec![0, 1, 0],
            runs: vec![0..1, 1..3],
        };
        assert!(!a.is_contiguous_under(&[0, 1, 2]));
        assert!(a.is_contiguous_under(&[0, 2, 1]));
    }
}

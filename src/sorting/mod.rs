//! One-dimensional similarity embedding of neurons ("sorting").
//!
//! ## Pipeline
//!
//! ```text
//! U·diag(s) (N × k)
//!   → spherical k-means scaffold          (n_c clusters, n_c = min(n_clusters, N))
//!   → cluster traces = means · Vᵀ         (n_c × T)
//!   → time-lagged similarity              (n_c × n_c, max over -L..=L)
//!   → spectral layout + matching refinement of the clusters
//!   → upsampled node chain, each neuron at its best node
//!   → contiguous clusters along the neuron ordering
//!   → final pass: re-layout the contiguous clusters with their own similarity
//! ```
//!
//! The final pass only permutes whole clusters, so the clusters stay contiguous and
//! the ordering stays a permutation.

pub mod kmeans;
pub mod matching;
pub mod similarity;
pub mod upsample;

pub use matching::Refinement;
pub use similarity::SimilarityStructure;

use crate::cluster::{ClusterAggregator, ClusterAssignment};
use crate::core::{MapError, MapResult, SingularComponents};
use crate::linalg::normalize_rows;
use crate::reduce::{DimensionalityReducer, SubspaceSvd};
use crate::SortConfig;
use kmeans::{cluster_means, spherical_kmeans};
use matching::{matching_matrix, refine_order, spectral_order};
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use similarity::lagged_similarity;
use tracing::{debug, info};
use upsample::{assign_positions, order_by_position, upsample_nodes};

/// Diagnostics of one sorting run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortReport {
    /// k-means iterations until labels stabilised
    pub kmeans_iterations: usize,
    /// Scaffold layout cost after every accepted move (non-increasing)
    pub cost_history: Vec<f64>,
    /// Local-search sweeps spent on the scaffold layout
    pub sweeps: usize,
    /// Cluster layout cost of the final coarse-to-fine pass (non-increasing)
    pub final_cost_history: Vec<f64>,
    /// Local-search sweeps spent on the final pass
    pub final_sweeps: usize,
}

/// Output of [`SimilarityEmbedder::embed`].
#[derive(Debug, Clone)]
pub struct SortResult {
    /// `ordering[p]` is the neuron placed at position `p`
    pub ordering: Vec<usize>,
    /// Inverse permutation: `rank[neuron]` is its position in `ordering`
    pub rank: Vec<usize>,
    /// Contiguous clusters along `ordering`, numbered from the start of the ordering
    pub clusters: ClusterAssignment,
    /// Cluster-level similarity, rows and columns in cluster (ordering) order
    pub similarity: SimilarityStructure,
    /// Layout diagnostics
    pub report: SortReport,
}

/// Sorts neurons so that similar activity sits together.
#[derive(Debug, Clone)]
pub struct SimilarityEmbedder {
    config: SortConfig,
    aggregator: ClusterAggregator,
}

impl SimilarityEmbedder {
    /// Create an embedder.
    ///
    /// # Errors
    /// - `InvalidInput` if the configuration is out of range
    pub fn new(config: SortConfig) -> MapResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            aggregator: ClusterAggregator::default(),
        })
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Reduce raw activity (N × T) to `n_pcs` components with a [`SubspaceSvd`] seeded
    /// from the configuration, then embed.
    ///
    /// # Errors
    /// - `InvalidInput` if N < 2, or from the reducer and [`Self::embed`]
    pub fn fit(&self, activity: ArrayView2<f32>) -> MapResult<SortResult> {
        let reducer = SubspaceSvd {
            seed: self.config.seed,
            ..SubspaceSvd::default()
        };
        self.fit_with(activity, &reducer)
    }

    /// Reduce raw activity (N × T) to `n_pcs` components with `reducer`, then embed.
    ///
    /// The configured seed is not used; `reducer` carries its own.
    ///
    /// # Errors
    /// - `InvalidInput` if N < 2, or from the reducer and [`Self::embed`]
    pub fn fit_with(
        &self,
        activity: ArrayView2<f32>,
        reducer: &dyn DimensionalityReducer,
    ) -> MapResult<SortResult> {
        if activity.nrows() < 2 {
            return Err(MapError::InvalidInput(format!(
                "sorting needs at least 2 neurons, got {}",
                activity.nrows()
            )));
        }
        let components = reducer.reduce(activity, self.config.n_pcs)?;
        self.embed(&components)
    }

    /// Order the neurons described by `components`.
    ///
    /// # Errors
    /// - `InvalidInput` if N < 2, k < 1, or `time_lag_window` is not smaller than T
    /// - `NumericalInstability` if a layout refinement fails to lower its cost monotonically
    pub fn embed(&self, components: &SingularComponents) -> MapResult<SortResult> {
        let n = components.n_neurons();
        let t = components.n_time();
        if n < 2 {
            return Err(MapError::InvalidInput(format!(
                "sorting needs at least 2 neurons, got {n}"
            )));
        }
        if components.n_components() < 1 {
            return Err(MapError::InvalidInput(
                "sorting needs at least one component".to_string(),
            ));
        }
        if self.config.time_lag_window >= t {
            return Err(MapError::InvalidInput(format!(
                "time_lag_window ({}) must be smaller than the number of timepoints ({t})",
                self.config.time_lag_window
            )));
        }

        let usv = components.scaled_loadings();
        let features = normalize_rows(usv.view());
        let n_c = self.config.n_clusters.min(n);

        // Coarse scaffold
        let km = spherical_kmeans(
            features.view(),
            usv.column(0),
            n_c,
            self.config.kmeans_iterations,
        );
        debug!(
            target: "neuromap::sorting",
            n_clusters = n_c,
            iterations = km.iterations,
            "k-means scaffold"
        );

        let scaffold_sim = self.group_similarity(usv.view(), components, &km.labels, n_c)?;
        let weights = matching_matrix(n_c, self.config.locality);
        let initial = spectral_order(&scaffold_sim.matrix)?;
        let scaffold = refine_order(
            &scaffold_sim.matrix,
            &weights,
            initial,
            self.config.max_refine_sweeps,
        )?;

        // Neuron resolution
        let sorted_centroids = km.centroids.select(Axis(0), &scaffold.order);
        let nodes = upsample_nodes(sorted_centroids.view(), self.config.upsample);
        let positions = assign_positions(features.view(), &nodes, self.config.upsample);
        let coarse_ordering = order_by_position(&positions);

        let groups = self
            .aggregator
            .cluster_features(&coarse_ordering, features.view(), n_c)?;
        let g = groups.n_clusters();

        // Coarse-to-fine: lay out the contiguous clusters themselves
        let group_sim = self.group_similarity(usv.view(), components, &groups.labels, g)?;
        let group_weights = matching_matrix(g, self.config.locality);
        let final_pass = refine_order(
            &group_sim.matrix,
            &group_weights,
            (0..g).collect(),
            self.config.max_refine_sweeps,
        )?;

        let mut ordering = Vec::with_capacity(n);
        let mut boundaries = Vec::with_capacity(g + 1);
        boundaries.push(0);
        for &c in &final_pass.order {
            ordering.extend_from_slice(groups.members(&coarse_ordering, c));
            boundaries.push(ordering.len());
        }
        let clusters = ClusterAssignment::from_boundaries(&ordering, &boundaries);
        let similarity = group_sim.permuted(&final_pass.order);

        let mut rank = vec![0usize; n];
        for (p, &neuron) in ordering.iter().enumerate() {
            rank[neuron] = p;
        }

        info!(
            target: "neuromap::sorting",
            neurons = n,
            clusters = g,
            scaffold_cost = scaffold.final_cost(),
            final_cost = final_pass.final_cost(),
            "sorting complete"
        );

        Ok(SortResult {
            ordering,
            rank,
            clusters,
            similarity,
            report: SortReport {
                kmeans_iterations: km.iterations,
                cost_history: scaffold.cost_history,
                sweeps: scaffold.sweeps,
                final_cost_history: final_pass.cost_history,
                final_sweeps: final_pass.sweeps,
            },
        })
    }

    /// Lagged similarity of the mean traces of labelled groups.
    fn group_similarity(
        &self,
        usv: ArrayView2<f32>,
        components: &SingularComponents,
        labels: &[usize],
        n_groups: usize,
    ) -> MapResult<SimilarityStructure> {
        let means = cluster_means(usv, labels, n_groups);
        let traces: Array2<f32> = means.dot(&components.time_courses.t());
        lagged_similarity(traces.view(), self.config.time_lag_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sorting::matching::is_permutation;
    use ndarray::{Array1, Array2};

    /// Components of two neuron groups with orthogonal time-courses, interleaved by index.
    fn two_group_components(n: usize, t: usize) -> SingularComponents {
        let v1 = Array1::from_shape_fn(t, |i| (i as f32 * 0.21).sin());
        let v2 = Array1::from_shape_fn(t, |i| (i as f32 * 0.53).cos());
        let activity = Array2::from_shape_fn((n, t), |(neuron, time)| {
            let jitter = 1.0 + 0.05 * (neuron as f32 * 1.7).sin();
            if neuron % 2 == 0 {
                jitter * v1[time] + 0.1 * v2[time]
            } else {
                jitter * v2[time] - 0.1 * v1[time]
            }
        });
        let mut time_courses = Array2::<f32>::zeros((t, 2));
        time_courses.column_mut(0).assign(&(&v1 / v1.dot(&v1).sqrt()));
        time_courses.column_mut(1).assign(&(&v2 / v2.dot(&v2).sqrt()));
        SingularComponents::from_time_courses(activity.view(), time_courses)
            .expect("components")
    }

    #[test]
    fn test_embed_returns_permutation() {
        let comps = two_group_components(30, 120);
        let embedder = SimilarityEmbedder::new(SortConfig {
            n_clusters: 6,
            ..SortConfig::default()
        })
        .expect("config");
        let result = embedder.embed(&comps).expect("embed");
        assert!(is_permutation(&result.ordering, 30));
        for (p, &neuron) in result.ordering.iter().enumerate() {
            assert_eq!(result.rank[neuron], p);
        }
        assert!(result.clusters.is_contiguous_under(&result.ordering));
    }

    #[test]
    fn test_two_groups_contiguous() {
        let comps = two_group_components(40, 150);
        let embedder = SimilarityEmbedder::new(SortConfig {
            n_clusters: 4,
            time_lag_window: 2,
            ..SortConfig::default()
        })
        .expect("config");
        let result = embedder.embed(&comps).expect("embed");

        let groups: Vec<usize> = result.ordering.iter().map(|&i| i % 2).collect();
        let switches = groups.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 1, "groups interleave in the ordering: {groups:?}");
    }

    #[test]
    fn test_fit_uses_configured_seed() {
        let activity = Array2::from_shape_fn((24, 90), |(i, t)| {
            let phase = (t as f32) * 0.1 * (1.0 + (i % 3) as f32);
            phase.sin() + 0.2 * ((i * 7 + t * 3) as f32).cos()
        });
        for seed in [1u64, 99] {
            let embedder = SimilarityEmbedder::new(SortConfig {
                n_clusters: 4,
                n_pcs: 5,
                seed,
                ..SortConfig::default()
            })
            .expect("config");
            let reducer = SubspaceSvd {
                seed,
                ..SubspaceSvd::default()
            };
            let via_config = embedder.fit(activity.view()).expect("fit");
            let explicit = embedder.fit_with(activity.view(), &reducer).expect("fit_with");
            assert_eq!(via_config.ordering, explicit.ordering, "seed {seed} not applied");
            assert_eq!(via_config.report.cost_history, explicit.report.cost_history);
        }
    }

    #[test]
    fn test_single_neuron_rejected() {
        let comps = SingularComponents::new(
            Array2::from_elem((10, 1), 0.3),
            Array2::from_elem((1, 1), 1.0),
            Array1::from_elem(1, 1.0),
        )
        .expect("components");
        let embedder = SimilarityEmbedder::new(SortConfig::default()).expect("config");
        assert!(matches!(
            embedder.embed(&comps),
            Err(MapError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_more_clusters_than_neurons() {
        let comps = two_group_components(6, 60);
        let embedder = SimilarityEmbedder::new(SortConfig {
            n_clusters: 50,
            ..SortConfig::default()
        })
        .expect("config");
        let result = embedder.embed(&comps).expect("embed");
        assert_eq!(result.clusters.n_clusters(), 6);
        assert!(result.clusters.runs.iter().all(|r| r.len() == 1));
        assert_eq!(result.similarity.len(), 6);
    }

    #[test]
    fn test_cost_histories_non_increasing() {
        let comps = two_group_components(24, 100);
        let embedder = SimilarityEmbedder::new(SortConfig {
            n_clusters: 8,
            locality: 0.5,
            ..SortConfig::default()
        })
        .expect("config");
        let report = embedder.embed(&comps).expect("embed").report;
        for history in [&report.cost_history, &report.final_cost_history] {
            for w in history.windows(2) {
                assert!(w[1] <= w[0], "cost increased: {} -> {}", w[0], w[1]);
            }
        }
    }

    #[test]
    fn test_lag_window_must_fit() {
        let comps = two_group_components(8, 20);
        let embedder = SimilarityEmbedder::new(SortConfig {
            time_lag_window: 20,
            ..SortConfig::default()
        })
        .expect("config");
        assert!(matches!(
            embedder.embed(&comps),
            Err(MapError::InvalidInput(_))
        ));
    }
}

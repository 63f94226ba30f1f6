//! # neuromap
//!
//! Sorting and behavioural prediction for large-scale neural recordings.
//!
//! ## Overview
//!
//! Given an activity matrix of N neurons × T timepoints, neuromap
//! - orders the neurons along one dimension so that neurons with similar temporal
//!   activity sit next to each other (and can be binned into superneurons), and
//! - learns a mapping from a low-dimensional behavioural signal to the dominant
//!   temporal components of the activity, quantifies how much of the activity it
//!   explains, and recovers the behavioural receptive fields of the fitted model.
//!
//! ## Structure
//!
//! - [`core`] — Error taxonomy, activations, the truncated SVD data model
//! - [`linalg`] — Dense solvers and decompositions used by the engines
//! - [`reduce`] — [`DimensionalityReducer`] seam and the default randomized SVD
//! - [`sorting`] — [`SimilarityEmbedder`]: k-means scaffold, time-lagged similarity,
//!   locality-weighted matrix matching, upsampling
//! - [`cluster`] — [`ClusterAggregator`]: contiguous clusters along an ordering
//! - [`split`] — [`TrainTestSplitter`]: interleaved segment train/test masks
//! - [`regression`] — [`LinearPredictor`]: ridge regression baseline
//! - [`training`] — Explicit gradient-descent state machine and AdamW optimiser
//! - [`prediction`] — [`TemporalConvPredictor`]: behaviour → neural components
//! - [`receptive`] — [`ReceptiveFieldEstimator`]: maximum-stimulus synthesis
//! - [`metrics`] — Superneurons and embedding benchmarks
//! - `gpu` — Batched inference on a burn backend (feature `gpu`)
//!
//! ## Determinism
//!
//! Nothing in the crate reads process-wide state. Every random initialisation takes
//! its seed from the configuration passed to the call, and parallel sections
//! (rayon) combine results in index order, so repeated calls with the same inputs
//! return identical outputs.

pub mod cluster;
pub mod core;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod linalg;
pub mod metrics;
pub mod prediction;
pub mod receptive;
pub mod reduce;
pub mod regression;
pub mod sorting;
pub mod split;
pub mod training;

pub use crate::core::{
    Activation, IdentityActivation, MapError, MapResult, ReluActivation, SingularComponents,
};
pub use cluster::{ClusterAggregator, ClusterAssignment, FeatureCost, SegmentCost, SimilarityCost};
pub use metrics::{
    contamination_score, embedding_to_rank, superneuron_correlation, superneurons, triplet_score,
};
pub use prediction::{FitReport, FitState, TemporalConvPredictor};
pub use receptive::ReceptiveFieldEstimator;
pub use reduce::{DimensionalityReducer, SubspaceSvd};
pub use regression::{variance_explained, variance_explained_per_column, LinearPredictor};
pub use sorting::{SimilarityEmbedder, SimilarityStructure, SortReport, SortResult};
pub use split::{SplitMask, TrainTestSplitter};
pub use training::{StepMetrics, Trainer, TrainingStatus};

use serde::{Deserialize, Serialize};

/// Similarity embedder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortConfig {
    /// Number of k-means clusters in the scaffold (clamped to N). Default 100.
    pub n_clusters: usize,
    /// Singular components used when sorting from raw activity. Default 200.
    pub n_pcs: usize,
    /// 0 = preserve global similarity, 1 = tight local clusters. Default 0.0.
    pub locality: f32,
    /// Largest time shift (samples) examined when comparing clusters. Default 0.
    pub time_lag_window: usize,
    /// Interpolated nodes per pair of adjacent clusters. Default 10.
    pub upsample: usize,
    /// Maximum k-means iterations. Default 30.
    pub kmeans_iterations: usize,
    /// Maximum local-search sweeps per refinement. Default 50.
    pub max_refine_sweeps: usize,
    /// Seed of the SVD used by [`SimilarityEmbedder::fit`]. Default 0.
    pub seed: u64,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            n_clusters: 100,
            n_pcs: 200,
            locality: 0.0,
            time_lag_window: 0,
            upsample: 10,
            kmeans_iterations: 30,
            max_refine_sweeps: 50,
            seed: 0,
        }
    }
}

impl SortConfig {
    /// Reject out-of-range settings.
    ///
    /// # Errors
    /// - `InvalidInput` naming the first offending field
    pub fn validate(&self) -> MapResult<()> {
        if self.n_clusters == 0 {
            return Err(MapError::InvalidInput("n_clusters must be > 0".to_string()));
        }
        if self.n_pcs == 0 {
            return Err(MapError::InvalidInput("n_pcs must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.locality) {
            return Err(MapError::InvalidInput(format!(
                "locality must be in [0, 1], got {}",
                self.locality
            )));
        }
        if self.upsample == 0 {
            return Err(MapError::InvalidInput("upsample must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Architecture of the temporal convolutional predictor.
///
/// ```text
/// behaviour (T × n_in)
///   → linear → latents (T × n_kp)
///   → n_filters temporal kernels of width kernel_size, shared across latents
///     (T × n_kp·n_filters), optional ReLU
///   → n_core_layers dense layers of width n_latents, optional ReLU
///   → linear → neural components (T × n_out)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvConfig {
    /// Behavioural features per timepoint
    pub n_in: usize,
    /// Width of the compressed behavioural latent. Default 8.
    pub n_kp: usize,
    /// Learned temporal kernels. Default 10.
    pub n_filters: usize,
    /// Kernel width in samples, odd. Default 31.
    pub kernel_size: usize,
    /// Dense layers between the convolution and the readout. Default 2.
    pub n_core_layers: usize,
    /// Width of the dense layers. Default 64.
    pub n_latents: usize,
    /// ReLU after the convolution. Default true.
    pub relu_wavelets: bool,
    /// ReLU after each dense layer. Default true.
    pub relu_latents: bool,
    /// Neural components predicted per timepoint
    pub n_out: usize,
    /// Seed for weight initialisation. Default 0.
    pub seed: u64,
}

impl ConvConfig {
    /// Default architecture for the given input and output widths.
    pub fn new(n_in: usize, n_out: usize) -> Self {
        Self {
            n_in,
            n_kp: 8,
            n_filters: 10,
            kernel_size: 31,
            n_core_layers: 2,
            n_latents: 64,
            relu_wavelets: true,
            relu_latents: true,
            n_out,
            seed: 0,
        }
    }

    /// Reject out-of-range settings.
    ///
    /// # Errors
    /// - `InvalidInput` naming the first offending field
    pub fn validate(&self) -> MapResult<()> {
        let sizes = [
            ("n_in", self.n_in),
            ("n_kp", self.n_kp),
            ("n_filters", self.n_filters),
            ("kernel_size", self.kernel_size),
            ("n_core_layers", self.n_core_layers),
            ("n_latents", self.n_latents),
            ("n_out", self.n_out),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(MapError::InvalidInput(format!("{name} must be > 0")));
            }
        }
        if self.kernel_size % 2 == 0 {
            return Err(MapError::InvalidInput(format!(
                "kernel_size must be odd, got {}",
                self.kernel_size
            )));
        }
        Ok(())
    }
}

/// Training settings for [`TemporalConvPredictor::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    /// Shift of behaviour relative to neural samples; negative = behaviour leads. Default -1.
    pub delay: i64,
    /// AdamW step size. Default 1e-3.
    pub learning_rate: f32,
    /// Decoupled weight decay. Default 1e-4.
    pub weight_decay: f32,
    /// Gradient steps. Default 300.
    pub n_iterations: usize,
    /// Interleaved train/test segments. Default 20.
    pub n_segs: usize,
    /// Fraction of each segment held out. Default 0.25.
    pub test_fraction: f32,
    /// Relative loss change below which training counts as converged; 0 disables. Default 0.0.
    pub tolerance: f32,
    /// Final fraction of iterations run at a tenth of the learning rate. Default 0.1.
    pub anneal_fraction: f32,
    /// Log progress every N iterations; 0 disables. Default 50.
    pub log_every: usize,
    /// Gaussian smoothing (camera samples) before resampling behaviour; 0 disables. Default 0.0.
    pub smoothing_sigma: f32,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            delay: -1,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            n_iterations: 300,
            n_segs: 20,
            test_fraction: 0.25,
            tolerance: 0.0,
            anneal_fraction: 0.1,
            log_every: 50,
            smoothing_sigma: 0.0,
        }
    }
}

impl FitConfig {
    /// Reject out-of-range settings.
    ///
    /// # Errors
    /// - `InvalidInput` naming the first offending field
    pub fn validate(&self) -> MapResult<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(MapError::InvalidInput(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(MapError::InvalidInput("weight_decay must be >= 0".to_string()));
        }
        if self.n_iterations == 0 {
            return Err(MapError::InvalidInput("n_iterations must be > 0".to_string()));
        }
        if self.n_segs == 0 {
            return Err(MapError::InvalidInput("n_segs must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.test_fraction) {
            return Err(MapError::InvalidInput(format!(
                "test_fraction must be in [0, 1), got {}",
                self.test_fraction
            )));
        }
        if !(self.tolerance >= 0.0) {
            return Err(MapError::InvalidInput("tolerance must be >= 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.anneal_fraction) {
            return Err(MapError::InvalidInput("anneal_fraction must be in [0, 1]".to_string()));
        }
        if !(self.smoothing_sigma >= 0.0) {
            return Err(MapError::InvalidInput("smoothing_sigma must be >= 0".to_string()));
        }
        Ok(())
    }
}

/// Settings for [`ReceptiveFieldEstimator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceptiveFieldConfig {
    /// Length of the synthesised trace, odd; `None` uses the model's kernel size.
    pub window: Option<usize>,
    /// Gradient-ascent steps per target. Default 200.
    pub n_iterations: usize,
    /// Adam step size on the trace. Default 0.05.
    pub learning_rate: f32,
    /// L2 penalty keeping the trace bounded. Default 0.1.
    pub l2_penalty: f32,
    /// Seed for the trace initialisation. Default 0.
    pub seed: u64,
}

impl Default for ReceptiveFieldConfig {
    fn default() -> Self {
        Self {
            window: None,
            n_iterations: 200,
            learning_rate: 0.05,
            l2_penalty: 0.1,
            seed: 0,
        }
    }
}

impl ReceptiveFieldConfig {
    /// Reject out-of-range settings.
    ///
    /// # Errors
    /// - `InvalidInput` naming the first offending field
    pub fn validate(&self) -> MapResult<()> {
        if let Some(w) = self.window {
            if w == 0 || w % 2 == 0 {
                return Err(MapError::InvalidInput(format!(
                    "window must be odd and > 0, got {w}"
                )));
            }
        }
        if self.n_iterations == 0 {
            return Err(MapError::InvalidInput("n_iterations must be > 0".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(MapError::InvalidInput("learning_rate must be positive".to_string()));
        }
        if !(self.l2_penalty >= 0.0) {
            return Err(MapError::InvalidInput("l2_penalty must be >= 0".to_string()));
        }
        Ok(())
    }
}

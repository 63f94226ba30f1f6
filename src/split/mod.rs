//! Interleaved train/test split of the time axis.
//!
//! `n_segs` segments of length `n_time / n_segs` are spread evenly over the
//! recording (first at 0, last ending at the final sample). The first
//! `floor(seg_len · test_fraction)` samples of every segment are test; everything
//! else is train. Holding out many short blocks spreads the test set over the whole
//! session while keeping it out of the immediate neighbourhood of most train samples.

use crate::core::{MapError, MapResult};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Boolean partition of the time axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitMask {
    /// `test[t]` is true for held-out timepoints
    pub test: Array1<bool>,
    /// Held-out block of every segment, in time order
    pub test_segments: Vec<Range<usize>>,
    /// Contiguous train blocks between test blocks, in time order, non-empty
    pub train_segments: Vec<Range<usize>>,
}

impl SplitMask {
    /// Number of timepoints.
    pub fn len(&self) -> usize {
        self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.test.is_empty()
    }

    /// Exact complement of the test mask.
    pub fn train(&self) -> Array1<bool> {
        self.test.mapv(|b| !b)
    }

    /// Indices of test timepoints, ascending.
    pub fn test_indices(&self) -> Vec<usize> {
        self.indices(true)
    }

    /// Indices of train timepoints, ascending.
    pub fn train_indices(&self) -> Vec<usize> {
        self.indices(false)
    }

    fn indices(&self, test: bool) -> Vec<usize> {
        self.test
            .iter()
            .enumerate()
            .filter_map(|(t, &b)| (b == test).then_some(t))
            .collect()
    }
}

/// Builds [`SplitMask`]s.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrainTestSplitter;

impl TrainTestSplitter {
    /// Split `n_time` samples into `n_segs` segments with `test_fraction` of each held out.
    ///
    /// # Errors
    /// - `InvalidInput` if `test_fraction` is outside `[0, 1)`, `n_segs == 0`, or
    ///   `n_segs > n_time`
    #[allow(clippy::cast_precision_loss)]
    pub fn split(&self, n_time: usize, n_segs: usize, test_fraction: f32) -> MapResult<SplitMask> {
        if !(0.0..1.0).contains(&test_fraction) {
            return Err(MapError::InvalidInput(format!(
                "test_fraction must be in [0, 1), got {test_fraction}"
            )));
        }
        if n_segs == 0 {
            return Err(MapError::InvalidInput("n_segs must be > 0".to_string()));
        }
        if n_segs > n_time {
            return Err(MapError::InvalidInput(format!(
                "n_segs ({n_segs}) exceeds the number of timepoints ({n_time})"
            )));
        }

        let seg_len = n_time / n_segs;
        let n_test = (seg_len as f64 * f64::from(test_fraction)).floor() as usize;
        let last_start = n_time - seg_len;

        let mut test = Array1::from_elem(n_time, false);
        let mut test_segments = Vec::with_capacity(n_segs);
        for s in 0..n_segs {
            let start = if n_segs == 1 {
                0
            } else {
                (s as f64 * last_start as f64 / (n_segs - 1) as f64).floor() as usize
            };
            let block = start..start + n_test;
            test.slice_mut(ndarray::s![block.clone()]).fill(true);
            if !block.is_empty() {
                test_segments.push(block);
            }
        }

        let mut train_segments = Vec::new();
        let mut run_start = None;
        for (t, &is_test) in test.iter().enumerate() {
            match (is_test, run_start) {
                (false, None) => run_start = Some(t),
                (true, Some(s)) => {
                    train_segments.push(s..t);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = run_start {
            train_segments.push(s..n_time);
        }

        Ok(SplitMask {
            test,
            test_segments,
            train_segments,
        })
    }
}

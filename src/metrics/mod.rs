//! Superneurons and embedding quality scores.
//!
//! - [`superneurons`]: mean activity of contiguous bins of the sorted neurons
//! - [`superneuron_correlation`]: correlation matrix of those traces
//! - [`embedding_to_rank`]: continuous 1-D embedding → rank of every neuron
//! - [`triplet_score`] / [`contamination_score`]: agreement of an embedding with a
//!   known ground truth, for comparing sorting methods on synthetic data

use crate::core::{MapError, MapResult};
use crate::linalg::zscore_rows;
use crate::sorting::matching::is_permutation;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Average `activity` (N × T) over consecutive bins of `bin_size` neurons along `ordering`.
///
/// The last bin holds the remainder and may be smaller. Returns `ceil(N / bin_size)` × T.
///
/// # Errors
/// - `InvalidInput` if `bin_size == 0` or `ordering` is not a permutation of the rows
pub fn superneurons(
    activity: ArrayView2<f32>,
    ordering: &[usize],
    bin_size: usize,
) -> MapResult<Array2<f32>> {
    if bin_size == 0 {
        return Err(MapError::InvalidInput("bin_size must be > 0".to_string()));
    }
    if !is_permutation(ordering, activity.nrows()) {
        return Err(MapError::InvalidInput(format!(
            "ordering is not a permutation of {} neurons",
            activity.nrows()
        )));
    }
    let n_bins = ordering.len().div_ceil(bin_size);
    let mut out = Array2::<f32>::zeros((n_bins, activity.ncols()));
    for (b, chunk) in ordering.chunks(bin_size).enumerate() {
        let mut row = out.row_mut(b);
        for &neuron in chunk {
            row += &activity.row(neuron);
        }
        #[allow(clippy::cast_precision_loss)]
        let count = chunk.len() as f32;
        row /= count;
    }
    Ok(out)
}

/// Pearson correlation between every pair of rows.
pub fn superneuron_correlation(traces: ArrayView2<f32>) -> Array2<f32> {
    let z = zscore_rows(traces);
    #[allow(clippy::cast_precision_loss)]
    let t = traces.ncols().max(1) as f32;
    z.dot(&z.t()) / t
}

/// Rank of every neuron along a 1-D embedding; ties keep index order.
pub fn embedding_to_rank(embedding: ArrayView1<f32>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..embedding.len()).collect();
    order.sort_by(|&a, &b| embedding[a].total_cmp(&embedding[b]).then(a.cmp(&b)));
    let mut rank = vec![0usize; order.len()];
    for (r, &i) in order.iter().enumerate() {
        rank[i] = r;
    }
    rank
}

/// Fraction of random triplets `(i, j, k)` whose ground-truth relation
/// "j is closer to i than k is" holds in the embedding too.
///
/// Triplets tied in the ground truth are redrawn.
///
/// # Errors
/// - `InvalidInput` if fewer than 3 neurons, lengths differ, or `n_triplets == 0`
pub fn triplet_score(
    ground_truth: ArrayView1<f32>,
    embedding: ArrayView1<f32>,
    n_triplets: usize,
    seed: u64,
) -> MapResult<f32> {
    let n = ground_truth.len();
    if embedding.len() != n {
        return Err(MapError::InvalidInput(format!(
            "ground truth has {n} neurons, embedding has {}",
            embedding.len()
        )));
    }
    if n < 3 || n_triplets == 0 {
        return Err(MapError::InvalidInput(
            "triplet score needs at least 3 neurons and 1 triplet".to_string(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut correct = 0usize;
    let mut drawn = 0usize;
    let max_draws = n_triplets.saturating_mul(100);
    let mut attempts = 0usize;
    while drawn < n_triplets && attempts < max_draws {
        attempts += 1;
        let i = rng.gen_range(0..n);
        let j = rng.gen_range(0..n);
        let k = rng.gen_range(0..n);
        if i == j || j == k || i == k {
            continue;
        }
        let gt_ij = (ground_truth[i] - ground_truth[j]).abs();
        let gt_ik = (ground_truth[i] - ground_truth[k]).abs();
        if gt_ij == gt_ik {
            continue;
        }
        let em_ij = (embedding[i] - embedding[j]).abs();
        let em_ik = (embedding[i] - embedding[k]).abs();
        drawn += 1;
        if (gt_ij < gt_ik) == (em_ij < em_ik) {
            correct += 1;
        }
    }
    if drawn == 0 {
        return Err(MapError::InvalidInput(
            "ground truth has no distinguishable triplets".to_string(),
        ));
    }
    #[allow(clippy::cast_precision_loss)]
    Ok(correct as f32 / drawn as f32)
}

/// Mean fraction of each neuron's `n_neighbors` nearest embedding neighbours (by rank)
/// that carry a different ground-truth label.
///
/// # Errors
/// - `InvalidInput` if lengths differ or `n_neighbors` is 0 or ≥ N
pub fn contamination_score(
    labels: &[usize],
    embedding: ArrayView1<f32>,
    n_neighbors: usize,
) -> MapResult<f32> {
    let n = labels.len();
    if embedding.len() != n {
        return Err(MapError::InvalidInput(format!(
            "{n} labels but embedding has {} neurons",
            embedding.len()
        )));
    }
    if n_neighbors == 0 || n_neighbors >= n {
        return Err(MapError::InvalidInput(format!(
            "n_neighbors must be in 1..{n}, got {n_neighbors}"
        )));
    }
    let rank = embedding_to_rank(embedding);
    let mut order = vec![0usize; n];
    for (i, &r) in rank.iter().enumerate() {
        order[r] = i;
    }

    let mut fractions = Array1::<f32>::zeros(n);
    for (p, &neuron) in order.iter().enumerate() {
        // n_neighbors + 1 positions containing p, shifted inward at the ends
        let start = p.saturating_sub(n_neighbors / 2).min(n - 1 - n_neighbors);
        let foreign = (start..=start + n_neighbors)
            .filter(|&q| q != p && labels[order[q]] != labels[neuron])
            .count();
        #[allow(clippy::cast_precision_loss)]
        let fraction = foreign as f32 / n_neighbors as f32;
        fractions[p] = fraction;
    }
    Ok(fractions.mean().unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_superneurons_bins_and_remainder() {
        let activity = array![[1.0, 1.0], [3.0, 3.0], [5.0, 5.0], [7.0, 7.0], [9.0, 9.0]];
        let sn = superneurons(activity.view(), &[4, 3, 2, 1, 0], 2).expect("bins");
        assert_eq!(sn, array![[8.0, 8.0], [4.0, 4.0], [1.0, 1.0]]);
        assert!(superneurons(activity.view(), &[0, 1], 2).is_err());
    }

    #[test]
    fn test_correlation_diagonal() {
        let traces = array![[1.0, 2.0, 3.0, 4.0], [4.0, 3.0, 2.0, 1.0]];
        let c = superneuron_correlation(traces.view());
        assert!((c[[0, 0]] - 1.0).abs() < 1e-5);
        assert!((c[[0, 1]] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_rank_ties_by_index() {
        assert_eq!(embedding_to_rank(array![0.5, 0.1, 0.5, -1.0].view()), vec![2, 1, 3, 0]);
    }

    #[test]
    fn test_triplet_score_perfect_and_reversed() {
        let gt = Array1::from_iter((0..50).map(|i| i as f32));
        let same = triplet_score(gt.view(), gt.view(), 500, 1).expect("score");
        assert!((same - 1.0).abs() < 1e-6);
        let flipped = gt.mapv(|v| -2.0 * v);
        let still = triplet_score(gt.view(), flipped.view(), 500, 1).expect("score");
        assert!((still - 1.0).abs() < 1e-6, "distances are sign invariant");
    }

    #[test]
    fn test_contamination_separated_modules() {
        let labels = [0, 0, 0, 0, 1, 1, 1, 1];
        let sorted = array![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let mixed = array![0.0, 2.0, 4.0, 6.0, 1.0, 3.0, 5.0, 7.0];
        let clean = contamination_score(&labels, sorted.view(), 2).expect("score");
        let dirty = contamination_score(&labels, mixed.view(), 2).expect("score");
        assert!(clean < dirty, "{clean} should be below {dirty}");
    }
}

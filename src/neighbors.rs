//! Brute-force k-nearest-neighbor search over selected feature columns.
//!
//! Neighbor lists are built once per fit from static features, so the exact
//! O(n_queries * n_candidates) scan is acceptable and keeps results free of
//! index-approximation noise. Queries are scanned in parallel.

use ndarray::ArrayView2;
use rayon::prelude::*;

/// Indices of the `k` nearest candidates for every query event.
///
/// `features` is feature-major `[n_features, n_samples]`; distances are
/// Euclidean over those rows. `queries` and `candidates` hold sample indices;
/// a query that is also a candidate is its own nearest neighbor (distance 0).
/// Ties break toward the lower candidate index, so results are deterministic.
///
/// Each returned row holds `min(k, candidates.len())` sample indices sorted
/// by ascending distance from the query.
///
/// # Panics
///
/// Panics if `k == 0` or `candidates` is empty.
pub fn knn_indices(
    features: ArrayView2<'_, f64>,
    queries: &[usize],
    candidates: &[usize],
    k: usize,
) -> Vec<Vec<usize>> {
    assert!(k > 0, "k must be positive");
    assert!(!candidates.is_empty(), "candidate set must not be empty");
    let k_eff = k.min(candidates.len());

    queries
        .par_iter()
        .map(|&q| {
            let mut dists: Vec<(f64, usize)> = candidates
                .iter()
                .map(|&c| (squared_distance(features, q, c), c))
                .collect();
            if k_eff < dists.len() {
                dists.select_nth_unstable_by(k_eff - 1, compare);
                dists.truncate(k_eff);
            }
            dists.sort_unstable_by(compare);
            dists.into_iter().map(|(_, c)| c).collect()
        })
        .collect()
}

#[inline]
fn compare(a: &(f64, usize), b: &(f64, usize)) -> std::cmp::Ordering {
    a.0.partial_cmp(&b.0)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(a.1.cmp(&b.1))
}

#[inline]
fn squared_distance(features: ArrayView2<'_, f64>, a: usize, b: usize) -> f64 {
    let mut acc = 0.0;
    for feature in features.rows() {
        let d = feature[a] - feature[b];
        acc += d * d;
    }
    acc
}

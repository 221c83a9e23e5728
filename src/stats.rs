//! Weighted order statistics shared by the rank-sensitive losses and the
//! histogram reweighter.

use ndarray::ArrayView1;

/// Weighted empirical CDF position of every event among `values`.
///
/// Position = (weighted) fraction of elements with lower value, counting the
/// element itself at half weight, so positions lie strictly inside `(0, 1)`
/// for positive weights. Ties keep their input order (stable sort), matching
/// rank-data semantics with weights.
pub fn weighted_positions(values: ArrayView1<'_, f64>, weights: ArrayView1<'_, f64>) -> Vec<f64> {
    debug_assert_eq!(values.len(), weights.len(), "lengths must match");
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(std::cmp::Ordering::Equal));

    let total: f64 = weights.sum();
    let mut positions = vec![0.0; values.len()];
    let mut cumulative = 0.0;
    for &idx in &order {
        let w = weights[idx] / total;
        cumulative += w;
        positions[idx] = cumulative - 0.5 * w;
    }
    positions
}

/// Weighted quantiles of `values`, linearly interpolated.
///
/// Sorts by value, assigns each element the position
/// `(cumulative weight - half own weight) / total weight`, then interpolates
/// each requested quantile between adjacent values. Quantiles outside the
/// covered range clamp to the extreme values.
pub fn weighted_quantile(values: &[f64], quantiles: &[f64], weights: &[f64]) -> Vec<f64> {
    debug_assert_eq!(values.len(), weights.len(), "lengths must match");
    assert!(!values.is_empty(), "cannot take quantiles of empty data");

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(std::cmp::Ordering::Equal));

    let total: f64 = weights.iter().sum();
    let mut sorted_values = Vec::with_capacity(values.len());
    let mut positions = Vec::with_capacity(values.len());
    let mut cumulative = 0.0;
    for &idx in &order {
        let w = weights[idx] / total;
        cumulative += w;
        sorted_values.push(values[idx]);
        positions.push(cumulative - 0.5 * w);
    }

    quantiles
        .iter()
        .map(|&q| interpolate(&positions, &sorted_values, q))
        .collect()
}

/// Piecewise-linear interpolation of `x` against monotone `(xs, ys)` pairs,
/// clamped at the ends.
fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[xs.len() - 1] {
        return ys[ys.len() - 1];
    }
    let hi = xs.partition_point(|&p| p < x);
    let lo = hi - 1;
    let span = xs[hi] - xs[lo];
    if span <= 0.0 {
        return ys[lo];
    }
    let t = (x - xs[lo]) / span;
    ys[lo] + t * (ys[hi] - ys[lo])
}

/// Index of the first edge `>= x`: the bin id of `x` against sorted `edges`,
/// with values equal to an edge falling into the lower bin.
#[inline]
pub fn searchsorted(edges: &[f64], x: f64) -> usize {
    edges.partition_point(|&e| e < x)
}

/// Weighted count per bucket: `result[b] = Σ weights[i] where ids[i] == b`.
pub fn bincount(ids: &[usize], weights: &[f64], n_buckets: usize) -> Vec<f64> {
    debug_assert_eq!(ids.len(), weights.len(), "lengths must match");
    let mut result = vec![0.0; n_buckets];
    for (&id, &w) in ids.iter().zip(weights) {
        debug_assert!(id < n_buckets, "bucket id {} out of range {}", id, n_buckets);
        result[id] += w;
    }
    result
}

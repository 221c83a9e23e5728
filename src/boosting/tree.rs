//! Weighted-MSE regression tree grown on loss pseudo-targets.
//!
//! Exact greedy splitter: every boosting round hands the tree a per-event
//! target and weight, the tree scans sorted feature values for the split
//! maximizing the weighted sum-of-squares gain, and each terminal node gets
//! a region id. Leaf outputs start as weighted target means and are
//! overwritten by the loss's leaf correction before prediction.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Minimum gain over the parent score for a split to be kept.
const MIN_GAIN: f64 = 1e-12;

/// Growth limits for one tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GrowthParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

/// One node in the flat node array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    /// Internal split: `x[feature] <= threshold` goes left.
    Branch {
        feature: u32,
        threshold: f64,
        left: u32,
        right: u32,
    },
    /// Terminal node owning a region id.
    Leaf { region: u32 },
}

/// Regression tree over feature-major data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
    leaf_values: Vec<f64>,
}

// ArrayView2 is invariant over its data lifetime, so the view cannot
// share a parameter with the round-local target and weight buffers.
struct TreeBuilder<'f, 'd> {
    features: ArrayView2<'f, f64>,
    target: &'d [f64],
    weight: &'d [f64],
    params: GrowthParams,
    nodes: Vec<Node>,
    leaf_values: Vec<f64>,
}

struct Split {
    feature: u32,
    threshold: f64,
}

impl TreeBuilder<'_, '_> {
    fn grow(&mut self, rows: Vec<u32>, depth: usize) -> u32 {
        if depth >= self.params.max_depth || rows.len() < 2 * self.params.min_samples_leaf {
            return self.make_leaf(&rows);
        }
        let split = match self.best_split(&rows) {
            Some(split) => split,
            None => return self.make_leaf(&rows),
        };

        let axis = self.features.row(split.feature as usize);
        let (left_rows, right_rows): (Vec<u32>, Vec<u32>) = rows
            .into_iter()
            .partition(|&r| axis[r as usize] <= split.threshold);
        if left_rows.len() < self.params.min_samples_leaf
            || right_rows.len() < self.params.min_samples_leaf
        {
            let mut rows = left_rows;
            rows.extend(right_rows);
            return self.make_leaf(&rows);
        }

        let node_id = self.nodes.len() as u32;
        self.nodes.push(Node::Leaf { region: 0 });
        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[node_id as usize] = Node::Branch {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        node_id
    }

    fn make_leaf(&mut self, rows: &[u32]) -> u32 {
        let mut sum = 0.0;
        let mut total = 0.0;
        for &r in rows {
            let r = r as usize;
            sum += self.weight[r] * self.target[r];
            total += self.weight[r];
        }
        let value = if total > 0.0 { sum / total } else { 0.0 };
        let region = self.leaf_values.len() as u32;
        self.leaf_values.push(value);
        self.nodes.push(Node::Leaf { region });
        (self.nodes.len() - 1) as u32
    }

    /// Scan every feature's sorted order for the split maximizing
    /// `S_L^2/W_L + S_R^2/W_R`; midpoint thresholds between distinct values.
    fn best_split(&self, rows: &[u32]) -> Option<Split> {
        let mut total_weight = 0.0;
        let mut total_sum = 0.0;
        for &r in rows {
            let r = r as usize;
            total_weight += self.weight[r];
            total_sum += self.weight[r] * self.target[r];
        }
        if total_weight <= 0.0 {
            return None;
        }
        let parent_score = total_sum * total_sum / total_weight;

        let mut best = None;
        let mut best_score = parent_score + MIN_GAIN;
        let mut order = rows.to_vec();
        for feature in 0..self.features.nrows() {
            let axis = self.features.row(feature);
            order.sort_unstable_by(|&a, &b| {
                axis[a as usize]
                    .partial_cmp(&axis[b as usize])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut left_weight = 0.0;
            let mut left_sum = 0.0;
            for pos in 1..order.len() {
                let prev = order[pos - 1] as usize;
                left_weight += self.weight[prev];
                left_sum += self.weight[prev] * self.target[prev];

                let current = order[pos] as usize;
                if axis[prev] >= axis[current] {
                    continue;
                }
                if pos < self.params.min_samples_leaf
                    || order.len() - pos < self.params.min_samples_leaf
                {
                    continue;
                }
                let right_weight = total_weight - left_weight;
                let right_sum = total_sum - left_sum;
                if left_weight <= 0.0 || right_weight <= 0.0 {
                    continue;
                }
                let score =
                    left_sum * left_sum / left_weight + right_sum * right_sum / right_weight;
                if score > best_score {
                    best_score = score;
                    best = Some(Split {
                        feature: feature as u32,
                        threshold: 0.5 * (axis[prev] + axis[current]),
                    });
                }
            }
        }
        best
    }
}

impl RegressionTree {
    /// Grow a tree on the given rows of a feature-major matrix.
    ///
    /// `target` and `weight` cover all samples; `rows` selects the training
    /// subset for this round.
    pub(crate) fn fit(
        features: ArrayView2<'_, f64>,
        target: &[f64],
        weight: &[f64],
        rows: &[u32],
        params: GrowthParams,
    ) -> Self {
        let mut builder = TreeBuilder {
            features,
            target,
            weight,
            params,
            nodes: Vec::new(),
            leaf_values: Vec::new(),
        };
        builder.grow(rows.to_vec(), 0);
        Self {
            nodes: builder.nodes,
            leaf_values: builder.leaf_values,
        }
    }

    /// Terminal region id for every sample in the matrix.
    pub fn terminal_regions(&self, features: ArrayView2<'_, f64>) -> Vec<usize> {
        (0..features.ncols())
            .map(|sample| self.region_for(features, sample))
            .collect()
    }

    fn region_for(&self, features: ArrayView2<'_, f64>, sample: usize) -> usize {
        let mut node = 0usize;
        loop {
            match &self.nodes[node] {
                Node::Branch {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if features[[*feature as usize, sample]] <= *threshold {
                        *left as usize
                    } else {
                        *right as usize
                    };
                }
                Node::Leaf { region } => return *region as usize,
            }
        }
    }

    #[inline]
    pub fn n_leaves(&self) -> usize {
        self.leaf_values.len()
    }

    #[inline]
    pub fn leaf_values(&self) -> &[f64] {
        &self.leaf_values
    }

    /// Overwrite the naive leaf outputs with loss-corrected values.
    pub(crate) fn set_leaf_values(&mut self, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.leaf_values.len());
        self.leaf_values = values;
    }

    /// Leaf output for one sample.
    pub fn value_for(&self, features: ArrayView2<'_, f64>, sample: usize) -> f64 {
        self.leaf_values[self.region_for(features, sample)]
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn grow(
        features: ndarray::Array2<f64>,
        target: &[f64],
        weight: &[f64],
        max_depth: usize,
        min_samples_leaf: usize,
    ) -> RegressionTree {
        let rows: Vec<u32> = (0..features.ncols() as u32).collect();
        RegressionTree::fit(
            features.view(),
            target,
            weight,
            &rows,
            GrowthParams {
                max_depth,
                min_samples_leaf,
            },
        )
    }

    #[test]
    fn recovers_a_step_function() {
        let features = array![[0.0, 1.0, 2.0, 3.0]];
        let tree = grow(features.clone(), &[0.0, 0.0, 1.0, 1.0], &[1.0; 4], 3, 1);
        assert_eq!(tree.n_leaves(), 2);
        let regions = tree.terminal_regions(features.view());
        assert_eq!(regions[0], regions[1]);
        assert_eq!(regions[2], regions[3]);
        assert_ne!(regions[0], regions[2]);
        assert_relative_eq!(tree.value_for(features.view(), 0), 0.0);
        assert_relative_eq!(tree.value_for(features.view(), 3), 1.0);
    }

    #[test]
    fn constant_target_stays_a_stump() {
        let features = array![[0.0, 1.0, 2.0, 3.0]];
        let tree = grow(features, &[0.5; 4], &[1.0; 4], 3, 1);
        assert_eq!(tree.n_leaves(), 1);
        assert_relative_eq!(tree.leaf_values()[0], 0.5);
    }

    #[test]
    fn depth_limit_caps_the_leaf_count() {
        let features = array![[0.0, 1.0, 2.0, 3.0]];
        let tree = grow(features, &[0.0, 1.0, 2.0, 3.0], &[1.0; 4], 1, 1);
        assert_eq!(tree.n_leaves(), 2);
    }

    #[test]
    fn min_samples_leaf_blocks_narrow_splits() {
        let features = array![[0.0, 1.0, 2.0, 3.0]];
        let tree = grow(features, &[0.0, 1.0, 2.0, 3.0], &[1.0; 4], 5, 2);
        // Only the middle split leaves two samples on each side.
        assert_eq!(tree.n_leaves(), 2);
    }

    #[test]
    fn leaf_value_is_the_weighted_target_mean() {
        let features = array![[1.0, 1.0]];
        let tree = grow(features, &[2.0, 4.0], &[1.0, 3.0], 3, 1);
        assert_eq!(tree.n_leaves(), 1);
        assert_relative_eq!(tree.leaf_values()[0], 3.5);
    }

    #[test]
    fn splits_prefer_the_informative_feature() {
        // Feature 0 is noise, feature 1 separates the target.
        let features = array![[5.0, 5.0, 5.0, 5.0], [0.0, 1.0, 2.0, 3.0]];
        let tree = grow(features.clone(), &[1.0, 1.0, -1.0, -1.0], &[1.0; 4], 1, 1);
        assert_eq!(tree.n_leaves(), 2);
        assert_relative_eq!(tree.value_for(features.view(), 0), 1.0);
        assert_relative_eq!(tree.value_for(features.view(), 2), -1.0);
    }

    #[test]
    fn fits_only_the_requested_rows() {
        let features = array![[0.0, 1.0, 2.0, 3.0]];
        let target = [0.0, 0.0, 7.0, 7.0];
        let tree = RegressionTree::fit(
            features.view(),
            &target,
            &[1.0; 4],
            &[0, 1],
            GrowthParams {
                max_depth: 3,
                min_samples_leaf: 1,
            },
        );
        // Rows 2 and 3 were out of bag: constant in-bag target, no split.
        assert_eq!(tree.n_leaves(), 1);
        assert_relative_eq!(tree.leaf_values()[0], 0.0);
        // Out-of-bag samples still map to a region.
        assert_eq!(tree.terminal_regions(features.view()), vec![0, 0, 0, 0]);
    }

    #[test]
    fn round_local_buffers_drop_while_the_view_lives() {
        // Same borrow shape as the boosting loop: one feature view held
        // across rounds, target and weight rebuilt from scratch each round.
        let features = array![[0.0, 1.0, 2.0, 3.0]];
        let view = features.view();
        let mut trees = Vec::new();
        for round in 0..3 {
            let shift = round as f64;
            let target = vec![shift, shift, shift + 1.0, shift + 1.0];
            let weight = vec![1.0; 4];
            let tree = RegressionTree::fit(
                view,
                &target,
                &weight,
                &[0, 1, 2, 3],
                GrowthParams {
                    max_depth: 3,
                    min_samples_leaf: 1,
                },
            );
            trees.push(tree);
        }
        for (round, tree) in trees.iter().enumerate() {
            assert_eq!(tree.n_leaves(), 2);
            assert_relative_eq!(tree.value_for(view, 0), round as f64);
            assert_relative_eq!(tree.value_for(view, 3), round as f64 + 1.0);
        }
    }

    #[test]
    fn corrected_leaf_values_flow_into_predictions() {
        let features = array![[0.0, 1.0, 2.0, 3.0]];
        let mut tree = grow(features.clone(), &[0.0, 0.0, 1.0, 1.0], &[1.0; 4], 3, 1);
        let regions = tree.terminal_regions(features.view());
        let mut corrected = vec![0.0; tree.n_leaves()];
        corrected[regions[0]] = -2.0;
        corrected[regions[3]] = 2.0;
        tree.set_leaf_values(corrected);
        assert_relative_eq!(tree.value_for(features.view(), 1), -2.0);
        assert_relative_eq!(tree.value_for(features.view(), 2), 2.0);
    }
}

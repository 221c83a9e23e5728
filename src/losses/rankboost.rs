//! Pairwise ranking loss with bucketed aggregation.
//!
//! The classic RankBoost objective sums `exp(p_i - p_j)` over all pairs
//! where event `j` outranks event `i`. Enumerating pairs is quadratic;
//! instead events are bucketed by rank (and by query and rank), `exp(p)`
//! and `exp(-p)` are summed per bucket, and the pair penalties collapse
//! into a small sparse matrix between buckets. Two schemes run side by
//! side: one couples all events by rank alone, one only within a query.

use bon::Builder;
use ndarray::{Array1, Array2, ArrayView1};

use super::scalar::validate_regularization;
use super::{
    required_labels, ConfigError, FittedLoss, HessianLoss, LeafUpdateContext, LossError,
    LossFunction, TreeParams,
};
use crate::data::{CsrMatrix, Dataset};
use crate::stats::bincount;

/// Penalty applied to a pair of ranks `r1 < r2` as a function of the gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankPenalty {
    /// `(r2 - r1)^2`, punishing distant rank inversions harder.
    Square,
    /// `r2 - r1`.
    Linear,
}

impl RankPenalty {
    fn gap_penalty(self, gap: f64) -> f64 {
        match self {
            RankPenalty::Square => gap * gap,
            RankPenalty::Linear => gap,
        }
    }
}

/// Ranking loss over query groups.
///
/// Labels are rank values (higher means should score higher); the query
/// column partitions events into independent ranking problems. Sample
/// weights are not part of this objective and are ignored.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct RankBoostLoss {
    /// Feature holding the query id of each event.
    pub query_column: String,
    /// Pair penalty shape. Default: [`RankPenalty::Square`].
    #[builder(default = RankPenalty::Square)]
    pub penalty: RankPenalty,
    /// Leaf refinement passes per tree. Default: 1.
    #[builder(default = 1)]
    pub update_iterations: usize,
    /// Additive term in the leaf log-ratio. Default: 0.1.
    #[builder(default = 0.1)]
    pub regularization: f64,
}

impl<S: rank_boost_loss_builder::IsComplete> RankBoostLossBuilder<S> {
    /// Build and validate the loss configuration.
    pub fn build(self) -> Result<RankBoostLoss, ConfigError> {
        let loss = self.__build_internal();
        validate_regularization(loss.regularization)?;
        if loss.update_iterations == 0 {
            return Err(ConfigError::InvalidUpdateIterations);
        }
        Ok(loss)
    }
}

/// Sorted unique values, exact float equality as bucketing key.
fn unique_sorted(values: ArrayView1<'_, f64>) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted.dedup();
    sorted
}

fn dense_index(sorted: &[f64], value: f64) -> usize {
    sorted.partition_point(|&v| v < value)
}

/// One bucketing scheme: an event-to-bucket lookup plus the scaled penalty
/// matrix between buckets.
#[derive(Debug, Clone)]
struct Scheme {
    lookup: Vec<usize>,
    n_buckets: usize,
    penalty: CsrMatrix,
}

impl Scheme {
    /// Per-bucket sums of `exp(p)` and `exp(-p)`.
    fn bucket_stats(&self, pos_exponent: &[f64], neg_exponent: &[f64]) -> (Vec<f64>, Vec<f64>) {
        (
            bincount(&self.lookup, pos_exponent, self.n_buckets),
            bincount(&self.lookup, neg_exponent, self.n_buckets),
        )
    }
}

impl LossFunction for RankBoostLoss {
    type Fitted = FittedRankBoostLoss;

    fn fit(&self, data: &Dataset) -> Result<FittedRankBoostLoss, LossError> {
        let ranks = required_labels(data)?;
        let query_axis = data.feature_index(&self.query_column)?;
        let queries = data.feature(query_axis);
        let n = data.n_samples();

        let possible_ranks = unique_sorted(ranks.view());
        let possible_queries = unique_sorted(queries);
        let n_ranks = possible_ranks.len();
        let n_queries = possible_queries.len();

        let rank_idx: Vec<usize> = ranks.iter().map(|&r| dense_index(&possible_ranks, r)).collect();
        let query_idx: Vec<usize> = queries
            .iter()
            .map(|&q| dense_index(&possible_queries, q))
            .collect();

        let mut rank_penalties = Array2::<f64>::zeros((n_ranks, n_ranks));
        for i in 0..n_ranks {
            for j in (i + 1)..n_ranks {
                rank_penalties[[i, j]] =
                    self.penalty.gap_penalty(possible_ranks[j] - possible_ranks[i]);
            }
        }

        // Scheme one: rank buckets over the whole sample.
        let global = Scheme {
            lookup: rank_idx.clone(),
            n_buckets: n_ranks,
            penalty: CsrMatrix::from_dense((&rank_penalties / (1.0 + n as f64).sqrt()).view()),
        };

        // Scheme two: (query, rank) buckets, each query's block scaled by
        // its own size so small queries are not drowned out.
        let mut query_counts = vec![0usize; n_queries];
        for &q in &query_idx {
            query_counts[q] += 1;
        }
        let blocks: Vec<CsrMatrix> = query_counts
            .iter()
            .map(|&count| {
                CsrMatrix::from_dense((&rank_penalties / (1.0 + count as f64).sqrt()).view())
            })
            .collect();
        let per_query = Scheme {
            lookup: rank_idx
                .iter()
                .zip(&query_idx)
                .map(|(&r, &q)| q * n_ranks + r)
                .collect(),
            n_buckets: n_queries * n_ranks,
            penalty: CsrMatrix::block_diag(&blocks),
        };

        log::debug!(
            "rank boost schemes: {} ranks, {} queries, {} penalty nonzeros",
            n_ranks,
            n_queries,
            global.penalty.nnz() + per_query.penalty.nnz()
        );

        Ok(FittedRankBoostLoss {
            schemes: vec![global, per_query],
            regularization: self.regularization,
            update_iterations: self.update_iterations,
        })
    }
}

/// Fitted ranking state: both bucketing schemes over the training events.
#[derive(Debug, Clone)]
pub struct FittedRankBoostLoss {
    schemes: Vec<Scheme>,
    regularization: f64,
    update_iterations: usize,
}

impl FittedRankBoostLoss {
    /// The objective is shift-invariant; centering keeps the exponents tame.
    fn centered(y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        let mean = y_pred.mean().unwrap_or(0.0);
        y_pred.mapv(|p| p - mean)
    }

    /// Per-event pair pressure from above (`w_plus`) and below (`w_minus`).
    fn pair_pressure(&self, pos_exponent: &[f64], neg_exponent: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let n = pos_exponent.len();
        let mut w_plus = vec![0.0; n];
        let mut w_minus = vec![0.0; n];
        for scheme in &self.schemes {
            let (pos_stats, neg_stats) = scheme.bucket_stats(pos_exponent, neg_exponent);
            let down = scheme.penalty.dot(&neg_stats);
            let up = scheme.penalty.transpose_dot(&pos_stats);
            for (i, &bucket) in scheme.lookup.iter().enumerate() {
                w_plus[i] += down[bucket];
                w_minus[i] += up[bucket];
            }
        }
        (w_plus, w_minus)
    }
}

impl FittedLoss for FittedRankBoostLoss {
    fn loss(&self, y_pred: ArrayView1<'_, f64>) -> f64 {
        let centered = Self::centered(y_pred);
        let pos_exponent: Vec<f64> = centered.iter().map(|&p| p.exp()).collect();
        let neg_exponent: Vec<f64> = centered.iter().map(|&p| (-p).exp()).collect();
        let mut result = 0.0;
        for scheme in &self.schemes {
            let (pos_stats, neg_stats) = scheme.bucket_stats(&pos_exponent, &neg_exponent);
            let down = scheme.penalty.dot(&neg_stats);
            result += pos_stats.iter().zip(&down).map(|(&p, &d)| p * d).sum::<f64>();
        }
        result
    }

    fn negative_gradient(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        let centered = Self::centered(y_pred);
        let pos_exponent: Vec<f64> = centered.iter().map(|&p| p.exp()).collect();
        let neg_exponent: Vec<f64> = centered.iter().map(|&p| (-p).exp()).collect();
        let (w_plus, w_minus) = self.pair_pressure(&pos_exponent, &neg_exponent);
        Array1::from_iter(
            (0..centered.len())
                .map(|i| neg_exponent[i] * w_minus[i] - pos_exponent[i] * w_plus[i]),
        )
    }

    fn tree_params(&self, y_pred: ArrayView1<'_, f64>) -> TreeParams {
        self.newton_tree_params(y_pred)
    }

    /// Iterative per-leaf refinement. Leaves interact through the pair
    /// pressure, so each closed-form step is blended 50/50 with the
    /// previous estimate instead of being applied outright.
    fn leaf_values(&self, y_pred: ArrayView1<'_, f64>, ctx: &LeafUpdateContext<'_>) -> Vec<f64> {
        let centered = Self::centered(y_pred);
        let mut leaves = vec![0.0; ctx.n_leaves];
        for _ in 0..self.update_iterations {
            let y_test: Vec<f64> = centered
                .iter()
                .zip(ctx.regions)
                .map(|(&p, &region)| p + leaves[region])
                .collect();
            let pos_exponent: Vec<f64> = y_test.iter().map(|&p| p.exp()).collect();
            let neg_exponent: Vec<f64> = y_test.iter().map(|&p| (-p).exp()).collect();
            let (w_plus, w_minus) = self.pair_pressure(&pos_exponent, &neg_exponent);

            let plus_in_leaf: Vec<f64> = w_plus
                .iter()
                .zip(&pos_exponent)
                .map(|(&w, &e)| w * e)
                .collect();
            let minus_in_leaf: Vec<f64> = w_minus
                .iter()
                .zip(&neg_exponent)
                .map(|(&w, &e)| w * e)
                .collect();
            let plus_leaf = bincount(ctx.regions, &plus_in_leaf, ctx.n_leaves);
            let minus_leaf = bincount(ctx.regions, &minus_in_leaf, ctx.n_leaves);

            for (leaf, (&plus, &minus)) in leaves.iter_mut().zip(plus_leaf.iter().zip(&minus_leaf))
            {
                let step = 0.5 * ((minus + self.regularization) / (plus + self.regularization)).ln();
                *leaf += 0.5 * step;
            }
        }
        leaves
    }
}

impl HessianLoss for FittedRankBoostLoss {
    fn hessian(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        let centered = Self::centered(y_pred);
        let pos_exponent: Vec<f64> = centered.iter().map(|&p| p.exp()).collect();
        let neg_exponent: Vec<f64> = centered.iter().map(|&p| (-p).exp()).collect();
        let (w_plus, w_minus) = self.pair_pressure(&pos_exponent, &neg_exponent);
        Array1::from_iter(
            (0..centered.len())
                .map(|i| pos_exponent[i] * w_plus[i] + neg_exponent[i] * w_minus[i]),
        )
    }

    fn regularization(&self) -> f64 {
        self.regularization
    }
}

// =============================================================================
// Tests
// =============================================================================

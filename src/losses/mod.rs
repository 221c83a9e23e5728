//! Loss functions for gradient boosting.
//!
//! A loss is an immutable hyperparameter value implementing [`LossFunction`].
//! [`LossFunction::fit`] validates the dataset and returns an owned fitted
//! state implementing [`FittedLoss`]; the boosting driver queries that state
//! once per round. Prediction vectors passed to any fitted-state method must
//! cover the same events, in the same order, as the dataset passed to `fit`.
//!
//! # The Round Contract
//!
//! Per boosting round the driver calls:
//!
//! 1. [`FittedLoss::tree_params`] - pseudo-target and weight for a
//!    weighted-MSE regression tree,
//! 2. the tree grower (external to this module), yielding a terminal-region
//!    id per event and naive leaf outputs,
//! 3. [`FittedLoss::leaf_values`] - loss-aware corrections overwriting the
//!    naive leaf outputs before they are added to the running prediction.
//!
//! Losses with a diagonal hessian implement [`HessianLoss`] on their fitted
//! state and route both calls through the provided Newton-Raphson helpers.
//!
//! # Available Losses
//!
//! - [`AdaLoss`], [`LogLoss`], [`MseLoss`], [`CompositeLoss`]: scalar
//!   classification/regression losses with closed-form derivatives
//! - [`KnnAdaLoss`]: exponential loss coupled across neighbor events through
//!   a sparse matrix, for uniformity along chosen features
//! - [`BinFlatnessLoss`], [`KnnFlatnessLoss`]: rank-based flatness penalty
//!   mixed with an exponential classification term
//! - [`RankBoostLoss`]: pairwise ranking loss with bucketed aggregation
//! - [`ReweightLoss`]: density-ratio loss driving [`GBReweighter`]
//!
//! [`GBReweighter`]: crate::reweight::GBReweighter

mod flatness;
mod matrix;
mod rankboost;
mod reweight;
mod scalar;

pub use flatness::{BinFlatnessLoss, FittedFlatnessLoss, KnnFlatnessLoss};
pub use matrix::{FittedMatrixLoss, KnnAdaLoss};
pub use rankboost::{FittedRankBoostLoss, RankBoostLoss, RankPenalty};
pub use reweight::{FittedReweightLoss, ReweightLoss};
pub use scalar::{
    AdaLoss, CompositeLoss, FittedAdaLoss, FittedCompositeLoss, FittedLogLoss, FittedMseLoss,
    LogLoss, MseLoss,
};

use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::data::{DataError, Dataset};
use crate::stats::bincount;

/// Damping added to the hessian before it is used as a division weight,
/// keeping near-zero-hessian events from blowing up the pseudo-target.
const HESSIAN_DAMPING: f64 = 0.01;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while fitting a loss to a dataset.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LossError {
    /// The dataset itself is malformed for this use.
    #[error(transparent)]
    Data(#[from] DataError),
    /// The loss requires labels and the dataset carries none.
    #[error("dataset has no labels")]
    MissingLabels,
    /// A classification loss received a label outside {0, 1}.
    #[error("label at index {index} is {value}, expected 0 or 1")]
    NonBinaryLabel { index: usize, value: f64 },
    /// A uniform label names a class with no events in the dataset.
    #[error("no events carry uniform label {label}")]
    EmptyClass { label: usize },
}

/// Errors that can occur during loss configuration validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Regularization must be non-negative.
    InvalidRegularization(f64),
    /// Flatness power must be at least 1.
    InvalidPower(f64),
    /// Neighbor count must be at least 1.
    InvalidNeighborCount,
    /// Bin count must be at least 1.
    InvalidBinCount,
    /// Group-count cap must be at least 1.
    InvalidGroupCap,
    /// Leaf update iteration count must be at least 1.
    InvalidUpdateIterations,
    /// At least one uniform feature must be named.
    NoUniformFeatures,
    /// At least one uniform label must be given.
    NoUniformLabels,
    /// Uniform labels must be distinct.
    DuplicateUniformLabel(usize),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRegularization(v) => {
                write!(f, "regularization must be non-negative, got {}", v)
            }
            Self::InvalidPower(v) => write!(f, "power must be at least 1, got {}", v),
            Self::InvalidNeighborCount => write!(f, "neighbor count must be at least 1"),
            Self::InvalidBinCount => write!(f, "n_bins must be at least 1"),
            Self::InvalidGroupCap => write!(f, "group-count cap must be at least 1"),
            Self::InvalidUpdateIterations => write!(f, "update_iterations must be at least 1"),
            Self::NoUniformFeatures => write!(f, "uniform_features must name at least one feature"),
            Self::NoUniformLabels => write!(f, "uniform_labels must contain at least one label"),
            Self::DuplicateUniformLabel(label) => {
                write!(f, "uniform label {} is listed more than once", label)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// =============================================================================
// Round Contract Types
// =============================================================================

/// Pseudo-target and per-event weight for one round's regression tree.
///
/// The external tree only minimizes weighted squared error; a loss encodes
/// its update direction in these two vectors.
#[derive(Debug, Clone)]
pub struct TreeParams {
    /// Regression target for the next tree, one value per event.
    pub target: Array1<f64>,
    /// Weight for the weighted-MSE fit, one value per event.
    pub weight: Array1<f64>,
}

/// Inputs to the leaf-value correction at the end of a round.
///
/// `regions` and `residual` cover every event in fit order; leaf ids are
/// dense in `0..n_leaves`.
#[derive(Debug, Clone, Copy)]
pub struct LeafUpdateContext<'a> {
    /// Terminal leaf id per event.
    pub regions: &'a [usize],
    /// Number of leaves in the freshly grown tree.
    pub n_leaves: usize,
    /// Naive leaf outputs produced by the tree grower.
    pub leaf_values: &'a [f64],
    /// This round's tree target, as returned by [`FittedLoss::tree_params`].
    pub residual: &'a [f64],
    /// True for events the tree was grown on. Losses may ignore this and
    /// update from the full sample.
    pub update_mask: &'a [bool],
}

// =============================================================================
// Traits
// =============================================================================

/// A loss-function configuration that can be fit to a dataset.
pub trait LossFunction {
    /// The state produced by [`fit`](Self::fit).
    type Fitted: FittedLoss;

    /// Validate the dataset and build the fitted state.
    ///
    /// Fitting caches everything derived from static data (signed labels,
    /// working weights, coupling matrices, group memberships) so per-round
    /// queries touch only the prediction vector.
    fn fit(&self, data: &Dataset) -> Result<Self::Fitted, LossError>;
}

/// Fitted loss state queried by the boosting driver each round.
pub trait FittedLoss: Send + Sync {
    /// Total loss at the given predictions.
    ///
    /// Flatness and density-ratio losses have no closed-form value and
    /// return 0; only the gradient drives those.
    fn loss(&self, y_pred: ArrayView1<'_, f64>) -> f64;

    /// Negative gradient of the loss with respect to each prediction.
    fn negative_gradient(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64>;

    /// Pseudo-target and weight for this round's regression tree.
    ///
    /// The first-order default is `(negative_gradient, ones)`.
    fn tree_params(&self, y_pred: ArrayView1<'_, f64>) -> TreeParams {
        TreeParams {
            target: self.negative_gradient(y_pred),
            weight: Array1::ones(y_pred.len()),
        }
    }

    /// Loss-aware corrections for the tree's leaf outputs.
    ///
    /// `y_pred` holds predictions before this round's tree is added. The
    /// default keeps the naive leaf outputs.
    fn leaf_values(&self, y_pred: ArrayView1<'_, f64>, ctx: &LeafUpdateContext<'_>) -> Vec<f64> {
        let _ = y_pred;
        ctx.leaf_values.to_vec()
    }
}

/// Fitted loss with a cheap diagonal hessian.
///
/// Implementors route [`FittedLoss::tree_params`] and
/// [`FittedLoss::leaf_values`] through the provided Newton-Raphson helpers,
/// turning the second-order step into a weighted least-squares problem the
/// external tree can solve.
pub trait HessianLoss: FittedLoss {
    /// Diagonal of the hessian at the given predictions.
    fn hessian(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64>;

    /// Shrinkage added to per-leaf hessian sums, fixed at fit time.
    ///
    /// The scale is the implementor's: the scalar and matrix losses return
    /// `regularization * mean(weight)`, the ranking loss returns the
    /// configured value unscaled.
    fn regularization(&self) -> f64;

    /// Newton step disguised as a weighted-MSE problem:
    /// target `grad / (hess + damping)`, weight `hess + damping`.
    fn newton_tree_params(&self, y_pred: ArrayView1<'_, f64>) -> TreeParams {
        let grad = self.negative_gradient(y_pred);
        let weight = self.hessian(y_pred) + HESSIAN_DAMPING;
        let target = &grad / &weight;
        TreeParams { target, weight }
    }

    /// Second-order-optimal leaf values
    /// `Σ(residual in leaf) / (Σ(hessian in leaf) + regularization)`.
    fn newton_leaf_values(
        &self,
        y_pred: ArrayView1<'_, f64>,
        ctx: &LeafUpdateContext<'_>,
    ) -> Vec<f64> {
        let hessian = self.hessian(y_pred).to_vec();
        let nominator = bincount(ctx.regions, ctx.residual, ctx.n_leaves);
        let denominator = bincount(ctx.regions, &hessian, ctx.n_leaves);
        nominator
            .iter()
            .zip(&denominator)
            .map(|(&n, &d)| n / (d + self.regularization()))
            .collect()
    }
}

// =============================================================================
// Shared Fit Helpers
// =============================================================================

/// Labels required; any value accepted (regression).
pub(crate) fn required_labels(data: &Dataset) -> Result<Array1<f64>, LossError> {
    Ok(data.labels().ok_or(LossError::MissingLabels)?.to_owned())
}

/// Labels required and restricted to {0, 1}.
pub(crate) fn binary_labels(data: &Dataset) -> Result<Array1<f64>, LossError> {
    let labels = required_labels(data)?;
    for (index, &value) in labels.iter().enumerate() {
        if value != 0.0 && value != 1.0 {
            return Err(LossError::NonBinaryLabel { index, value });
        }
    }
    Ok(labels)
}

/// Map {0, 1} labels to {-1, +1}.
pub(crate) fn signed_labels(labels: &Array1<f64>) -> Array1<f64> {
    labels.mapv(|y| 2.0 * y - 1.0)
}

/// Select the named feature rows into an owned `[n_features, n_samples]`
/// block, in the order the names are given.
pub(crate) fn uniform_feature_rows(
    data: &Dataset,
    names: &[String],
) -> Result<Array2<f64>, LossError> {
    let mut indices = Vec::with_capacity(names.len());
    for name in names {
        indices.push(data.feature_index(name)?);
    }
    Ok(data.features().select(Axis(0), &indices))
}

/// Validate a uniform-label configuration: non-empty and free of repeats.
pub(crate) fn validate_uniform_labels(labels: &[usize]) -> Result<(), ConfigError> {
    if labels.is_empty() {
        return Err(ConfigError::NoUniformLabels);
    }
    for (i, &label) in labels.iter().enumerate() {
        if labels[..i].contains(&label) {
            return Err(ConfigError::DuplicateUniformLabel(label));
        }
    }
    Ok(())
}

/// Sign with `sign(0) = 0`.
pub(crate) fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Indices of events carrying the given label.
pub(crate) fn label_members(labels: &Array1<f64>, label: usize) -> Vec<usize> {
    let value = label as f64;
    labels
        .iter()
        .enumerate()
        .filter(|(_, &y)| y == value)
        .map(|(i, _)| i)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    struct FixedNewton {
        grad: Array1<f64>,
        hess: Array1<f64>,
        reg: f64,
    }

    impl FittedLoss for FixedNewton {
        fn loss(&self, _y_pred: ArrayView1<'_, f64>) -> f64 {
            0.0
        }

        fn negative_gradient(&self, _y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
            self.grad.clone()
        }

        fn tree_params(&self, y_pred: ArrayView1<'_, f64>) -> TreeParams {
            self.newton_tree_params(y_pred)
        }

        fn leaf_values(
            &self,
            y_pred: ArrayView1<'_, f64>,
            ctx: &LeafUpdateContext<'_>,
        ) -> Vec<f64> {
            self.newton_leaf_values(y_pred, ctx)
        }
    }

    impl HessianLoss for FixedNewton {
        fn hessian(&self, _y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
            self.hess.clone()
        }

        fn regularization(&self) -> f64 {
            self.reg
        }
    }

    struct FirstOrder {
        grad: Array1<f64>,
    }

    impl FittedLoss for FirstOrder {
        fn loss(&self, _y_pred: ArrayView1<'_, f64>) -> f64 {
            0.0
        }

        fn negative_gradient(&self, _y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
            self.grad.clone()
        }
    }

    #[test]
    fn newton_tree_params_damp_the_hessian() {
        let loss = FixedNewton {
            grad: array![1.0, -2.0],
            hess: array![0.99, 1.99],
            reg: 0.0,
        };
        let params = loss.tree_params(array![0.0, 0.0].view());
        assert_relative_eq!(params.target[0], 1.0);
        assert_relative_eq!(params.target[1], -1.0);
        assert_relative_eq!(params.weight[0], 1.0);
        assert_relative_eq!(params.weight[1], 2.0);
    }

    #[test]
    fn single_leaf_newton_value_is_residual_over_hessian() {
        let loss = FixedNewton {
            grad: array![0.0, 0.0],
            hess: array![2.0, 2.0],
            reg: 0.0,
        };
        let y_pred = array![0.0, 0.0];
        let regions = [0usize, 0];
        let update_mask = [true, true];
        let ctx = LeafUpdateContext {
            regions: &regions,
            n_leaves: 1,
            leaf_values: &[123.0],
            residual: &[0.5, 1.0],
            update_mask: &update_mask,
        };
        let values = loss.leaf_values(y_pred.view(), &ctx);
        assert_relative_eq!(values[0], 1.5 / 4.0);
    }

    #[test]
    fn regularization_shrinks_leaf_values() {
        let loss = FixedNewton {
            grad: array![0.0],
            hess: array![1.0],
            reg: 3.0,
        };
        let y_pred = array![0.0];
        let ctx = LeafUpdateContext {
            regions: &[0],
            n_leaves: 1,
            leaf_values: &[0.0],
            residual: &[2.0],
            update_mask: &[true],
        };
        let values = loss.leaf_values(y_pred.view(), &ctx);
        assert_relative_eq!(values[0], 2.0 / 4.0);
    }

    #[test]
    fn first_order_defaults_use_gradient_and_unit_weights() {
        let loss = FirstOrder {
            grad: array![3.0, -1.0],
        };
        let params = loss.tree_params(array![0.0, 0.0].view());
        assert_eq!(params.target, array![3.0, -1.0]);
        assert_eq!(params.weight, array![1.0, 1.0]);

        let ctx = LeafUpdateContext {
            regions: &[0, 1],
            n_leaves: 2,
            leaf_values: &[0.25, -0.5],
            residual: &[3.0, -1.0],
            update_mask: &[true, true],
        };
        let values = loss.leaf_values(array![0.0, 0.0].view(), &ctx);
        assert_eq!(values, vec![0.25, -0.5]);
    }

    #[test]
    fn binary_labels_reject_other_values() {
        let data = Dataset::new(array![[0.0, 1.0, 2.0]])
            .unwrap()
            .with_labels(array![0.0, 0.5, 1.0])
            .unwrap();
        let err = binary_labels(&data).unwrap_err();
        assert!(matches!(
            err,
            LossError::NonBinaryLabel { index: 1, value } if value == 0.5
        ));
    }

    #[test]
    fn labels_are_required() {
        let data = Dataset::new(array![[0.0, 1.0]]).unwrap();
        assert!(matches!(
            required_labels(&data),
            Err(LossError::MissingLabels)
        ));
    }

    #[test]
    fn signed_labels_map_to_plus_minus_one() {
        let signed = signed_labels(&array![0.0, 1.0, 1.0]);
        assert_eq!(signed, array![-1.0, 1.0, 1.0]);
    }
}

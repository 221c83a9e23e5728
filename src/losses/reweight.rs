//! Density-ratio loss driving the gradient-boosted reweighter.
//!
//! Labels split the sample into a target distribution (0) and an original
//! distribution (1). Each round the original class's weights are multiplied
//! by `exp(p)` and both classes are renormalized to equal mass, so every
//! tree is grown on a balanced two-sample problem. Leaves then move the
//! score by the log ratio of the class masses that ended up in them.

use bon::Builder;
use ndarray::{Array1, ArrayView1};

use super::scalar::validate_regularization;
use super::{
    binary_labels, sign, ConfigError, FittedLoss, LeafUpdateContext, LossError, LossFunction,
    TreeParams,
};
use crate::data::Dataset;
use crate::stats::bincount;

/// Loss used by gradient-boosted reweighting.
///
/// Weights may be signed (background-subtracted samples); the sign travels
/// with the tree target while the tree weight uses the magnitude.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct ReweightLoss {
    /// Additive term in the leaf log-ratio. Default: 5.0.
    #[builder(default = 5.0)]
    pub regularization: f64,
}

impl<S: reweight_loss_builder::IsComplete> ReweightLossBuilder<S> {
    /// Build and validate the loss configuration.
    pub fn build(self) -> Result<ReweightLoss, ConfigError> {
        let loss = self.__build_internal();
        validate_regularization(loss.regularization)?;
        Ok(loss)
    }
}

impl Default for ReweightLoss {
    fn default() -> Self {
        Self::builder().build().expect("default config is valid")
    }
}

impl LossFunction for ReweightLoss {
    type Fitted = FittedReweightLoss;

    fn fit(&self, data: &Dataset) -> Result<FittedReweightLoss, LossError> {
        let labels = binary_labels(data)?;
        let weight = data.weight_vector();
        let signs = Array1::from_iter(
            labels
                .iter()
                .zip(&weight)
                .map(|(&y, &w)| (2.0 * y - 1.0) * sign(w)),
        );
        Ok(FittedReweightLoss {
            labels,
            weight,
            signs,
            regularization: self.regularization,
        })
    }
}

/// Fitted reweighting state.
#[derive(Debug, Clone)]
pub struct FittedReweightLoss {
    labels: Array1<f64>,
    weight: Array1<f64>,
    signs: Array1<f64>,
    regularization: f64,
}

impl FittedReweightLoss {
    /// Current-round weights: original-class weights scaled by `exp(p)`,
    /// each class renormalized to unit mass, the whole vector to mean one.
    fn round_weights(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        let mut weights = Array1::from_iter(
            self.weight
                .iter()
                .zip(&self.labels)
                .zip(y_pred)
                .map(|((&w, &y), &p)| w * (y * p).exp()),
        );
        for class in [0.0, 1.0] {
            let total: f64 = weights
                .iter()
                .zip(&self.labels)
                .filter(|(_, &y)| y == class)
                .map(|(&w, _)| w)
                .sum();
            if total != 0.0 {
                for (w, _) in weights.iter_mut().zip(&self.labels).filter(|(_, &y)| y == class) {
                    *w /= total;
                }
            }
        }
        let mean = weights.mean().unwrap_or(1.0);
        weights.mapv_into(|w| w / mean)
    }
}

impl FittedLoss for FittedReweightLoss {
    /// The density-ratio objective has no closed form; the boosting loop
    /// only needs the tree params and leaf updates.
    fn loss(&self, _y_pred: ArrayView1<'_, f64>) -> f64 {
        0.0
    }

    fn negative_gradient(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        Array1::zeros(y_pred.len())
    }

    fn tree_params(&self, y_pred: ArrayView1<'_, f64>) -> TreeParams {
        TreeParams {
            target: self.signs.clone(),
            weight: self.round_weights(y_pred).mapv_into(f64::abs),
        }
    }

    fn leaf_values(&self, y_pred: ArrayView1<'_, f64>, ctx: &LeafUpdateContext<'_>) -> Vec<f64> {
        let weights = self.round_weights(y_pred);
        let target_mass: Vec<f64> = weights
            .iter()
            .zip(&self.labels)
            .map(|(&w, &y)| (1.0 - y) * w)
            .collect();
        let original_mass: Vec<f64> = weights
            .iter()
            .zip(&self.labels)
            .map(|(&w, &y)| y * w)
            .collect();
        let target_leaf = bincount(ctx.regions, &target_mass, ctx.n_leaves);
        let original_leaf = bincount(ctx.regions, &original_mass, ctx.n_leaves);
        target_leaf
            .iter()
            .zip(&original_leaf)
            .map(|(&target, &original)| {
                // Signed weights can cancel a leaf's mass below zero.
                (target.max(0.0) + self.regularization).ln()
                    - (original.max(0.0) + self.regularization).ln()
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

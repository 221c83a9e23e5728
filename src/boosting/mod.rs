//! Gradient boosting driver.
//!
//! Wires a [`LossFunction`] to weighted-MSE regression trees. Each round the
//! fitted loss turns the current predictions into a pseudo-target and weight,
//! a tree is grown on an optional row subsample, the loss corrects the
//! tree's leaf outputs, and the scaled correction is added to the running
//! prediction vector.
//!
//! ```
//! use ndarray::array;
//! use uniboost::boosting::GradientBoosting;
//! use uniboost::data::Dataset;
//! use uniboost::losses::AdaLoss;
//!
//! let data = Dataset::new(array![[0.0, 1.0, 2.0, 3.0]])
//!     .unwrap()
//!     .with_labels(array![0.0, 0.0, 1.0, 1.0])
//!     .unwrap();
//! let model = GradientBoosting::builder()
//!     .loss(AdaLoss::default())
//!     .n_estimators(5)
//!     .build()
//!     .unwrap()
//!     .fit(&data)
//!     .unwrap();
//! assert_eq!(model.n_trees(), 5);
//! ```

mod tree;

pub use tree::{Node, RegressionTree};

use bon::Builder;
use ndarray::{Array1, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::data::Dataset;
use crate::losses::{FittedLoss, LeafUpdateContext, LossError, LossFunction};
use tree::GrowthParams;

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur during driver configuration validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// At least one boosting round is required.
    InvalidEstimatorCount,
    /// Learning rate must be positive and finite.
    InvalidLearningRate(f64),
    /// Trees need at least one level of splits.
    InvalidMaxDepth,
    /// Leaves must hold at least one sample.
    InvalidMinSamplesLeaf,
    /// Subsample fraction must lie in (0, 1].
    InvalidSubsample(f64),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEstimatorCount => write!(f, "n_estimators must be at least 1"),
            Self::InvalidLearningRate(v) => {
                write!(f, "learning_rate must be positive, got {}", v)
            }
            Self::InvalidMaxDepth => write!(f, "max_depth must be at least 1"),
            Self::InvalidMinSamplesLeaf => write!(f, "min_samples_leaf must be at least 1"),
            Self::InvalidSubsample(v) => {
                write!(f, "subsample must be in (0, 1], got {}", v)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// =============================================================================
// GradientBoosting
// =============================================================================

/// Boosting driver configuration around a loss.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct GradientBoosting<L: LossFunction> {
    /// Loss to optimize.
    pub loss: L,
    /// Number of boosting rounds (trees). Default: 100.
    #[builder(default = 100)]
    pub n_estimators: usize,
    /// Shrinkage applied to every leaf correction. Default: 0.1.
    #[builder(default = 0.1)]
    pub learning_rate: f64,
    /// Maximum tree depth. Default: 3.
    #[builder(default = 3)]
    pub max_depth: usize,
    /// Minimum samples per leaf. Default: 2.
    #[builder(default = 2)]
    pub min_samples_leaf: usize,
    /// Fraction of rows each tree is grown on. Default: 1.0.
    #[builder(default = 1.0)]
    pub subsample: f64,
    /// Seed for row subsampling. Default: 42.
    #[builder(default = 42)]
    pub seed: u64,
}

impl<L: LossFunction, S: gradient_boosting_builder::IsComplete> GradientBoostingBuilder<L, S> {
    /// Build and validate the driver configuration.
    pub fn build(self) -> Result<GradientBoosting<L>, ConfigError> {
        let driver = self.__build_internal();
        if driver.n_estimators == 0 {
            return Err(ConfigError::InvalidEstimatorCount);
        }
        if !(driver.learning_rate > 0.0 && driver.learning_rate.is_finite()) {
            return Err(ConfigError::InvalidLearningRate(driver.learning_rate));
        }
        if driver.max_depth == 0 {
            return Err(ConfigError::InvalidMaxDepth);
        }
        if driver.min_samples_leaf == 0 {
            return Err(ConfigError::InvalidMinSamplesLeaf);
        }
        if !(driver.subsample > 0.0 && driver.subsample <= 1.0) {
            return Err(ConfigError::InvalidSubsample(driver.subsample));
        }
        Ok(driver)
    }
}

impl<L: LossFunction> GradientBoosting<L> {
    /// Fit the loss, then grow and correct one tree per round.
    pub fn fit(&self, data: &Dataset) -> Result<BoostedEnsemble, LossError> {
        let fitted = self.loss.fit(data)?;
        let n = data.n_samples();
        let features = data.features();
        let growth = GrowthParams {
            max_depth: self.max_depth,
            min_samples_leaf: self.min_samples_leaf,
        };

        let mut y_pred = Array1::<f64>::zeros(n);
        let mut trees = Vec::with_capacity(self.n_estimators);
        let mut train_losses = Vec::with_capacity(self.n_estimators);
        for round in 0..self.n_estimators {
            let params = fitted.tree_params(y_pred.view());
            let target = params.target.to_vec();
            let weight = params.weight.to_vec();

            let rows = sample_rows(n, self.subsample, self.seed.wrapping_add(round as u64));
            let mut tree = RegressionTree::fit(features, &target, &weight, &rows, growth);

            let regions = tree.terminal_regions(features);
            let mut update_mask = vec![false; n];
            for &r in &rows {
                update_mask[r as usize] = true;
            }
            let ctx = LeafUpdateContext {
                regions: &regions,
                n_leaves: tree.n_leaves(),
                leaf_values: tree.leaf_values(),
                residual: &target,
                update_mask: &update_mask,
            };
            tree.set_leaf_values(fitted.leaf_values(y_pred.view(), &ctx));

            for (pred, &region) in y_pred.iter_mut().zip(&regions) {
                *pred += self.learning_rate * tree.leaf_values()[region];
            }

            let round_loss = fitted.loss(y_pred.view());
            log::debug!(
                "round {}: {} leaves, loss {:.6}",
                round,
                tree.n_leaves(),
                round_loss
            );
            train_losses.push(round_loss);
            trees.push(tree);
        }

        Ok(BoostedEnsemble {
            trees,
            learning_rate: self.learning_rate,
            n_features: data.n_features(),
            train_losses,
        })
    }
}

/// Sorted random row subset without replacement, partial Fisher-Yates.
fn sample_rows(n_rows: usize, subsample: f64, seed: u64) -> Vec<u32> {
    if subsample >= 1.0 {
        return (0..n_rows as u32).collect();
    }
    let sample_size = ((n_rows as f64 * subsample).ceil() as usize).clamp(1, n_rows);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut indices: Vec<u32> = (0..n_rows as u32).collect();
    for i in 0..sample_size {
        let j = rng.gen_range(i..n_rows);
        indices.swap(i, j);
    }
    let mut sampled = indices[..sample_size].to_vec();
    sampled.sort_unstable();
    sampled
}

// =============================================================================
// BoostedEnsemble
// =============================================================================

/// Trained ensemble: corrected trees plus the shrinkage they were fit with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostedEnsemble {
    trees: Vec<RegressionTree>,
    learning_rate: f64,
    n_features: usize,
    train_losses: Vec<f64>,
}

impl BoostedEnsemble {
    /// Cumulative score per sample over all trees.
    ///
    /// # Panics
    /// Panics if the dataset's feature count differs from training.
    pub fn decision_function(&self, data: &Dataset) -> Array1<f64> {
        self.score_features(data.features())
    }

    /// Scores after each boosting round; the last entry equals
    /// [`decision_function`](Self::decision_function).
    pub fn staged_decision_function(&self, data: &Dataset) -> Vec<Array1<f64>> {
        let features = data.features();
        self.check_features(features);
        let mut score = Array1::<f64>::zeros(features.ncols());
        let mut stages = Vec::with_capacity(self.trees.len());
        for tree in &self.trees {
            for (sample, value) in score.iter_mut().enumerate() {
                *value += self.learning_rate * tree.value_for(features, sample);
            }
            stages.push(score.clone());
        }
        stages
    }

    fn score_features(&self, features: ArrayView2<'_, f64>) -> Array1<f64> {
        self.check_features(features);
        let mut score = Array1::<f64>::zeros(features.ncols());
        for tree in &self.trees {
            for (sample, value) in score.iter_mut().enumerate() {
                *value += self.learning_rate * tree.value_for(features, sample);
            }
        }
        score
    }

    fn check_features(&self, features: ArrayView2<'_, f64>) {
        assert_eq!(
            features.nrows(),
            self.n_features,
            "expected {} features, got {}",
            self.n_features,
            features.nrows()
        );
    }

    #[inline]
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Feature count the ensemble was trained on.
    #[inline]
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    #[inline]
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Training loss recorded after each round.
    #[inline]
    pub fn train_losses(&self) -> &[f64] {
        &self.train_losses
    }

    /// The trees in fit order, leaf corrections applied.
    #[inline]
    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::losses::{AdaLoss, LogLoss, MseLoss};
    use approx::assert_relative_eq;
    use ndarray::array;

    fn classification_data() -> Dataset {
        Dataset::new(array![[0.0, 1.0, 2.0, 5.0, 6.0, 7.0]])
            .unwrap()
            .with_labels(array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0])
            .unwrap()
    }

    #[test]
    fn training_loss_decreases() {
        let model = GradientBoosting::builder()
            .loss(LogLoss::default())
            .n_estimators(20)
            .min_samples_leaf(1)
            .build()
            .unwrap()
            .fit(&classification_data())
            .unwrap();
        let losses = model.train_losses();
        assert_eq!(losses.len(), 20);
        assert!(losses[19] < losses[0]);
    }

    #[test]
    fn scores_separate_the_classes() {
        let data = classification_data();
        let model = GradientBoosting::builder()
            .loss(AdaLoss::default())
            .n_estimators(20)
            .min_samples_leaf(1)
            .build()
            .unwrap()
            .fit(&data)
            .unwrap();
        let scores = model.decision_function(&data);
        for signal in 3..6 {
            for background in 0..3 {
                assert!(scores[signal] > scores[background]);
            }
        }
    }

    #[test]
    fn staged_scores_end_at_the_full_score() {
        let data = classification_data();
        let model = GradientBoosting::builder()
            .loss(LogLoss::default())
            .n_estimators(7)
            .min_samples_leaf(1)
            .build()
            .unwrap()
            .fit(&data)
            .unwrap();
        let stages = model.staged_decision_function(&data);
        assert_eq!(stages.len(), 7);
        let full = model.decision_function(&data);
        for (staged, final_score) in stages[6].iter().zip(&full) {
            assert_relative_eq!(*staged, *final_score);
        }
    }

    #[test]
    fn same_seed_reproduces_the_model() {
        let data = classification_data();
        let build = || {
            GradientBoosting::builder()
                .loss(LogLoss::default())
                .n_estimators(10)
                .subsample(0.7)
                .min_samples_leaf(1)
                .seed(7)
                .build()
                .unwrap()
                .fit(&data)
                .unwrap()
        };
        let first = build().decision_function(&data);
        let second = build().decision_function(&data);
        assert_eq!(first.to_vec(), second.to_vec());
    }

    #[test]
    fn regression_converges_to_the_targets() {
        let data = Dataset::new(array![[0.0, 1.0, 2.0, 3.0]])
            .unwrap()
            .with_labels(array![0.0, 0.0, 2.0, 2.0])
            .unwrap();
        let model = GradientBoosting::builder()
            .loss(MseLoss::builder().regularization(0.0).build().unwrap())
            .n_estimators(40)
            .learning_rate(0.3)
            .min_samples_leaf(1)
            .build()
            .unwrap()
            .fit(&data)
            .unwrap();
        let scores = model.decision_function(&data);
        for (score, &label) in scores.iter().zip(&array![0.0, 0.0, 2.0, 2.0]) {
            assert_relative_eq!(*score, label, epsilon = 0.05);
        }
    }

    #[test]
    fn subsampling_stays_deterministic_and_sorted() {
        let rows = sample_rows(100, 0.3, 9);
        assert_eq!(rows.len(), 30);
        assert!(rows.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(rows, sample_rows(100, 0.3, 9));
        assert_ne!(rows, sample_rows(100, 0.3, 10));
    }

    #[test]
    #[should_panic(expected = "expected 1 features")]
    fn feature_count_mismatch_panics() {
        let data = classification_data();
        let model = GradientBoosting::builder()
            .loss(LogLoss::default())
            .n_estimators(2)
            .min_samples_leaf(1)
            .build()
            .unwrap()
            .fit(&data)
            .unwrap();
        let wide = Dataset::new(array![[0.0, 1.0], [2.0, 3.0]]).unwrap();
        model.decision_function(&wide);
    }

    #[test]
    fn builder_rejects_bad_configs() {
        assert!(matches!(
            GradientBoosting::builder()
                .loss(LogLoss::default())
                .n_estimators(0)
                .build(),
            Err(ConfigError::InvalidEstimatorCount)
        ));
        assert!(matches!(
            GradientBoosting::builder()
                .loss(LogLoss::default())
                .learning_rate(0.0)
                .build(),
            Err(ConfigError::InvalidLearningRate(_))
        ));
        assert!(matches!(
            GradientBoosting::builder()
                .loss(LogLoss::default())
                .max_depth(0)
                .build(),
            Err(ConfigError::InvalidMaxDepth)
        ));
        assert!(matches!(
            GradientBoosting::builder()
                .loss(LogLoss::default())
                .subsample(1.5)
                .build(),
            Err(ConfigError::InvalidSubsample(_))
        ));
    }
}

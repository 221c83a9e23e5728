//! Distribution reweighting.
//!
//! Both estimators learn per-event multiplicative weights that make an
//! *original* sample match a *target* sample: [`BinsReweighter`] takes the
//! ratio of smoothed n-dimensional histograms, [`GBReweighter`] boosts
//! [`ReweightLoss`](crate::losses::ReweightLoss) trees and exponentiates the
//! resulting score (an estimate of the log density ratio).
//!
//! Fit consumes two [`Dataset`]s and returns an immutable model. Event
//! weights are validated non-negative and rescaled to mean 1 on the way in,
//! so only relative weights matter.
//!
//! ```
//! use ndarray::array;
//! use uniboost::{BinsReweighter, Dataset};
//!
//! let original = Dataset::new(array![[0.0, 0.0, 0.0, 1.0]]).unwrap();
//! let target = Dataset::new(array![[0.0, 0.0, 1.0, 1.0]]).unwrap();
//!
//! let model = BinsReweighter::builder()
//!     .n_bins(2)
//!     .n_neighs(0.0)
//!     .build()
//!     .unwrap()
//!     .fit(&original, &target)
//!     .unwrap();
//! let corrected = model.predict_weights(&original).unwrap();
//! assert!(corrected[3] > corrected[0]);
//! ```

use bon::Builder;
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::boosting::{BoostedEnsemble, GradientBoosting};
use crate::data::{DataError, Dataset};
use crate::losses::{LossError, ReweightLoss};
use crate::stats::{bincount, searchsorted, weighted_quantile};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while fitting a reweighter or predicting weights.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReweightError {
    /// The data's feature count differs from what the model was fit on.
    #[error("expected {expected} features, got {got}")]
    FeatureCountMismatch { expected: usize, got: usize },

    /// Reweighters require non-negative event weights.
    #[error("weight at index {index} is negative: {value}")]
    NegativeWeight { index: usize, value: f64 },

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Loss(#[from] LossError),
}

/// Errors that can occur during reweighter configuration validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Bin count must be at least 1.
    InvalidBinCount,
    /// Smoothing width must be non-negative.
    InvalidSmoothing(f64),
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
    /// Leaf regularization must be non-negative.
    InvalidRegularization(f64),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBinCount => write!(f, "n_bins must be at least 1"),
            Self::InvalidSmoothing(v) => {
                write!(f, "n_neighs must be non-negative, got {}", v)
            }
            Self::InvalidEstimatorCount => write!(f, "n_estimators must be at least 1"),
            Self::InvalidLearningRate(v) => {
                write!(f, "learning_rate must be positive, got {}", v)
            }
            Self::InvalidMaxDepth => write!(f, "max_depth must be at least 1"),
            Self::InvalidMinSamplesLeaf => write!(f, "min_samples_leaf must be at least 1"),
            Self::InvalidSubsample(v) => {
                write!(f, "subsample must be in (0, 1], got {}", v)
            }
            Self::InvalidRegularization(v) => {
                write!(f, "regularization must be non-negative, got {}", v)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// =============================================================================
// Shared input handling
// =============================================================================

/// Validated event weights, rescaled to mean 1.
///
/// The signed-weight escape hatch lives in [`ReweightLoss`] for callers
/// driving the boosting loop themselves; the reweighter front doors only
/// accept non-negative weights.
fn normalized_weights(data: &Dataset) -> Result<Array1<f64>, ReweightError> {
    let weights = data.weight_vector();
    for (index, &value) in weights.iter().enumerate() {
        if value < 0.0 {
            return Err(ReweightError::NegativeWeight { index, value });
        }
    }
    let mean = weights.mean().unwrap_or(1.0);
    Ok(weights / mean)
}

fn check_feature_count(expected: usize, data: &Dataset) -> Result<(), ReweightError> {
    if data.n_features() != expected {
        return Err(ReweightError::FeatureCountMismatch {
            expected,
            got: data.n_features(),
        });
    }
    Ok(())
}

// =============================================================================
// Gaussian histogram smoothing
// =============================================================================

/// Normalized 1-d Gaussian taps, truncated at 2.5 sigma.
fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (2.5 * sigma + 0.5) as usize;
    let mut taps: Vec<f64> = (0..=2 * radius)
        .map(|tap| {
            let x = tap as f64 - radius as f64;
            (-0.5 * (x / sigma).powi(2)).exp()
        })
        .collect();
    let total: f64 = taps.iter().sum();
    for tap in &mut taps {
        *tap /= total;
    }
    taps
}

/// Map an out-of-range index back inside `0..len` by reflecting about the
/// array ends, repeating the edge samples (`d c b a | a b c d | d c b a`).
fn reflect_index(index: isize, len: usize) -> usize {
    let period = 2 * len as isize;
    let folded = (((index % period) + period) % period) as usize;
    if folded < len {
        folded
    } else {
        2 * len - 1 - folded
    }
}

/// One separable smoothing pass along `axis` of a row-major n-d array.
fn smooth_axis(values: &mut [f64], shape: &[usize], axis: usize, kernel: &[f64]) {
    let len = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    let outer: usize = shape[..axis].iter().product();
    let radius = kernel.len() / 2;

    let mut line = vec![0.0; len];
    for block in 0..outer {
        for offset in 0..inner {
            let base = block * len * inner + offset;
            for (slot, value) in line.iter_mut().enumerate() {
                *value = values[base + slot * inner];
            }
            for slot in 0..len {
                let mut acc = 0.0;
                for (tap, &weight) in kernel.iter().enumerate() {
                    let position = slot as isize + tap as isize - radius as isize;
                    acc += weight * line[reflect_index(position, len)];
                }
                values[base + slot * inner] = acc;
            }
        }
    }
}

/// In-place Gaussian blur of a flat row-major histogram, axis by axis.
fn gaussian_smooth(values: &mut [f64], shape: &[usize], sigma: f64) {
    if sigma <= 0.0 {
        return;
    }
    let kernel = gaussian_kernel(sigma);
    for axis in 0..shape.len() {
        smooth_axis(values, shape, axis, &kernel);
    }
}

// =============================================================================
// Binning
// =============================================================================

/// Flat row-major cell id per event from per-axis ordered edge search.
fn flat_bins(edges: &[Vec<f64>], n_bins: usize, data: &Dataset) -> Vec<usize> {
    let features = data.features();
    (0..data.n_samples())
        .map(|sample| {
            edges.iter().enumerate().fold(0, |id, (axis, axis_edges)| {
                id * n_bins + searchsorted(axis_edges, features[[axis, sample]])
            })
        })
        .collect()
}

/// Weighted n-d histogram of `data`, blurred with a Gaussian of width `sigma`.
fn smoothed_histogram(
    data: &Dataset,
    weight: &[f64],
    edges: &[Vec<f64>],
    n_bins: usize,
    sigma: f64,
) -> Vec<f64> {
    let shape = vec![n_bins; edges.len()];
    let bins = flat_bins(edges, n_bins, data);
    let mut histogram = bincount(&bins, weight, shape.iter().product());
    gaussian_smooth(&mut histogram, &shape, sigma);
    histogram
}

// =============================================================================
// BinsReweighter
// =============================================================================

/// Histogram reweighter configuration.
///
/// Works well for one or two features; cell counts grow as
/// `n_bins ^ n_features`, so higher dimensions thin out quickly.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct BinsReweighter {
    /// Bins per input feature. Default: 200.
    #[builder(default = 200)]
    pub n_bins: usize,
    /// Gaussian smoothing width applied to both histograms, in bins.
    /// Default: 3.0.
    #[builder(default = 3.0)]
    pub n_neighs: f64,
}

impl<S: bins_reweighter_builder::IsComplete> BinsReweighterBuilder<S> {
    /// Build and validate the reweighter configuration.
    pub fn build(self) -> Result<BinsReweighter, ConfigError> {
        let config = self.__build_internal();
        if config.n_bins == 0 {
            return Err(ConfigError::InvalidBinCount);
        }
        if !(config.n_neighs >= 0.0 && config.n_neighs.is_finite()) {
            return Err(ConfigError::InvalidSmoothing(config.n_neighs));
        }
        Ok(config)
    }
}

impl Default for BinsReweighter {
    fn default() -> Self {
        Self::builder().build().expect("default config is valid")
    }
}

impl BinsReweighter {
    /// Build the transition table between the two samples.
    ///
    /// Bin edges are weighted quantiles of the target, so target events
    /// spread evenly over each axis. Both histograms are blurred before the
    /// per-cell ratio is taken; the `+ 1` in the denominator floors the
    /// ratio in nearly empty cells.
    pub fn fit(
        &self,
        original: &Dataset,
        target: &Dataset,
    ) -> Result<BinsReweightModel, ReweightError> {
        check_feature_count(original.n_features(), target)?;
        let original_weight = normalized_weights(original)?.to_vec();
        let target_weight = normalized_weights(target)?.to_vec();

        let quantiles: Vec<f64> = (1..self.n_bins)
            .map(|q| q as f64 / self.n_bins as f64)
            .collect();
        let mut edges = Vec::with_capacity(original.n_features());
        for axis in 0..original.n_features() {
            let values = target.feature(axis).to_vec();
            edges.push(weighted_quantile(&values, &quantiles, &target_weight));
        }
        log::debug!(
            "histogram reweighter: {} bins per axis over {} features",
            self.n_bins,
            edges.len()
        );

        let original_hist =
            smoothed_histogram(original, &original_weight, &edges, self.n_bins, self.n_neighs);
        let target_hist =
            smoothed_histogram(target, &target_weight, &edges, self.n_bins, self.n_neighs);
        let transition = target_hist
            .iter()
            .zip(&original_hist)
            .map(|(&target_mass, &original_mass)| target_mass / (original_mass + 1.0))
            .collect();

        Ok(BinsReweightModel {
            n_bins: self.n_bins,
            edges,
            transition,
        })
    }
}

/// Fitted histogram reweighter: quantile edges plus the per-cell ratio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinsReweightModel {
    n_bins: usize,
    edges: Vec<Vec<f64>>,
    transition: Vec<f64>,
}

impl BinsReweightModel {
    /// Corrected weights: each event's weight times its cell's transition
    /// ratio.
    pub fn predict_weights(&self, data: &Dataset) -> Result<Array1<f64>, ReweightError> {
        check_feature_count(self.edges.len(), data)?;
        let weight = normalized_weights(data)?;
        let bins = flat_bins(&self.edges, self.n_bins, data);
        Ok(Array1::from_iter(
            bins.iter()
                .zip(&weight)
                .map(|(&bin, &w)| self.transition[bin] * w),
        ))
    }

    /// Feature count the model was fit on.
    #[inline]
    pub fn n_features(&self) -> usize {
        self.edges.len()
    }

    #[inline]
    pub fn n_bins(&self) -> usize {
        self.n_bins
    }

    /// Per-axis bin edges, `n_bins - 1` each.
    #[inline]
    pub fn edges(&self) -> &[Vec<f64>] {
        &self.edges
    }

    /// Flat row-major transition table, `n_bins ^ n_features` cells.
    #[inline]
    pub fn transition(&self) -> &[f64] {
        &self.transition
    }
}

// =============================================================================
// GBReweighter
// =============================================================================

/// Boosted reweighter configuration.
///
/// Trains [`GradientBoosting`] with [`ReweightLoss`] on the union of both
/// samples (original events labelled 1, target events 0). The boosted score
/// approximates the per-event log density ratio target/original, so
/// `exp(score)` is the multiplicative correction.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct GBReweighter {
    /// Number of boosting rounds. Default: 40.
    #[builder(default = 40)]
    pub n_estimators: usize,
    /// Shrinkage applied to every leaf correction. Default: 0.2.
    #[builder(default = 0.2)]
    pub learning_rate: f64,
    /// Maximum tree depth. Default: 4.
    #[builder(default = 4)]
    pub max_depth: usize,
    /// Minimum events per leaf; large values keep the density-ratio
    /// estimates in each leaf stable. Default: 1000.
    #[builder(default = 1000)]
    pub min_samples_leaf: usize,
    /// Fraction of rows each tree is grown on. Default: 1.0.
    #[builder(default = 1.0)]
    pub subsample: f64,
    /// Additive term in the leaf log-ratio. Default: 5.0.
    #[builder(default = 5.0)]
    pub regularization: f64,
    /// Seed for row subsampling. Default: 42.
    #[builder(default = 42)]
    pub seed: u64,
}

impl<S: g_b_reweighter_builder::IsComplete> GBReweighterBuilder<S> {
    /// Build and validate the reweighter configuration.
    pub fn build(self) -> Result<GBReweighter, ConfigError> {
        let config = self.__build_internal();
        if config.n_estimators == 0 {
            return Err(ConfigError::InvalidEstimatorCount);
        }
        if !(config.learning_rate > 0.0 && config.learning_rate.is_finite()) {
            return Err(ConfigError::InvalidLearningRate(config.learning_rate));
        }
        if config.max_depth == 0 {
            return Err(ConfigError::InvalidMaxDepth);
        }
        if config.min_samples_leaf == 0 {
            return Err(ConfigError::InvalidMinSamplesLeaf);
        }
        if !(config.subsample > 0.0 && config.subsample <= 1.0) {
            return Err(ConfigError::InvalidSubsample(config.subsample));
        }
        if !(config.regularization >= 0.0 && config.regularization.is_finite()) {
            return Err(ConfigError::InvalidRegularization(config.regularization));
        }
        Ok(config)
    }
}

impl Default for GBReweighter {
    fn default() -> Self {
        Self::builder().build().expect("default config is valid")
    }
}

impl GBReweighter {
    /// Train the density-ratio booster on the union of both samples.
    pub fn fit(
        &self,
        original: &Dataset,
        target: &Dataset,
    ) -> Result<GBReweightModel, ReweightError> {
        check_feature_count(original.n_features(), target)?;
        let original_weight = normalized_weights(original)?;
        let target_weight = normalized_weights(target)?;

        let n_original = original.n_samples();
        let n_total = n_original + target.n_samples();
        let mut features = Array2::zeros((original.n_features(), n_total));
        features
            .slice_mut(s![.., ..n_original])
            .assign(&original.features());
        features
            .slice_mut(s![.., n_original..])
            .assign(&target.features());

        let mut labels = Array1::zeros(n_total);
        labels.slice_mut(s![..n_original]).fill(1.0);

        let mut weights = Array1::zeros(n_total);
        weights.slice_mut(s![..n_original]).assign(&original_weight);
        weights.slice_mut(s![n_original..]).assign(&target_weight);

        let union = Dataset::new(features)?
            .with_labels(labels)?
            .with_weights(weights)?;

        let driver = GradientBoosting {
            loss: ReweightLoss {
                regularization: self.regularization,
            },
            n_estimators: self.n_estimators,
            learning_rate: self.learning_rate,
            max_depth: self.max_depth,
            min_samples_leaf: self.min_samples_leaf,
            subsample: self.subsample,
            seed: self.seed,
        };
        Ok(GBReweightModel {
            ensemble: driver.fit(&union)?,
        })
    }
}

/// Fitted boosted reweighter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GBReweightModel {
    ensemble: BoostedEnsemble,
}

impl GBReweightModel {
    /// Corrected weights: `exp(score) * weight`, strictly positive whenever
    /// the input weights are.
    pub fn predict_weights(&self, data: &Dataset) -> Result<Array1<f64>, ReweightError> {
        check_feature_count(self.ensemble.n_features(), data)?;
        let weight = normalized_weights(data)?;
        let scores = self.ensemble.decision_function(data);
        Ok(scores.mapv(f64::exp) * weight)
    }

    /// The underlying boosted ensemble.
    #[inline]
    pub fn ensemble(&self) -> &BoostedEnsemble {
        &self.ensemble
    }
}

// =============================================================================
// Tests
// =============================================================================

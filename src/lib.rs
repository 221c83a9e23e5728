//! uniboost: uniformity-aware losses for gradient boosting, plus distribution
//! reweighting.
//!
//! Classification and ranking losses for boosted ensembles that additionally
//! control how strongly the output score depends on chosen nuisance features
//! within a class, and two algorithms for reweighting one sample to match
//! the distribution of another.
//!
//! # Key Types
//!
//! - [`LossFunction`] / [`FittedLoss`] / [`HessianLoss`] - the loss contract
//! - [`AdaLoss`], [`LogLoss`], [`MseLoss`], [`CompositeLoss`] - scalar losses
//! - [`KnnAdaLoss`] - sparse-matrix-coupled uniformity loss
//! - [`BinFlatnessLoss`] / [`KnnFlatnessLoss`] - rank-based flatness losses
//! - [`RankBoostLoss`] - pairwise ranking loss with bucketed aggregation
//! - [`ReweightLoss`] - density-ratio loss for boosted reweighting
//! - [`GradientBoosting`] - the ensemble driver wiring losses to trees
//! - [`BinsReweighter`] / [`GBReweighter`] - fit/predict reweighters
//!
//! # Training
//!
//! Losses are immutable hyperparameter values; `fit` returns an owned fitted
//! state that the boosting driver queries each round:
//!
//! ```
//! use ndarray::array;
//! use uniboost::{Dataset, GradientBoosting, LogLoss};
//!
//! let features = array![[0.1, 0.4, 0.9, 1.3], [1.0, 0.6, 0.2, 0.1]];
//! let data = Dataset::new(features)
//!     .unwrap()
//!     .with_labels(array![0.0, 0.0, 1.0, 1.0])
//!     .unwrap();
//!
//! let booster = GradientBoosting::builder()
//!     .loss(LogLoss::default())
//!     .n_estimators(10)
//!     .build()
//!     .unwrap();
//! let model = booster.fit(&data).unwrap();
//! let scores = model.decision_function(&data);
//! assert_eq!(scores.len(), 4);
//! ```

pub mod boosting;
pub mod data;
pub mod losses;
pub mod neighbors;
pub mod reweight;
pub mod stats;

// =============================================================================
// Convenience Re-exports
// =============================================================================

// Data types (for preparing training data)
pub use data::{CsrMatrix, DataError, Dataset};

// The loss contract and concrete losses
pub use losses::{
    AdaLoss, BinFlatnessLoss, CompositeLoss, FittedLoss, HessianLoss, KnnAdaLoss, KnnFlatnessLoss,
    LeafUpdateContext, LogLoss, LossError, LossFunction, MseLoss, RankBoostLoss, RankPenalty,
    ReweightLoss, TreeParams,
};

// The boosting driver
pub use boosting::{BoostedEnsemble, GradientBoosting};

// Reweighters
pub use reweight::{
    BinsReweightModel, BinsReweighter, GBReweightModel, GBReweighter, ReweightError,
};

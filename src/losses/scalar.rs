//! Scalar classification and regression losses with closed-form derivatives.
//!
//! Every loss here has a diagonal hessian, so the fitted states implement
//! [`HessianLoss`] and route tree parameters and leaf values through the
//! Newton-Raphson helpers.

use bon::Builder;
use ndarray::{Array1, ArrayView1, Zip};

use super::{
    binary_labels, required_labels, signed_labels, ConfigError, FittedLoss, HessianLoss,
    LeafUpdateContext, LossError, LossFunction, TreeParams,
};
use crate::data::Dataset;

/// Numerically stable `1 / (1 + exp(-x))`.
#[inline]
pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Numerically stable `ln(1 + exp(x))`.
#[inline]
fn log1p_exp(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

pub(crate) fn validate_regularization(value: f64) -> Result<(), ConfigError> {
    if value < 0.0 || !value.is_finite() {
        return Err(ConfigError::InvalidRegularization(value));
    }
    Ok(())
}

// =============================================================================
// AdaLoss
// =============================================================================

/// Exponential (AdaBoost) loss for binary classification.
///
/// `loss = Σ w·exp(-s·p)` with signed labels `s = 2y - 1`.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct AdaLoss {
    /// Shrinkage added to per-leaf hessian sums, scaled by the mean event
    /// weight at fit time. Default: 5.0.
    #[builder(default = 5.0)]
    pub regularization: f64,
}

impl<S: ada_loss_builder::IsComplete> AdaLossBuilder<S> {
    /// Build and validate the loss configuration.
    pub fn build(self) -> Result<AdaLoss, ConfigError> {
        let loss = self.__build_internal();
        validate_regularization(loss.regularization)?;
        Ok(loss)
    }
}

impl Default for AdaLoss {
    fn default() -> Self {
        Self::builder().build().expect("default config is valid")
    }
}

impl LossFunction for AdaLoss {
    type Fitted = FittedAdaLoss;

    fn fit(&self, data: &Dataset) -> Result<FittedAdaLoss, LossError> {
        let labels = binary_labels(data)?;
        let weight = data.weight_vector();
        let regularization = self.regularization * weight.mean().unwrap_or(0.0);
        Ok(FittedAdaLoss {
            y_signed: signed_labels(&labels),
            weight,
            regularization,
        })
    }
}

/// Fitted state for [`AdaLoss`].
#[derive(Debug, Clone)]
pub struct FittedAdaLoss {
    y_signed: Array1<f64>,
    weight: Array1<f64>,
    regularization: f64,
}

impl FittedAdaLoss {
    fn exponents(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        Zip::from(&self.y_signed)
            .and(y_pred)
            .map_collect(|&s, &p| (-s * p).exp())
    }
}

impl FittedLoss for FittedAdaLoss {
    fn loss(&self, y_pred: ArrayView1<'_, f64>) -> f64 {
        (self.exponents(y_pred) * &self.weight).sum()
    }

    fn negative_gradient(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        let mut exps = self.exponents(y_pred);
        exps *= &self.weight;
        exps *= &self.y_signed;
        exps
    }

    fn tree_params(&self, y_pred: ArrayView1<'_, f64>) -> TreeParams {
        self.newton_tree_params(y_pred)
    }

    fn leaf_values(&self, y_pred: ArrayView1<'_, f64>, ctx: &LeafUpdateContext<'_>) -> Vec<f64> {
        self.newton_leaf_values(y_pred, ctx)
    }
}

impl HessianLoss for FittedAdaLoss {
    fn hessian(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        let mut exps = self.exponents(y_pred);
        exps *= &self.weight;
        exps
    }

    fn regularization(&self) -> f64 {
        self.regularization
    }
}

// =============================================================================
// LogLoss
// =============================================================================

/// Logistic loss (binomial deviance) for binary classification.
///
/// `loss = Σ w·ln(1 + exp(-s·p))` with signed labels `s = 2y - 1`.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct LogLoss {
    /// Shrinkage added to per-leaf hessian sums, scaled by the mean event
    /// weight at fit time. Default: 5.0.
    #[builder(default = 5.0)]
    pub regularization: f64,
}

impl<S: log_loss_builder::IsComplete> LogLossBuilder<S> {
    /// Build and validate the loss configuration.
    pub fn build(self) -> Result<LogLoss, ConfigError> {
        let loss = self.__build_internal();
        validate_regularization(loss.regularization)?;
        Ok(loss)
    }
}

impl Default for LogLoss {
    fn default() -> Self {
        Self::builder().build().expect("default config is valid")
    }
}

impl LossFunction for LogLoss {
    type Fitted = FittedLogLoss;

    fn fit(&self, data: &Dataset) -> Result<FittedLogLoss, LossError> {
        let labels = binary_labels(data)?;
        let weight = data.weight_vector();
        let regularization = self.regularization * weight.mean().unwrap_or(0.0);
        Ok(FittedLogLoss {
            y_signed: signed_labels(&labels),
            weight,
            regularization,
        })
    }
}

/// Fitted state for [`LogLoss`].
#[derive(Debug, Clone)]
pub struct FittedLogLoss {
    y_signed: Array1<f64>,
    weight: Array1<f64>,
    regularization: f64,
}

impl FittedLoss for FittedLogLoss {
    fn loss(&self, y_pred: ArrayView1<'_, f64>) -> f64 {
        Zip::from(&self.y_signed)
            .and(y_pred)
            .and(&self.weight)
            .fold(0.0, |acc, &s, &p, &w| acc + w * log1p_exp(-s * p))
    }

    fn negative_gradient(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        Zip::from(&self.y_signed)
            .and(y_pred)
            .and(&self.weight)
            .map_collect(|&s, &p, &w| s * w * sigmoid(-s * p))
    }

    fn tree_params(&self, y_pred: ArrayView1<'_, f64>) -> TreeParams {
        self.newton_tree_params(y_pred)
    }

    fn leaf_values(&self, y_pred: ArrayView1<'_, f64>, ctx: &LeafUpdateContext<'_>) -> Vec<f64> {
        self.newton_leaf_values(y_pred, ctx)
    }
}

impl HessianLoss for FittedLogLoss {
    fn hessian(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        Zip::from(&self.y_signed)
            .and(y_pred)
            .and(&self.weight)
            .map_collect(|&s, &p, &w| {
                let e = sigmoid(s * p);
                w * e * (1.0 - e)
            })
    }

    fn regularization(&self) -> f64 {
        self.regularization
    }
}

// =============================================================================
// MseLoss
// =============================================================================

/// Mean squared error loss for regression.
///
/// `loss = 0.5·Σ w·(y - p)²`; any real-valued labels are accepted.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct MseLoss {
    /// Shrinkage added to per-leaf hessian sums, scaled by the mean event
    /// weight at fit time. Default: 5.0.
    #[builder(default = 5.0)]
    pub regularization: f64,
}

impl<S: mse_loss_builder::IsComplete> MseLossBuilder<S> {
    /// Build and validate the loss configuration.
    pub fn build(self) -> Result<MseLoss, ConfigError> {
        let loss = self.__build_internal();
        validate_regularization(loss.regularization)?;
        Ok(loss)
    }
}

impl Default for MseLoss {
    fn default() -> Self {
        Self::builder().build().expect("default config is valid")
    }
}

impl LossFunction for MseLoss {
    type Fitted = FittedMseLoss;

    fn fit(&self, data: &Dataset) -> Result<FittedMseLoss, LossError> {
        let labels = required_labels(data)?;
        let weight = data.weight_vector();
        let regularization = self.regularization * weight.mean().unwrap_or(0.0);
        Ok(FittedMseLoss {
            labels,
            weight,
            regularization,
        })
    }
}

/// Fitted state for [`MseLoss`].
#[derive(Debug, Clone)]
pub struct FittedMseLoss {
    labels: Array1<f64>,
    weight: Array1<f64>,
    regularization: f64,
}

impl FittedLoss for FittedMseLoss {
    fn loss(&self, y_pred: ArrayView1<'_, f64>) -> f64 {
        Zip::from(&self.labels)
            .and(y_pred)
            .and(&self.weight)
            .fold(0.0, |acc, &y, &p, &w| acc + 0.5 * w * (y - p) * (y - p))
    }

    fn negative_gradient(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        Zip::from(&self.labels)
            .and(y_pred)
            .and(&self.weight)
            .map_collect(|&y, &p, &w| w * (y - p))
    }

    fn tree_params(&self, y_pred: ArrayView1<'_, f64>) -> TreeParams {
        self.newton_tree_params(y_pred)
    }

    fn leaf_values(&self, y_pred: ArrayView1<'_, f64>, ctx: &LeafUpdateContext<'_>) -> Vec<f64> {
        self.newton_leaf_values(y_pred, ctx)
    }
}

impl HessianLoss for FittedMseLoss {
    fn hessian(&self, _y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        self.weight.clone()
    }

    fn regularization(&self) -> f64 {
        self.regularization
    }
}

// =============================================================================
// CompositeLoss
// =============================================================================

/// Logistic loss on signal, half-scale exponential loss on background.
///
/// `loss = Σ_sig w·ln(1 + exp(-p)) + Σ_bck w·exp(p/2)`. The asymmetry favors
/// a clean low-background tail, which suits significance-style objectives.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct CompositeLoss {
    /// Shrinkage added to per-leaf hessian sums, scaled by the mean event
    /// weight at fit time. Default: 5.0.
    #[builder(default = 5.0)]
    pub regularization: f64,
}

impl<S: composite_loss_builder::IsComplete> CompositeLossBuilder<S> {
    /// Build and validate the loss configuration.
    pub fn build(self) -> Result<CompositeLoss, ConfigError> {
        let loss = self.__build_internal();
        validate_regularization(loss.regularization)?;
        Ok(loss)
    }
}

impl Default for CompositeLoss {
    fn default() -> Self {
        Self::builder().build().expect("default config is valid")
    }
}

impl LossFunction for CompositeLoss {
    type Fitted = FittedCompositeLoss;

    fn fit(&self, data: &Dataset) -> Result<FittedCompositeLoss, LossError> {
        let labels = binary_labels(data)?;
        let weight = data.weight_vector();
        let regularization = self.regularization * weight.mean().unwrap_or(0.0);
        let signal_weight = &labels * &weight;
        let background_weight = labels.mapv(|y| 1.0 - y) * &weight;
        Ok(FittedCompositeLoss {
            signal_weight,
            background_weight,
            regularization,
        })
    }
}

/// Fitted state for [`CompositeLoss`].
#[derive(Debug, Clone)]
pub struct FittedCompositeLoss {
    signal_weight: Array1<f64>,
    background_weight: Array1<f64>,
    regularization: f64,
}

impl FittedLoss for FittedCompositeLoss {
    fn loss(&self, y_pred: ArrayView1<'_, f64>) -> f64 {
        Zip::from(&self.signal_weight)
            .and(&self.background_weight)
            .and(y_pred)
            .fold(0.0, |acc, &sw, &bw, &p| {
                acc + sw * log1p_exp(-p) + bw * (0.5 * p).exp()
            })
    }

    fn negative_gradient(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        Zip::from(&self.signal_weight)
            .and(&self.background_weight)
            .and(y_pred)
            .map_collect(|&sw, &bw, &p| sw * sigmoid(-p) - 0.5 * bw * (0.5 * p).exp())
    }

    fn tree_params(&self, y_pred: ArrayView1<'_, f64>) -> TreeParams {
        self.newton_tree_params(y_pred)
    }

    fn leaf_values(&self, y_pred: ArrayView1<'_, f64>, ctx: &LeafUpdateContext<'_>) -> Vec<f64> {
        self.newton_leaf_values(y_pred, ctx)
    }
}

impl HessianLoss for FittedCompositeLoss {
    fn hessian(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        Zip::from(&self.signal_weight)
            .and(&self.background_weight)
            .and(y_pred)
            .map_collect(|&sw, &bw, &p| {
                let e = sigmoid(-p);
                sw * e * (1.0 - e) + 0.25 * bw * (0.5 * p).exp()
            })
    }

    fn regularization(&self) -> f64 {
        self.regularization
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Rank-based flatness losses.
//!
//! These penalize, per uniform class, the gap between an event's rank
//! position inside a local group and its rank position over the whole class.
//! Groups come either from staggered bins over the uniform features
//! ([`BinFlatnessLoss`]) or from each event's neighbor set
//! ([`KnnFlatnessLoss`]). The penalty has no closed-form loss value; only
//! its gradient feeds the boosting loop, mixed with a clipped exponential
//! classification term.

use bon::Builder;
use ndarray::{aview1, Array1, Array2, ArrayView1};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::collections::BTreeMap;

use super::{
    binary_labels, label_members, sign, signed_labels, uniform_feature_rows,
    validate_uniform_labels, ConfigError, FittedLoss, LossError, LossFunction,
};
use crate::data::Dataset;
use crate::neighbors::knn_indices;
use crate::stats::{searchsorted, weighted_positions};

/// Exponent of the margin, clipped high so badly misclassified events cannot
/// dominate the gradient.
fn exp_margin(margin: f64) -> f64 {
    margin.clamp(-1e5, 2.0).exp()
}

fn validate_flatness_params(
    uniform_features: &[String],
    uniform_labels: &[usize],
    power: f64,
) -> Result<(), ConfigError> {
    if uniform_features.is_empty() {
        return Err(ConfigError::NoUniformFeatures);
    }
    validate_uniform_labels(uniform_labels)?;
    if power < 1.0 || !power.is_finite() {
        return Err(ConfigError::InvalidPower(power));
    }
    Ok(())
}

// =============================================================================
// BinFlatnessLoss
// =============================================================================

/// Flatness penalty over staggered bins of the uniform features.
///
/// Each uniform class is split into `n_bins` cells per feature, twice, with
/// the second grid offset by half a bin width. Unioning both partitions'
/// groups cancels discretization edge artifacts; events belonging to two
/// groups have their contribution halved through an occurrence counter.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct BinFlatnessLoss {
    /// Features along which the score should stay uniform.
    pub uniform_features: Vec<String>,
    /// Labels of the classes whose scores are made uniform.
    pub uniform_labels: Vec<usize>,
    /// Bins per feature in each grid. Default: 10.
    #[builder(default = 10)]
    pub n_bins: usize,
    /// Exponent of the rank discrepancy `|local - global|^power`. Default: 2.
    #[builder(default = 2.0)]
    pub power: f64,
    /// Scale of the exponential classification term. Default: 1.0.
    #[builder(default = 1.0)]
    pub ada_coefficient: f64,
    /// Keep gradient components whose sign opposes the event's class.
    /// Default: true.
    #[builder(default = true)]
    pub allow_wrong_signs: bool,
}

impl<S: bin_flatness_loss_builder::IsComplete> BinFlatnessLossBuilder<S> {
    /// Build and validate the loss configuration.
    pub fn build(self) -> Result<BinFlatnessLoss, ConfigError> {
        let loss = self.__build_internal();
        validate_flatness_params(&loss.uniform_features, &loss.uniform_labels, loss.power)?;
        if loss.n_bins == 0 {
            return Err(ConfigError::InvalidBinCount);
        }
        Ok(loss)
    }
}

impl LossFunction for BinFlatnessLoss {
    type Fitted = FittedFlatnessLoss;

    fn fit(&self, data: &Dataset) -> Result<FittedFlatnessLoss, LossError> {
        fit_flatness(
            data,
            &self.uniform_features,
            &self.uniform_labels,
            self.power,
            self.ada_coefficient,
            self.allow_wrong_signs,
            |features, members| bin_groups(features, members, self.n_bins),
        )
    }
}

/// Group label events by flat bin id over one edge grid.
fn grid_groups(features: &Array2<f64>, members: &[usize], edges: &[Vec<f64>]) -> Vec<Vec<usize>> {
    let mut by_bin: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &i in members {
        let mut id = 0usize;
        for (axis, axis_edges) in features.rows().into_iter().zip(edges) {
            id = id * (axis_edges.len() + 1) + searchsorted(axis_edges, axis[i]);
        }
        by_bin.entry(id).or_default().push(i);
    }
    by_bin.into_values().collect()
}

fn bin_groups(features: &Array2<f64>, members: &[usize], n_bins: usize) -> Vec<Vec<usize>> {
    // 2*n_bins+1 evenly spaced points over the class range of each feature;
    // odd points form one edge grid, even interior points the offset grid.
    let mut extended: Vec<Vec<f64>> = Vec::with_capacity(features.nrows());
    for axis in features.rows() {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &i in members {
            lo = lo.min(axis[i]);
            hi = hi.max(axis[i]);
        }
        let count = 2 * n_bins + 1;
        let step = (hi - lo) / (count - 1) as f64;
        extended.push((0..count).map(|k| lo + step * k as f64).collect());
    }

    let mut groups = Vec::new();
    for shift in 0..2usize {
        let edges: Vec<Vec<f64>> = extended
            .iter()
            .map(|axis| {
                axis[1 + shift..axis.len() - 1]
                    .iter()
                    .copied()
                    .step_by(2)
                    .collect()
            })
            .collect();
        groups.extend(grid_groups(features, members, &edges));
    }
    groups
}

// =============================================================================
// KnnFlatnessLoss
// =============================================================================

/// Flatness penalty over each event's nearest-neighbor set.
///
/// Every uniform-class event contributes one group: its `n_neighbours`
/// nearest same-class events. When a class has more events than
/// `max_group_count`, that many groups are drawn with replacement using the
/// seeded generator; over many boosting rounds the subsample is unbiased.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct KnnFlatnessLoss {
    /// Features along which the score should stay uniform.
    pub uniform_features: Vec<String>,
    /// Labels of the classes whose scores are made uniform.
    pub uniform_labels: Vec<usize>,
    /// Neighbors per group. Default: 100.
    #[builder(default = 100)]
    pub n_neighbours: usize,
    /// Exponent of the rank discrepancy `|local - global|^power`. Default: 2.
    #[builder(default = 2.0)]
    pub power: f64,
    /// Scale of the exponential classification term. Default: 1.0.
    #[builder(default = 1.0)]
    pub ada_coefficient: f64,
    /// Keep gradient components whose sign opposes the event's class.
    /// Default: true.
    #[builder(default = true)]
    pub allow_wrong_signs: bool,
    /// Cap on groups kept per class. Default: 3000.
    #[builder(default = 3000)]
    pub max_group_count: usize,
    /// Seed for group subsampling. Default: 42.
    #[builder(default = 42)]
    pub seed: u64,
}

impl<S: knn_flatness_loss_builder::IsComplete> KnnFlatnessLossBuilder<S> {
    /// Build and validate the loss configuration.
    pub fn build(self) -> Result<KnnFlatnessLoss, ConfigError> {
        let loss = self.__build_internal();
        validate_flatness_params(&loss.uniform_features, &loss.uniform_labels, loss.power)?;
        if loss.n_neighbours == 0 {
            return Err(ConfigError::InvalidNeighborCount);
        }
        if loss.max_group_count == 0 {
            return Err(ConfigError::InvalidGroupCap);
        }
        Ok(loss)
    }
}

impl LossFunction for KnnFlatnessLoss {
    type Fitted = FittedFlatnessLoss;

    fn fit(&self, data: &Dataset) -> Result<FittedFlatnessLoss, LossError> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed);
        fit_flatness(
            data,
            &self.uniform_features,
            &self.uniform_labels,
            self.power,
            self.ada_coefficient,
            self.allow_wrong_signs,
            |features, members| {
                let groups = knn_indices(features.view(), members, members, self.n_neighbours);
                if groups.len() > self.max_group_count {
                    (0..self.max_group_count)
                        .map(|_| groups[rng.gen_range(0..groups.len())].clone())
                        .collect()
                } else {
                    groups
                }
            },
        )
    }
}

// =============================================================================
// FittedFlatnessLoss
// =============================================================================

/// One uniform class: all of its events plus its group memberships.
#[derive(Debug, Clone)]
struct LabelGroups {
    members: Vec<usize>,
    groups: Vec<Vec<usize>>,
}

/// Fitted state shared by the bin and knn flatness losses.
#[derive(Debug, Clone)]
pub struct FittedFlatnessLoss {
    label_groups: Vec<LabelGroups>,
    y_signed: Array1<f64>,
    weight: Array1<f64>,
    divided_weight: Array1<f64>,
    power: f64,
    ada_coefficient: f64,
    allow_wrong_signs: bool,
}

fn fit_flatness<F>(
    data: &Dataset,
    uniform_features: &[String],
    uniform_labels: &[usize],
    power: f64,
    ada_coefficient: f64,
    allow_wrong_signs: bool,
    mut compute_groups: F,
) -> Result<FittedFlatnessLoss, LossError>
where
    F: FnMut(&Array2<f64>, &[usize]) -> Vec<Vec<usize>>,
{
    let labels = binary_labels(data)?;
    let weight = data.weight_vector();
    let features = uniform_feature_rows(data, uniform_features)?;
    let n = data.n_samples();

    let mut label_groups = Vec::with_capacity(uniform_labels.len());
    let mut occurrences = vec![0usize; n];
    for &label in uniform_labels {
        let members = label_members(&labels, label);
        if members.is_empty() {
            return Err(LossError::EmptyClass { label });
        }
        let groups = compute_groups(&features, &members);
        for group in &groups {
            for &i in group {
                occurrences[i] += 1;
            }
        }
        label_groups.push(LabelGroups { members, groups });
    }

    // Sparse coverage means most of a class never feels the penalty; that is
    // a binning/neighbor configuration signal, not a fatal condition.
    let out_of_groups = labels
        .iter()
        .zip(&occurrences)
        .filter(|(&y, &occ)| occ == 0 && uniform_labels.iter().any(|&l| l as f64 == y))
        .count();
    if out_of_groups as f64 > 0.01 * n as f64 {
        log::warn!("{} events fall outside every flatness group", out_of_groups);
    }

    let divided_weight = Array1::from_iter(
        weight
            .iter()
            .zip(&occurrences)
            .map(|(&w, &occ)| w / occ.max(1) as f64),
    );

    Ok(FittedFlatnessLoss {
        label_groups,
        y_signed: signed_labels(&labels),
        weight,
        divided_weight,
        power,
        ada_coefficient,
        allow_wrong_signs,
    })
}

impl FittedFlatnessLoss {
    /// Total number of groups across all uniform classes.
    pub fn n_groups(&self) -> usize {
        self.label_groups.iter().map(|lg| lg.groups.len()).sum()
    }
}

impl FittedLoss for FittedFlatnessLoss {
    /// The penalty has no usable closed form; boosting only consumes the
    /// gradient.
    fn loss(&self, _y_pred: ArrayView1<'_, f64>) -> f64 {
        0.0
    }

    fn negative_gradient(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        let n = y_pred.len();
        let mut gradient = Array1::<f64>::zeros(n);

        for label_groups in &self.label_groups {
            let members = &label_groups.members;
            let member_preds: Vec<f64> = members.iter().map(|&i| y_pred[i]).collect();
            let member_weights: Vec<f64> = members.iter().map(|&i| self.weight[i]).collect();
            let positions = weighted_positions(aview1(&member_preds), aview1(&member_weights));
            let mut global = vec![0.0; n];
            for (k, &i) in members.iter().enumerate() {
                global[i] = positions[k];
            }

            for group in &label_groups.groups {
                let group_preds: Vec<f64> = group.iter().map(|&i| y_pred[i]).collect();
                let group_weights: Vec<f64> = group.iter().map(|&i| self.weight[i]).collect();
                let local = weighted_positions(aview1(&group_preds), aview1(&group_weights));
                for (k, &i) in group.iter().enumerate() {
                    let diff = local[k] - global[i];
                    gradient[i] += self.power * sign(diff) * diff.abs().powf(self.power - 1.0);
                }
            }
        }

        gradient *= &self.divided_weight;

        for (((g, &s), &w), &p) in gradient
            .iter_mut()
            .zip(&self.y_signed)
            .zip(&self.weight)
            .zip(y_pred)
        {
            *g += self.ada_coefficient * s * w * exp_margin(-s * p);
        }

        if !self.allow_wrong_signs {
            for (g, &s) in gradient.iter_mut().zip(&self.y_signed) {
                *g = s * (s * *g).clamp(0.0, 1e5);
            }
        }

        gradient
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Exponential loss coupled across events through a sparse matrix.
//!
//! The loss is `Σ_g w_g·exp(-A_g·(s⊙p))` where each row of `A` mixes the
//! signed predictions of a group of events. [`KnnAdaLoss`] builds `A` from
//! nearest-neighbor sets along chosen features, dragging each event's score
//! toward its neighborhood and thereby flattening the score along those
//! features. With an identity `A` the loss reduces to plain [`AdaLoss`].
//!
//! [`AdaLoss`]: super::AdaLoss

use bon::Builder;
use ndarray::{Array1, ArrayView1};

use super::{
    binary_labels, label_members, signed_labels, uniform_feature_rows, validate_uniform_labels,
    ConfigError, FittedLoss, HessianLoss, LeafUpdateContext, LossError, LossFunction, TreeParams,
};
use crate::data::{CsrMatrix, Dataset};
use crate::neighbors::knn_indices;

/// Damping added to per-leaf denominators in the projected Newton step.
const LEAF_DAMPING: f64 = 1e-5;

// =============================================================================
// KnnAdaLoss
// =============================================================================

/// Exponential loss averaged over each event's nearest neighbors.
///
/// For every event of a uniform class, one coupling row holds
/// `row_norm / knn` at that event's `knn` nearest neighbors (measured along
/// `uniform_features`), with row weight equal to the mean event weight over
/// those neighbors. Events of all other classes keep an identity row, so the
/// stacked matrix is square `[n, n]` and those events see an unmixed
/// exponential loss.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct KnnAdaLoss {
    /// Features along which the score should stay uniform.
    pub uniform_features: Vec<String>,
    /// Labels of the classes whose scores are made uniform.
    pub uniform_labels: Vec<usize>,
    /// Neighbors per coupling row. Default: 10.
    #[builder(default = 10)]
    pub knn: usize,
    /// Restrict neighbor search to events of the same class. Default: true.
    #[builder(default = true)]
    pub distinguish_classes: bool,
    /// Total value of each coupling row. Default: 1.0.
    #[builder(default = 1.0)]
    pub row_norm: f64,
    /// Shrinkage added to per-leaf hessian sums, scaled by the mean event
    /// weight at fit time. Default: 5.0.
    #[builder(default = 5.0)]
    pub regularization: f64,
}

impl<S: knn_ada_loss_builder::IsComplete> KnnAdaLossBuilder<S> {
    /// Build and validate the loss configuration.
    pub fn build(self) -> Result<KnnAdaLoss, ConfigError> {
        let loss = self.__build_internal();
        if loss.uniform_features.is_empty() {
            return Err(ConfigError::NoUniformFeatures);
        }
        validate_uniform_labels(&loss.uniform_labels)?;
        if loss.knn == 0 {
            return Err(ConfigError::InvalidNeighborCount);
        }
        if loss.regularization < 0.0 || !loss.regularization.is_finite() {
            return Err(ConfigError::InvalidRegularization(loss.regularization));
        }
        Ok(loss)
    }
}

impl LossFunction for KnnAdaLoss {
    type Fitted = FittedMatrixLoss;

    fn fit(&self, data: &Dataset) -> Result<FittedMatrixLoss, LossError> {
        let labels = binary_labels(data)?;
        let weight = data.weight_vector();
        let features = uniform_feature_rows(data, &self.uniform_features)?;
        let n = data.n_samples();
        let all: Vec<usize> = (0..n).collect();

        let mut parts = Vec::new();
        let mut row_weight = Vec::with_capacity(n);

        for &label in &self.uniform_labels {
            let members = label_members(&labels, label);
            if members.is_empty() {
                return Err(LossError::EmptyClass { label });
            }
            let candidates: &[usize] = if self.distinguish_classes {
                &members
            } else {
                &all
            };
            let neighbor_rows = knn_indices(features.view(), &members, candidates, self.knn);
            let mut rows = Vec::with_capacity(members.len());
            for neighbors in &neighbor_rows {
                let value = self.row_norm / neighbors.len() as f64;
                rows.push(
                    neighbors
                        .iter()
                        .map(|&i| (i as u32, value))
                        .collect::<Vec<_>>(),
                );
                let mean_weight =
                    neighbors.iter().map(|&i| weight[i]).sum::<f64>() / neighbors.len() as f64;
                row_weight.push(mean_weight);
            }
            parts.push(CsrMatrix::from_rows(&rows, n));
        }

        // Events outside the uniform classes keep an unmixed exponential term.
        for label in 0..=1usize {
            if self.uniform_labels.contains(&label) {
                continue;
            }
            let members = label_members(&labels, label);
            if members.is_empty() {
                continue;
            }
            let rows: Vec<Vec<(u32, f64)>> = members
                .iter()
                .map(|&i| vec![(i as u32, self.row_norm)])
                .collect();
            row_weight.extend(members.iter().map(|&i| weight[i]));
            parts.push(CsrMatrix::from_rows(&rows, n));
        }

        let matrix = CsrMatrix::vstack(&parts);
        debug_assert_eq!(matrix.n_rows(), n);
        log::debug!(
            "knn ada coupling matrix: {} rows, {} nonzeros, density {:.5}",
            matrix.n_rows(),
            matrix.nnz(),
            matrix.density()
        );

        let regularization = self.regularization * weight.mean().unwrap_or(0.0);
        Ok(FittedMatrixLoss::from_parts(
            matrix,
            row_weight,
            signed_labels(&labels),
            regularization,
        ))
    }
}

// =============================================================================
// FittedMatrixLoss
// =============================================================================

/// Fitted state of a sparse-matrix-coupled exponential loss.
#[derive(Debug, Clone)]
pub struct FittedMatrixLoss {
    matrix: CsrMatrix,
    matrix_sq: CsrMatrix,
    row_weight: Vec<f64>,
    y_signed: Array1<f64>,
    regularization: f64,
}

impl FittedMatrixLoss {
    pub(crate) fn from_parts(
        matrix: CsrMatrix,
        row_weight: Vec<f64>,
        y_signed: Array1<f64>,
        regularization: f64,
    ) -> Self {
        debug_assert_eq!(matrix.n_rows(), row_weight.len());
        debug_assert_eq!(matrix.n_cols(), y_signed.len());
        let matrix_sq = matrix.elementwise_square();
        Self {
            matrix,
            matrix_sq,
            row_weight,
            y_signed,
            regularization,
        }
    }

    /// The coupling matrix built at fit time.
    #[inline]
    pub fn coupling_matrix(&self) -> &CsrMatrix {
        &self.matrix
    }

    /// Per-row `w_g·exp(-A_g·(s⊙p))`.
    fn weighted_exponents(&self, y_pred: ArrayView1<'_, f64>) -> Vec<f64> {
        let signed_pred: Vec<f64> = self
            .y_signed
            .iter()
            .zip(y_pred.iter())
            .map(|(&s, &p)| s * p)
            .collect();
        let mut exps = self.matrix.dot(&signed_pred);
        for (e, &w) in exps.iter_mut().zip(&self.row_weight) {
            *e = w * (-*e).exp();
        }
        exps
    }
}

impl FittedLoss for FittedMatrixLoss {
    fn loss(&self, y_pred: ArrayView1<'_, f64>) -> f64 {
        self.weighted_exponents(y_pred).iter().sum()
    }

    fn negative_gradient(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        let weighted = self.weighted_exponents(y_pred);
        let mut gradient = Array1::from_vec(self.matrix.transpose_dot(&weighted));
        gradient *= &self.y_signed;
        gradient
    }

    fn tree_params(&self, y_pred: ArrayView1<'_, f64>) -> TreeParams {
        self.newton_tree_params(y_pred)
    }

    /// The coupling rows tie events in different leaves together, so leaf
    /// sums cannot be formed independently. Project the signed leaf
    /// indicator through the matrix and take the Newton step in that basis.
    fn leaf_values(&self, y_pred: ArrayView1<'_, f64>, ctx: &LeafUpdateContext<'_>) -> Vec<f64> {
        let weighted = self.weighted_exponents(y_pred);
        let mut nominator = vec![0.0; ctx.n_leaves];
        let mut denominator = vec![0.0; ctx.n_leaves];
        let mut projected = vec![0.0; ctx.n_leaves];

        for g in 0..self.matrix.n_rows() {
            projected.fill(0.0);
            for (i, a) in self.matrix.row(g) {
                projected[ctx.regions[i]] += a * self.y_signed[i];
            }
            let wexp = weighted[g];
            for (leaf, &z) in projected.iter().enumerate() {
                nominator[leaf] += z * wexp;
                denominator[leaf] += z * z * wexp;
            }
        }

        nominator
            .iter()
            .zip(&denominator)
            .map(|(&n, &d)| n / (d + LEAF_DAMPING))
            .collect()
    }
}

impl HessianLoss for FittedMatrixLoss {
    fn hessian(&self, y_pred: ArrayView1<'_, f64>) -> Array1<f64> {
        let weighted = self.weighted_exponents(y_pred);
        Array1::from_vec(self.matrix_sq.transpose_dot(&weighted))
    }

    fn regularization(&self) -> f64 {
        self.regularization
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::losses::AdaLoss;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn uniform_dataset() -> Dataset {
        // Feature "mass" drives the neighbor structure; "other" is inert.
        Dataset::from_rows(
            array![
                [0.0, 5.0],
                [1.0, 4.0],
                [2.0, 3.0],
                [10.0, 2.0],
                [11.0, 1.0],
                [12.0, 0.0]
            ]
            .view(),
        )
        .unwrap()
        .with_names(["mass", "other"])
        .unwrap()
        .with_labels(array![1.0, 1.0, 1.0, 0.0, 0.0, 1.0])
        .unwrap()
    }

    fn knn_loss(knn: usize) -> KnnAdaLoss {
        KnnAdaLoss::builder()
            .uniform_features(vec!["mass".to_string()])
            .uniform_labels(vec![1])
            .knn(knn)
            .build()
            .unwrap()
    }

    #[test]
    fn coupling_matrix_is_square() {
        let fitted = knn_loss(2).fit(&uniform_dataset()).unwrap();
        assert_eq!(fitted.coupling_matrix().n_rows(), 6);
        assert_eq!(fitted.coupling_matrix().n_cols(), 6);
    }

    #[test]
    fn uniform_rows_spread_over_neighbors() {
        let fitted = knn_loss(2).fit(&uniform_dataset()).unwrap();
        // Event 0 (label 1, mass 0.0): nearest same-class events are 0 and 1.
        let row: Vec<_> = fitted.coupling_matrix().row(0).collect();
        assert_eq!(row, vec![(0, 0.5), (1, 0.5)]);
    }

    #[test]
    fn other_class_rows_are_identity() {
        let fitted = knn_loss(2).fit(&uniform_dataset()).unwrap();
        // Label-1 rows come first (4 of them), then label-0 identity rows.
        let row: Vec<_> = fitted.coupling_matrix().row(4).collect();
        assert_eq!(row, vec![(3, 1.0)]);
        let row: Vec<_> = fitted.coupling_matrix().row(5).collect();
        assert_eq!(row, vec![(4, 1.0)]);
    }

    #[test]
    fn row_weights_average_neighbor_weights() {
        let data = Dataset::new(array![[0.0, 1.0, 10.0]])
            .unwrap()
            .with_names(["mass"])
            .unwrap()
            .with_labels(array![1.0, 1.0, 0.0])
            .unwrap()
            .with_weights(array![1.0, 3.0, 7.0])
            .unwrap();
        let fitted = knn_loss(2).fit(&data).unwrap();
        // Both label-1 rows average the weights of events 0 and 1; at zero
        // predictions the loss is the plain weight sum 2 + 2 + 7.
        assert_relative_eq!(fitted.loss(array![0.0, 0.0, 0.0].view()), 11.0);
    }

    #[test]
    fn identity_coupling_matches_plain_ada() {
        let data = Dataset::new(array![[0.0, 1.0, 2.0, 3.0]])
            .unwrap()
            .with_names(["f0"])
            .unwrap()
            .with_labels(array![0.0, 1.0, 0.0, 1.0])
            .unwrap()
            .with_weights(array![1.0, 2.0, 0.5, 1.5])
            .unwrap();
        let loss = KnnAdaLoss::builder()
            .uniform_features(vec!["f0".to_string()])
            .uniform_labels(vec![1])
            .knn(1)
            .distinguish_classes(false)
            .build()
            .unwrap();
        let fitted = loss.fit(&data).unwrap();
        let plain = AdaLoss::default().fit(&data).unwrap();

        let y_pred = array![0.3, -0.2, 0.1, 0.4];
        let got = fitted.negative_gradient(y_pred.view());
        let want = plain.negative_gradient(y_pred.view());
        for (g, w) in got.iter().zip(want.iter()) {
            assert_relative_eq!(g, w, max_relative = 1e-12);
        }
        assert_relative_eq!(
            fitted.loss(y_pred.view()),
            plain.loss(y_pred.view()),
            max_relative = 1e-12
        );
    }

    #[test]
    fn missing_uniform_class_is_an_error() {
        let data = Dataset::new(array![[0.0, 1.0]])
            .unwrap()
            .with_names(["f0"])
            .unwrap()
            .with_labels(array![0.0, 0.0])
            .unwrap();
        let loss = KnnAdaLoss::builder()
            .uniform_features(vec!["f0".to_string()])
            .uniform_labels(vec![1])
            .build()
            .unwrap();
        assert!(matches!(
            loss.fit(&data),
            Err(LossError::EmptyClass { label: 1 })
        ));
    }

    #[test]
    fn unknown_feature_is_an_error() {
        let data = Dataset::new(array![[0.0, 1.0]])
            .unwrap()
            .with_labels(array![0.0, 1.0])
            .unwrap();
        let loss = KnnAdaLoss::builder()
            .uniform_features(vec!["missing".to_string()])
            .uniform_labels(vec![1])
            .build()
            .unwrap();
        assert!(matches!(loss.fit(&data), Err(LossError::Data(_))));
    }

    #[test]
    fn builder_rejects_bad_configs() {
        let no_features = KnnAdaLoss::builder()
            .uniform_features(vec![])
            .uniform_labels(vec![1])
            .build();
        assert!(matches!(no_features, Err(ConfigError::NoUniformFeatures)));

        let zero_knn = KnnAdaLoss::builder()
            .uniform_features(vec!["mass".to_string()])
            .uniform_labels(vec![1])
            .knn(0)
            .build();
        assert!(matches!(zero_knn, Err(ConfigError::InvalidNeighborCount)));

        let duplicate = KnnAdaLoss::builder()
            .uniform_features(vec!["mass".to_string()])
            .uniform_labels(vec![1, 1])
            .build();
        assert!(matches!(
            duplicate,
            Err(ConfigError::DuplicateUniformLabel(1))
        ));
    }

    #[test]
    fn projected_leaf_update_matches_identity_closed_form() {
        // With an identity coupling the projected step reduces to
        // sum(grad) / (sum(hess) + damping) per leaf.
        let data = Dataset::new(array![[0.0, 1.0, 2.0, 3.0]])
            .unwrap()
            .with_names(["f0"])
            .unwrap()
            .with_labels(array![0.0, 1.0, 0.0, 1.0])
            .unwrap();
        let loss = KnnAdaLoss::builder()
            .uniform_features(vec!["f0".to_string()])
            .uniform_labels(vec![1])
            .knn(1)
            .distinguish_classes(false)
            .build()
            .unwrap();
        let fitted = loss.fit(&data).unwrap();

        let y_pred = array![0.0, 0.0, 0.0, 0.0];
        let regions = [0usize, 0, 1, 1];
        let ctx = LeafUpdateContext {
            regions: &regions,
            n_leaves: 2,
            leaf_values: &[0.0, 0.0],
            residual: &[0.0; 4],
            update_mask: &[true; 4],
        };
        let values = fitted.leaf_values(y_pred.view(), &ctx);

        let grad = fitted.negative_gradient(y_pred.view());
        let hess = fitted.hessian(y_pred.view());
        let want0 = (grad[0] + grad[1]) / (hess[0] + hess[1] + 1e-5);
        let want1 = (grad[2] + grad[3]) / (hess[2] + hess[3] + 1e-5);
        assert_relative_eq!(values[0], want0, max_relative = 1e-12);
        assert_relative_eq!(values[1], want1, max_relative = 1e-12);
    }
}

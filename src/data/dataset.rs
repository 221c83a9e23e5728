//! Event table with named feature columns.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Dataset construction and lookup errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DataError {
    #[error("dataset must contain at least one feature and one sample")]
    Empty,

    #[error("number of {field} ({got}) does not match number of samples ({expected})")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("number of feature names ({got}) does not match number of features ({expected})")]
    NameCountMismatch { expected: usize, got: usize },

    #[error("unknown feature name: {name:?}")]
    UnknownFeature { name: String },

    #[error("weight at index {index} is not finite: {value}")]
    NonFiniteWeight { index: usize, value: f64 },
}

/// The event table consumed by losses and the boosting driver.
///
/// # Storage Layout
///
/// Features are stored **feature-major**: `[n_features, n_samples]`. Each
/// feature's values across all events are contiguous, which is what split
/// scans, k-nn searches and bin assignment iterate over.
///
/// Labels and weights are optional: prediction-only tables carry neither,
/// and weights default to uniform at fit time. Losses validate the label
/// domain themselves (binary for classification losses, rank values for
/// ranking).
///
/// # Example
///
/// ```
/// use ndarray::array;
/// use uniboost::Dataset;
///
/// let features = array![[1.0, 2.0, 3.0], [7.0, 8.0, 9.0]]; // [n_features, n_samples]
/// let data = Dataset::new(features)
///     .unwrap()
///     .with_names(["mass", "pt"])
///     .unwrap()
///     .with_labels(array![0.0, 1.0, 1.0])
///     .unwrap();
///
/// assert_eq!(data.n_samples(), 3);
/// assert_eq!(data.feature_index("pt").unwrap(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Feature data: `[n_features, n_samples]` (feature-major).
    features: Array2<f64>,
    /// Per-feature names, `None` when unnamed.
    names: Vec<Option<String>>,
    /// Labels: class ids for classification losses, rank values for ranking.
    labels: Option<Array1<f64>>,
    /// Per-event weights; uniform when absent.
    weights: Option<Array1<f64>>,
}

impl Dataset {
    /// Create a dataset from a feature-major matrix `[n_features, n_samples]`.
    pub fn new(features: Array2<f64>) -> Result<Self, DataError> {
        if features.nrows() == 0 || features.ncols() == 0 {
            return Err(DataError::Empty);
        }
        let names = vec![None; features.nrows()];
        Ok(Self {
            features,
            names,
            labels: None,
            weights: None,
        })
    }

    /// Create a dataset from an event-major matrix `[n_samples, n_features]`.
    ///
    /// Rows are events; the data is transposed into feature-major storage.
    pub fn from_rows(rows: ArrayView2<f64>) -> Result<Self, DataError> {
        let mut features = Array2::zeros((rows.ncols(), rows.nrows()));
        features.assign(&rows.t());
        Self::new(features)
    }

    // =========================================================================
    // Builder-style methods
    // =========================================================================

    /// Attach feature names, one per feature.
    pub fn with_names<I, S>(mut self, names: I) -> Result<Self, DataError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<Option<String>> = names.into_iter().map(|n| Some(n.into())).collect();
        if names.len() != self.n_features() {
            return Err(DataError::NameCountMismatch {
                expected: self.n_features(),
                got: names.len(),
            });
        }
        self.names = names;
        Ok(self)
    }

    /// Attach labels.
    pub fn with_labels(mut self, labels: Array1<f64>) -> Result<Self, DataError> {
        if labels.len() != self.n_samples() {
            return Err(DataError::LengthMismatch {
                field: "labels",
                expected: self.n_samples(),
                got: labels.len(),
            });
        }
        self.labels = Some(labels);
        Ok(self)
    }

    /// Attach per-event weights.
    ///
    /// Weights may be negative (the density-ratio loss supports signed
    /// subtraction weights) but must be finite.
    pub fn with_weights(mut self, weights: Array1<f64>) -> Result<Self, DataError> {
        if weights.len() != self.n_samples() {
            return Err(DataError::LengthMismatch {
                field: "weights",
                expected: self.n_samples(),
                got: weights.len(),
            });
        }
        if let Some((index, &value)) = weights.iter().enumerate().find(|(_, w)| !w.is_finite()) {
            return Err(DataError::NonFiniteWeight { index, value });
        }
        self.weights = Some(weights);
        Ok(self)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of events.
    #[inline]
    pub fn n_samples(&self) -> usize {
        self.features.ncols()
    }

    /// Number of features.
    #[inline]
    pub fn n_features(&self) -> usize {
        self.features.nrows()
    }

    /// View of the feature matrix `[n_features, n_samples]`.
    #[inline]
    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    /// Values of one feature across all events.
    #[inline]
    pub fn feature(&self, index: usize) -> ArrayView1<'_, f64> {
        self.features.row(index)
    }

    /// Resolve a feature name to its index.
    pub fn feature_index(&self, name: &str) -> Result<usize, DataError> {
        self.names
            .iter()
            .position(|n| n.as_deref() == Some(name))
            .ok_or_else(|| DataError::UnknownFeature {
                name: name.to_string(),
            })
    }

    /// Labels, if attached.
    pub fn labels(&self) -> Option<ArrayView1<'_, f64>> {
        self.labels.as_ref().map(|l| l.view())
    }

    /// Weights, if attached.
    pub fn weights(&self) -> Option<ArrayView1<'_, f64>> {
        self.weights.as_ref().map(|w| w.view())
    }

    /// Materialized weight vector: the attached weights, or uniform ones.
    pub fn weight_vector(&self) -> Array1<f64> {
        match &self.weights {
            Some(w) => w.clone(),
            None => Array1::ones(self.n_samples()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn new_feature_major() {
        let data = Dataset::new(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(data.n_samples(), 3);
        assert_eq!(data.n_features(), 2);
        assert_eq!(data.feature(1).to_vec(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn from_rows_transposes() {
        let rows = array![[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]; // 3 events, 2 features
        let data = Dataset::from_rows(rows.view()).unwrap();
        assert_eq!(data.n_samples(), 3);
        assert_eq!(data.n_features(), 2);
        assert_eq!(data.feature(0).to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn empty_rejected() {
        let result = Dataset::new(Array2::zeros((0, 4)));
        assert!(matches!(result, Err(DataError::Empty)));
    }

    #[test]
    fn name_lookup() {
        let data = Dataset::new(array![[1.0, 2.0], [3.0, 4.0]])
            .unwrap()
            .with_names(["mass", "pt"])
            .unwrap();
        assert_eq!(data.feature_index("mass").unwrap(), 0);
        assert!(matches!(
            data.feature_index("eta"),
            Err(DataError::UnknownFeature { .. })
        ));
    }

    #[test]
    fn name_count_mismatch() {
        let result = Dataset::new(array![[1.0, 2.0], [3.0, 4.0]])
            .unwrap()
            .with_names(["only_one"]);
        assert!(matches!(result, Err(DataError::NameCountMismatch { .. })));
    }

    #[test]
    fn label_length_checked() {
        let result = Dataset::new(array![[1.0, 2.0, 3.0]])
            .unwrap()
            .with_labels(array![0.0, 1.0]);
        assert!(matches!(
            result,
            Err(DataError::LengthMismatch { field: "labels", .. })
        ));
    }

    #[test]
    fn non_finite_weight_rejected() {
        let result = Dataset::new(array![[1.0, 2.0]])
            .unwrap()
            .with_weights(array![1.0, f64::NAN]);
        assert!(matches!(result, Err(DataError::NonFiniteWeight { .. })));
    }

    #[test]
    fn weight_vector_defaults_to_ones() {
        let data = Dataset::new(array![[1.0, 2.0, 3.0]]).unwrap();
        assert_eq!(data.weight_vector().to_vec(), vec![1.0, 1.0, 1.0]);

        let weighted = data.with_weights(array![0.5, -1.0, 2.0]).unwrap();
        assert_eq!(weighted.weight_vector().to_vec(), vec![0.5, -1.0, 2.0]);
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn dataset_is_send_sync() {
        assert_send_sync::<Dataset>();
    }
}

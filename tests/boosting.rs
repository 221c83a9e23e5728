//! End-to-end training runs through the public API.
//!
//! Every loss is driven through [`GradientBoosting`] on a small synthetic
//! problem and judged on what it promises: class separation, within-query
//! ordering, regression convergence, and serialization parity.

use approx::assert_relative_eq;
use ndarray::{array, Array1};
use rstest::rstest;

use uniboost::{
    BinFlatnessLoss, BoostedEnsemble, CompositeLoss, Dataset, GradientBoosting, KnnAdaLoss,
    LogLoss, MseLoss, RankBoostLoss,
};

/// "f" separates the classes cleanly; "mass" is spread identically inside
/// both classes and carries no class information.
fn separable_dataset() -> Dataset {
    Dataset::new(array![
        [0.5, 1.5, 2.5, 3.5, 4.5, 5.5, 0.5, 1.5, 2.5, 3.5, 4.5, 5.5],
        [0.3, 0.5, 0.7, 0.4, 0.6, 0.8, 2.2, 2.6, 2.4, 2.8, 2.3, 2.7]
    ])
    .unwrap()
    .with_names(["mass", "f"])
    .unwrap()
    .with_labels(array![
        0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0
    ])
    .unwrap()
}

fn class_means(scores: &Array1<f64>) -> (f64, f64) {
    let background = scores.iter().take(6).sum::<f64>() / 6.0;
    let signal = scores.iter().skip(6).sum::<f64>() / 6.0;
    (background, signal)
}

#[rstest]
#[case(0.5)]
#[case(0.75)]
#[case(1.0)]
fn log_loss_learns_at_any_subsample(#[case] subsample: f64) {
    let data = separable_dataset();
    let model = GradientBoosting::builder()
        .loss(LogLoss::default())
        .n_estimators(25)
        .subsample(subsample)
        .seed(11)
        .build()
        .unwrap()
        .fit(&data)
        .unwrap();

    let losses = model.train_losses();
    assert!(losses.last().unwrap() < losses.first().unwrap());
    let (background, signal) = class_means(&model.decision_function(&data));
    assert!(signal > background);
}

#[test]
fn composite_loss_separates_the_classes() {
    let data = separable_dataset();
    let model = GradientBoosting::builder()
        .loss(CompositeLoss::default())
        .n_estimators(25)
        .build()
        .unwrap()
        .fit(&data)
        .unwrap();

    let losses = model.train_losses();
    assert!(losses.last().unwrap() < losses.first().unwrap());
    let scores = model.decision_function(&data);
    for signal in 6..12 {
        for background in 0..6 {
            assert!(scores[signal] > scores[background]);
        }
    }
}

#[test]
fn knn_ada_loss_trains_end_to_end() {
    let data = separable_dataset();
    let loss = KnnAdaLoss::builder()
        .uniform_features(vec!["mass".to_string()])
        .uniform_labels(vec![1])
        .knn(3)
        .build()
        .unwrap();
    let model = GradientBoosting::builder()
        .loss(loss)
        .n_estimators(25)
        .build()
        .unwrap()
        .fit(&data)
        .unwrap();

    let losses = model.train_losses();
    assert!(losses.last().unwrap() < losses.first().unwrap());
    let (background, signal) = class_means(&model.decision_function(&data));
    assert!(signal > background);
}

#[test]
fn bin_flatness_loss_trains_end_to_end() {
    let data = separable_dataset();
    let loss = BinFlatnessLoss::builder()
        .uniform_features(vec!["mass".to_string()])
        .uniform_labels(vec![1])
        .n_bins(3)
        .build()
        .unwrap();
    let model = GradientBoosting::builder()
        .loss(loss)
        .n_estimators(25)
        .build()
        .unwrap()
        .fit(&data)
        .unwrap();

    assert_eq!(model.n_trees(), 25);
    let (background, signal) = class_means(&model.decision_function(&data));
    assert!(signal > background);
}

#[test]
fn rank_boost_orders_within_each_query() {
    // Strength is monotone in the rank label inside both queries.
    let data = Dataset::new(array![
        [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0],
        [0.10, 0.35, 0.63, 0.90, 0.15, 0.42, 0.58, 0.85]
    ])
    .unwrap()
    .with_names(["query", "strength"])
    .unwrap()
    .with_labels(array![0.0, 1.0, 2.0, 3.0, 0.0, 1.0, 2.0, 3.0])
    .unwrap();

    let loss = RankBoostLoss::builder()
        .query_column("query".to_string())
        .build()
        .unwrap();
    let model = GradientBoosting::builder()
        .loss(loss)
        .n_estimators(50)
        .min_samples_leaf(1)
        .build()
        .unwrap()
        .fit(&data)
        .unwrap();

    let scores = model.decision_function(&data);
    for query in 0..2 {
        let base = 4 * query;
        for rank in 0..3 {
            assert!(
                scores[base + rank + 1] > scores[base + rank],
                "query {} rank {} out of order: {:?}",
                query,
                rank,
                scores
            );
        }
    }
}

#[test]
fn regression_recovers_an_additive_surface() {
    let data = Dataset::new(array![
        [0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0],
        [0.0, 2.0, 0.0, 2.0, 0.0, 2.0, 0.0, 2.0]
    ])
    .unwrap()
    .with_labels(array![0.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0])
    .unwrap();

    let model = GradientBoosting::builder()
        .loss(MseLoss::builder().regularization(0.0).build().unwrap())
        .n_estimators(60)
        .learning_rate(0.3)
        .max_depth(2)
        .min_samples_leaf(1)
        .build()
        .unwrap()
        .fit(&data)
        .unwrap();

    let scores = model.decision_function(&data);
    let labels = array![0.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0];
    for (score, label) in scores.iter().zip(&labels) {
        assert_relative_eq!(score, label, epsilon = 0.02);
    }
}

#[test]
fn ensemble_survives_a_serde_round_trip() {
    let data = separable_dataset();
    let model = GradientBoosting::builder()
        .loss(LogLoss::default())
        .n_estimators(5)
        .build()
        .unwrap()
        .fit(&data)
        .unwrap();

    let encoded = serde_json::to_string(&model).unwrap();
    let decoded: BoostedEnsemble = serde_json::from_str(&encoded).unwrap();

    assert_eq!(decoded.n_trees(), model.n_trees());
    assert_eq!(decoded.n_features(), model.n_features());
    assert_eq!(
        decoded.decision_function(&data).to_vec(),
        model.decision_function(&data).to_vec()
    );
}

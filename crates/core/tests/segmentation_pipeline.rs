use segmenta_core::assignment::assign_vectors;
use segmenta_core::config::{AppConfig, AxisConfig, PreprocessConfig, SamplingStrategy};
use segmenta_core::domain::customer::CustomerId;
use segmenta_core::domain::feature::{AxisName, FeatureVector};
use segmenta_core::engine::SegmentationEngine;
use segmenta_core::errors::AxisWarning;
use segmenta_core::fcm::{euclidean, membership_row};
use segmenta_core::features::Metric;
use segmenta_core::preprocess::Preprocessor;
use segmenta_core::selection::{
    balance_metrics, CandidateEvaluation, ModelSelector, SelectionOverrides,
};
use uuid::Uuid;

fn axis(name: &str, metrics: Vec<Metric>) -> AxisConfig {
    AxisConfig {
        name: AxisName::new(name),
        metrics,
        sampling: SamplingStrategy::Uniform,
        min_k: None,
        max_k: None,
        fuzziness: None,
    }
}

fn vectors(axis: &AxisConfig, rows: &[Vec<f64>]) -> Vec<FeatureVector> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| FeatureVector {
            customer_id: CustomerId::new(format!("c-{index:04}")),
            axis: axis.name.clone(),
            features: axis
                .metrics
                .iter()
                .map(|metric| metric.as_str().to_string())
                .zip(row.iter().copied())
                .collect(),
        })
        .collect()
}

/// Deterministic offset in `[-1, 1]`.
fn jitter(index: usize) -> f64 {
    ((index * 7) % 11) as f64 / 5.0 - 1.0
}

fn three_clusters() -> Vec<Vec<f64>> {
    let centers = [([1.0, 300.0, 0.2], 50), ([3.0, 150.0, 0.6], 30), ([8.0, 40.0, 0.9], 20)];
    let mut rows = Vec::new();
    for (center, count) in centers {
        for index in 0..count {
            let spread = 1.0 + 0.02 * jitter(index + rows.len());
            rows.push(center.iter().map(|value| value * spread).collect());
        }
    }
    rows
}

#[test]
fn three_behavioral_clusters_select_k3() {
    let axis = axis(
        "behavior",
        vec![Metric::OrdersPerMonth, Metric::AvgOrderValue, Metric::DiscountedOrderShare],
    );
    let mut config = AppConfig::default();
    config.axes = vec![axis.clone()];
    let engine = SegmentationEngine::new(config);

    let discovery = engine
        .fit_axis(&axis, &vectors(&axis, &three_clusters()), Uuid::new_v4())
        .expect("discovery should succeed");

    assert_eq!(discovery.model.k, 3);
    assert!(discovery.model.balanced);
    assert!(discovery.warnings.is_empty());
    let ks: Vec<usize> = discovery.candidates.iter().map(|candidate| candidate.k).collect();
    assert_eq!(ks, (2..=8).collect::<Vec<_>>());

    let mut shares = discovery.model.balance.shares.clone();
    shares.sort_by(f64::total_cmp);
    assert!((shares[0] - 0.2).abs() < 1e-9);
    assert!((shares[1] - 0.3).abs() < 1e-9);
    assert!((shares[2] - 0.5).abs() < 1e-9);
}

#[test]
fn toy_population_memberships_are_valid() {
    let mut axis = axis("spend", vec![Metric::TotalSpend]);
    axis.min_k = Some(2);
    axis.max_k = Some(2);
    let mut config = AppConfig::default();
    config.engine.selection.min_customers = 10;
    config.axes = vec![axis.clone()];
    let engine = SegmentationEngine::new(config);

    let rows: Vec<Vec<f64>> =
        [10.0, 12.0, 9.0, 11.0, 10.5, 50.0, 52.0, 49.0, 51.0, 50.5].iter().map(|v| vec![*v]).collect();
    let batch = vectors(&axis, &rows);
    let discovery =
        engine.fit_axis(&axis, &batch, Uuid::new_v4()).expect("discovery should succeed");
    let model = discovery.model;
    assert_eq!(model.k, 2);

    let memberships = assign_vectors(&model, &batch).expect("assignment should succeed");
    for membership in &memberships {
        assert_eq!(membership.weights.len(), 2);
        assert!(membership.weights.iter().all(|weight| (0.0..=1.0).contains(weight)));
        assert!((membership.weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    for (segment, center) in model.centers.iter().enumerate() {
        let closest = rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let scaled = model.scaler.transform_row(row).expect("row has model width");
                (index, euclidean(&scaled, center))
            })
            .min_by(|left, right| left.1.total_cmp(&right.1))
            .map(|(index, _)| index)
            .expect("population is not empty");
        assert!(memberships[closest].weights[segment] >= 0.5);
    }
}

#[test]
fn assignment_uses_persisted_scaler_not_a_refit() {
    let mut axis = axis("spend", vec![Metric::TotalSpend, Metric::OrderCount]);
    axis.max_k = Some(3);
    let mut config = AppConfig::default();
    config.axes = vec![axis.clone()];
    let engine = SegmentationEngine::new(config);

    let discovery_rows: Vec<Vec<f64>> = (0..60)
        .map(|index| {
            let group = (index % 2) as f64;
            vec![20.0 + 60.0 * group + jitter(index), 2.0 + 6.0 * group + 0.1 * jitter(index)]
        })
        .collect();
    let model = engine
        .fit_axis(&axis, &vectors(&axis, &discovery_rows), Uuid::new_v4())
        .expect("discovery should succeed")
        .model;

    // a later batch whose distribution differs from the discovery sample
    let later_rows: Vec<Vec<f64>> =
        (0..30).map(|index| vec![40.0 + index as f64, 3.0 + (index % 4) as f64]).collect();
    let later = vectors(&axis, &later_rows);
    let assigned = assign_vectors(&model, &later).expect("assignment should succeed");

    let refit = Preprocessor::new(PreprocessConfig::default())
        .fit_transform(&axis.name, &model.feature_names, &later_rows)
        .expect("refit should succeed")
        .params;

    let mut diverged = false;
    for (membership, row) in assigned.iter().zip(&later_rows) {
        let persisted = membership_row(
            &model.scaler.transform_row(row).expect("row has model width"),
            &model.centers,
            model.fuzziness,
        );
        assert_eq!(membership.weights, persisted);

        let refitted = membership_row(
            &refit.transform_row(row).expect("row has model width"),
            &model.centers,
            model.fuzziness,
        );
        if persisted.iter().zip(&refitted).any(|(left, right)| (left - right).abs() > 1e-6) {
            diverged = true;
        }
    }
    assert!(diverged, "a refit scaler must produce different memberships on this batch");
}

#[test]
fn assigning_twice_is_idempotent() {
    let axis = axis(
        "behavior",
        vec![Metric::OrdersPerMonth, Metric::AvgOrderValue, Metric::DiscountedOrderShare],
    );
    let mut config = AppConfig::default();
    config.axes = vec![axis.clone()];
    let engine = SegmentationEngine::new(config);
    let batch = vectors(&axis, &three_clusters());
    let model = engine.fit_axis(&axis, &batch, Uuid::new_v4()).expect("discovery").model;

    let first = assign_vectors(&model, &batch).expect("assignment should succeed");
    let second = assign_vectors(&model, &batch).expect("assignment should succeed");
    assert_eq!(first, second);
}

#[test]
fn balanced_selection_holds_when_recomputed_from_labels() {
    let config = AppConfig::default();
    let selection_config = config.engine.selection;
    let datasets = [
        three_clusters(),
        (0..80).map(|index| vec![index as f64, ((index * 13) % 17) as f64]).collect(),
        (0..90)
            .map(|index| if index < 70 { vec![0.0 + jitter(index)] } else { vec![10.0 + jitter(index)] })
            .collect::<Vec<_>>(),
    ];

    let mut balanced_datasets = 0;
    for (position, data) in datasets.iter().enumerate() {
        let names: Vec<String> = (0..data[0].len()).map(|column| format!("f{column}")).collect();
        let scaled = Preprocessor::new(config.engine.preprocess)
            .fit_transform(&AxisName::new("test"), &names, data)
            .expect("preprocess should succeed")
            .scaled;
        let selector = ModelSelector::new(selection_config, config.engine.fcm, 42);
        let selection = selector
            .select(&AxisName::new("test"), &scaled, SelectionOverrides::default())
            .expect("selection should succeed");

        if selection.balanced() {
            balanced_datasets += 1;
            let recomputed = balance_metrics(&selection.fit.hard_labels(), selection.chosen.k);
            assert!(recomputed.largest_share <= selection_config.max_share, "dataset {position}");
            assert!(recomputed.smallest_share >= selection_config.min_share, "dataset {position}");
        }
    }
    assert!(balanced_datasets >= 1, "no dataset produced a balanced selection");
}

/// Two nearby groups of 35 and a distant group of 30: merging the near pair separates
/// best but leaves one segment holding 70% of customers.
fn near_pair_and_distant_group() -> Vec<Vec<f64>> {
    let groups = [(0.0, 35), (1.0, 35), (100.0, 30)];
    let mut rows = Vec::new();
    for (center, count) in groups {
        for _ in 0..count {
            rows.push(vec![center + 0.05 * jitter(rows.len())]);
        }
    }
    rows
}

fn best_silhouette(candidates: &[CandidateEvaluation]) -> &CandidateEvaluation {
    candidates
        .iter()
        .max_by(|left, right| left.silhouette.total_cmp(&right.silhouette))
        .expect("at least one candidate")
}

#[test]
fn balance_gate_overrides_best_silhouette() {
    let config = AppConfig::default();
    let names = vec!["f0".to_string()];
    let scaled = Preprocessor::new(config.engine.preprocess)
        .fit_transform(&AxisName::new("test"), &names, &near_pair_and_distant_group())
        .expect("preprocess should succeed")
        .scaled;
    let selection = ModelSelector::new(config.engine.selection, config.engine.fcm, 42)
        .select(&AxisName::new("test"), &scaled, SelectionOverrides::default())
        .expect("selection should succeed");

    let best = best_silhouette(&selection.candidates);
    assert_eq!(best.k, 2);
    assert!(!best.balanced, "merged pair should exceed the share ceiling");
    assert!((best.balance.largest_share - 0.7).abs() < 1e-9);

    assert!(selection.balanced());
    assert_ne!(selection.chosen.k, best.k);
    assert!(selection.chosen.silhouette < best.silhouette);
}

#[test]
fn unbalanced_axis_falls_back_to_best_silhouette_and_warns() {
    let axis = axis("loyalty", vec![Metric::OrderCount]);
    // identical points always share one hard label, so no k can split the large group
    let rows: Vec<Vec<f64>> = (0..100)
        .map(|index| if index < 80 { vec![0.0] } else { vec![10.0 + 0.1 * jitter(index)] })
        .collect();
    let mut config = AppConfig::default();
    config.axes = vec![axis.clone()];
    let engine = SegmentationEngine::new(config);

    let discovery = engine
        .fit_axis(&axis, &vectors(&axis, &rows), Uuid::new_v4())
        .expect("unbalanced discovery still publishes a model");

    assert!(discovery.candidates.iter().all(|candidate| !candidate.balanced));
    assert!(!discovery.model.balanced);
    assert_eq!(discovery.model.k, best_silhouette(&discovery.candidates).k);
    assert!(discovery.warnings.iter().any(|warning| matches!(
        warning,
        AxisWarning::Unbalanced { k, .. } if *k == discovery.model.k
    )));
}

mod membership_properties {
    use proptest::prelude::*;
    use segmenta_core::fcm::membership_row;

    proptest! {
        #[test]
        fn weights_are_bounded_and_sum_to_one(
            point in proptest::collection::vec(-1_000.0f64..1_000.0, 3),
            centers in proptest::collection::vec(proptest::collection::vec(-1_000.0f64..1_000.0, 3), 2..8),
            fuzziness in 1.05f64..4.0,
        ) {
            let weights = membership_row(&point, &centers, fuzziness);
            prop_assert_eq!(weights.len(), centers.len());
            prop_assert!(weights.iter().all(|weight| (0.0..=1.0).contains(weight)));
            prop_assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }
}

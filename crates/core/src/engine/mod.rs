//! Batch orchestration across axes.
//!
//! [`SegmentationEngine`] owns the configuration, the shared [`ModelRegistry`] and the
//! process-wide [`FeatureCache`]. Axes are independent: discovery and assignment run them in
//! parallel and a failing axis is reported in the run summary without affecting the rest.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::archetype::ArchetypeComposer;
use crate::assignment::PopulationAssigner;
use crate::config::{AppConfig, AxisConfig};
use crate::domain::archetype::{ArchetypeReport, Granularity};
use crate::domain::customer::{CustomerHistory, CustomerId, ObservationWindow};
use crate::domain::feature::{AxisName, FeatureVector};
use crate::domain::membership::FuzzyMembership;
use crate::domain::model::AxisModel;
use crate::errors::{AxisWarning, SegmentationError};
use crate::features::{self, FeatureCache};
use crate::preprocess::Preprocessor;
use crate::registry::ModelRegistry;
use crate::sampling::Sampler;
use crate::selection::{CandidateEvaluation, ModelSelector, SelectionOverrides};

/// A fitted axis model with its selection audit trail, not yet published.
#[derive(Clone, Debug)]
pub struct AxisDiscovery {
    pub model: AxisModel,
    pub candidates: Vec<CandidateEvaluation>,
    pub warnings: Vec<AxisWarning>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisOutcome {
    pub axis: AxisName,
    pub run_id: Uuid,
    pub k: usize,
    pub silhouette: f64,
    pub balanced: bool,
    pub sample_size: usize,
    pub fingerprint: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisFailure {
    pub axis: AxisName,
    pub error_class: String,
    pub reason: String,
}

impl AxisFailure {
    fn from_error(axis: &AxisName, error: &SegmentationError) -> Self {
        Self { axis: axis.clone(), error_class: error.class().to_string(), reason: error.to_string() }
    }
}

/// Per-run summary: axes published, axes skipped (prior model stays active), and warnings
/// needing operator review.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: ObservationWindow,
    pub population: usize,
    pub succeeded: Vec<AxisOutcome>,
    pub skipped: Vec<AxisFailure>,
    pub flagged: Vec<AxisWarning>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisAssignment {
    pub axis: AxisName,
    pub model_run_id: Uuid,
    pub customers: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssignmentReport {
    pub window: ObservationWindow,
    pub memberships: Vec<FuzzyMembership>,
    pub completed: Vec<AxisAssignment>,
    pub failed: Vec<AxisFailure>,
}

pub struct SegmentationEngine {
    config: AppConfig,
    registry: Arc<ModelRegistry>,
    cache: Arc<FeatureCache>,
}

impl SegmentationEngine {
    pub fn new(config: AppConfig) -> Self {
        Self::with_registry(config, Arc::new(ModelRegistry::new()))
    }

    pub fn with_registry(config: AppConfig, registry: Arc<ModelRegistry>) -> Self {
        Self { config, registry, cache: Arc::new(FeatureCache::new()) }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &FeatureCache {
        &self.cache
    }

    /// Observation window ending at the configured reference time, or `now` when unset.
    pub fn window(&self, now: DateTime<Utc>) -> ObservationWindow {
        let end = self.config.engine.reference_time.unwrap_or(now);
        ObservationWindow::trailing_days(end, self.config.engine.observation_window_days)
    }

    /// Discovers and publishes a model for every configured axis.
    pub fn discover(
        &self,
        histories: &[CustomerHistory],
        window: &ObservationWindow,
    ) -> DiscoveryReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            event_name = "segmentation.discovery.started",
            run_id = %run_id,
            axes = self.config.axes.len(),
            population = histories.len(),
            "starting discovery run"
        );

        let results: Vec<(AxisName, Result<AxisDiscovery, SegmentationError>)> = self
            .config
            .axes
            .par_iter()
            .map(|axis| {
                let result = self
                    .discover_axis(axis, histories, window, run_id)
                    .and_then(|discovery| self.publish(discovery));
                (axis.name.clone(), result)
            })
            .collect();

        let mut succeeded = Vec::new();
        let mut skipped = Vec::new();
        let mut flagged = Vec::new();
        for (axis, result) in results {
            match result {
                Ok(discovery) => {
                    let model = &discovery.model;
                    succeeded.push(AxisOutcome {
                        axis,
                        run_id: model.run_id,
                        k: model.k,
                        silhouette: model.silhouette,
                        balanced: model.balanced,
                        sample_size: model.sample_size,
                        fingerprint: model.fingerprint.clone(),
                    });
                    flagged.extend(discovery.warnings);
                }
                Err(error) => {
                    warn!(
                        event_name = "segmentation.discovery.axis_skipped",
                        axis = %axis,
                        error_class = error.class(),
                        error = %error,
                        "axis discovery skipped; previous model stays active"
                    );
                    skipped.push(AxisFailure::from_error(&axis, &error));
                }
            }
        }

        let report = DiscoveryReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            window: *window,
            population: histories.len(),
            succeeded,
            skipped,
            flagged,
        };
        info!(
            event_name = "segmentation.discovery.completed",
            run_id = %run_id,
            succeeded = report.succeeded.len(),
            skipped = report.skipped.len(),
            flagged = report.flagged.len(),
            "discovery run finished"
        );
        report
    }

    /// Samples, extracts and fits one axis without publishing.
    pub fn discover_axis(
        &self,
        axis: &AxisConfig,
        histories: &[CustomerHistory],
        window: &ObservationWindow,
        run_id: Uuid,
    ) -> Result<AxisDiscovery, SegmentationError> {
        info!(
            event_name = "segmentation.discovery.axis_started",
            axis = %axis.name,
            run_id = %run_id,
            "discovering axis"
        );
        let sampler = Sampler::new(self.config.engine.sampling, &self.cache, self.config.engine.seed);
        let vectors: Vec<FeatureVector> = sampler
            .sample_indices(histories, axis, window)
            .into_par_iter()
            .map(|position| self.cache.get_or_extract(&histories[position], axis, window))
            .collect();
        self.fit_axis(axis, &vectors, run_id)
    }

    /// Fits an axis model on already-extracted vectors, which must follow the axis's
    /// declared metric order.
    pub fn fit_axis(
        &self,
        axis: &AxisConfig,
        vectors: &[FeatureVector],
        run_id: Uuid,
    ) -> Result<AxisDiscovery, SegmentationError> {
        let feature_names = features::feature_names(axis);
        if let Some(vector) = vectors.iter().find(|vector| {
            vector.names().iter().zip(&feature_names).any(|(left, right)| left != right)
                || vector.dimension() != feature_names.len()
        }) {
            return Err(SegmentationError::FeatureSchemaMismatch {
                axis: axis.name.clone(),
                expected: feature_names,
                actual: vector.names().into_iter().map(str::to_string).collect(),
            });
        }

        let rows = features::rows(vectors);
        let preprocessed = Preprocessor::new(self.config.engine.preprocess).fit_transform(
            &axis.name,
            &feature_names,
            &rows,
        )?;

        let mut warnings: Vec<AxisWarning> = preprocessed
            .params
            .degenerate_features()
            .into_iter()
            .map(|feature| AxisWarning::DegenerateFeature {
                axis: axis.name.clone(),
                feature: feature.to_string(),
            })
            .collect();

        let selector = ModelSelector::new(
            self.config.engine.selection,
            self.config.engine.fcm,
            self.config.engine.seed,
        );
        let selection = selector.select(
            &axis.name,
            &preprocessed.scaled,
            SelectionOverrides { min_k: axis.min_k, max_k: axis.max_k, fuzziness: axis.fuzziness },
        )?;

        let chosen = &selection.chosen;
        if !chosen.balanced {
            warnings.push(AxisWarning::Unbalanced {
                axis: axis.name.clone(),
                k: chosen.k,
                largest_share: chosen.balance.largest_share,
                smallest_share: chosen.balance.smallest_share,
            });
        }

        let fingerprint = AxisModel::compute_fingerprint(
            &axis.name,
            selection.fuzziness,
            &feature_names,
            &selection.fit.centers,
            &preprocessed.params,
        );
        let model = AxisModel {
            axis: axis.name.clone(),
            run_id,
            k: chosen.k,
            fuzziness: selection.fuzziness,
            feature_names,
            centers: selection.fit.centers.clone(),
            scaler: preprocessed.params,
            silhouette: chosen.silhouette,
            balance: chosen.balance.clone(),
            combined_score: chosen.combined_score,
            balanced: chosen.balanced,
            sample_size: rows.len(),
            iterations: chosen.iterations,
            discovered_at: Utc::now(),
            fingerprint,
        };

        Ok(AxisDiscovery { model, candidates: selection.candidates, warnings })
    }

    pub fn publish(&self, discovery: AxisDiscovery) -> Result<AxisDiscovery, SegmentationError> {
        self.cache.invalidate_axis(&discovery.model.axis);
        self.registry.publish(discovery.model.clone())?;
        Ok(discovery)
    }

    /// Assigns every history on every configured axis against the active models.
    pub fn assign(
        &self,
        histories: &[CustomerHistory],
        window: &ObservationWindow,
    ) -> AssignmentReport {
        let assigner = PopulationAssigner::new(&self.cache);
        let results: Vec<(AxisName, Result<(Arc<AxisModel>, Vec<FuzzyMembership>), SegmentationError>)> =
            self.config
                .axes
                .par_iter()
                .map(|axis| {
                    let result = self.registry.active(&axis.name).and_then(|model| {
                        assigner
                            .assign_histories(&model, axis, histories, window)
                            .map(|memberships| (model, memberships))
                    });
                    (axis.name.clone(), result)
                })
                .collect();

        let mut memberships = Vec::new();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for (axis, result) in results {
            match result {
                Ok((model, axis_memberships)) => {
                    completed.push(AxisAssignment {
                        axis,
                        model_run_id: model.run_id,
                        customers: axis_memberships.len(),
                    });
                    memberships.extend(axis_memberships);
                }
                Err(error) => {
                    warn!(
                        event_name = "segmentation.assignment.axis_failed",
                        axis = %axis,
                        error_class = error.class(),
                        error = %error,
                        "axis assignment failed"
                    );
                    failed.push(AxisFailure::from_error(&axis, &error));
                }
            }
        }

        AssignmentReport { window: *window, memberships, completed, failed }
    }

    /// Composes archetypes over all configured axes.
    pub fn compose_archetypes(
        &self,
        memberships: &[FuzzyMembership],
        granularity: Option<Granularity>,
    ) -> ArchetypeReport {
        let axes: Vec<AxisName> = self.config.axes.iter().map(|axis| axis.name.clone()).collect();
        let granularity = granularity.unwrap_or(self.config.engine.archetype.granularity);
        ArchetypeComposer::new(self.config.engine.archetype).compose(&axes, memberships, granularity)
    }
}

/// Groups memberships by customer for lookups such as "all axes of one customer".
pub fn memberships_by_customer(
    memberships: &[FuzzyMembership],
) -> HashMap<CustomerId, Vec<&FuzzyMembership>> {
    let mut grouped: HashMap<CustomerId, Vec<&FuzzyMembership>> = HashMap::new();
    for membership in memberships {
        grouped.entry(membership.customer_id.clone()).or_default().push(membership);
    }
    grouped
}

//! Population assignment.
//!
//! Memberships for any batch of customers are computed against a persisted [`AxisModel`]:
//! the model's own scaler is applied and the one-shot FCM membership update is evaluated
//! against its centers. Nothing here can fit a scaler, so memberships from different
//! batches stay comparable for as long as the model is active.

use rayon::prelude::*;
use tracing::info;

use crate::config::AxisConfig;
use crate::domain::customer::{CustomerHistory, ObservationWindow};
use crate::domain::feature::FeatureVector;
use crate::domain::membership::FuzzyMembership;
use crate::domain::model::AxisModel;
use crate::errors::SegmentationError;
use crate::fcm::membership_row;
use crate::features::FeatureCache;

pub struct PopulationAssigner<'a> {
    cache: &'a FeatureCache,
}

impl<'a> PopulationAssigner<'a> {
    pub fn new(cache: &'a FeatureCache) -> Self {
        Self { cache }
    }

    /// Extracts features for `histories` and assigns them against `model`.
    pub fn assign_histories(
        &self,
        model: &AxisModel,
        axis: &AxisConfig,
        histories: &[CustomerHistory],
        window: &ObservationWindow,
    ) -> Result<Vec<FuzzyMembership>, SegmentationError> {
        if axis.name != model.axis {
            return Err(SegmentationError::InvalidParameters(format!(
                "axis `{}` cannot be assigned with the model of axis `{}`",
                axis.name, model.axis
            )));
        }
        let declared: Vec<String> =
            axis.metrics.iter().map(|metric| metric.as_str().to_string()).collect();
        if declared != model.feature_names {
            return Err(SegmentationError::FeatureSchemaMismatch {
                axis: model.axis.clone(),
                expected: model.feature_names.clone(),
                actual: declared,
            });
        }

        let vectors: Vec<FeatureVector> = histories
            .par_iter()
            .map(|history| self.cache.get_or_extract(history, axis, window))
            .collect();
        assign_vectors(model, &vectors)
    }
}

/// Memberships of pre-extracted vectors against `model`.
///
/// Every vector must carry exactly the model's ordered feature names.
pub fn assign_vectors(
    model: &AxisModel,
    vectors: &[FeatureVector],
) -> Result<Vec<FuzzyMembership>, SegmentationError> {
    if !model.verify_fingerprint() {
        return Err(SegmentationError::Registry(format!(
            "model {} for axis `{}` does not match its fingerprint",
            model.run_id, model.axis
        )));
    }

    for vector in vectors {
        if vector.axis != model.axis
            || vector.dimension() != model.dimension()
            || vector.names().iter().zip(&model.feature_names).any(|(left, right)| left != right)
        {
            return Err(SegmentationError::FeatureSchemaMismatch {
                axis: model.axis.clone(),
                expected: model.feature_names.clone(),
                actual: vector.names().into_iter().map(str::to_string).collect(),
            });
        }
    }

    let memberships = vectors
        .par_iter()
        .map(|vector| {
            let scaled = model.scaler.transform_row(&vector.values())?;
            Ok(FuzzyMembership {
                customer_id: vector.customer_id.clone(),
                axis: model.axis.clone(),
                model_run_id: model.run_id,
                weights: membership_row(&scaled, &model.centers, model.fuzziness),
            })
        })
        .collect::<Result<Vec<_>, SegmentationError>>()?;

    info!(
        event_name = "segmentation.assignment.completed",
        axis = %model.axis,
        run_id = %model.run_id,
        customers = memberships.len(),
        "assigned memberships against active model"
    );

    Ok(memberships)
}

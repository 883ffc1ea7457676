use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::domain::feature::AxisName;
use crate::domain::model::AxisModel;
use crate::errors::SegmentationError;

/// Active axis models.
///
/// Publishing swaps an `Arc<AxisModel>` under the write lock, so a reader holding the
/// previous model keeps a complete copy and never observes a partial one. Replaced models
/// are released once their last reader drops them; version history is kept by the
/// persistence layer.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    active: RwLock<HashMap<AxisName, Arc<AxisModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `model` the active model for its axis and returns the one it replaced.
    pub fn publish(&self, model: AxisModel) -> Result<Option<Arc<AxisModel>>, SegmentationError> {
        if !model.verify_fingerprint() {
            return Err(SegmentationError::Registry(format!(
                "model {} for axis `{}` failed fingerprint verification",
                model.run_id, model.axis
            )));
        }

        let model = Arc::new(model);
        let previous = {
            let mut active = self.active.write().map_err(poisoned)?;
            active.insert(model.axis.clone(), Arc::clone(&model))
        };

        info!(
            event_name = "segmentation.registry.published",
            axis = %model.axis,
            run_id = %model.run_id,
            k = model.k,
            fingerprint = %model.fingerprint,
            replaced = previous.as_ref().map(|model| model.run_id.to_string()),
            "published axis model"
        );

        Ok(previous)
    }

    pub fn active(&self, axis: &AxisName) -> Result<Arc<AxisModel>, SegmentationError> {
        self.get(axis)?.ok_or_else(|| SegmentationError::MissingModel { axis: axis.clone() })
    }

    pub fn get(&self, axis: &AxisName) -> Result<Option<Arc<AxisModel>>, SegmentationError> {
        let active = self.active.read().map_err(poisoned)?;
        Ok(active.get(axis).cloned())
    }

    /// Active models ordered by axis name.
    pub fn snapshot(&self) -> Result<Vec<Arc<AxisModel>>, SegmentationError> {
        let active = self.active.read().map_err(poisoned)?;
        let mut models: Vec<Arc<AxisModel>> = active.values().cloned().collect();
        models.sort_by(|left, right| left.axis.cmp(&right.axis));
        Ok(models)
    }

    /// Restores a persisted model as the active one.
    pub fn load(&self, json: &str) -> Result<Arc<AxisModel>, SegmentationError> {
        let model: AxisModel = serde_json::from_str(json).map_err(|error| {
            SegmentationError::Registry(format!("failed to deserialize axis model: {error}"))
        })?;
        let axis = model.axis.clone();
        self.publish(model)?;
        self.active(&axis)
    }

    pub fn save(&self, axis: &AxisName) -> Result<String, SegmentationError> {
        let model = self.active(axis)?;
        serde_json::to_string_pretty(model.as_ref()).map_err(|error| {
            SegmentationError::Registry(format!("failed to serialize axis model: {error}"))
        })
    }
}

fn poisoned<T>(_: T) -> SegmentationError {
    SegmentationError::Registry("model registry lock is poisoned".to_string())
}

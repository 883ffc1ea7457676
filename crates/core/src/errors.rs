use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::feature::AxisName;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SegmentationError {
    #[error("insufficient data for axis `{axis}`: {reason}")]
    InsufficientData { axis: AxisName, reason: String },
    #[error("no discovered model is active for axis `{axis}`")]
    MissingModel { axis: AxisName },
    #[error("feature layout for axis `{axis}` does not match its model: expected {expected:?}, got {actual:?}")]
    FeatureSchemaMismatch { axis: AxisName, expected: Vec<String>, actual: Vec<String> },
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("model registry failure: {0}")]
    Registry(String),
}

impl SegmentationError {
    pub fn insufficient(axis: &AxisName, reason: impl Into<String>) -> Self {
        Self::InsufficientData { axis: axis.clone(), reason: reason.into() }
    }

    /// Short machine-readable class used in run summaries and CLI outcomes.
    pub fn class(&self) -> &'static str {
        match self {
            Self::InsufficientData { .. } => "insufficient_data",
            Self::MissingModel { .. } => "missing_model",
            Self::FeatureSchemaMismatch { .. } => "feature_schema_mismatch",
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::Registry(_) => "registry",
        }
    }
}

/// Non-fatal conditions surfaced for operator review.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AxisWarning {
    /// No candidate k satisfied the balance thresholds; the best-silhouette candidate is active.
    Unbalanced { axis: AxisName, k: usize, largest_share: f64, smallest_share: f64 },
    /// Feature had no spread after winsorizing and was kept with scale 1.
    DegenerateFeature { axis: AxisName, feature: String },
}

impl AxisWarning {
    pub fn axis(&self) -> &AxisName {
        match self {
            Self::Unbalanced { axis, .. } | Self::DegenerateFeature { axis, .. } => axis,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ApplicationError {
    #[error(transparent)]
    Segmentation(#[from] SegmentationError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn class(&self) -> &'static str {
        match self {
            Self::Segmentation(error) => error.class(),
            Self::Persistence(_) => "persistence",
            Self::Configuration(_) => "configuration",
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::feature::AxisName;
    use crate::errors::{ApplicationError, AxisWarning, SegmentationError};

    #[test]
    fn missing_model_message_names_axis() {
        let error = SegmentationError::MissingModel { axis: AxisName::new("spend") };
        assert_eq!(error.to_string(), "no discovered model is active for axis `spend`");
        assert_eq!(error.class(), "missing_model");
    }

    #[test]
    fn application_error_keeps_segmentation_class() {
        let error = ApplicationError::from(SegmentationError::insufficient(
            &AxisName::new("frequency"),
            "only 3 customers",
        ));
        assert_eq!(error.class(), "insufficient_data");
        assert!(error.to_string().contains("only 3 customers"));
    }

    #[test]
    fn persistence_error_has_its_own_class() {
        let error = ApplicationError::Persistence("database lock timeout".to_owned());
        assert_eq!(error.class(), "persistence");
    }

    #[test]
    fn warnings_expose_their_axis() {
        let warning = AxisWarning::DegenerateFeature {
            axis: AxisName::new("exploration"),
            feature: "category_entropy".to_owned(),
        };
        assert_eq!(warning.axis().as_str(), "exploration");
    }
}

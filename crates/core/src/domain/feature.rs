use serde::{Deserialize, Serialize};

use crate::domain::customer::CustomerId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AxisName(pub String);

impl AxisName {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AxisName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered `(feature_name, value)` pairs for one customer on one axis.
///
/// The order always follows the axis configuration so discovery and assignment see the
/// same column layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub customer_id: CustomerId,
    pub axis: AxisName,
    pub features: Vec<(String, f64)>,
}

impl FeatureVector {
    pub fn names(&self) -> Vec<&str> {
        self.features.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.features.iter().map(|(_, value)| *value).collect()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.features.iter().find(|(feature, _)| feature == name).map(|(_, value)| *value)
    }

    pub fn dimension(&self) -> usize {
        self.features.len()
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::feature::AxisName;
use crate::preprocess::ScalerParams;

/// Segment size distribution derived from hard labels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceMetrics {
    /// Population share per segment, indexed by segment id.
    pub shares: Vec<f64>,
    pub largest_share: f64,
    pub smallest_share: f64,
    /// Normalized entropy of `shares` in `[0, 1]`; 1.0 means perfectly even segments.
    pub evenness: f64,
}

/// Fitted clustering for one axis.
///
/// Centers live in the scaled feature space described by `scaler`; both were produced by
/// the same discovery run and travel together so assignment can never pair centers with a
/// different scaler. A newer discovery run supersedes the model; it is never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisModel {
    pub axis: AxisName,
    pub run_id: Uuid,
    pub k: usize,
    pub fuzziness: f64,
    pub feature_names: Vec<String>,
    pub centers: Vec<Vec<f64>>,
    pub scaler: ScalerParams,
    pub silhouette: f64,
    pub balance: BalanceMetrics,
    pub combined_score: f64,
    /// False when no candidate k met the balance thresholds and the best-silhouette
    /// candidate was used instead.
    pub balanced: bool,
    pub sample_size: usize,
    pub iterations: usize,
    pub discovered_at: DateTime<Utc>,
    pub fingerprint: String,
}

impl AxisModel {
    pub fn dimension(&self) -> usize {
        self.feature_names.len()
    }

    /// Content hash over everything assignment depends on.
    pub fn compute_fingerprint(
        axis: &AxisName,
        fuzziness: f64,
        feature_names: &[String],
        centers: &[Vec<f64>],
        scaler: &ScalerParams,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(axis.as_str().as_bytes());
        hasher.update(fuzziness.to_le_bytes());
        for name in feature_names {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        for center in centers {
            for value in center {
                hasher.update(value.to_le_bytes());
            }
        }
        for feature in scaler.features() {
            for value in [feature.lower, feature.upper, feature.center, feature.scale] {
                hasher.update(value.to_le_bytes());
            }
        }
        format!("sha256:{:x}", hasher.finalize())
    }

    pub fn verify_fingerprint(&self) -> bool {
        let expected = Self::compute_fingerprint(
            &self.axis,
            self.fuzziness,
            &self.feature_names,
            &self.centers,
            &self.scaler,
        );
        expected == self.fingerprint
    }
}

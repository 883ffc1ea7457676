//! Winsorization and robust scaling for one axis's feature matrix.
//!
//! Fitting produces a [`ScalerParams`] that is persisted with the axis model. The only way
//! to obtain one is [`Preprocessor::fit_transform`] on discovery data (or deserializing a
//! persisted copy); assignment applies it and never refits.

use serde::{Deserialize, Serialize};

use crate::config::PreprocessConfig;
use crate::domain::feature::AxisName;
use crate::errors::SegmentationError;

const MIN_SPREAD: f64 = 1e-12;

/// Clip bounds and robust location/scale of one feature column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaling {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    pub center: f64,
    pub scale: f64,
    /// No spread after winsorizing; kept with `scale = 1`.
    pub degenerate: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalerParams {
    axis: AxisName,
    features: Vec<FeatureScaling>,
    fitted_on: usize,
}

impl ScalerParams {
    pub fn axis(&self) -> &AxisName {
        &self.axis
    }

    pub fn features(&self) -> &[FeatureScaling] {
        &self.features
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.features.iter().map(|feature| feature.name.clone()).collect()
    }

    /// Number of rows the parameters were fitted on.
    pub fn fitted_on(&self) -> usize {
        self.fitted_on
    }

    pub fn degenerate_features(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|feature| feature.degenerate)
            .map(|feature| feature.name.as_str())
            .collect()
    }

    /// Sanitizes, clips and scales one raw row with the fitted parameters.
    pub fn transform_row(&self, row: &[f64]) -> Result<Vec<f64>, SegmentationError> {
        if row.len() != self.features.len() {
            return Err(SegmentationError::InvalidParameters(format!(
                "axis `{}` expects {} features, row has {}",
                self.axis,
                self.features.len(),
                row.len()
            )));
        }

        Ok(row
            .iter()
            .zip(&self.features)
            .map(|(value, feature)| {
                let clipped = sanitize(*value).clamp(feature.lower, feature.upper);
                (clipped - feature.center) / feature.scale
            })
            .collect())
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, SegmentationError> {
        rows.iter().map(|row| self.transform_row(row)).collect()
    }
}

pub struct PreprocessOutput {
    pub scaled: Vec<Vec<f64>>,
    pub params: ScalerParams,
}

#[derive(Clone, Debug)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn fit_transform(
        &self,
        axis: &AxisName,
        feature_names: &[String],
        rows: &[Vec<f64>],
    ) -> Result<PreprocessOutput, SegmentationError> {
        if rows.is_empty() {
            return Err(SegmentationError::insufficient(axis, "no rows to preprocess"));
        }
        if let Some(row) = rows.iter().find(|row| row.len() != feature_names.len()) {
            return Err(SegmentationError::InvalidParameters(format!(
                "axis `{axis}` declares {} features but a row has {}",
                feature_names.len(),
                row.len()
            )));
        }

        let features: Vec<FeatureScaling> = feature_names
            .iter()
            .enumerate()
            .map(|(column, name)| {
                let values: Vec<f64> = rows.iter().map(|row| sanitize(row[column])).collect();
                self.fit_column(name, values)
            })
            .collect();

        if features.iter().all(|feature| feature.degenerate) {
            return Err(SegmentationError::insufficient(
                axis,
                "every feature is constant after winsorizing",
            ));
        }

        let params = ScalerParams { axis: axis.clone(), features, fitted_on: rows.len() };
        let scaled = params.transform(rows)?;
        Ok(PreprocessOutput { scaled, params })
    }

    fn fit_column(&self, name: &str, mut values: Vec<f64>) -> FeatureScaling {
        values.sort_by(f64::total_cmp);
        let lower = percentile(&values, self.config.lower_percentile);
        let upper = percentile(&values, self.config.upper_percentile);

        let mut clipped: Vec<f64> = values.iter().map(|value| value.clamp(lower, upper)).collect();
        clipped.sort_by(f64::total_cmp);

        let center = percentile(&clipped, 50.0);
        let iqr = percentile(&clipped, 75.0) - percentile(&clipped, 25.0);
        let (scale, degenerate) = if iqr > MIN_SPREAD {
            (iqr, false)
        } else {
            let spread = std_dev(&clipped);
            if spread > MIN_SPREAD {
                (spread, false)
            } else {
                (1.0, true)
            }
        };

        FeatureScaling { name: name.to_string(), lower, upper, center, scale, degenerate }
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Linear-interpolated percentile of an ascending slice; `p` in `[0, 100]`.
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let below = rank.floor() as usize;
            let above = rank.ceil() as usize;
            let fraction = rank - below as f64;
            sorted[below] + (sorted[above] - sorted[below]) * fraction
        }
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::{percentile, Preprocessor};
    use crate::config::PreprocessConfig;
    use crate::domain::feature::AxisName;
    use crate::errors::SegmentationError;

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|index| format!("f{index}")).collect()
    }

    fn preprocessor() -> Preprocessor {
        Preprocessor::new(PreprocessConfig::default())
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 100.0), 4.0);
        assert!((percentile(&sorted, 50.0) - 2.5).abs() < 1e-12);
        assert!((percentile(&sorted, 25.0) - 1.75).abs() < 1e-12);
    }

    #[test]
    fn non_finite_values_become_zero() {
        let rows = vec![vec![f64::NAN], vec![1.0], vec![2.0], vec![f64::INFINITY], vec![3.0]];
        let output = preprocessor()
            .fit_transform(&AxisName::new("spend"), &names(1), &rows)
            .expect("fit should succeed");
        assert!(output.scaled.iter().flatten().all(|value| value.is_finite()));
        assert_eq!(output.params.features()[0].lower, percentile(&[0.0, 0.0, 1.0, 2.0, 3.0], 1.0));
    }

    #[test]
    fn outliers_are_clipped_to_fitted_bounds() {
        let mut rows: Vec<Vec<f64>> = (0..99).map(|value| vec![value as f64]).collect();
        rows.push(vec![1_000_000.0]);
        let output = preprocessor()
            .fit_transform(&AxisName::new("spend"), &names(1), &rows)
            .expect("fit should succeed");
        let feature = &output.params.features()[0];

        assert!(feature.upper < 1_000_000.0);
        let max_scaled = output.scaled.iter().map(|row| row[0]).fold(f64::MIN, f64::max);
        assert!((max_scaled - (feature.upper - feature.center) / feature.scale).abs() < 1e-9);
    }

    #[test]
    fn robust_center_is_the_median() {
        let rows: Vec<Vec<f64>> = [1.0, 2.0, 3.0, 4.0, 100.0].iter().map(|v| vec![*v]).collect();
        let output = preprocessor()
            .fit_transform(&AxisName::new("spend"), &names(1), &rows)
            .expect("fit should succeed");
        assert!((output.params.features()[0].center - 3.0).abs() < 1e-9);
    }

    #[test]
    fn constant_feature_is_flagged_and_kept_with_unit_scale() {
        let rows: Vec<Vec<f64>> = (0..10).map(|value| vec![5.0, value as f64]).collect();
        let output = preprocessor()
            .fit_transform(&AxisName::new("frequency"), &names(2), &rows)
            .expect("fit should succeed");

        let constant = &output.params.features()[0];
        assert!(constant.degenerate);
        assert_eq!(constant.scale, 1.0);
        assert_eq!(output.params.degenerate_features(), vec!["f0"]);
        assert!(output.scaled.iter().all(|row| row[0] == 0.0));
    }

    #[test]
    fn all_constant_features_are_insufficient_data() {
        let rows = vec![vec![1.0, 2.0]; 10];
        let result = preprocessor().fit_transform(&AxisName::new("frequency"), &names(2), &rows);
        assert!(matches!(result, Err(SegmentationError::InsufficientData { .. })));
    }

    #[test]
    fn transform_rejects_wrong_width() {
        let rows: Vec<Vec<f64>> = (0..10).map(|value| vec![value as f64]).collect();
        let output = preprocessor()
            .fit_transform(&AxisName::new("spend"), &names(1), &rows)
            .expect("fit should succeed");
        assert!(output.params.transform_row(&[1.0, 2.0]).is_err());
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::customer::CustomerId;
use crate::domain::feature::AxisName;

/// Soft assignment of one customer to the segments of one axis.
///
/// `weights[j]` is the membership in segment `j`; weights lie in `[0, 1]` and sum to 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FuzzyMembership {
    pub customer_id: CustomerId,
    pub axis: AxisName,
    pub model_run_id: Uuid,
    pub weights: Vec<f64>,
}

impl FuzzyMembership {
    /// Segment with the highest weight; ties resolve to the lowest segment id.
    pub fn dominant(&self) -> (usize, f64) {
        argmax(&self.weights)
    }

    pub fn dominant_segment(&self) -> usize {
        self.dominant().0
    }

    pub fn weight(&self, segment: usize) -> Option<f64> {
        self.weights.get(segment).copied()
    }

    /// Up to two `(segment, weight)` pairs ordered by descending weight.
    pub fn top_two(&self) -> Vec<(usize, f64)> {
        let mut ranked: Vec<(usize, f64)> = self.weights.iter().copied().enumerate().collect();
        ranked.sort_by(|left, right| right.1.total_cmp(&left.1).then(left.0.cmp(&right.0)));
        ranked.truncate(2);
        ranked
    }
}

pub fn argmax(values: &[f64]) -> (usize, f64) {
    let mut best = (0usize, f64::NEG_INFINITY);
    for (index, value) in values.iter().copied().enumerate() {
        if value > best.1 {
            best = (index, value);
        }
    }
    if best.1 == f64::NEG_INFINITY {
        (0, 0.0)
    } else {
        best
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{argmax, FuzzyMembership};
    use crate::domain::{customer::CustomerId, feature::AxisName};

    fn membership(weights: Vec<f64>) -> FuzzyMembership {
        FuzzyMembership {
            customer_id: CustomerId::new("c-1"),
            axis: AxisName::new("spend"),
            model_run_id: Uuid::nil(),
            weights,
        }
    }

    #[test]
    fn dominant_prefers_lowest_segment_on_ties() {
        assert_eq!(membership(vec![0.4, 0.4, 0.2]).dominant(), (0, 0.4));
        assert_eq!(membership(vec![0.1, 0.6, 0.3]).dominant_segment(), 1);
    }

    #[test]
    fn top_two_orders_by_weight() {
        let top = membership(vec![0.2, 0.5, 0.3]).top_two();
        assert_eq!(top, vec![(1, 0.5), (2, 0.3)]);
    }

    #[test]
    fn argmax_of_empty_slice_is_zero() {
        assert_eq!(argmax(&[]), (0, 0.0));
    }
}

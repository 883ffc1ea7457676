//! Fuzzy c-means clustering.
//!
//! [`fit`] is a pure function of its inputs: the same matrix, `k`, fuzziness and seed
//! always produce the same centers and memberships. The per-point membership update is
//! shared with population assignment through [`membership_row`].
//!
//! # Algorithm
//!
//! 1. Seed an `n × k` membership matrix with random rows normalized to sum to 1.
//! 2. Centers are the `u^m`-weighted means of the points.
//! 3. Memberships are updated from the Euclidean distance to every center,
//!    `u_ij = 1 / Σ_l (d_ij / d_il)^(2/(m-1))`, with distances floored at [`DISTANCE_FLOOR`].
//! 4. Stop when the Frobenius norm of the membership change drops below the tolerance or the
//!    iteration budget is spent.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::membership::argmax;
use crate::errors::SegmentationError;

pub const DISTANCE_FLOOR: f64 = 1e-10;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FcmParams {
    pub k: usize,
    pub fuzziness: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub seed: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FcmFit {
    pub centers: Vec<Vec<f64>>,
    /// Row `i` holds the memberships of point `i`.
    pub memberships: Vec<Vec<f64>>,
    pub iterations: usize,
    pub converged: bool,
}

impl FcmFit {
    /// Argmax label per point. Used for quality metrics only, never for assignment.
    pub fn hard_labels(&self) -> Vec<usize> {
        self.memberships.iter().map(|row| argmax(row).0).collect()
    }
}

pub fn fit(data: &[Vec<f64>], params: &FcmParams) -> Result<FcmFit, SegmentationError> {
    validate(data, params)?;

    let n = data.len();
    let k = params.k;
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut memberships: Vec<Vec<f64>> = (0..n)
        .map(|_| {
            let mut row: Vec<f64> = (0..k).map(|_| rng.gen::<f64>() + f64::EPSILON).collect();
            let total: f64 = row.iter().sum();
            row.iter_mut().for_each(|value| *value /= total);
            row
        })
        .collect();

    let mut centers = compute_centers(data, &memberships, k, params.fuzziness);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < params.max_iterations {
        iterations += 1;
        let updated: Vec<Vec<f64>> =
            data.par_iter().map(|point| membership_row(point, &centers, params.fuzziness)).collect();

        let change = frobenius_distance(&memberships, &updated);
        memberships = updated;
        centers = compute_centers(data, &memberships, k, params.fuzziness);

        if change < params.tolerance {
            converged = true;
            break;
        }
    }

    Ok(FcmFit { centers, memberships, iterations, converged })
}

/// One-shot membership of a point against fixed centers.
///
/// Weights are computed relative to the closest center, `(d_min / d_j)^(2/(m-1))`, then
/// normalized; this is algebraically the standard update and cannot overflow for small `m`.
pub fn membership_row(point: &[f64], centers: &[Vec<f64>], fuzziness: f64) -> Vec<f64> {
    let exponent = 2.0 / (fuzziness - 1.0);
    let distances: Vec<f64> =
        centers.iter().map(|center| euclidean(point, center).max(DISTANCE_FLOOR)).collect();
    let closest = distances.iter().copied().fold(f64::INFINITY, f64::min);

    let raw: Vec<f64> =
        distances.iter().map(|distance| (closest / distance).powf(exponent)).collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|value| value / total).collect()
}

pub fn euclidean(left: &[f64], right: &[f64]) -> f64 {
    left.iter().zip(right).map(|(a, b)| (a - b) * (a - b)).sum::<f64>().sqrt()
}

fn compute_centers(
    data: &[Vec<f64>],
    memberships: &[Vec<f64>],
    k: usize,
    fuzziness: f64,
) -> Vec<Vec<f64>> {
    let dimension = data[0].len();
    let mut numerators = vec![vec![0.0; dimension]; k];
    let mut denominators = vec![0.0; k];

    for (point, row) in data.iter().zip(memberships) {
        for (cluster, weight) in row.iter().enumerate() {
            let weight = weight.powf(fuzziness);
            denominators[cluster] += weight;
            for (accumulator, value) in numerators[cluster].iter_mut().zip(point) {
                *accumulator += weight * value;
            }
        }
    }

    numerators
        .into_iter()
        .zip(denominators)
        .map(|(numerator, denominator)| {
            if denominator > 0.0 {
                numerator.into_iter().map(|value| value / denominator).collect()
            } else {
                vec![0.0; dimension]
            }
        })
        .collect()
}

fn frobenius_distance(left: &[Vec<f64>], right: &[Vec<f64>]) -> f64 {
    left.iter()
        .zip(right)
        .flat_map(|(a, b)| a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)))
        .sum::<f64>()
        .sqrt()
}

fn validate(data: &[Vec<f64>], params: &FcmParams) -> Result<(), SegmentationError> {
    if params.k < 2 {
        return Err(SegmentationError::InvalidParameters(format!(
            "k must be at least 2, got {}",
            params.k
        )));
    }
    if !(params.fuzziness > 1.0) || !params.fuzziness.is_finite() {
        return Err(SegmentationError::InvalidParameters(format!(
            "fuzziness must be greater than 1, got {}",
            params.fuzziness
        )));
    }
    if data.len() < params.k {
        return Err(SegmentationError::InvalidParameters(format!(
            "cannot fit {} clusters to {} points",
            params.k,
            data.len()
        )));
    }
    let dimension = data[0].len();
    if dimension == 0 {
        return Err(SegmentationError::InvalidParameters("points have no features".to_string()));
    }
    if data.iter().any(|point| point.len() != dimension) {
        return Err(SegmentationError::InvalidParameters(
            "points have inconsistent dimensions".to_string(),
        ));
    }
    if data.iter().flatten().any(|value| !value.is_finite()) {
        return Err(SegmentationError::InvalidParameters(
            "points contain non-finite values".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{euclidean, fit, membership_row, FcmParams};
    use crate::errors::SegmentationError;

    fn params(k: usize, seed: u64) -> FcmParams {
        FcmParams { k, fuzziness: 2.0, max_iterations: 300, tolerance: 1e-6, seed }
    }

    fn two_blobs() -> Vec<Vec<f64>> {
        let mut data = Vec::new();
        for index in 0..20 {
            let jitter = (index % 5) as f64 * 0.05;
            data.push(vec![0.0 + jitter, 0.0 - jitter]);
            data.push(vec![5.0 - jitter, 5.0 + jitter]);
        }
        data
    }

    #[test]
    fn memberships_are_stochastic_rows() {
        let fit = fit(&two_blobs(), &params(2, 7)).expect("fit should succeed");
        for row in &fit.memberships {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
            assert!(row.iter().all(|value| (0.0..=1.0).contains(value)));
        }
    }

    #[test]
    fn recovers_well_separated_blobs() {
        let fit = fit(&two_blobs(), &params(2, 11)).expect("fit should succeed");
        assert!(fit.converged);

        let mut centers = fit.centers.clone();
        centers.sort_by(|a, b| a[0].total_cmp(&b[0]));
        assert!(euclidean(&centers[0], &[0.1, -0.1]) < 0.2);
        assert!(euclidean(&centers[1], &[4.9, 5.1]) < 0.2);

        let labels = fit.hard_labels();
        for pair in labels.chunks(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn identical_seed_is_deterministic() {
        let first = fit(&two_blobs(), &params(3, 42)).expect("fit should succeed");
        let second = fit(&two_blobs(), &params(3, 42)).expect("fit should succeed");
        assert_eq!(first, second);
    }

    #[test]
    fn point_on_a_center_gets_full_membership() {
        let centers = vec![vec![0.0, 0.0], vec![3.0, 4.0]];
        let row = membership_row(&[0.0, 0.0], &centers, 2.0);
        assert!(row[0] > 0.999_999);
        assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn membership_matches_closed_form() {
        let centers = vec![vec![0.0], vec![3.0]];
        let row = membership_row(&[1.0], &centers, 2.0);
        // d = (1, 2): u_0 = 1 / (1 + (1/2)^2) = 0.8
        assert!((row[0] - 0.8).abs() < 1e-12);
        assert!((row[1] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn small_fuzziness_does_not_overflow() {
        let centers = vec![vec![0.0], vec![1e6]];
        let row = membership_row(&[1e-12], &centers, 1.01);
        assert!(row.iter().all(|value| value.is_finite()));
    }

    #[test]
    fn rejects_invalid_parameters() {
        let data = two_blobs();
        assert!(matches!(fit(&data, &params(1, 0)), Err(SegmentationError::InvalidParameters(_))));
        let mut bad = params(2, 0);
        bad.fuzziness = 1.0;
        assert!(fit(&data, &bad).is_err());
        assert!(fit(&data[..1], &params(2, 0)).is_err());
        assert!(fit(&[vec![1.0], vec![1.0, 2.0]], &params(2, 0)).is_err());
    }
}

//! Balance-aware choice of the cluster count for one axis.
//!
//! Every candidate `k` in the configured range is fitted with fuzzy c-means and scored on
//! separation (silhouette of the hard labels) and segment-size balance. Among candidates
//! whose largest segment is at most `max_share` and smallest at least `min_share`, the best
//! ranked one wins; when none passes, the best-silhouette candidate is used and the result
//! is reported as unbalanced. Each candidate is logged so the choice can be audited.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{FcmConfig, Ranking, SelectionConfig};
use crate::domain::feature::AxisName;
use crate::domain::model::BalanceMetrics;
use crate::errors::SegmentationError;
use crate::fcm::{self, euclidean, FcmFit, FcmParams};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvaluation {
    pub k: usize,
    pub silhouette: f64,
    pub balance: BalanceMetrics,
    pub combined_score: f64,
    pub balanced: bool,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Clone, Debug)]
pub struct Selection {
    pub chosen: CandidateEvaluation,
    pub fit: FcmFit,
    pub fuzziness: f64,
    pub candidates: Vec<CandidateEvaluation>,
}

impl Selection {
    pub fn balanced(&self) -> bool {
        self.chosen.balanced
    }
}

/// Per-axis overrides of the global k range and fuzziness.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SelectionOverrides {
    pub min_k: Option<usize>,
    pub max_k: Option<usize>,
    pub fuzziness: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct ModelSelector {
    selection: SelectionConfig,
    fcm: FcmConfig,
    seed: u64,
}

impl ModelSelector {
    pub fn new(selection: SelectionConfig, fcm: FcmConfig, seed: u64) -> Self {
        Self { selection, fcm, seed }
    }

    pub fn select(
        &self,
        axis: &AxisName,
        data: &[Vec<f64>],
        overrides: SelectionOverrides,
    ) -> Result<Selection, SegmentationError> {
        if data.len() < self.selection.min_customers {
            return Err(SegmentationError::insufficient(
                axis,
                format!(
                    "{} customers sampled, at least {} required",
                    data.len(),
                    self.selection.min_customers
                ),
            ));
        }

        let min_k = overrides.min_k.unwrap_or(self.selection.min_k).max(2);
        let max_k =
            overrides.max_k.unwrap_or(self.selection.max_k).min(data.len().saturating_sub(1));
        let fuzziness = overrides.fuzziness.unwrap_or(self.fcm.fuzziness);
        if min_k > max_k {
            return Err(SegmentationError::insufficient(
                axis,
                format!("k range {min_k}..={max_k} is empty for {} customers", data.len()),
            ));
        }

        let silhouette_rows = stride_sample(data.len(), self.selection.silhouette_sample_limit);
        let mut fits = Vec::new();
        let mut candidates = Vec::new();

        for k in min_k..=max_k {
            let params = FcmParams {
                k,
                fuzziness,
                max_iterations: self.fcm.max_iterations,
                tolerance: self.fcm.tolerance,
                seed: self.seed,
            };
            let fit = match fcm::fit(data, &params) {
                Ok(fit) => fit,
                Err(error) => {
                    debug!(
                        event_name = "segmentation.selection.candidate_skipped",
                        axis = %axis,
                        k,
                        error = %error,
                        "candidate could not be fitted"
                    );
                    continue;
                }
            };

            let labels = fit.hard_labels();
            let silhouette = silhouette_on_rows(data, &labels, &silhouette_rows);
            let balance = balance_metrics(&labels, k);
            let balanced = self.is_balanced(&balance);
            let combined_score = self.combined_score(silhouette, &balance);

            info!(
                event_name = "segmentation.selection.candidate",
                axis = %axis,
                k,
                silhouette,
                largest_share = balance.largest_share,
                smallest_share = balance.smallest_share,
                combined_score,
                balanced,
                iterations = fit.iterations,
                converged = fit.converged,
                "evaluated cluster count candidate"
            );

            candidates.push(CandidateEvaluation {
                k,
                silhouette,
                balance,
                combined_score,
                balanced,
                iterations: fit.iterations,
                converged: fit.converged,
            });
            fits.push(fit);
        }

        let (index, balanced) = choose(&candidates, self.selection.ranking)
            .ok_or_else(|| SegmentationError::insufficient(axis, "no candidate k could be fitted"))?;
        let chosen = candidates[index].clone();

        if balanced {
            info!(
                event_name = "segmentation.selection.chosen",
                axis = %axis,
                k = chosen.k,
                silhouette = chosen.silhouette,
                "selected balanced cluster count"
            );
        } else {
            warn!(
                event_name = "segmentation.selection.unbalanced",
                axis = %axis,
                k = chosen.k,
                silhouette = chosen.silhouette,
                largest_share = chosen.balance.largest_share,
                smallest_share = chosen.balance.smallest_share,
                "no candidate met balance thresholds; using best silhouette"
            );
        }

        Ok(Selection { chosen, fit: fits.swap_remove(index), fuzziness, candidates })
    }

    pub fn is_balanced(&self, balance: &BalanceMetrics) -> bool {
        balance.largest_share <= self.selection.max_share
            && balance.smallest_share >= self.selection.min_share
    }

    /// Weighted blend of silhouette (rescaled to `[0, 1]`) and segment evenness.
    pub fn combined_score(&self, silhouette: f64, balance: &BalanceMetrics) -> f64 {
        let total = self.selection.silhouette_weight + self.selection.balance_weight;
        if total <= 0.0 {
            return 0.0;
        }
        let separation = ((silhouette + 1.0) / 2.0).clamp(0.0, 1.0);
        (self.selection.silhouette_weight * separation
            + self.selection.balance_weight * balance.evenness)
            / total
    }
}

/// Picks the winning candidate; returns its index and whether it passed the balance gate.
///
/// Balanced candidates are ranked by `ranking`; without any, the highest silhouette wins.
/// Ties keep the smaller k.
pub fn choose(candidates: &[CandidateEvaluation], ranking: Ranking) -> Option<(usize, bool)> {
    let score = |candidate: &CandidateEvaluation| match ranking {
        Ranking::Silhouette => candidate.silhouette,
        Ranking::Combined => candidate.combined_score,
    };

    let best_balanced = best_by(candidates.iter().enumerate().filter(|(_, c)| c.balanced), score);
    if let Some(index) = best_balanced {
        return Some((index, true));
    }

    best_by(candidates.iter().enumerate(), |candidate| candidate.silhouette)
        .map(|index| (index, false))
}

fn best_by<'a>(
    candidates: impl Iterator<Item = (usize, &'a CandidateEvaluation)>,
    score: impl Fn(&CandidateEvaluation) -> f64,
) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, candidate) in candidates {
        let value = score(candidate);
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

pub fn balance_metrics(labels: &[usize], k: usize) -> BalanceMetrics {
    let mut counts = vec![0usize; k];
    for label in labels {
        if let Some(count) = counts.get_mut(*label) {
            *count += 1;
        }
    }

    let total = labels.len().max(1) as f64;
    let shares: Vec<f64> = counts.iter().map(|count| *count as f64 / total).collect();
    let largest_share = shares.iter().copied().fold(0.0, f64::max);
    let smallest_share = shares.iter().copied().fold(1.0, f64::min);

    let entropy: f64 =
        shares.iter().filter(|share| **share > 0.0).map(|share| -share * share.ln()).sum();
    let evenness = if k > 1 { entropy / (k as f64).ln() } else { 0.0 };

    BalanceMetrics { shares, largest_share, smallest_share, evenness }
}

/// Mean silhouette coefficient of a hard labelling, in `[-1, 1]`.
pub fn silhouette_score(data: &[Vec<f64>], labels: &[usize]) -> f64 {
    let rows: Vec<usize> = (0..data.len()).collect();
    silhouette_on_rows(data, labels, &rows)
}

fn silhouette_on_rows(data: &[Vec<f64>], labels: &[usize], rows: &[usize]) -> f64 {
    let k = rows.iter().map(|row| labels[*row] + 1).max().unwrap_or(0);
    let mut sizes = vec![0usize; k];
    for row in rows {
        sizes[labels[*row]] += 1;
    }
    if sizes.iter().filter(|size| **size > 0).count() < 2 {
        return 0.0;
    }

    let total: f64 = rows
        .par_iter()
        .map(|i| {
            let own = labels[*i];
            if sizes[own] <= 1 {
                return 0.0;
            }
            let mut sums = vec![0.0; k];
            for j in rows {
                if j != i {
                    sums[labels[*j]] += euclidean(&data[*i], &data[*j]);
                }
            }
            let a = sums[own] / (sizes[own] - 1) as f64;
            let b = (0..k)
                .filter(|cluster| *cluster != own && sizes[*cluster] > 0)
                .map(|cluster| sums[cluster] / sizes[cluster] as f64)
                .fold(f64::INFINITY, f64::min);
            let denominator = a.max(b);
            if denominator > 0.0 {
                (b - a) / denominator
            } else {
                0.0
            }
        })
        .sum();

    total / rows.len() as f64
}

/// Evenly spaced row indices, at most `limit` of them.
fn stride_sample(n: usize, limit: usize) -> Vec<usize> {
    if limit == 0 || n <= limit {
        return (0..n).collect();
    }
    let step = n as f64 / limit as f64;
    (0..limit).map(|index| ((index as f64 * step) as usize).min(n - 1)).collect()
}

#[cfg(test)]
mod tests {
    use super::{balance_metrics, choose, silhouette_score, stride_sample, CandidateEvaluation};
    use crate::config::Ranking;
    use crate::domain::model::BalanceMetrics;

    fn candidate(k: usize, silhouette: f64, balanced: bool, combined: f64) -> CandidateEvaluation {
        CandidateEvaluation {
            k,
            silhouette,
            balance: BalanceMetrics {
                shares: vec![1.0 / k as f64; k],
                largest_share: 0.5,
                smallest_share: 0.1,
                evenness: 0.9,
            },
            combined_score: combined,
            balanced,
            iterations: 10,
            converged: true,
        }
    }

    #[test]
    fn prefers_best_balanced_over_better_unbalanced() {
        let candidates = vec![
            candidate(2, 0.81, false, 0.5),
            candidate(3, 0.62, true, 0.7),
            candidate(4, 0.58, true, 0.8),
        ];
        assert_eq!(choose(&candidates, Ranking::Silhouette), Some((1, true)));
        assert_eq!(choose(&candidates, Ranking::Combined), Some((2, true)));
    }

    #[test]
    fn falls_back_to_best_silhouette_when_nothing_is_balanced() {
        let candidates = vec![
            candidate(2, 0.4, false, 0.9),
            candidate(3, 0.7, false, 0.1),
            candidate(4, 0.5, false, 0.5),
        ];
        assert_eq!(choose(&candidates, Ranking::Combined), Some((1, false)));
    }

    #[test]
    fn ties_keep_the_smaller_k() {
        let candidates = vec![candidate(2, 0.6, true, 0.5), candidate(3, 0.6, true, 0.5)];
        assert_eq!(choose(&candidates, Ranking::Silhouette), Some((0, true)));
        assert_eq!(choose(&[], Ranking::Silhouette), None);
    }

    #[test]
    fn balance_metrics_report_shares_and_evenness() {
        let labels = vec![0, 0, 0, 0, 0, 1, 1, 1, 2, 2];
        let balance = balance_metrics(&labels, 3);
        assert_eq!(balance.shares, vec![0.5, 0.3, 0.2]);
        assert_eq!(balance.largest_share, 0.5);
        assert_eq!(balance.smallest_share, 0.2);
        assert!(balance.evenness > 0.9 && balance.evenness < 1.0);

        let even = balance_metrics(&[0, 1, 2, 0, 1, 2], 3);
        assert!((even.evenness - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_segment_has_zero_share() {
        let balance = balance_metrics(&[0, 0, 1, 1], 3);
        assert_eq!(balance.smallest_share, 0.0);
    }

    #[test]
    fn silhouette_is_high_for_separated_groups() {
        let data = vec![vec![0.0], vec![0.1], vec![0.2], vec![10.0], vec![10.1], vec![10.2]];
        let good = silhouette_score(&data, &[0, 0, 0, 1, 1, 1]);
        let bad = silhouette_score(&data, &[0, 1, 0, 1, 0, 1]);
        assert!(good > 0.95);
        assert!(bad < 0.0);
    }

    #[test]
    fn silhouette_of_single_cluster_is_zero() {
        let data = vec![vec![0.0], vec![1.0]];
        assert_eq!(silhouette_score(&data, &[0, 0]), 0.0);
    }

    #[test]
    fn stride_sample_caps_row_count() {
        assert_eq!(stride_sample(5, 10), vec![0, 1, 2, 3, 4]);
        let rows = stride_sample(10_000, 100);
        assert_eq!(rows.len(), 100);
        assert_eq!(rows[1], 100);
    }
}

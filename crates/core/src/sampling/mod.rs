//! Discovery-time sampling.
//!
//! Discovery is too expensive to run over the whole population, so each axis is fitted on
//! a bounded sample drawn with the strategy its configuration names. All strategies are
//! deterministic for a given seed, axis name and population order.

use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{AxisConfig, SamplingConfig, SamplingStrategy};
use crate::domain::customer::{CustomerHistory, CustomerId, ObservationWindow};
use crate::domain::feature::AxisName;
use crate::features::FeatureCache;

/// Upper bounds (inclusive) of the activity tiers used by stratified sampling, in orders
/// inside the window. Customers above the last bound form the final tier.
const ACTIVITY_TIER_BOUNDS: [usize; 3] = [0, 1, 4];

pub struct Sampler<'a> {
    config: SamplingConfig,
    cache: &'a FeatureCache,
    seed: u64,
}

impl<'a> Sampler<'a> {
    pub fn new(config: SamplingConfig, cache: &'a FeatureCache, seed: u64) -> Self {
        Self { config, cache, seed }
    }

    /// Sample size for a population: a larger fraction for small populations, a smaller one
    /// for large populations, clamped to `[min_size, max_size]` and never above `population`.
    pub fn sample_size(&self, population: usize) -> usize {
        let fraction = if population <= self.config.small_population_threshold {
            self.config.small_fraction
        } else {
            self.config.large_fraction
        };
        let scaled = (population as f64 * fraction).round() as usize;
        scaled.clamp(self.config.min_size, self.config.max_size).min(population)
    }

    /// Customer ids selected for discovering `axis`.
    ///
    /// When the population is no larger than the requested size, every customer is returned
    /// in population order.
    pub fn sample(
        &self,
        histories: &[CustomerHistory],
        axis: &AxisConfig,
        window: &ObservationWindow,
    ) -> Vec<CustomerId> {
        self.sample_indices(histories, axis, window)
            .into_iter()
            .map(|position| histories[position].customer_id.clone())
            .collect()
    }

    pub(crate) fn sample_indices(
        &self,
        histories: &[CustomerHistory],
        axis: &AxisConfig,
        window: &ObservationWindow,
    ) -> Vec<usize> {
        let population = histories.len();
        let size = self.sample_size(population);
        if population <= size {
            return (0..population).collect();
        }

        let mut rng = StdRng::seed_from_u64(axis_seed(self.seed, &axis.name));
        let mut selected = match axis.sampling {
            SamplingStrategy::Uniform => index::sample(&mut rng, population, size).into_vec(),
            SamplingStrategy::Weighted => {
                let weights: Vec<f64> = histories
                    .iter()
                    .map(|history| self.cache.extractor().activity(history, window).total_spend)
                    .collect();
                weighted(&weights, size, &mut rng)
            }
            SamplingStrategy::Stratified => {
                let tiers: Vec<usize> = histories
                    .iter()
                    .map(|history| {
                        activity_tier(self.cache.extractor().activity(history, window).order_count)
                    })
                    .collect();
                stratified(&tiers, ACTIVITY_TIER_BOUNDS.len() + 1, size, &mut rng)
            }
            SamplingStrategy::Diversity => {
                let pool: Vec<usize> = if population > self.config.diversity_pool_limit {
                    index::sample(&mut rng, population, self.config.diversity_pool_limit)
                        .into_vec()
                } else {
                    (0..population).collect()
                };
                let points: Vec<Vec<f64>> = pool
                    .iter()
                    .map(|position| {
                        self.cache.get_or_extract(&histories[*position], axis, window).values()
                    })
                    .collect();
                farthest_point(&points, size, &mut rng)
                    .into_iter()
                    .map(|chosen| pool[chosen])
                    .collect()
            }
        };

        selected.sort_unstable();
        debug!(
            event_name = "segmentation.sampling.completed",
            axis = %axis.name,
            strategy = ?axis.sampling,
            population,
            sample_size = selected.len(),
            "drew discovery sample"
        );
        selected
    }
}

fn axis_seed(seed: u64, axis: &AxisName) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(axis.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn activity_tier(order_count: usize) -> usize {
    ACTIVITY_TIER_BOUNDS
        .iter()
        .position(|bound| order_count <= *bound)
        .unwrap_or(ACTIVITY_TIER_BOUNDS.len())
}

/// Weighted sampling without replacement (Efraimidis-Spirakis): each item draws the key
/// `ln(u) / w` and the `size` largest keys win. Every weight gets a floor of 1 so zero-value
/// customers stay eligible.
fn weighted(weights: &[f64], size: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut keyed: Vec<(f64, usize)> = weights
        .iter()
        .enumerate()
        .map(|(position, weight)| {
            let weight = if weight.is_finite() { weight.max(0.0) } else { 0.0 } + 1.0;
            let draw: f64 = rng.gen_range(f64::EPSILON..1.0);
            (draw.ln() / weight, position)
        })
        .collect();
    keyed.sort_by(|left, right| right.0.total_cmp(&left.0).then(left.1.cmp(&right.1)));
    keyed.into_iter().take(size).map(|(_, position)| position).collect()
}

/// Equal quota per non-empty tier; quota a small tier cannot fill goes to the others.
fn stratified(tiers: &[usize], tier_count: usize, size: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); tier_count];
    for (position, tier) in tiers.iter().enumerate() {
        buckets[*tier].push(position);
    }
    for bucket in &mut buckets {
        bucket.shuffle(rng);
    }

    let mut taken = vec![0usize; tier_count];
    let mut remaining = size;
    while remaining > 0 {
        let open: Vec<usize> =
            (0..tier_count).filter(|tier| taken[*tier] < buckets[*tier].len()).collect();
        if open.is_empty() {
            break;
        }
        let quota = (remaining / open.len()).max(1);
        for tier in open {
            if remaining == 0 {
                break;
            }
            let grant = quota.min(buckets[tier].len() - taken[tier]).min(remaining);
            taken[tier] += grant;
            remaining -= grant;
        }
    }

    buckets
        .into_iter()
        .zip(taken)
        .flat_map(|(bucket, count)| bucket.into_iter().take(count))
        .collect()
}

/// Greedy farthest-point selection in z-scored space, starting from one random point.
fn farthest_point(points: &[Vec<f64>], size: usize, rng: &mut StdRng) -> Vec<usize> {
    if points.is_empty() || size == 0 {
        return Vec::new();
    }
    let standardized = standardize(points);
    let first = rng.gen_range(0..standardized.len());
    let mut selected = vec![first];
    let mut chosen = vec![false; standardized.len()];
    chosen[first] = true;

    let mut nearest: Vec<f64> =
        standardized.par_iter().map(|point| squared(point, &standardized[first])).collect();

    while selected.len() < size.min(standardized.len()) {
        let mut best: Option<(usize, f64)> = None;
        for (position, distance) in nearest.iter().enumerate() {
            if chosen[position] {
                continue;
            }
            if best.map_or(true, |(_, current)| *distance > current) {
                best = Some((position, *distance));
            }
        }
        let Some((next, _)) = best else {
            break;
        };

        chosen[next] = true;
        selected.push(next);
        let anchor = &standardized[next];
        nearest.par_iter_mut().zip(standardized.par_iter()).for_each(|(distance, point)| {
            let candidate = squared(point, anchor);
            if candidate < *distance {
                *distance = candidate;
            }
        });
    }

    selected
}

fn standardize(points: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let count = points.len() as f64;
    let dimension = points[0].len();
    let mut means = vec![0.0; dimension];
    for point in points {
        for (mean, value) in means.iter_mut().zip(point) {
            *mean += value / count;
        }
    }
    let mut deviations = vec![0.0; dimension];
    for point in points {
        for ((deviation, value), mean) in deviations.iter_mut().zip(point).zip(&means) {
            *deviation += (value - mean).powi(2) / count;
        }
    }
    let scales: Vec<f64> = deviations
        .into_iter()
        .map(|variance| if variance > 0.0 { variance.sqrt() } else { 1.0 })
        .collect();

    points
        .iter()
        .map(|point| {
            point
                .iter()
                .zip(&means)
                .zip(&scales)
                .map(|((value, mean), scale)| (value - mean) / scale)
                .collect()
        })
        .collect()
}

fn squared(left: &[f64], right: &[f64]) -> f64 {
    left.iter().zip(right).map(|(a, b)| (a - b) * (a - b)).sum()
}

//! Cross-axis archetypes.
//!
//! A customer's signature combines their per-axis memberships at one of three
//! granularities; customers with identical signatures form an archetype. Finer
//! granularities split archetypes further, so choosing `fuzzy_top2` is a deliberate trade
//! of cohort size for diversity.

use std::collections::{BTreeMap, HashMap};

use tracing::{info, warn};

use crate::config::ArchetypeConfig;
use crate::domain::archetype::{
    Archetype, ArchetypeReport, ArchetypeSignature, ArchetypeStatistics, Granularity,
    SignatureComponent, StrengthBin,
};
use crate::domain::customer::CustomerId;
use crate::domain::feature::AxisName;
use crate::domain::membership::FuzzyMembership;

const TOP_COVERAGE: usize = 10;

#[derive(Clone, Debug)]
pub struct ArchetypeComposer {
    config: ArchetypeConfig,
}

impl ArchetypeComposer {
    pub fn new(config: ArchetypeConfig) -> Self {
        Self { config }
    }

    pub fn strength_bin(&self, dominant_weight: f64) -> StrengthBin {
        if dominant_weight < self.config.weak_below {
            StrengthBin::Weak
        } else if dominant_weight > self.config.strong_above {
            StrengthBin::Strong
        } else {
            StrengthBin::Balanced
        }
    }

    pub fn component(
        &self,
        membership: &FuzzyMembership,
        granularity: Granularity,
    ) -> SignatureComponent {
        let axis = membership.axis.clone();
        match granularity {
            Granularity::Dominant => {
                SignatureComponent::Dominant { axis, segment: membership.dominant_segment() }
            }
            Granularity::StrengthBinned => {
                let (segment, weight) = membership.dominant();
                SignatureComponent::Binned { axis, segment, strength: self.strength_bin(weight) }
            }
            Granularity::FuzzyTop2 => {
                let scale = 10f64.powi(self.config.precision as i32);
                let strength = self.strength_bin(membership.dominant().1);
                let segments = membership
                    .top_two()
                    .into_iter()
                    .map(|(segment, weight)| (segment, (weight * scale).round() as u32))
                    .collect();
                SignatureComponent::Top2 {
                    axis,
                    strength,
                    precision: self.config.precision,
                    segments,
                }
            }
        }
    }

    /// Groups customers by signature over `axes`.
    ///
    /// Customers without a membership on every axis are left out of all archetypes and
    /// listed in `incomplete_customers`; shares are relative to complete customers only.
    pub fn compose(
        &self,
        axes: &[AxisName],
        memberships: &[FuzzyMembership],
        granularity: Granularity,
    ) -> ArchetypeReport {
        let mut by_customer: BTreeMap<&CustomerId, HashMap<&AxisName, &FuzzyMembership>> =
            BTreeMap::new();
        for membership in memberships {
            if axes.contains(&membership.axis) {
                by_customer
                    .entry(&membership.customer_id)
                    .or_default()
                    .insert(&membership.axis, membership);
            }
        }

        let mut groups: HashMap<ArchetypeSignature, Vec<CustomerId>> = HashMap::new();
        let mut incomplete_customers = Vec::new();
        for (customer_id, per_axis) in by_customer {
            let components: Option<Vec<SignatureComponent>> = axes
                .iter()
                .map(|axis| {
                    per_axis.get(axis).map(|membership| self.component(membership, granularity))
                })
                .collect();
            match components {
                Some(components) => groups
                    .entry(ArchetypeSignature::new(components))
                    .or_default()
                    .push(customer_id.clone()),
                None => incomplete_customers.push(customer_id.clone()),
            }
        }

        if !incomplete_customers.is_empty() {
            warn!(
                event_name = "segmentation.archetype.incomplete_customers",
                count = incomplete_customers.len(),
                "customers without memberships on every axis were excluded"
            );
        }

        let customer_count: usize = groups.values().map(Vec::len).sum();
        let mut archetypes: Vec<Archetype> = groups
            .into_iter()
            .map(|(signature, member_ids)| Archetype {
                key: signature.key(),
                member_count: member_ids.len(),
                population_share: member_ids.len() as f64 / customer_count as f64,
                signature,
                member_ids,
            })
            .collect();
        archetypes.sort_by(|left, right| {
            right.member_count.cmp(&left.member_count).then_with(|| left.key.cmp(&right.key))
        });

        let statistics = statistics(&archetypes, customer_count);
        info!(
            event_name = "segmentation.archetype.composed",
            granularity = granularity.as_str(),
            archetypes = statistics.archetype_count,
            customers = customer_count,
            top10_coverage = statistics.top10_coverage,
            "composed archetypes"
        );

        ArchetypeReport { granularity, archetypes, statistics, incomplete_customers }
    }
}

fn statistics(archetypes: &[Archetype], customer_count: usize) -> ArchetypeStatistics {
    if archetypes.is_empty() {
        return ArchetypeStatistics {
            archetype_count: 0,
            customer_count,
            min_size: 0,
            max_size: 0,
            median_size: 0.0,
            mean_size: 0.0,
            singleton_count: 0,
            top10_coverage: 0.0,
        };
    }

    let mut sizes: Vec<usize> = archetypes.iter().map(|archetype| archetype.member_count).collect();
    sizes.sort_unstable();
    let middle = sizes.len() / 2;
    let median_size = if sizes.len() % 2 == 0 {
        (sizes[middle - 1] + sizes[middle]) as f64 / 2.0
    } else {
        sizes[middle] as f64
    };
    // archetypes arrive sorted by size descending
    let top: usize =
        archetypes.iter().take(TOP_COVERAGE).map(|archetype| archetype.member_count).sum();

    ArchetypeStatistics {
        archetype_count: archetypes.len(),
        customer_count,
        min_size: sizes[0],
        max_size: sizes[sizes.len() - 1],
        median_size,
        mean_size: customer_count as f64 / archetypes.len() as f64,
        singleton_count: sizes.iter().filter(|size| **size == 1).count(),
        top10_coverage: top as f64 / customer_count as f64,
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::ArchetypeComposer;
    use crate::config::ArchetypeConfig;
    use crate::domain::archetype::{Granularity, StrengthBin};
    use crate::domain::customer::CustomerId;
    use crate::domain::feature::AxisName;
    use crate::domain::membership::FuzzyMembership;

    fn membership(customer: &str, axis: &str, weights: &[f64]) -> FuzzyMembership {
        FuzzyMembership {
            customer_id: CustomerId::new(customer),
            axis: AxisName::new(axis),
            model_run_id: Uuid::nil(),
            weights: weights.to_vec(),
        }
    }

    fn axes() -> Vec<AxisName> {
        vec![AxisName::new("frequency"), AxisName::new("spend")]
    }

    fn population() -> Vec<FuzzyMembership> {
        vec![
            membership("a", "frequency", &[0.9, 0.1]),
            membership("a", "spend", &[0.2, 0.8]),
            membership("b", "frequency", &[0.55, 0.45]),
            membership("b", "spend", &[0.25, 0.75]),
            membership("c", "frequency", &[0.8, 0.2]),
            membership("c", "spend", &[0.22, 0.78]),
            membership("d", "frequency", &[0.2, 0.8]),
            membership("d", "spend", &[0.9, 0.1]),
            membership("e", "frequency", &[0.95, 0.05]),
        ]
    }

    #[test]
    fn dominant_groups_by_argmax_per_axis() {
        let composer = ArchetypeComposer::new(ArchetypeConfig::default());
        let report = composer.compose(&axes(), &population(), Granularity::Dominant);

        assert_eq!(report.statistics.archetype_count, 2);
        assert_eq!(report.archetypes[0].key, "frequency=0|spend=1");
        assert_eq!(report.archetypes[0].member_count, 3);
        assert_eq!(report.find("frequency=1|spend=0").map(|a| a.member_count), Some(1));
        assert_eq!(report.incomplete_customers, vec![CustomerId::new("e")]);
    }

    #[test]
    fn shares_sum_to_one() {
        let composer = ArchetypeComposer::new(ArchetypeConfig { precision: 2, ..Default::default() });
        for granularity in [Granularity::Dominant, Granularity::StrengthBinned, Granularity::FuzzyTop2]
        {
            let report = composer.compose(&axes(), &population(), granularity);
            let total: f64 = report.archetypes.iter().map(|a| a.population_share).sum();
            assert!((total - 1.0).abs() < 1e-12, "{granularity:?}");
        }
    }

    #[test]
    fn finer_granularity_never_merges_archetypes() {
        let composer = ArchetypeComposer::new(ArchetypeConfig { precision: 2, ..Default::default() });
        let count = |granularity| {
            composer.compose(&axes(), &population(), granularity).statistics.archetype_count
        };
        let dominant = count(Granularity::Dominant);
        let binned = count(Granularity::StrengthBinned);
        let top2 = count(Granularity::FuzzyTop2);
        assert!(dominant <= binned && binned <= top2, "{dominant} {binned} {top2}");
        assert_eq!((dominant, binned, top2), (2, 3, 4));
    }

    #[test]
    fn top2_splits_weights_straddling_strength_thresholds() {
        let axis = [AxisName::new("spend")];
        let population = vec![
            membership("a", "spend", &[0.699, 0.301]),
            membership("b", "spend", &[0.701, 0.299]),
            membership("c", "spend", &[0.399, 0.301, 0.3]),
            membership("d", "spend", &[0.3, 0.401, 0.299]),
        ];

        for precision in [1, 2] {
            let composer = ArchetypeComposer::new(ArchetypeConfig { precision, ..Default::default() });
            let count = |granularity| {
                composer.compose(&axis, &population, granularity).statistics.archetype_count
            };
            let binned = count(Granularity::StrengthBinned);
            let top2 = count(Granularity::FuzzyTop2);
            assert_eq!(binned, 4, "precision {precision}");
            assert!(binned <= top2, "precision {precision}: {binned} > {top2}");
        }
    }

    #[test]
    fn strength_bins_use_configured_thresholds() {
        let composer = ArchetypeComposer::new(ArchetypeConfig::default());
        assert_eq!(composer.strength_bin(0.35), StrengthBin::Weak);
        assert_eq!(composer.strength_bin(0.4), StrengthBin::Balanced);
        assert_eq!(composer.strength_bin(0.7), StrengthBin::Balanced);
        assert_eq!(composer.strength_bin(0.71), StrengthBin::Strong);
    }

    #[test]
    fn top2_key_renders_rounded_weights() {
        let composer = ArchetypeComposer::new(ArchetypeConfig::default());
        let report = composer.compose(
            &[AxisName::new("spend")],
            &[membership("a", "spend", &[0.14, 0.61, 0.25])],
            Granularity::FuzzyTop2,
        );
        assert_eq!(report.archetypes[0].key, "spend=1@0.6+2@0.3:balanced");
    }

    #[test]
    fn statistics_describe_size_distribution() {
        let composer = ArchetypeComposer::new(ArchetypeConfig::default());
        let report = composer.compose(&axes(), &population(), Granularity::Dominant);
        let stats = &report.statistics;
        assert_eq!((stats.min_size, stats.max_size, stats.singleton_count), (1, 3, 1));
        assert_eq!(stats.customer_count, 4);
        assert!((stats.median_size - 2.0).abs() < 1e-12);
        assert!((stats.top10_coverage - 1.0).abs() < 1e-12);
        assert_eq!(report.top(1).len(), 1);
    }
}

use std::collections::{BTreeMap, HashMap};

use tokio::sync::RwLock;

use segmenta_core::domain::archetype::{Archetype, ArchetypeReport, Granularity};
use segmenta_core::domain::customer::{
    CustomerEvent, CustomerHistory, CustomerId, ObservationWindow,
};
use segmenta_core::domain::feature::AxisName;
use segmenta_core::domain::membership::FuzzyMembership;
use segmenta_core::domain::model::AxisModel;
use segmenta_core::engine::DiscoveryReport;

use super::membership::distribution;
use super::{
    ArchetypeRepository, AxisModelRepository, DiscoveryRunRepository, EventRepository,
    MembershipRepository, RepositoryError, SegmentCount,
};

#[derive(Default)]
pub struct InMemoryEventRepository {
    events: RwLock<Vec<CustomerEvent>>,
}

#[async_trait::async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn append(&self, events: &[CustomerEvent]) -> Result<(), RepositoryError> {
        let mut stored = self.events.write().await;
        stored.extend_from_slice(events);
        Ok(())
    }

    async fn load_histories(
        &self,
        window: &ObservationWindow,
    ) -> Result<Vec<CustomerHistory>, RepositoryError> {
        let stored = self.events.read().await;
        let mut grouped: BTreeMap<CustomerId, Vec<CustomerEvent>> = BTreeMap::new();
        for event in stored.iter().filter(|event| event.occurred_at < window.end) {
            let events = grouped.entry(event.customer_id.clone()).or_default();
            if window.contains(event.occurred_at) {
                events.push(event.clone());
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(customer_id, events)| CustomerHistory::new(customer_id, events))
            .collect())
    }
}

/// Published models per axis, oldest first; the last entry is active.
#[derive(Default)]
pub struct InMemoryAxisModelRepository {
    models: RwLock<HashMap<AxisName, Vec<AxisModel>>>,
}

#[async_trait::async_trait]
impl AxisModelRepository for InMemoryAxisModelRepository {
    async fn publish_all(&self, models: &[AxisModel]) -> Result<(), RepositoryError> {
        if let Some(model) = models.iter().find(|model| !model.verify_fingerprint()) {
            return Err(RepositoryError::Integrity(format!(
                "model {} for axis `{}` does not match its fingerprint",
                model.run_id, model.axis
            )));
        }
        let mut stored = self.models.write().await;
        for model in models {
            stored.entry(model.axis.clone()).or_default().push(model.clone());
        }
        Ok(())
    }

    async fn find_active(&self, axis: &AxisName) -> Result<Option<AxisModel>, RepositoryError> {
        let models = self.models.read().await;
        Ok(models.get(axis).and_then(|history| history.last()).cloned())
    }

    async fn list_active(&self) -> Result<Vec<AxisModel>, RepositoryError> {
        let models = self.models.read().await;
        let mut active: Vec<AxisModel> =
            models.values().filter_map(|history| history.last()).cloned().collect();
        active.sort_by(|left, right| left.axis.cmp(&right.axis));
        Ok(active)
    }

    async fn history(&self, axis: &AxisName) -> Result<Vec<AxisModel>, RepositoryError> {
        let models = self.models.read().await;
        Ok(models.get(axis).map(|history| history.iter().rev().cloned().collect()).unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryMembershipRepository {
    memberships: RwLock<BTreeMap<(CustomerId, AxisName), FuzzyMembership>>,
}

impl InMemoryMembershipRepository {
    async fn collect(&self, keep: impl Fn(&FuzzyMembership) -> bool) -> Vec<FuzzyMembership> {
        let memberships = self.memberships.read().await;
        memberships.values().filter(|membership| keep(membership)).cloned().collect()
    }
}

#[async_trait::async_trait]
impl MembershipRepository for InMemoryMembershipRepository {
    async fn upsert_many(&self, memberships: &[FuzzyMembership]) -> Result<(), RepositoryError> {
        let mut stored = self.memberships.write().await;
        for membership in memberships {
            stored.insert(
                (membership.customer_id.clone(), membership.axis.clone()),
                membership.clone(),
            );
        }
        Ok(())
    }

    async fn find(
        &self,
        customer_id: &CustomerId,
        axis: &AxisName,
    ) -> Result<Option<FuzzyMembership>, RepositoryError> {
        let stored = self.memberships.read().await;
        Ok(stored.get(&(customer_id.clone(), axis.clone())).cloned())
    }

    async fn list_for_customer(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<FuzzyMembership>, RepositoryError> {
        Ok(self.collect(|membership| &membership.customer_id == customer_id).await)
    }

    async fn list_for_axis(&self, axis: &AxisName) -> Result<Vec<FuzzyMembership>, RepositoryError> {
        Ok(self.collect(|membership| &membership.axis == axis).await)
    }

    async fn list_all(&self) -> Result<Vec<FuzzyMembership>, RepositoryError> {
        Ok(self.collect(|_| true).await)
    }

    async fn segment_distribution(
        &self,
        axis: &AxisName,
    ) -> Result<Vec<SegmentCount>, RepositoryError> {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for membership in self.collect(|membership| &membership.axis == axis).await {
            *counts.entry(membership.dominant_segment()).or_default() += 1;
        }
        Ok(distribution(counts.into_iter().collect()))
    }
}

#[derive(Default)]
pub struct InMemoryArchetypeRepository {
    snapshots: RwLock<HashMap<Granularity, Vec<Archetype>>>,
}

#[async_trait::async_trait]
impl ArchetypeRepository for InMemoryArchetypeRepository {
    async fn replace_snapshot(&self, report: &ArchetypeReport) -> Result<(), RepositoryError> {
        let mut archetypes = report.archetypes.clone();
        archetypes.sort_by(|left, right| {
            right.member_count.cmp(&left.member_count).then_with(|| left.key.cmp(&right.key))
        });
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(report.granularity, archetypes);
        Ok(())
    }

    async fn find_by_key(
        &self,
        granularity: Granularity,
        key: &str,
    ) -> Result<Option<Archetype>, RepositoryError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(&granularity)
            .and_then(|archetypes| archetypes.iter().find(|archetype| archetype.key == key))
            .cloned())
    }

    async fn top(
        &self,
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<Archetype>, RepositoryError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(&granularity)
            .map(|archetypes| archetypes.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryDiscoveryRunRepository {
    runs: RwLock<Vec<DiscoveryReport>>,
}

#[async_trait::async_trait]
impl DiscoveryRunRepository for InMemoryDiscoveryRunRepository {
    async fn record(&self, report: &DiscoveryReport) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        runs.push(report.clone());
        Ok(())
    }

    async fn latest(&self) -> Result<Option<DiscoveryReport>, RepositoryError> {
        let runs = self.runs.read().await;
        Ok(runs.iter().max_by_key(|report| report.started_at).cloned())
    }
}

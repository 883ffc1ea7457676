use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::config::AxisConfig;
use crate::domain::customer::{CustomerHistory, CustomerId, ObservationWindow};
use crate::domain::feature::{AxisName, FeatureVector};
use crate::features::{FeatureExtractor, Metric};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    customer_id: CustomerId,
    axis: AxisName,
    metrics: Vec<Metric>,
    window: ObservationWindow,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Memoizes extracted feature vectors for the lifetime of one process.
///
/// Constructed once at startup and handed by reference to the sampler and the assigner.
/// Keys include the metric list and window, so a changed axis definition never reads a
/// stale vector. A poisoned lock degrades to uncached extraction.
#[derive(Debug, Default)]
pub struct FeatureCache {
    extractor: FeatureExtractor,
    entries: RwLock<HashMap<CacheKey, FeatureVector>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn get_or_extract(
        &self,
        history: &CustomerHistory,
        axis: &AxisConfig,
        window: &ObservationWindow,
    ) -> FeatureVector {
        let key = CacheKey {
            customer_id: history.customer_id.clone(),
            axis: axis.name.clone(),
            metrics: axis.metrics.clone(),
            window: *window,
        };

        if let Ok(entries) = self.entries.read() {
            if let Some(vector) = entries.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return vector.clone();
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let vector = self.extractor.extract(history, axis, window);
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, vector.clone());
        }
        vector
    }

    pub fn invalidate_axis(&self, axis: &AxisName) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|key, _| &key.axis != axis);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read().map(|entries| entries.len()).unwrap_or(0);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::FeatureCache;
    use crate::config::{AxisConfig, SamplingStrategy};
    use crate::domain::customer::{
        CustomerEvent, CustomerHistory, CustomerId, EventKind, ObservationWindow,
    };
    use crate::domain::feature::AxisName;
    use crate::features::Metric;

    fn fixture() -> (CustomerHistory, AxisConfig, ObservationWindow) {
        let end = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().expect("valid date");
        let history = CustomerHistory::new(
            CustomerId::new("c-9"),
            vec![CustomerEvent {
                customer_id: CustomerId::new("c-9"),
                kind: EventKind::Order,
                occurred_at: end - chrono::Duration::days(3),
                amount: Decimal::new(4200, 2),
                units: 1,
                category: Some("books".to_string()),
                discount_pct: 0.0,
            }],
        );
        let axis = AxisConfig {
            name: AxisName::new("spend"),
            metrics: vec![Metric::TotalSpend],
            sampling: SamplingStrategy::Weighted,
            min_k: None,
            max_k: None,
            fuzziness: None,
        };
        (history, axis, ObservationWindow::trailing_days(end, 90))
    }

    #[test]
    fn second_lookup_is_a_hit() {
        let cache = FeatureCache::new();
        let (history, axis, window) = fixture();

        let first = cache.get_or_extract(&history, &axis, &window);
        let second = cache.get_or_extract(&history, &axis, &window);

        assert_eq!(first, second);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn changed_metric_list_misses() {
        let cache = FeatureCache::new();
        let (history, mut axis, window) = fixture();

        cache.get_or_extract(&history, &axis, &window);
        axis.metrics.push(Metric::OrderCount);
        let vector = cache.get_or_extract(&history, &axis, &window);

        assert_eq!(vector.dimension(), 2);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn invalidate_axis_drops_entries() {
        let cache = FeatureCache::new();
        let (history, axis, window) = fixture();

        cache.get_or_extract(&history, &axis, &window);
        cache.invalidate_axis(&axis.name);

        assert_eq!(cache.stats().entries, 0);
    }
}

//! Per-axis feature extraction.
//!
//! Turns a customer's event history into one ordered feature vector per axis. Extraction
//! is a pure function of the history, the axis definition and the observation window, which
//! is what makes discovery reproducible and lets [`FeatureCache`] memoize results safely.

mod cache;

use std::collections::{HashMap, HashSet};

use chrono::Datelike;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::AxisConfig;
use crate::domain::customer::{CustomerEvent, CustomerHistory, EventKind, ObservationWindow};
use crate::domain::feature::FeatureVector;

pub use cache::{CacheStats, FeatureCache};

const DAYS_PER_MONTH: f64 = 30.4375;

/// Behavioral metrics an axis can be defined over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    OrderCount,
    OrdersPerMonth,
    ActiveMonths,
    MeanDaysBetweenOrders,
    DaysSinceLastOrder,
    TenureDays,
    TotalSpend,
    AvgOrderValue,
    MaxOrderValue,
    SpendPerMonth,
    AvgUnitsPerOrder,
    DistinctCategories,
    CategoryEntropy,
    TopCategoryShare,
    NewCategoryRate,
    DiscountedOrderShare,
    AvgDiscountPct,
    FullPriceSpendShare,
    ReturnRate,
    ViewsPerOrder,
}

impl Metric {
    pub const ALL: [Metric; 20] = [
        Metric::OrderCount,
        Metric::OrdersPerMonth,
        Metric::ActiveMonths,
        Metric::MeanDaysBetweenOrders,
        Metric::DaysSinceLastOrder,
        Metric::TenureDays,
        Metric::TotalSpend,
        Metric::AvgOrderValue,
        Metric::MaxOrderValue,
        Metric::SpendPerMonth,
        Metric::AvgUnitsPerOrder,
        Metric::DistinctCategories,
        Metric::CategoryEntropy,
        Metric::TopCategoryShare,
        Metric::NewCategoryRate,
        Metric::DiscountedOrderShare,
        Metric::AvgDiscountPct,
        Metric::FullPriceSpendShare,
        Metric::ReturnRate,
        Metric::ViewsPerOrder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OrderCount => "order_count",
            Self::OrdersPerMonth => "orders_per_month",
            Self::ActiveMonths => "active_months",
            Self::MeanDaysBetweenOrders => "mean_days_between_orders",
            Self::DaysSinceLastOrder => "days_since_last_order",
            Self::TenureDays => "tenure_days",
            Self::TotalSpend => "total_spend",
            Self::AvgOrderValue => "avg_order_value",
            Self::MaxOrderValue => "max_order_value",
            Self::SpendPerMonth => "spend_per_month",
            Self::AvgUnitsPerOrder => "avg_units_per_order",
            Self::DistinctCategories => "distinct_categories",
            Self::CategoryEntropy => "category_entropy",
            Self::TopCategoryShare => "top_category_share",
            Self::NewCategoryRate => "new_category_rate",
            Self::DiscountedOrderShare => "discounted_order_share",
            Self::AvgDiscountPct => "avg_discount_pct",
            Self::FullPriceSpendShare => "full_price_spend_share",
            Self::ReturnRate => "return_rate",
            Self::ViewsPerOrder => "views_per_order",
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|metric| metric.as_str() == normalized)
            .ok_or_else(|| format!("unknown metric `{normalized}`"))
    }
}

/// Order count and spend used by samplers for weighting and stratification.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActivityProfile {
    pub order_count: usize,
    pub total_spend: f64,
}

#[derive(Clone, Debug, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Builds the feature vector for one axis, in the axis's declared metric order.
    pub fn extract(
        &self,
        history: &CustomerHistory,
        axis: &AxisConfig,
        window: &ObservationWindow,
    ) -> FeatureVector {
        let summary = WindowSummary::collect(history, window);
        let features = axis
            .metrics
            .iter()
            .map(|metric| {
                let value = summary.metric(*metric);
                (metric.as_str().to_string(), if value.is_finite() { value } else { 0.0 })
            })
            .collect();

        FeatureVector { customer_id: history.customer_id.clone(), axis: axis.name.clone(), features }
    }

    pub fn extract_metric(
        &self,
        history: &CustomerHistory,
        metric: Metric,
        window: &ObservationWindow,
    ) -> f64 {
        WindowSummary::collect(history, window).metric(metric)
    }

    pub fn activity(&self, history: &CustomerHistory, window: &ObservationWindow) -> ActivityProfile {
        let summary = WindowSummary::collect(history, window);
        ActivityProfile { order_count: summary.orders.len(), total_spend: summary.total_spend() }
    }
}

/// Feature names of an axis in column order.
pub fn feature_names(axis: &AxisConfig) -> Vec<String> {
    axis.metrics.iter().map(|metric| metric.as_str().to_string()).collect()
}

pub(crate) fn rows(vectors: &[FeatureVector]) -> Vec<Vec<f64>> {
    vectors.iter().map(FeatureVector::values).collect()
}

struct WindowSummary<'a> {
    window: ObservationWindow,
    orders: Vec<&'a CustomerEvent>,
    returns: usize,
    views: usize,
    first_event: Option<chrono::DateTime<chrono::Utc>>,
}

impl<'a> WindowSummary<'a> {
    fn collect(history: &'a CustomerHistory, window: &ObservationWindow) -> Self {
        let mut orders = Vec::new();
        let mut returns = 0;
        let mut views = 0;
        let mut first_event = None;

        for event in history.within(*window) {
            if first_event.is_none() {
                first_event = Some(event.occurred_at);
            }
            match event.kind {
                EventKind::Order => orders.push(event),
                EventKind::Return => returns += 1,
                EventKind::View => views += 1,
            }
        }

        Self { window: *window, orders, returns, views, first_event }
    }

    fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::OrderCount => self.orders.len() as f64,
            Metric::OrdersPerMonth => per_month(self.orders.len() as f64, self.window.span_days()),
            Metric::ActiveMonths => self.active_months() as f64,
            Metric::MeanDaysBetweenOrders => self.mean_gap_days(),
            Metric::DaysSinceLastOrder => match self.orders.last() {
                Some(order) => days_between(order.occurred_at, self.window.end),
                None => self.window.span_days(),
            },
            Metric::TenureDays => {
                self.first_event.map(|first| days_between(first, self.window.end)).unwrap_or(0.0)
            }
            Metric::TotalSpend => self.total_spend(),
            Metric::AvgOrderValue => ratio(self.total_spend(), self.orders.len() as f64),
            Metric::MaxOrderValue => {
                self.orders.iter().map(|order| to_f64(order.amount)).fold(0.0, f64::max)
            }
            Metric::SpendPerMonth => per_month(self.total_spend(), self.window.span_days()),
            Metric::AvgUnitsPerOrder => {
                let units: u64 = self.orders.iter().map(|order| u64::from(order.units)).sum();
                ratio(units as f64, self.orders.len() as f64)
            }
            Metric::DistinctCategories => self.category_counts().len() as f64,
            Metric::CategoryEntropy => entropy(&self.category_counts()),
            Metric::TopCategoryShare => {
                let counts = self.category_counts();
                let total: usize = counts.values().sum();
                let top = counts.values().copied().max().unwrap_or(0);
                ratio(top as f64, total as f64)
            }
            Metric::NewCategoryRate => self.new_category_rate(),
            Metric::DiscountedOrderShare => {
                let discounted =
                    self.orders.iter().filter(|order| order.discount_pct > 0.0).count();
                ratio(discounted as f64, self.orders.len() as f64)
            }
            Metric::AvgDiscountPct => {
                let sum: f64 = self.orders.iter().map(|order| order.discount_pct).sum();
                ratio(sum, self.orders.len() as f64)
            }
            Metric::FullPriceSpendShare => {
                let full_price: Decimal = self
                    .orders
                    .iter()
                    .filter(|order| order.discount_pct <= 0.0)
                    .map(|order| order.amount)
                    .sum();
                ratio(to_f64(full_price), self.total_spend())
            }
            Metric::ReturnRate => ratio(self.returns as f64, self.orders.len() as f64),
            Metric::ViewsPerOrder => ratio(self.views as f64, self.orders.len() as f64),
        }
    }

    fn total_spend(&self) -> f64 {
        to_f64(self.orders.iter().map(|order| order.amount).sum())
    }

    fn active_months(&self) -> usize {
        self.orders
            .iter()
            .map(|order| (order.occurred_at.year(), order.occurred_at.month()))
            .collect::<HashSet<_>>()
            .len()
    }

    fn mean_gap_days(&self) -> f64 {
        if self.orders.len() < 2 {
            return 0.0;
        }
        let total: f64 = self
            .orders
            .windows(2)
            .map(|pair| days_between(pair[0].occurred_at, pair[1].occurred_at))
            .sum();
        total / (self.orders.len() - 1) as f64
    }

    fn category_counts(&self) -> HashMap<&str, usize> {
        let mut counts = HashMap::new();
        for category in self.orders.iter().filter_map(|order| order.category.as_deref()) {
            *counts.entry(category).or_insert(0) += 1;
        }
        counts
    }

    /// Share of repeat orders that introduced a category not bought before.
    fn new_category_rate(&self) -> f64 {
        if self.orders.len() < 2 {
            return 0.0;
        }
        let mut seen = HashSet::new();
        let mut introduced = 0usize;
        for (index, order) in self.orders.iter().enumerate() {
            if let Some(category) = order.category.as_deref() {
                if seen.insert(category) && index > 0 {
                    introduced += 1;
                }
            }
        }
        introduced as f64 / (self.orders.len() - 1) as f64
    }
}

fn to_f64(value: Decimal) -> f64 {
    f64::try_from(value).unwrap_or(0.0)
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

fn per_month(value: f64, span_days: f64) -> f64 {
    ratio(value, span_days / DAYS_PER_MONTH)
}

fn days_between(from: chrono::DateTime<chrono::Utc>, to: chrono::DateTime<chrono::Utc>) -> f64 {
    ((to - from).num_seconds() as f64 / 86_400.0).max(0.0)
}

fn entropy(counts: &HashMap<&str, usize>) -> f64 {
    let total: usize = counts.values().sum();
    if total == 0 {
        return 0.0;
    }
    counts
        .values()
        .map(|count| {
            let p = *count as f64 / total as f64;
            -p * p.ln()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{FeatureExtractor, Metric};
    use crate::config::{AxisConfig, SamplingStrategy};
    use crate::domain::customer::{
        CustomerEvent, CustomerHistory, CustomerId, EventKind, ObservationWindow,
    };
    use crate::domain::feature::AxisName;

    fn window_end() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).single().expect("valid date")
    }

    fn window() -> ObservationWindow {
        ObservationWindow::trailing_days(window_end(), 365)
    }

    fn order(days_before_end: i64, cents: i64, category: &str, discount_pct: f64) -> CustomerEvent {
        CustomerEvent {
            customer_id: CustomerId::new("c-1"),
            kind: EventKind::Order,
            occurred_at: window_end() - Duration::days(days_before_end),
            amount: Decimal::new(cents, 2),
            units: 2,
            category: Some(category.to_string()),
            discount_pct,
        }
    }

    fn other(kind: EventKind, days_before_end: i64) -> CustomerEvent {
        CustomerEvent {
            customer_id: CustomerId::new("c-1"),
            kind,
            occurred_at: window_end() - Duration::days(days_before_end),
            amount: Decimal::ZERO,
            units: 0,
            category: None,
            discount_pct: 0.0,
        }
    }

    fn history() -> CustomerHistory {
        CustomerHistory::new(
            CustomerId::new("c-1"),
            vec![
                order(100, 10_000, "shoes", 0.0),
                order(70, 5_000, "shoes", 20.0),
                order(40, 15_000, "bags", 0.0),
                order(10, 10_000, "hats", 10.0),
                other(EventKind::Return, 5),
                other(EventKind::View, 3),
                other(EventKind::View, 2),
                order(400, 99_999, "outside-window", 0.0),
            ],
        )
    }

    fn axis(metrics: Vec<Metric>) -> AxisConfig {
        AxisConfig {
            name: AxisName::new("test"),
            metrics,
            sampling: SamplingStrategy::Uniform,
            min_k: None,
            max_k: None,
            fuzziness: None,
        }
    }

    fn value(metric: Metric) -> f64 {
        FeatureExtractor::new().extract_metric(&history(), metric, &window())
    }

    #[test]
    fn frequency_metrics_ignore_events_outside_window() {
        assert_eq!(value(Metric::OrderCount), 4.0);
        assert!((value(Metric::MeanDaysBetweenOrders) - 30.0).abs() < 1e-9);
        assert!((value(Metric::DaysSinceLastOrder) - 10.0).abs() < 1e-9);
        assert!((value(Metric::TenureDays) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn spend_metrics_use_order_amounts() {
        assert!((value(Metric::TotalSpend) - 400.0).abs() < 1e-9);
        assert!((value(Metric::AvgOrderValue) - 100.0).abs() < 1e-9);
        assert!((value(Metric::MaxOrderValue) - 150.0).abs() < 1e-9);
        assert!((value(Metric::AvgUnitsPerOrder) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn exploration_metrics_count_categories() {
        assert_eq!(value(Metric::DistinctCategories), 3.0);
        assert!((value(Metric::TopCategoryShare) - 0.5).abs() < 1e-9);
        assert!((value(Metric::NewCategoryRate) - 2.0 / 3.0).abs() < 1e-9);
        let expected_entropy = -(0.5f64 * 0.5f64.ln() + 2.0 * 0.25 * 0.25f64.ln());
        assert!((value(Metric::CategoryEntropy) - expected_entropy).abs() < 1e-9);
    }

    #[test]
    fn price_sensitivity_metrics_use_discounts() {
        assert!((value(Metric::DiscountedOrderShare) - 0.5).abs() < 1e-9);
        assert!((value(Metric::AvgDiscountPct) - 7.5).abs() < 1e-9);
        assert!((value(Metric::FullPriceSpendShare) - 250.0 / 400.0).abs() < 1e-9);
        assert!((value(Metric::ReturnRate) - 0.25).abs() < 1e-9);
        assert!((value(Metric::ViewsPerOrder) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_history_yields_neutral_values() {
        let empty = CustomerHistory::new(CustomerId::new("c-2"), Vec::new());
        let vector = FeatureExtractor::new().extract(
            &empty,
            &axis(vec![Metric::AvgOrderValue, Metric::CategoryEntropy, Metric::ReturnRate]),
            &window(),
        );
        assert_eq!(vector.values(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn vector_follows_declared_metric_order() {
        let vector = FeatureExtractor::new().extract(
            &history(),
            &axis(vec![Metric::TotalSpend, Metric::OrderCount]),
            &window(),
        );
        assert_eq!(vector.names(), vec!["total_spend", "order_count"]);
        assert_eq!(vector.axis.as_str(), "test");
    }

    #[test]
    fn extraction_is_repeatable() {
        let extractor = FeatureExtractor::new();
        let axis = axis(Metric::ALL.to_vec());
        let first = extractor.extract(&history(), &axis, &window());
        let second = extractor.extract(&history(), &axis, &window());
        assert_eq!(first, second);
    }

    #[test]
    fn metric_names_round_trip_through_from_str() {
        for metric in Metric::ALL {
            assert_eq!(metric.as_str().parse::<Metric>(), Ok(metric));
        }
        assert!("lifetime_value".parse::<Metric>().is_err());
    }
}

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CustomerId(pub String);

impl CustomerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Order,
    Return,
    View,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Return => "return",
            Self::View => "view",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "order" => Ok(Self::Order),
            "return" => Ok(Self::Return),
            "view" => Ok(Self::View),
            other => Err(format!("unknown event kind `{other}`")),
        }
    }
}

/// One timestamped record from a customer's history, as delivered by the ETL layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomerEvent {
    pub customer_id: CustomerId,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    /// Net amount paid for orders, refunded amount for returns, zero for views.
    pub amount: Decimal,
    pub units: u32,
    pub category: Option<String>,
    /// Discount applied to the order, in percent (0..=100).
    pub discount_pct: f64,
}

/// Half-open `[start, end)` interval of event timestamps considered by feature extraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ObservationWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn trailing_days(end: DateTime<Utc>, days: u32) -> Self {
        Self { start: end - Duration::days(i64::from(days)), end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    pub fn span_days(&self) -> f64 {
        ((self.end - self.start).num_seconds() as f64 / 86_400.0).max(0.0)
    }
}

/// Events for one customer, ordered by `occurred_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomerHistory {
    pub customer_id: CustomerId,
    events: Vec<CustomerEvent>,
}

impl CustomerHistory {
    pub fn new(customer_id: CustomerId, mut events: Vec<CustomerEvent>) -> Self {
        events.sort_by_key(|event| event.occurred_at);
        Self { customer_id, events }
    }

    pub fn events(&self) -> &[CustomerEvent] {
        &self.events
    }

    pub fn within(&self, window: ObservationWindow) -> impl Iterator<Item = &CustomerEvent> + '_ {
        self.events.iter().filter(move |event| window.contains(event.occurred_at))
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

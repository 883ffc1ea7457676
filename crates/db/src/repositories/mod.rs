use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use segmenta_core::domain::archetype::{Archetype, ArchetypeReport, Granularity};
use segmenta_core::domain::customer::{CustomerEvent, CustomerHistory, CustomerId, ObservationWindow};
use segmenta_core::domain::feature::AxisName;
use segmenta_core::domain::membership::FuzzyMembership;
use segmenta_core::domain::model::AxisModel;
use segmenta_core::engine::DiscoveryReport;

pub mod archetype;
pub mod axis_model;
pub mod discovery_run;
pub mod event;
pub mod membership;
pub mod memory;

pub use archetype::SqlArchetypeRepository;
pub use axis_model::SqlAxisModelRepository;
pub use discovery_run::SqlDiscoveryRunRepository;
pub use event::SqlEventRepository;
pub use membership::SqlMembershipRepository;
pub use memory::{
    InMemoryArchetypeRepository, InMemoryAxisModelRepository, InMemoryDiscoveryRunRepository,
    InMemoryEventRepository, InMemoryMembershipRepository,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("integrity error: {0}")]
    Integrity(String),
}

/// Number of customers whose dominant segment on an axis is `segment`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentCount {
    pub segment: usize,
    pub customers: usize,
    pub share: f64,
}

/// Source of behavioral history, written by the upstream ETL.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn append(&self, events: &[CustomerEvent]) -> Result<(), RepositoryError>;

    /// One history per customer with any event before `window.end`, ordered by id.
    ///
    /// Only events inside `window` are loaded; lapsed customers get an empty history so
    /// assignment still places them.
    async fn load_histories(
        &self,
        window: &ObservationWindow,
    ) -> Result<Vec<CustomerHistory>, RepositoryError>;
}

/// Versioned axis models; at most one is active per axis.
#[async_trait]
pub trait AxisModelRepository: Send + Sync {
    /// Deactivates the current model of the axis and activates `model` in one step.
    async fn publish(&self, model: &AxisModel) -> Result<(), RepositoryError> {
        self.publish_all(std::slice::from_ref(model)).await
    }

    /// Activates every model of one discovery run together; a failure stores none of them.
    async fn publish_all(&self, models: &[AxisModel]) -> Result<(), RepositoryError>;

    async fn find_active(&self, axis: &AxisName) -> Result<Option<AxisModel>, RepositoryError>;

    async fn list_active(&self) -> Result<Vec<AxisModel>, RepositoryError>;

    /// Every model ever published for the axis, newest first.
    async fn history(&self, axis: &AxisName) -> Result<Vec<AxisModel>, RepositoryError>;
}

#[async_trait]
pub trait MembershipRepository: Send + Sync {
    /// Inserts or replaces memberships keyed by (customer, axis).
    async fn upsert_many(&self, memberships: &[FuzzyMembership]) -> Result<(), RepositoryError>;

    async fn find(
        &self,
        customer_id: &CustomerId,
        axis: &AxisName,
    ) -> Result<Option<FuzzyMembership>, RepositoryError>;

    async fn list_for_customer(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<FuzzyMembership>, RepositoryError>;

    async fn list_for_axis(&self, axis: &AxisName) -> Result<Vec<FuzzyMembership>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<FuzzyMembership>, RepositoryError>;

    async fn segment_distribution(
        &self,
        axis: &AxisName,
    ) -> Result<Vec<SegmentCount>, RepositoryError>;
}

#[async_trait]
pub trait ArchetypeRepository: Send + Sync {
    /// Replaces the stored snapshot for the report's granularity.
    async fn replace_snapshot(&self, report: &ArchetypeReport) -> Result<(), RepositoryError>;

    async fn find_by_key(
        &self,
        granularity: Granularity,
        key: &str,
    ) -> Result<Option<Archetype>, RepositoryError>;

    /// Largest archetypes first.
    async fn top(
        &self,
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<Archetype>, RepositoryError>;
}

#[async_trait]
pub trait DiscoveryRunRepository: Send + Sync {
    async fn record(&self, report: &DiscoveryReport) -> Result<(), RepositoryError>;

    async fn latest(&self) -> Result<Option<DiscoveryReport>, RepositoryError>;
}

/// Fixed-width UTC timestamps so lexical order in SQLite matches time order.
pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn to_json<T: Serialize>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("cannot encode `{column}`: {error}")))
}

pub(crate) fn from_json<T: for<'de> Deserialize<'de>>(
    column: &str,
    value: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

pub(crate) fn parse_usize(column: &str, value: i64) -> Result<usize, RepositoryError> {
    usize::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative integer): {value}"
        ))
    })
}

pub(crate) fn to_i64(column: &str, value: usize) -> Result<i64, RepositoryError> {
    i64::try_from(value)
        .map_err(|_| RepositoryError::Integrity(format!("`{column}` does not fit in i64: {value}")))
}

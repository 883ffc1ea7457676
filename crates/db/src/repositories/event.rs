use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use segmenta_core::domain::customer::{
    CustomerEvent, CustomerHistory, CustomerId, EventKind, ObservationWindow,
};

use super::{format_timestamp, parse_timestamp, EventRepository, RepositoryError};
use crate::DbPool;

pub struct SqlEventRepository {
    pool: DbPool,
}

impl SqlEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EventRepository for SqlEventRepository {
    async fn append(&self, events: &[CustomerEvent]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        for event in events {
            sqlx::query(
                "INSERT INTO customer_event (
                    customer_id,
                    kind,
                    occurred_at,
                    amount,
                    units,
                    category,
                    discount_pct
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(event.customer_id.as_str())
            .bind(event.kind.as_str())
            .bind(format_timestamp(&event.occurred_at))
            .bind(event.amount.to_string())
            .bind(i64::from(event.units))
            .bind(event.category.as_deref())
            .bind(event.discount_pct)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_histories(
        &self,
        window: &ObservationWindow,
    ) -> Result<Vec<CustomerHistory>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                customer_id,
                kind,
                occurred_at,
                amount,
                units,
                category,
                discount_pct
             FROM customer_event
             WHERE occurred_at >= ? AND occurred_at < ?
             ORDER BY customer_id ASC, occurred_at ASC, id ASC",
        )
        .bind(format_timestamp(&window.start))
        .bind(format_timestamp(&window.end))
        .fetch_all(&self.pool)
        .await?;

        // customers whose last event predates the window still belong to the population
        let roster: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT customer_id
             FROM customer_event
             WHERE occurred_at < ?",
        )
        .bind(format_timestamp(&window.end))
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: BTreeMap<CustomerId, Vec<CustomerEvent>> =
            roster.into_iter().map(|customer_id| (CustomerId(customer_id), Vec::new())).collect();
        for row in rows {
            let event = event_from_row(row)?;
            grouped.entry(event.customer_id.clone()).or_default().push(event);
        }

        Ok(grouped
            .into_iter()
            .map(|(customer_id, events)| CustomerHistory::new(customer_id, events))
            .collect())
    }
}

fn event_from_row(row: SqliteRow) -> Result<CustomerEvent, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("kind")?;
    let kind = EventKind::from_str(&kind_raw).map_err(RepositoryError::Decode)?;
    let amount_raw = row.try_get::<String, _>("amount")?;
    let amount = Decimal::from_str(&amount_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `amount`: `{amount_raw}` ({error})"))
    })?;
    let units = row.try_get::<i64, _>("units")?;

    Ok(CustomerEvent {
        customer_id: CustomerId(row.try_get("customer_id")?),
        kind,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
        amount,
        units: u32::try_from(units).map_err(|_| {
            RepositoryError::Decode(format!("invalid value for `units`: {units}"))
        })?,
        category: row.try_get("category")?,
        discount_pct: row.try_get("discount_pct")?,
    })
}

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use segmenta_core::domain::customer::CustomerId;
use segmenta_core::domain::feature::AxisName;
use segmenta_core::domain::membership::FuzzyMembership;

use super::{
    format_timestamp, from_json, parse_usize, to_i64, to_json, MembershipRepository,
    RepositoryError, SegmentCount,
};
use crate::DbPool;

const MEMBERSHIP_COLUMNS: &str = "customer_id, axis_name, model_run_id, weights_json";

pub struct SqlMembershipRepository {
    pool: DbPool,
}

impl SqlMembershipRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(
        &self,
        clause: &str,
        binding: &str,
    ) -> Result<Vec<FuzzyMembership>, RepositoryError> {
        let sql = format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM fuzzy_membership WHERE {clause} \
             ORDER BY customer_id ASC, axis_name ASC"
        );
        let rows = sqlx::query(&sql).bind(binding).fetch_all(&self.pool).await?;
        rows.into_iter().map(membership_from_row).collect()
    }
}

#[async_trait::async_trait]
impl MembershipRepository for SqlMembershipRepository {
    async fn upsert_many(&self, memberships: &[FuzzyMembership]) -> Result<(), RepositoryError> {
        let assigned_at = format_timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;

        for membership in memberships {
            let (segment, weight) = membership.dominant();
            sqlx::query(
                "INSERT INTO fuzzy_membership (
                    customer_id,
                    axis_name,
                    model_run_id,
                    weights_json,
                    dominant_segment,
                    dominant_weight,
                    assigned_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(customer_id, axis_name) DO UPDATE SET
                    model_run_id = excluded.model_run_id,
                    weights_json = excluded.weights_json,
                    dominant_segment = excluded.dominant_segment,
                    dominant_weight = excluded.dominant_weight,
                    assigned_at = excluded.assigned_at",
            )
            .bind(membership.customer_id.as_str())
            .bind(membership.axis.as_str())
            .bind(membership.model_run_id.to_string())
            .bind(to_json("weights_json", &membership.weights)?)
            .bind(to_i64("dominant_segment", segment)?)
            .bind(weight)
            .bind(&assigned_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find(
        &self,
        customer_id: &CustomerId,
        axis: &AxisName,
    ) -> Result<Option<FuzzyMembership>, RepositoryError> {
        let sql = format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM fuzzy_membership \
             WHERE customer_id = ? AND axis_name = ?"
        );
        let row = sqlx::query(&sql)
            .bind(customer_id.as_str())
            .bind(axis.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(membership_from_row).transpose()
    }

    async fn list_for_customer(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<FuzzyMembership>, RepositoryError> {
        self.fetch_where("customer_id = ?", customer_id.as_str()).await
    }

    async fn list_for_axis(&self, axis: &AxisName) -> Result<Vec<FuzzyMembership>, RepositoryError> {
        self.fetch_where("axis_name = ?", axis.as_str()).await
    }

    async fn list_all(&self) -> Result<Vec<FuzzyMembership>, RepositoryError> {
        let sql = format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM fuzzy_membership \
             ORDER BY customer_id ASC, axis_name ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(membership_from_row).collect()
    }

    async fn segment_distribution(
        &self,
        axis: &AxisName,
    ) -> Result<Vec<SegmentCount>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT dominant_segment, COUNT(*) AS customers
             FROM fuzzy_membership
             WHERE axis_name = ?
             GROUP BY dominant_segment
             ORDER BY dominant_segment ASC",
        )
        .bind(axis.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            counts.push((
                parse_usize("dominant_segment", row.try_get("dominant_segment")?)?,
                parse_usize("customers", row.try_get("customers")?)?,
            ));
        }
        Ok(distribution(counts))
    }
}

/// Converts `(segment, customers)` pairs into counts with population shares.
pub(crate) fn distribution(counts: Vec<(usize, usize)>) -> Vec<SegmentCount> {
    let total: usize = counts.iter().map(|(_, customers)| customers).sum();
    counts
        .into_iter()
        .map(|(segment, customers)| SegmentCount {
            segment,
            customers,
            share: if total == 0 { 0.0 } else { customers as f64 / total as f64 },
        })
        .collect()
}

fn membership_from_row(row: SqliteRow) -> Result<FuzzyMembership, RepositoryError> {
    let run_raw = row.try_get::<String, _>("model_run_id")?;
    let model_run_id = Uuid::parse_str(&run_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid uuid in `model_run_id`: `{run_raw}` ({error})"))
    })?;

    Ok(FuzzyMembership {
        customer_id: CustomerId(row.try_get("customer_id")?),
        axis: AxisName(row.try_get("axis_name")?),
        model_run_id,
        weights: from_json("weights_json", &row.try_get::<String, _>("weights_json")?)?,
    })
}

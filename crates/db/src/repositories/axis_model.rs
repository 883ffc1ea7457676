use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::info;

use segmenta_core::domain::feature::AxisName;
use segmenta_core::domain::model::AxisModel;

use super::{format_timestamp, from_json, to_i64, to_json, AxisModelRepository, RepositoryError};
use crate::DbPool;

pub struct SqlAxisModelRepository {
    pool: DbPool,
}

impl SqlAxisModelRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AxisModelRepository for SqlAxisModelRepository {
    async fn publish_all(&self, models: &[AxisModel]) -> Result<(), RepositoryError> {
        let mut rows = Vec::with_capacity(models.len());
        for model in models {
            if !model.verify_fingerprint() {
                return Err(RepositoryError::Integrity(format!(
                    "model {} for axis `{}` does not match its fingerprint",
                    model.run_id, model.axis
                )));
            }
            rows.push((model, to_json("model_json", model)?, to_i64("k", model.k)?));
        }
        let published_at = format_timestamp(&Utc::now());

        let mut tx = self.pool.begin().await?;

        for (model, model_json, k) in rows {
            sqlx::query("UPDATE axis_model SET is_active = 0 WHERE axis_name = ? AND is_active = 1")
                .bind(model.axis.as_str())
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO axis_model (
                    run_id,
                    axis_name,
                    k,
                    fuzziness,
                    fingerprint,
                    silhouette,
                    balanced,
                    model_json,
                    is_active,
                    discovered_at,
                    published_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
            )
            .bind(model.run_id.to_string())
            .bind(model.axis.as_str())
            .bind(k)
            .bind(model.fuzziness)
            .bind(&model.fingerprint)
            .bind(model.silhouette)
            .bind(model.balanced)
            .bind(model_json)
            .bind(format_timestamp(&model.discovered_at))
            .bind(&published_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        for model in models {
            info!(
                event_name = "segmentation.persistence.model_published",
                axis = %model.axis,
                run_id = %model.run_id,
                fingerprint = %model.fingerprint,
                "persisted active axis model"
            );
        }
        Ok(())
    }

    async fn find_active(&self, axis: &AxisName) -> Result<Option<AxisModel>, RepositoryError> {
        let row = sqlx::query(
            "SELECT model_json, fingerprint
             FROM axis_model
             WHERE axis_name = ? AND is_active = 1",
        )
        .bind(axis.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(model_from_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<AxisModel>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT model_json, fingerprint
             FROM axis_model
             WHERE is_active = 1
             ORDER BY axis_name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(model_from_row).collect()
    }

    async fn history(&self, axis: &AxisName) -> Result<Vec<AxisModel>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT model_json, fingerprint
             FROM axis_model
             WHERE axis_name = ?
             ORDER BY published_at DESC, rowid DESC",
        )
        .bind(axis.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(model_from_row).collect()
    }
}

fn model_from_row(row: SqliteRow) -> Result<AxisModel, RepositoryError> {
    let model: AxisModel = from_json("model_json", &row.try_get::<String, _>("model_json")?)?;
    let fingerprint = row.try_get::<String, _>("fingerprint")?;

    if model.fingerprint != fingerprint || !model.verify_fingerprint() {
        return Err(RepositoryError::Integrity(format!(
            "stored model {} for axis `{}` failed fingerprint verification",
            model.run_id, model.axis
        )));
    }
    Ok(model)
}

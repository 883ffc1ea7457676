use sqlx::Row;

use segmenta_core::engine::DiscoveryReport;

use super::{format_timestamp, from_json, to_i64, to_json, DiscoveryRunRepository, RepositoryError};
use crate::DbPool;

/// Audit trail of discovery runs; the full report is stored alongside summary counts.
pub struct SqlDiscoveryRunRepository {
    pool: DbPool,
}

impl SqlDiscoveryRunRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DiscoveryRunRepository for SqlDiscoveryRunRepository {
    async fn record(&self, report: &DiscoveryReport) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO discovery_run (
                run_id,
                started_at,
                finished_at,
                succeeded_count,
                skipped_count,
                flagged_count,
                report_json
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(report.run_id.to_string())
        .bind(format_timestamp(&report.started_at))
        .bind(format_timestamp(&report.finished_at))
        .bind(to_i64("succeeded_count", report.succeeded.len())?)
        .bind(to_i64("skipped_count", report.skipped.len())?)
        .bind(to_i64("flagged_count", report.flagged.len())?)
        .bind(to_json("report_json", report)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest(&self) -> Result<Option<DiscoveryReport>, RepositoryError> {
        let row = sqlx::query(
            "SELECT report_json
             FROM discovery_run
             ORDER BY started_at DESC, rowid DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let raw = row.try_get::<String, _>("report_json")?;
            from_json("report_json", &raw)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::SqlDiscoveryRunRepository;
    use crate::repositories::memory::test_support::sample_run;
    use crate::repositories::DiscoveryRunRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    #[tokio::test]
    async fn latest_returns_most_recent_run() {
        let pool = setup_pool().await;
        let repo = SqlDiscoveryRunRepository::new(pool.clone());
        assert!(repo.latest().await.expect("empty latest").is_none());

        let now = Utc::now();
        let older = sample_run(now - Duration::hours(2));
        let newer = sample_run(now);
        repo.record(&newer).await.expect("record newer");
        repo.record(&older).await.expect("record older");

        let latest = repo.latest().await.expect("latest").expect("a run is recorded");
        assert_eq!(latest.run_id, newer.run_id);
        assert_eq!(latest.skipped, newer.skipped);

        pool.close().await;
    }
}

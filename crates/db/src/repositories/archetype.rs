use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::info;

use segmenta_core::domain::archetype::{Archetype, ArchetypeReport, Granularity};

use super::{
    format_timestamp, from_json, parse_usize, to_i64, to_json, ArchetypeRepository,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlArchetypeRepository {
    pool: DbPool,
}

impl SqlArchetypeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ArchetypeRepository for SqlArchetypeRepository {
    async fn replace_snapshot(&self, report: &ArchetypeReport) -> Result<(), RepositoryError> {
        let granularity = report.granularity.as_str();
        let composed_at = format_timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM archetype WHERE granularity = ?")
            .bind(granularity)
            .execute(&mut *tx)
            .await?;

        for archetype in &report.archetypes {
            sqlx::query(
                "INSERT INTO archetype (
                    granularity,
                    signature_key,
                    signature_json,
                    member_count,
                    population_share,
                    member_ids_json,
                    composed_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(granularity)
            .bind(&archetype.key)
            .bind(to_json("signature_json", &archetype.signature)?)
            .bind(to_i64("member_count", archetype.member_count)?)
            .bind(archetype.population_share)
            .bind(to_json("member_ids_json", &archetype.member_ids)?)
            .bind(&composed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            event_name = "segmentation.persistence.archetypes_replaced",
            granularity,
            archetypes = report.archetypes.len(),
            "replaced archetype snapshot"
        );
        Ok(())
    }

    async fn find_by_key(
        &self,
        granularity: Granularity,
        key: &str,
    ) -> Result<Option<Archetype>, RepositoryError> {
        let row = sqlx::query(
            "SELECT signature_key, signature_json, member_count, population_share, member_ids_json
             FROM archetype
             WHERE granularity = ? AND signature_key = ?",
        )
        .bind(granularity.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(archetype_from_row).transpose()
    }

    async fn top(
        &self,
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<Archetype>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT signature_key, signature_json, member_count, population_share, member_ids_json
             FROM archetype
             WHERE granularity = ?
             ORDER BY member_count DESC, signature_key ASC
             LIMIT ?",
        )
        .bind(granularity.as_str())
        .bind(to_i64("limit", limit)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(archetype_from_row).collect()
    }
}

fn archetype_from_row(row: SqliteRow) -> Result<Archetype, RepositoryError> {
    Ok(Archetype {
        signature: from_json("signature_json", &row.try_get::<String, _>("signature_json")?)?,
        key: row.try_get("signature_key")?,
        member_count: parse_usize("member_count", row.try_get("member_count")?)?,
        population_share: row.try_get("population_share")?,
        member_ids: from_json("member_ids_json", &row.try_get::<String, _>("member_ids_json")?)?,
    })
}

#[cfg(test)]
mod tests {
    use segmenta_core::domain::archetype::Granularity;

    use super::SqlArchetypeRepository;
    use crate::repositories::memory::test_support::sample_report;
    use crate::repositories::ArchetypeRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    #[tokio::test]
    async fn snapshot_replacement_is_scoped_to_granularity() {
        let pool = setup_pool().await;
        let repo = SqlArchetypeRepository::new(pool.clone());

        let dominant = sample_report(Granularity::Dominant, &[("spend=0", 3), ("spend=1", 1)]);
        let binned = sample_report(Granularity::StrengthBinned, &[("spend=0:strong", 4)]);
        repo.replace_snapshot(&dominant).await.expect("store dominant");
        repo.replace_snapshot(&binned).await.expect("store binned");

        let replacement = sample_report(Granularity::Dominant, &[("spend=1", 4)]);
        repo.replace_snapshot(&replacement).await.expect("replace dominant");

        let top = repo.top(Granularity::Dominant, 10).await.expect("top dominant");
        assert_eq!(top, replacement.archetypes);
        assert!(repo.find_by_key(Granularity::Dominant, "spend=0").await.expect("find").is_none());

        let kept = repo
            .find_by_key(Granularity::StrengthBinned, "spend=0:strong")
            .await
            .expect("find binned");
        assert_eq!(kept.map(|archetype| archetype.member_count), Some(4));

        pool.close().await;
    }

    #[tokio::test]
    async fn top_orders_by_size_then_key() {
        let pool = setup_pool().await;
        let repo = SqlArchetypeRepository::new(pool.clone());
        let report = sample_report(
            Granularity::Dominant,
            &[("spend=2", 1), ("spend=1", 3), ("spend=0", 3), ("spend=3", 2)],
        );
        repo.replace_snapshot(&report).await.expect("store");

        let keys: Vec<String> = repo
            .top(Granularity::Dominant, 3)
            .await
            .expect("top")
            .into_iter()
            .map(|archetype| archetype.key)
            .collect();
        assert_eq!(keys, vec!["spend=0", "spend=1", "spend=3"]);

        pool.close().await;
    }
}

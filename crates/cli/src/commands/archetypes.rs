use serde::Serialize;

use segmenta_core::config::LoadOptions;
use segmenta_core::domain::archetype::{ArchetypeStatistics, Granularity};
use segmenta_core::engine::SegmentationEngine;
use segmenta_db::repositories::{SqlArchetypeRepository, SqlMembershipRepository};
use segmenta_db::{ArchetypeRepository, MembershipRepository};

use crate::commands::{load_config, open_database, persistence, runtime, CommandResult, Failure};

#[derive(Debug, Serialize)]
struct ArchetypeSummary {
    granularity: Granularity,
    statistics: ArchetypeStatistics,
    incomplete_customers: usize,
    top: Vec<ArchetypeLine>,
}

#[derive(Debug, Serialize)]
struct ArchetypeLine {
    key: String,
    member_count: usize,
    population_share: f64,
}

/// Composes archetypes from the stored memberships and replaces the granularity's snapshot.
pub fn run(options: LoadOptions, top: usize) -> CommandResult {
    match execute(options, top) {
        Ok(summary) if summary.statistics.archetype_count == 0 => {
            CommandResult::failure_with_details(
                "archetypes",
                "insufficient_data",
                "no customer has a membership on every axis; run `segmenta assign` first",
                7,
                &summary,
            )
        }
        Ok(summary) => CommandResult::success_with_details(
            "archetypes",
            format!(
                "stored {} {} archetype(s) covering {} customer(s)",
                summary.statistics.archetype_count,
                summary.granularity.as_str(),
                summary.statistics.customer_count
            ),
            &summary,
        ),
        Err(failure) => CommandResult::from_failure("archetypes", failure),
    }
}

fn execute(options: LoadOptions, top: usize) -> Result<ArchetypeSummary, Failure> {
    let config = load_config(options)?;
    let runtime = runtime()?;

    let (pool, memberships) = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let memberships =
            SqlMembershipRepository::new(pool.clone()).list_all().await.map_err(persistence)?;
        Ok::<_, Failure>((pool, memberships))
    })?;

    let engine = SegmentationEngine::new(config);
    let report = engine.compose_archetypes(&memberships, None);

    if report.statistics.archetype_count > 0 {
        runtime.block_on(async {
            SqlArchetypeRepository::new(pool.clone())
                .replace_snapshot(&report)
                .await
                .map_err(persistence)
        })?;
    }
    runtime.block_on(pool.close());

    Ok(ArchetypeSummary {
        granularity: report.granularity,
        incomplete_customers: report.incomplete_customers.len(),
        top: report
            .top(top)
            .iter()
            .map(|archetype| ArchetypeLine {
                key: archetype.key.clone(),
                member_count: archetype.member_count,
                population_share: archetype.population_share,
            })
            .collect(),
        statistics: report.statistics,
    })
}

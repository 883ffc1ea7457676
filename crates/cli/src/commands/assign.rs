use chrono::Utc;
use serde::Serialize;

use segmenta_core::config::LoadOptions;
use segmenta_core::engine::{AxisAssignment, AxisFailure, SegmentationEngine};
use segmenta_core::domain::customer::ObservationWindow;
use segmenta_db::repositories::{SqlEventRepository, SqlMembershipRepository};
use segmenta_db::{EventRepository, MembershipRepository};

use crate::commands::{
    load_config, load_registry, open_database, persistence, runtime, CommandResult, Failure,
};

#[derive(Debug, Serialize)]
struct AssignSummary {
    window: ObservationWindow,
    customers: usize,
    memberships: usize,
    completed: Vec<AxisAssignment>,
    failed: Vec<AxisFailure>,
}

/// Assigns the active population against the persisted models and upserts memberships.
pub fn run(options: LoadOptions) -> CommandResult {
    match execute(options) {
        Ok(summary) if summary.completed.is_empty() => CommandResult::failure_with_details(
            "assign",
            "missing_model",
            "no axis has an active model; run `segmenta discover` first",
            7,
            &summary,
        ),
        Ok(summary) => CommandResult::success_with_details(
            "assign",
            format!(
                "stored {} membership(s) for {} customer(s) across {} axis(es)",
                summary.memberships,
                summary.customers,
                summary.completed.len()
            ),
            &summary,
        ),
        Err(failure) => CommandResult::from_failure("assign", failure),
    }
}

fn execute(options: LoadOptions) -> Result<AssignSummary, Failure> {
    let config = load_config(options)?;
    let runtime = runtime()?;

    let (pool, registry) = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let registry = load_registry(&pool).await?;
        Ok::<_, Failure>((pool, registry))
    })?;

    let engine = SegmentationEngine::with_registry(config, registry);
    let window = engine.window(Utc::now());
    let histories = runtime
        .block_on(SqlEventRepository::new(pool.clone()).load_histories(&window))
        .map_err(persistence)?;
    let report = engine.assign(&histories, &window);

    runtime.block_on(async {
        SqlMembershipRepository::new(pool.clone())
            .upsert_many(&report.memberships)
            .await
            .map_err(persistence)?;
        pool.close().await;
        Ok::<_, Failure>(())
    })?;

    Ok(AssignSummary {
        window: report.window,
        customers: histories.len(),
        memberships: report.memberships.len(),
        completed: report.completed,
        failed: report.failed,
    })
}

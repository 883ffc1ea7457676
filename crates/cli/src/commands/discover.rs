use chrono::Utc;
use tracing::info;

use segmenta_core::config::LoadOptions;
use segmenta_core::domain::model::AxisModel;
use segmenta_core::engine::{DiscoveryReport, SegmentationEngine};
use segmenta_db::repositories::{
    SqlAxisModelRepository, SqlDiscoveryRunRepository, SqlEventRepository,
};
use segmenta_db::{AxisModelRepository, DiscoveryRunRepository, EventRepository};

use crate::commands::{
    load_config, load_registry, open_database, persistence, runtime, CommandResult, Failure,
};

/// Runs discovery over the persisted event history and stores every newly published model.
///
/// Axes that fail keep their previously persisted model active.
pub fn run(options: LoadOptions) -> CommandResult {
    match execute(options) {
        Ok(report) if report.succeeded.is_empty() => CommandResult::failure_with_details(
            "discover",
            "discovery_skipped",
            format!("no axis produced a model ({} skipped)", report.skipped.len()),
            7,
            &report,
        ),
        Ok(report) => CommandResult::success_with_details(
            "discover",
            format!(
                "published {} axis model(s), skipped {}, flagged {}",
                report.succeeded.len(),
                report.skipped.len(),
                report.flagged.len()
            ),
            &report,
        ),
        Err(failure) => CommandResult::from_failure("discover", failure),
    }
}

fn execute(options: LoadOptions) -> Result<DiscoveryReport, Failure> {
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
    let report = engine.discover(&histories, &window);

    let mut models = Vec::with_capacity(report.succeeded.len());
    for outcome in &report.succeeded {
        let model = engine
            .registry()
            .get(&outcome.axis)
            .map_err(|error| ("registry", error.to_string(), 6u8))?
            .ok_or_else(|| {
                ("registry", format!("axis `{}` has no published model", outcome.axis), 6u8)
            })?;
        models.push(AxisModel::clone(&model));
    }

    runtime.block_on(async {
        SqlAxisModelRepository::new(pool.clone()).publish_all(&models).await.map_err(persistence)?;
        SqlDiscoveryRunRepository::new(pool.clone()).record(&report).await.map_err(persistence)?;
        pool.close().await;
        Ok::<_, Failure>(())
    })?;

    info!(
        event_name = "segmentation.cli.discover_persisted",
        run_id = %report.run_id,
        succeeded = report.succeeded.len(),
        "persisted discovery results"
    );
    Ok(report)
}

pub mod archetypes;
pub mod assign;
pub mod config;
pub mod discover;
pub mod migrate;

use std::fmt::Display;
use std::sync::Arc;

use segmenta_core::config::{AppConfig, LoadOptions};
use segmenta_core::registry::ModelRegistry;
use segmenta_db::{connect_with_config, migrations, AxisModelRepository, DbPool};
use segmenta_db::repositories::SqlAxisModelRepository;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

/// `(error_class, message, exit_code)` carried out of a failed command step.
pub(crate) type Failure = (&'static str, String, u8);

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::outcome(command, None, message.into(), None, 0)
    }

    pub fn success_with_details(
        command: &str,
        message: impl Into<String>,
        details: impl Serialize,
    ) -> Self {
        Self::outcome(command, None, message.into(), serde_json::to_value(details).ok(), 0)
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self::outcome(command, Some(error_class), message.into(), None, exit_code)
    }

    pub fn failure_with_details(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
        details: impl Serialize,
    ) -> Self {
        Self::outcome(
            command,
            Some(error_class),
            message.into(),
            serde_json::to_value(details).ok(),
            exit_code,
        )
    }

    pub(crate) fn from_failure(command: &str, (error_class, message, exit_code): Failure) -> Self {
        Self::failure(command, error_class, message, exit_code)
    }

    fn outcome(
        command: &str,
        error_class: Option<&str>,
        message: String,
        details: Option<Value>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: if error_class.is_some() { "error" } else { "ok" }.to_string(),
            error_class: error_class.map(str::to_string),
            message,
            details,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

pub(crate) fn load_config(options: LoadOptions) -> Result<AppConfig, Failure> {
    AppConfig::load(options)
        .map_err(|error| ("config_validation", format!("configuration issue: {error}"), 2))
}

pub(crate) fn runtime() -> Result<Runtime, Failure> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        ("runtime_init", format!("failed to initialize async runtime: {error}"), 3)
    })
}

/// Connects and brings the schema up to date.
pub(crate) async fn open_database(config: &AppConfig) -> Result<DbPool, Failure> {
    let pool = connect_with_config(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
    migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5u8))?;
    Ok(pool)
}

/// Registry seeded with the persisted active model of every axis.
pub(crate) async fn load_registry(pool: &DbPool) -> Result<Arc<ModelRegistry>, Failure> {
    let registry = Arc::new(ModelRegistry::new());
    let models = SqlAxisModelRepository::new(pool.clone())
        .list_active()
        .await
        .map_err(persistence)?;
    for model in models {
        registry.publish(model).map_err(|error| ("registry", error.to_string(), 6u8))?;
    }
    Ok(registry)
}

pub(crate) fn persistence(error: impl Display) -> Failure {
    ("persistence", error.to_string(), 6)
}

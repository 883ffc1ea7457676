use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use segmenta_core::config::LoadOptions;
use toml::Value;

/// Renders the effective configuration with the source of every value.
pub fn run(options: LoadOptions) -> String {
    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config = match segmenta_core::config::AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: &str| {
        field_source(key_path, Some(env_key), config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let engine = &config.engine;
    let reference_time = engine
        .reference_time
        .map(|timestamp| timestamp.to_rfc3339())
        .unwrap_or_else(|| "<now>".to_string());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.push(render_line(
        "database.url",
        &config.database.url,
        source("database.url", "SEGMENTA_DATABASE_URL"),
    ));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        source("database.max_connections", "SEGMENTA_DATABASE_MAX_CONNECTIONS"),
    ));
    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", "SEGMENTA_LOGGING_LEVEL"),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", "SEGMENTA_LOGGING_FORMAT"),
    ));
    lines.push(render_line(
        "engine.seed",
        &engine.seed.to_string(),
        source("engine.seed", "SEGMENTA_ENGINE_SEED"),
    ));
    lines.push(render_line(
        "engine.observation_window_days",
        &engine.observation_window_days.to_string(),
        source("engine.observation_window_days", "SEGMENTA_ENGINE_WINDOW_DAYS"),
    ));
    lines.push(render_line(
        "engine.reference_time",
        &reference_time,
        source("engine.reference_time", "SEGMENTA_ENGINE_REFERENCE_TIME"),
    ));
    lines.push(render_line(
        "engine.fcm.fuzziness",
        &engine.fcm.fuzziness.to_string(),
        source("engine.fcm.fuzziness", "SEGMENTA_FCM_FUZZINESS"),
    ));
    lines.push(render_line(
        "engine.selection.min_k",
        &engine.selection.min_k.to_string(),
        source("engine.selection.min_k", "SEGMENTA_SELECTION_MIN_K"),
    ));
    lines.push(render_line(
        "engine.selection.max_k",
        &engine.selection.max_k.to_string(),
        source("engine.selection.max_k", "SEGMENTA_SELECTION_MAX_K"),
    ));
    lines.push(render_line(
        "engine.selection.ranking",
        &format!("{:?}", engine.selection.ranking),
        source("engine.selection.ranking", "SEGMENTA_SELECTION_RANKING"),
    ));
    lines.push(render_line(
        "engine.archetype.granularity",
        engine.archetype.granularity.as_str(),
        source("engine.archetype.granularity", "SEGMENTA_ARCHETYPE_GRANULARITY"),
    ));

    for axis in &config.axes {
        let metrics: Vec<&str> = axis.metrics.iter().map(|metric| metric.as_str()).collect();
        lines.push(render_line(
            &format!("axes.{}", axis.name),
            &format!("[{}] sampling={:?}", metrics.join(", "), axis.sampling),
            field_source("axes", None, config_file_doc.as_ref(), config_file_path.as_deref()),
        ));
    }

    lines.join("\n")
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    let root = PathBuf::from("segmenta.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/segmenta.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, field_source};

    #[test]
    fn nested_keys_resolve_to_file_source() {
        let doc: Value = "[engine.selection]\nmax_k = 6\n".parse().expect("valid toml");
        assert!(contains_path(&doc, "engine.selection.max_k"));
        assert!(!contains_path(&doc, "engine.selection.min_k"));

        let source = field_source("engine.selection.max_k", None, Some(&doc), None);
        assert_eq!(source, "file (config file)");
        assert_eq!(field_source("engine.seed", None, Some(&doc), None), "default");
    }
}

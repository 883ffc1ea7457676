use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::archetype::Granularity;
use crate::domain::feature::AxisName;
use crate::features::Metric;

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub axes: Vec<AxisConfig>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub seed: u64,
    pub observation_window_days: u32,
    /// End of the observation window; `None` means "now" at run time.
    pub reference_time: Option<DateTime<Utc>>,
    pub fcm: FcmConfig,
    pub preprocess: PreprocessConfig,
    pub selection: SelectionConfig,
    pub sampling: SamplingConfig,
    pub archetype: ArchetypeConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FcmConfig {
    pub fuzziness: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    pub lower_percentile: f64,
    pub upper_percentile: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub min_k: usize,
    pub max_k: usize,
    /// Ceiling on the largest segment's population share.
    pub max_share: f64,
    /// Floor on the smallest segment's population share.
    pub min_share: f64,
    pub min_customers: usize,
    pub ranking: Ranking,
    pub silhouette_weight: f64,
    pub balance_weight: f64,
    pub silhouette_sample_limit: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub small_population_threshold: usize,
    pub small_fraction: f64,
    pub large_fraction: f64,
    pub diversity_pool_limit: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchetypeConfig {
    pub granularity: Granularity,
    pub weak_below: f64,
    pub strong_above: f64,
    /// Decimal places kept when rounding memberships for `fuzzy_top2` signatures.
    pub precision: u32,
}

/// Ordering applied to balanced candidates during model selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ranking {
    Silhouette,
    Combined,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Probability proportional to spend.
    Weighted,
    /// Equal quota per activity tier.
    Stratified,
    /// Greedy farthest-point selection in standardized feature space.
    Diversity,
    Uniform,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    pub name: AxisName,
    pub metrics: Vec<Metric>,
    pub sampling: SamplingStrategy,
    #[serde(default)]
    pub min_k: Option<usize>,
    #[serde(default)]
    pub max_k: Option<usize>,
    #[serde(default)]
    pub fuzziness: Option<f64>,
}

impl AxisConfig {
    fn new(name: &str, metrics: Vec<Metric>, sampling: SamplingStrategy) -> Self {
        Self {
            name: AxisName::new(name),
            metrics,
            sampling,
            min_k: None,
            max_k: None,
            fuzziness: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub seed: Option<u64>,
    pub reference_time: Option<DateTime<Utc>>,
    pub granularity: Option<Granularity>,
    pub min_k: Option<usize>,
    pub max_k: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for FcmConfig {
    fn default() -> Self {
        Self { fuzziness: 2.0, max_iterations: 300, tolerance: 1e-5 }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self { lower_percentile: 1.0, upper_percentile: 99.0 }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_k: 2,
            max_k: 8,
            max_share: 0.55,
            min_share: 0.03,
            min_customers: 20,
            ranking: Ranking::Silhouette,
            silhouette_weight: 0.4,
            balance_weight: 0.6,
            silhouette_sample_limit: 3_000,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            min_size: 500,
            max_size: 5_000,
            small_population_threshold: 10_000,
            small_fraction: 0.25,
            large_fraction: 0.02,
            diversity_pool_limit: 20_000,
        }
    }
}

impl Default for ArchetypeConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::Dominant,
            weak_below: 0.4,
            strong_above: 0.7,
            precision: 1,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            observation_window_days: 365,
            reference_time: None,
            fcm: FcmConfig::default(),
            preprocess: PreprocessConfig::default(),
            selection: SelectionConfig::default(),
            sampling: SamplingConfig::default(),
            archetype: ArchetypeConfig::default(),
        }
    }
}

pub fn default_axes() -> Vec<AxisConfig> {
    vec![
        AxisConfig::new(
            "frequency",
            vec![
                Metric::OrderCount,
                Metric::OrdersPerMonth,
                Metric::MeanDaysBetweenOrders,
                Metric::DaysSinceLastOrder,
                Metric::ActiveMonths,
            ],
            SamplingStrategy::Stratified,
        ),
        AxisConfig::new(
            "spend",
            vec![
                Metric::TotalSpend,
                Metric::AvgOrderValue,
                Metric::MaxOrderValue,
                Metric::SpendPerMonth,
            ],
            SamplingStrategy::Weighted,
        ),
        AxisConfig::new(
            "exploration",
            vec![
                Metric::DistinctCategories,
                Metric::CategoryEntropy,
                Metric::TopCategoryShare,
                Metric::NewCategoryRate,
            ],
            SamplingStrategy::Diversity,
        ),
        AxisConfig::new(
            "price_sensitivity",
            vec![
                Metric::DiscountedOrderShare,
                Metric::AvgDiscountPct,
                Metric::FullPriceSpendShare,
                Metric::ReturnRate,
            ],
            SamplingStrategy::Diversity,
        ),
    ]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://segmenta.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            engine: EngineConfig::default(),
            axes: default_axes(),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl FromStr for Ranking {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "silhouette" => Ok(Self::Silhouette),
            "combined" => Ok(Self::Combined),
            other => Err(ConfigError::Validation(format!(
                "unsupported selection ranking `{other}` (expected silhouette|combined)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("segmenta.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn axis(&self, name: &AxisName) -> Option<&AxisConfig> {
        self.axes.iter().find(|axis| &axis.name == name)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(engine) = patch.engine {
            self.engine.apply_patch(engine);
        }

        if let Some(axes) = patch.axes {
            self.axes = axes;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("SEGMENTA_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("SEGMENTA_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("SEGMENTA_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("SEGMENTA_DATABASE_TIMEOUT_SECS", &value)?;
        }

        let log_level =
            read_env("SEGMENTA_LOGGING_LEVEL").or_else(|| read_env("SEGMENTA_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("SEGMENTA_LOGGING_FORMAT").or_else(|| read_env("SEGMENTA_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        let engine = &mut self.engine;
        if let Some(value) = read_env("SEGMENTA_ENGINE_SEED") {
            engine.seed = parse_env("SEGMENTA_ENGINE_SEED", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_ENGINE_WINDOW_DAYS") {
            engine.observation_window_days = parse_env("SEGMENTA_ENGINE_WINDOW_DAYS", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_ENGINE_REFERENCE_TIME") {
            let parsed = DateTime::parse_from_rfc3339(&value).map_err(|_| {
                ConfigError::InvalidEnvOverride {
                    key: "SEGMENTA_ENGINE_REFERENCE_TIME".to_string(),
                    value: value.clone(),
                }
            })?;
            engine.reference_time = Some(parsed.with_timezone(&Utc));
        }

        if let Some(value) = read_env("SEGMENTA_FCM_FUZZINESS") {
            engine.fcm.fuzziness = parse_env("SEGMENTA_FCM_FUZZINESS", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_FCM_MAX_ITERATIONS") {
            engine.fcm.max_iterations = parse_env("SEGMENTA_FCM_MAX_ITERATIONS", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_FCM_TOLERANCE") {
            engine.fcm.tolerance = parse_env("SEGMENTA_FCM_TOLERANCE", &value)?;
        }

        if let Some(value) = read_env("SEGMENTA_PREPROCESS_LOWER_PERCENTILE") {
            engine.preprocess.lower_percentile =
                parse_env("SEGMENTA_PREPROCESS_LOWER_PERCENTILE", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_PREPROCESS_UPPER_PERCENTILE") {
            engine.preprocess.upper_percentile =
                parse_env("SEGMENTA_PREPROCESS_UPPER_PERCENTILE", &value)?;
        }

        if let Some(value) = read_env("SEGMENTA_SELECTION_MIN_K") {
            engine.selection.min_k = parse_env("SEGMENTA_SELECTION_MIN_K", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_SELECTION_MAX_K") {
            engine.selection.max_k = parse_env("SEGMENTA_SELECTION_MAX_K", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_SELECTION_MAX_SHARE") {
            engine.selection.max_share = parse_env("SEGMENTA_SELECTION_MAX_SHARE", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_SELECTION_MIN_SHARE") {
            engine.selection.min_share = parse_env("SEGMENTA_SELECTION_MIN_SHARE", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_SELECTION_MIN_CUSTOMERS") {
            engine.selection.min_customers =
                parse_env("SEGMENTA_SELECTION_MIN_CUSTOMERS", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_SELECTION_RANKING") {
            engine.selection.ranking = value.parse()?;
        }
        if let Some(value) = read_env("SEGMENTA_SELECTION_SILHOUETTE_WEIGHT") {
            engine.selection.silhouette_weight =
                parse_env("SEGMENTA_SELECTION_SILHOUETTE_WEIGHT", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_SELECTION_BALANCE_WEIGHT") {
            engine.selection.balance_weight =
                parse_env("SEGMENTA_SELECTION_BALANCE_WEIGHT", &value)?;
        }

        if let Some(value) = read_env("SEGMENTA_SAMPLING_MIN_SIZE") {
            engine.sampling.min_size = parse_env("SEGMENTA_SAMPLING_MIN_SIZE", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_SAMPLING_MAX_SIZE") {
            engine.sampling.max_size = parse_env("SEGMENTA_SAMPLING_MAX_SIZE", &value)?;
        }

        if let Some(value) = read_env("SEGMENTA_ARCHETYPE_GRANULARITY") {
            engine.archetype.granularity = value.parse().map_err(ConfigError::Validation)?;
        }
        if let Some(value) = read_env("SEGMENTA_ARCHETYPE_PRECISION") {
            engine.archetype.precision = parse_env("SEGMENTA_ARCHETYPE_PRECISION", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_ARCHETYPE_WEAK_BELOW") {
            engine.archetype.weak_below = parse_env("SEGMENTA_ARCHETYPE_WEAK_BELOW", &value)?;
        }
        if let Some(value) = read_env("SEGMENTA_ARCHETYPE_STRONG_ABOVE") {
            engine.archetype.strong_above = parse_env("SEGMENTA_ARCHETYPE_STRONG_ABOVE", &value)?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(seed) = overrides.seed {
            self.engine.seed = seed;
        }
        if let Some(reference_time) = overrides.reference_time {
            self.engine.reference_time = Some(reference_time);
        }
        if let Some(granularity) = overrides.granularity {
            self.engine.archetype.granularity = granularity;
        }
        if let Some(min_k) = overrides.min_k {
            self.engine.selection.min_k = min_k;
        }
        if let Some(max_k) = overrides.max_k {
            self.engine.selection.max_k = max_k;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_logging(&self.logging)?;
        validate_engine(&self.engine)?;
        validate_axes(&self.axes, &self.engine)?;
        Ok(())
    }
}

impl EngineConfig {
    fn apply_patch(&mut self, patch: EnginePatch) {
        if let Some(seed) = patch.seed {
            self.seed = seed;
        }
        if let Some(days) = patch.observation_window_days {
            self.observation_window_days = days;
        }
        if let Some(reference_time) = patch.reference_time {
            self.reference_time = Some(reference_time);
        }

        if let Some(fcm) = patch.fcm {
            if let Some(fuzziness) = fcm.fuzziness {
                self.fcm.fuzziness = fuzziness;
            }
            if let Some(max_iterations) = fcm.max_iterations {
                self.fcm.max_iterations = max_iterations;
            }
            if let Some(tolerance) = fcm.tolerance {
                self.fcm.tolerance = tolerance;
            }
        }

        if let Some(preprocess) = patch.preprocess {
            if let Some(lower) = preprocess.lower_percentile {
                self.preprocess.lower_percentile = lower;
            }
            if let Some(upper) = preprocess.upper_percentile {
                self.preprocess.upper_percentile = upper;
            }
        }

        if let Some(selection) = patch.selection {
            let target = &mut self.selection;
            if let Some(value) = selection.min_k {
                target.min_k = value;
            }
            if let Some(value) = selection.max_k {
                target.max_k = value;
            }
            if let Some(value) = selection.max_share {
                target.max_share = value;
            }
            if let Some(value) = selection.min_share {
                target.min_share = value;
            }
            if let Some(value) = selection.min_customers {
                target.min_customers = value;
            }
            if let Some(value) = selection.ranking {
                target.ranking = value;
            }
            if let Some(value) = selection.silhouette_weight {
                target.silhouette_weight = value;
            }
            if let Some(value) = selection.balance_weight {
                target.balance_weight = value;
            }
            if let Some(value) = selection.silhouette_sample_limit {
                target.silhouette_sample_limit = value;
            }
        }

        if let Some(sampling) = patch.sampling {
            let target = &mut self.sampling;
            if let Some(value) = sampling.min_size {
                target.min_size = value;
            }
            if let Some(value) = sampling.max_size {
                target.max_size = value;
            }
            if let Some(value) = sampling.small_population_threshold {
                target.small_population_threshold = value;
            }
            if let Some(value) = sampling.small_fraction {
                target.small_fraction = value;
            }
            if let Some(value) = sampling.large_fraction {
                target.large_fraction = value;
            }
            if let Some(value) = sampling.diversity_pool_limit {
                target.diversity_pool_limit = value;
            }
        }

        if let Some(archetype) = patch.archetype {
            if let Some(value) = archetype.granularity {
                self.archetype.granularity = value;
            }
            if let Some(value) = archetype.weak_below {
                self.archetype.weak_below = value;
            }
            if let Some(value) = archetype.strong_above {
                self.archetype.strong_above = value;
            }
            if let Some(value) = archetype.precision {
                self.archetype.precision = value;
            }
        }
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("segmenta.toml"), PathBuf::from("config/segmenta.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.observation_window_days == 0 {
        return Err(ConfigError::Validation(
            "engine.observation_window_days must be greater than zero".to_string(),
        ));
    }

    validate_fuzziness("engine.fcm.fuzziness", engine.fcm.fuzziness)?;
    if engine.fcm.max_iterations == 0 {
        return Err(ConfigError::Validation(
            "engine.fcm.max_iterations must be greater than zero".to_string(),
        ));
    }
    if !(engine.fcm.tolerance > 0.0) {
        return Err(ConfigError::Validation(
            "engine.fcm.tolerance must be greater than zero".to_string(),
        ));
    }

    let preprocess = &engine.preprocess;
    let percentiles_ok = (0.0..=100.0).contains(&preprocess.lower_percentile)
        && (0.0..=100.0).contains(&preprocess.upper_percentile)
        && preprocess.lower_percentile < preprocess.upper_percentile;
    if !percentiles_ok {
        return Err(ConfigError::Validation(
            "engine.preprocess percentiles must satisfy 0 <= lower < upper <= 100".to_string(),
        ));
    }

    let selection = &engine.selection;
    validate_k_range("engine.selection", selection.min_k, selection.max_k)?;
    let shares_ok = selection.min_share > 0.0
        && selection.max_share < 1.0
        && selection.min_share < selection.max_share;
    if !shares_ok {
        return Err(ConfigError::Validation(
            "engine.selection shares must satisfy 0 < min_share < max_share < 1".to_string(),
        ));
    }
    if selection.min_customers < selection.min_k {
        return Err(ConfigError::Validation(
            "engine.selection.min_customers must be at least min_k".to_string(),
        ));
    }
    if selection.silhouette_weight < 0.0
        || selection.balance_weight < 0.0
        || selection.silhouette_weight + selection.balance_weight <= 0.0
    {
        return Err(ConfigError::Validation(
            "engine.selection weights must be non-negative and not both zero".to_string(),
        ));
    }

    let sampling = &engine.sampling;
    if sampling.min_size == 0 || sampling.min_size > sampling.max_size {
        return Err(ConfigError::Validation(
            "engine.sampling sizes must satisfy 0 < min_size <= max_size".to_string(),
        ));
    }
    let fraction_ok = |value: f64| value > 0.0 && value <= 1.0;
    if !fraction_ok(sampling.small_fraction) || !fraction_ok(sampling.large_fraction) {
        return Err(ConfigError::Validation(
            "engine.sampling fractions must be in range (0, 1]".to_string(),
        ));
    }

    let archetype = &engine.archetype;
    let bins_ok = 0.0 <= archetype.weak_below
        && archetype.weak_below < archetype.strong_above
        && archetype.strong_above <= 1.0;
    if !bins_ok {
        return Err(ConfigError::Validation(
            "engine.archetype thresholds must satisfy 0 <= weak_below < strong_above <= 1"
                .to_string(),
        ));
    }
    if archetype.precision > 6 {
        return Err(ConfigError::Validation(
            "engine.archetype.precision must be at most 6".to_string(),
        ));
    }

    Ok(())
}

fn validate_axes(axes: &[AxisConfig], engine: &EngineConfig) -> Result<(), ConfigError> {
    if axes.is_empty() {
        return Err(ConfigError::Validation("at least one axis must be configured".to_string()));
    }

    let mut names = HashSet::new();
    for axis in axes {
        let name = axis.name.as_str().trim();
        if name.is_empty() {
            return Err(ConfigError::Validation("axis names must not be empty".to_string()));
        }
        if !names.insert(name.to_string()) {
            return Err(ConfigError::Validation(format!("axis `{name}` is configured twice")));
        }
        if axis.metrics.is_empty() {
            return Err(ConfigError::Validation(format!("axis `{name}` declares no metrics")));
        }
        let distinct: HashSet<_> = axis.metrics.iter().collect();
        if distinct.len() != axis.metrics.len() {
            return Err(ConfigError::Validation(format!(
                "axis `{name}` declares a metric more than once"
            )));
        }

        let min_k = axis.min_k.unwrap_or(engine.selection.min_k);
        let max_k = axis.max_k.unwrap_or(engine.selection.max_k);
        validate_k_range(&format!("axes.{name}"), min_k, max_k)?;
        if let Some(fuzziness) = axis.fuzziness {
            validate_fuzziness(&format!("axes.{name}.fuzziness"), fuzziness)?;
        }
    }

    Ok(())
}

fn validate_k_range(scope: &str, min_k: usize, max_k: usize) -> Result<(), ConfigError> {
    if min_k < 2 || min_k > max_k {
        return Err(ConfigError::Validation(format!(
            "{scope} k range must satisfy 2 <= min_k <= max_k (got {min_k}..={max_k})"
        )));
    }
    Ok(())
}

fn validate_fuzziness(key: &str, value: f64) -> Result<(), ConfigError> {
    if !(value > 1.0) || !value.is_finite() {
        return Err(ConfigError::Validation(format!("{key} must be a finite value above 1.0")));
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    logging: Option<LoggingPatch>,
    engine: Option<EnginePatch>,
    axes: Option<Vec<AxisConfig>>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    seed: Option<u64>,
    observation_window_days: Option<u32>,
    reference_time: Option<DateTime<Utc>>,
    fcm: Option<FcmPatch>,
    preprocess: Option<PreprocessPatch>,
    selection: Option<SelectionPatch>,
    sampling: Option<SamplingPatch>,
    archetype: Option<ArchetypePatch>,
}

#[derive(Debug, Default, Deserialize)]
struct FcmPatch {
    fuzziness: Option<f64>,
    max_iterations: Option<usize>,
    tolerance: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct PreprocessPatch {
    lower_percentile: Option<f64>,
    upper_percentile: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct SelectionPatch {
    min_k: Option<usize>,
    max_k: Option<usize>,
    max_share: Option<f64>,
    min_share: Option<f64>,
    min_customers: Option<usize>,
    ranking: Option<Ranking>,
    silhouette_weight: Option<f64>,
    balance_weight: Option<f64>,
    silhouette_sample_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SamplingPatch {
    min_size: Option<usize>,
    max_size: Option<usize>,
    small_population_threshold: Option<usize>,
    small_fraction: Option<f64>,
    large_fraction: Option<f64>,
    diversity_pool_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ArchetypePatch {
    granularity: Option<Granularity>,
    weak_below: Option<f64>,
    strong_above: Option<f64>,
    precision: Option<u32>,
}

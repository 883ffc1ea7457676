pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use segmenta_core::config::{AppConfig, ConfigOverrides, LoadOptions, LoggingConfig};
use segmenta_core::domain::archetype::Granularity;

#[derive(Debug, Parser)]
#[command(
    name = "segmenta",
    about = "Segmenta batch runner",
    long_about = "Run scheduled customer segmentation jobs: migrations, per-axis discovery, population assignment and archetype composition.",
    after_help = "Examples:\n  segmenta migrate\n  segmenta discover --seed 7\n  segmenta assign\n  segmenta archetypes --granularity strength_binned --top 20"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a segmenta.toml file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Discover fuzzy segments for every configured axis and persist the models")]
    Discover {
        #[arg(long, help = "Override the sampling and initialization seed")]
        seed: Option<u64>,
        #[arg(long, help = "End of the observation window (RFC 3339); defaults to now")]
        reference_time: Option<DateTime<Utc>>,
    },
    #[command(about = "Assign all active customers against the persisted axis models")]
    Assign {
        #[arg(long, help = "End of the observation window (RFC 3339); defaults to now")]
        reference_time: Option<DateTime<Utc>>,
    },
    #[command(about = "Compose archetypes from stored memberships and replace the snapshot")]
    Archetypes {
        #[arg(long, help = "dominant | strength_binned | fuzzy_top2")]
        granularity: Option<Granularity>,
        #[arg(long, default_value_t = 10, help = "Number of largest archetypes to report")]
        top: usize,
    },
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
}

pub fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let overrides = match &cli.command {
        Command::Discover { seed, reference_time } => ConfigOverrides {
            seed: *seed,
            reference_time: *reference_time,
            ..ConfigOverrides::default()
        },
        Command::Assign { reference_time } => {
            ConfigOverrides { reference_time: *reference_time, ..ConfigOverrides::default() }
        }
        Command::Archetypes { granularity, .. } => {
            ConfigOverrides { granularity: *granularity, ..ConfigOverrides::default() }
        }
        Command::Migrate | Command::Config => ConfigOverrides::default(),
    };
    let options = LoadOptions { config_path: cli.config.clone(), require_file: false, overrides };

    // a broken config is reported by the command itself; log with defaults meanwhile
    let logging = AppConfig::load(options.clone())
        .map(|config| config.logging)
        .unwrap_or_else(|_| AppConfig::default().logging);
    init_logging(&logging)?;

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(options),
        Command::Discover { .. } => commands::discover::run(options),
        Command::Assign { .. } => commands::assign::run(options),
        Command::Archetypes { top, .. } => commands::archetypes::run(options, top),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(options) }
        }
    };

    println!("{}", result.output);
    Ok(ExitCode::from(result.exit_code))
}

/// Installs the global subscriber on stderr so stdout carries only the outcome line.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    use segmenta_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder =
        tracing_subscriber::fmt().with_target(false).with_max_level(log_level).with_writer(std::io::stderr);

    let installed = match config.format {
        Compact => builder.compact().try_init(),
        Pretty => builder.pretty().try_init(),
        Json => builder.json().try_init(),
    };
    installed.map_err(|error| anyhow!("failed to initialise logging: {error}"))
}

//! Startup configuration.
//!
//! Settings come from the environment (and `.env`); CLI flags override them.
//! The resolved [`RuntimeConfig`] carries the exchange slice this instance
//! runs after round-robin sharding.

use anyhow::{ensure, Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::warn;

/// Command-line flags. Every flag has an environment equivalent; CLI wins.
#[derive(Debug, Parser)]
#[command(
    name = "funding-harvester",
    version,
    about = "Perpetual-futures funding rate collection into TimescaleDB"
)]
pub struct Cli {
    /// Comma-separated list of exchanges to run (default: all).
    #[arg(long)]
    pub exchanges: Option<String>,

    /// Comma-separated list of exchanges for DEBUG logging.
    #[arg(long)]
    pub debug_exchanges: Option<String>,

    /// Comma-separated list of exchanges for live-collection DEBUG logging.
    #[arg(long)]
    pub debug_exchanges_live: Option<String>,

    /// Instance identifier for multi-instance deployment.
    #[arg(long)]
    pub instance_id: Option<i64>,

    /// Total number of instances for exchange distribution.
    #[arg(long)]
    pub total_instances: Option<i64>,
}

/// Environment-backed settings (`DB_CONNECTION` is required).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_connection: String,
    #[serde(default)]
    pub exchanges: Option<String>,
    #[serde(default)]
    pub debug_exchanges: Option<String>,
    #[serde(default)]
    pub debug_exchanges_live: Option<String>,
    #[serde(default)]
    pub instance_id: Option<i64>,
    #[serde(default)]
    pub total_instances: Option<i64>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .context("failed to read environment configuration")?
            .try_deserialize()
            .context("invalid environment configuration (is DB_CONNECTION set?)")
    }
}

/// Resolved startup configuration after the CLI/env merge.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub db_connection: String,
    /// Exchanges this instance runs, sorted.
    pub exchanges: Vec<String>,
    pub debug_exchanges: Vec<String>,
    pub debug_exchanges_live: Vec<String>,
    pub instance_id: i64,
    pub total_instances: i64,
}

/// Merge CLI over env, validate, filter to known exchanges and shard.
pub fn build_runtime_config(
    cli: &Cli,
    settings: &Settings,
    all_exchanges: &[&str],
) -> Result<RuntimeConfig> {
    let instance_id = cli.instance_id.or(settings.instance_id).unwrap_or(0);
    let total_instances = cli.total_instances.or(settings.total_instances).unwrap_or(1);

    ensure!(total_instances > 0, "TOTAL_INSTANCES must be greater than 0");
    ensure!(instance_id >= 0, "INSTANCE_ID must be >= 0");
    ensure!(
        instance_id < total_instances,
        "INSTANCE_ID must be less than TOTAL_INSTANCES"
    );

    let requested = parse_csv(
        cli.exchanges
            .as_deref()
            .or(settings.exchanges.as_deref()),
    );

    let mut selected: Vec<String> = if requested.is_empty() {
        all_exchanges.iter().map(ToString::to_string).collect()
    } else {
        let (valid, unknown): (Vec<String>, Vec<String>) = requested
            .into_iter()
            .partition(|name| all_exchanges.contains(&name.as_str()));
        if !unknown.is_empty() {
            warn!(
                unknown = ?unknown,
                available = ?all_exchanges,
                "unknown exchange ids will be skipped"
            );
        }
        ensure!(!valid.is_empty(), "no valid exchanges left after filtering");
        valid
    };
    selected.sort();
    selected.dedup();

    let exchanges = shard_exchanges(&selected, instance_id, total_instances);

    Ok(RuntimeConfig {
        db_connection: settings.db_connection.clone(),
        exchanges,
        debug_exchanges: parse_csv(
            cli.debug_exchanges
                .as_deref()
                .or(settings.debug_exchanges.as_deref()),
        ),
        debug_exchanges_live: parse_csv(
            cli.debug_exchanges_live
                .as_deref()
                .or(settings.debug_exchanges_live.as_deref()),
        ),
        instance_id,
        total_instances,
    })
}

/// Deterministic round-robin slice of the sorted exchange list:
/// `sorted[instance_id::total_instances]`.
pub fn shard_exchanges(sorted: &[String], instance_id: i64, total_instances: i64) -> Vec<String> {
    if total_instances <= 1 {
        return sorted.to_vec();
    }
    sorted
        .iter()
        .skip(instance_id as usize)
        .step_by(total_instances as usize)
        .cloned()
        .collect()
}

/// Split a comma-separated flag value, dropping empty items.
pub fn parse_csv(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

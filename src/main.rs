//! Funding Harvester entry point.
//!
//! Resolves configuration (CLI over env), forces UTC, wires the exchange
//! registry, orchestrators and scheduler, then waits for SIGINT. Exit code 0
//! means a clean shutdown after the signal; any other fatal exits with 1.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use funding_harvester::config::{build_runtime_config, parse_csv, Cli, Settings};
use funding_harvester::db;
use funding_harvester::exchange;
use funding_harvester::http::HttpClient;
use funding_harvester::orchestrator::{ExchangeOrchestrator, DEFAULT_CONCURRENCY_LIMIT};
use funding_harvester::refresher::{MaterializedViewRefresher, DEFAULT_DEBOUNCE_SECONDS};
use funding_harvester::scheduler::{live_stagger_second, Scheduler};
use tracing::{info, warn};
use tracing_subscriber::fmt::format::{Format, Full};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // All timestamps in the system are naive UTC; force it before anything
    // touches the clock.
    std::env::set_var("TZ", "UTC");

    if let Err(err) = run().await {
        eprintln!("funding-harvester: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load()?;

    // Tracing comes up before config validation so filtering warnings and
    // configuration errors are not lost.
    init_tracing(&cli, &settings)?;

    let http = HttpClient::new()?;
    let registry = exchange::registry(&http)?;
    let all_ids: Vec<&str> = registry.keys().copied().collect();

    let config = build_runtime_config(&cli, &settings, &all_ids)?;

    if config.total_instances > 1 {
        info!(
            instance = config.instance_id,
            total = config.total_instances,
            exchanges = ?config.exchanges,
            "starting instance slice"
        );
    } else {
        info!(exchanges = ?config.exchanges, "starting funding harvester");
    }

    let pool = db::connect_pool(&config.db_connection).await?;
    db::run_migrations(&pool).await?;

    let refresher = Arc::new(MaterializedViewRefresher::new(
        pool.clone(),
        DEFAULT_DEBOUNCE_SECONDS,
    ));

    let mut scheduler = Scheduler::new();
    let exchange_count = config.exchanges.len().max(1);

    for (index, name) in config.exchanges.iter().enumerate() {
        let adapter = registry
            .get(name.as_str())
            .cloned()
            .with_context(|| format!("exchange {name} missing from registry"))?;

        let orchestrator = Arc::new(ExchangeOrchestrator::new(
            adapter,
            pool.clone(),
            Arc::clone(&refresher),
            DEFAULT_CONCURRENCY_LIMIT,
        ));

        scheduler.register_update_job(Arc::clone(&orchestrator));
        scheduler.register_live_job(orchestrator, live_stagger_second(index, exchange_count));
    }
    scheduler.register_refresher_job(Arc::clone(&refresher));

    info!("scheduler started, waiting for jobs");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    scheduler.shutdown();
    pool.close().await;
    info!("stopped cleanly");
    Ok(())
}

/// Map an exchange id to its adapter module for log filter directives.
fn exchange_module(id: &str) -> Option<&'static str> {
    Some(match id {
        "aster" => "aster",
        "backpack" => "backpack",
        "binance_usd-m" => "binance_usdm",
        "binance_coin-m" => "binance_coinm",
        "bybit" => "bybit",
        "derive" => "derive",
        "dydx" => "dydx",
        "extended" => "extended",
        "hyperliquid" => "hyperliquid",
        "hyperliquid-xyz" => "hyperliquid_xyz",
        "kucoin" => "kucoin",
        "lighter" => "lighter",
        "okx" => "okx",
        "pacifica" => "pacifica",
        "paradex" => "paradex",
        _ => return None,
    })
}

/// Prefixes every event with the instance slot when scaled horizontally.
struct InstanceTaggedFormat {
    tag: String,
    inner: Format<Full, SystemTime>,
}

impl<S, N> FormatEvent<S, N> for InstanceTaggedFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        use std::fmt::Write as _;

        write!(writer, "{} ", self.tag)?;
        self.inner.format_event(ctx, writer, event)
    }
}

fn init_tracing(cli: &Cli, settings: &Settings) -> Result<()> {
    let debug_exchanges = parse_csv(
        cli.debug_exchanges
            .as_deref()
            .or(settings.debug_exchanges.as_deref()),
    );
    let debug_exchanges_live = parse_csv(
        cli.debug_exchanges_live
            .as_deref()
            .or(settings.debug_exchanges_live.as_deref()),
    );
    let instance_id = cli.instance_id.or(settings.instance_id).unwrap_or(0);
    let total_instances = cli.total_instances.or(settings.total_instances).unwrap_or(1);

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let mut unknown_debug_ids = Vec::new();

    for id in &debug_exchanges {
        match exchange_module(id) {
            Some(module) => {
                filter = filter.add_directive(
                    format!("funding_harvester::exchange::{module}=debug").parse()?,
                );
            }
            None => unknown_debug_ids.push(id.clone()),
        }
    }

    if !debug_exchanges_live.is_empty() {
        filter = filter.add_directive("funding_harvester::coordinator::live=debug".parse()?);
        for id in &debug_exchanges_live {
            match exchange_module(id) {
                Some(module) => {
                    filter = filter.add_directive(
                        format!("funding_harvester::exchange::{module}=debug").parse()?,
                    );
                }
                None => unknown_debug_ids.push(id.clone()),
            }
        }
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if total_instances > 1 {
        builder
            .event_format(InstanceTaggedFormat {
                tag: format!("[{instance_id}/{total_instances}]"),
                inner: Format::default(),
            })
            .init();
    } else {
        builder.init();
    }

    if !unknown_debug_ids.is_empty() {
        warn!(ids = ?unknown_debug_ids, "unknown exchange ids in debug logging flags");
    }
    if !debug_exchanges.is_empty() {
        info!(exchanges = ?debug_exchanges, "debug logging enabled");
    }
    if !debug_exchanges_live.is_empty() {
        info!(exchanges = ?debug_exchanges_live, "live collection debug logging enabled");
    }

    Ok(())
}

//! Contract registry synchronization.

use std::collections::HashSet;

use anyhow::Result;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::UnitOfWork;
use crate::exchange::Exchange;
use crate::model::{Asset, Contract, Quote, Section};
use crate::refresher::MaterializedViewRefresher;

/// Sync the section's contract set from the venue.
///
/// Within one transaction: upsert the section, insert-ignore referenced
/// quotes and assets, mark prior contracts missing from the fresh list as
/// deprecated and upsert the fresh list with `deprecated = false`. An empty
/// API response leaves the registry untouched so a transient upstream outage
/// cannot wipe it. Signals the materialized-view refresher on completion.
pub async fn register_contracts(
    exchange: &dyn Exchange,
    section_name: &str,
    pool: &PgPool,
    mv_refresher: Option<&MaterializedViewRefresher>,
) -> Result<()> {
    info!(section = section_name, "starting contract sync");

    let api_contracts = exchange.get_contracts().await?;
    debug!(
        section = section_name,
        count = api_contracts.len(),
        "fetched contracts from venue"
    );

    if api_contracts.is_empty() {
        warn!(section = section_name, "venue returned no contracts, leaving registry untouched");
        return Ok(());
    }

    let mut uow = UnitOfWork::begin(pool).await?;

    uow.sections()
        .bulk_insert_ignore(&[Section::new(section_name)])
        .await?;

    let quotes: Vec<Quote> = api_contracts
        .iter()
        .map(|c| c.quote.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .map(|name| Quote { name })
        .collect();
    uow.quotes().bulk_insert_ignore(&quotes).await?;

    let assets: Vec<Asset> = api_contracts
        .iter()
        .map(|c| c.asset_name.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .map(|name| Asset { name })
        .collect();
    uow.assets().bulk_insert_ignore(&assets).await?;

    let existing = uow.contracts().get_by_section(section_name).await?;
    debug!(section = section_name, count = existing.len(), "existing contracts in store");

    let api_keys: HashSet<(&str, &str)> = api_contracts
        .iter()
        .map(|c| (c.asset_name.as_str(), c.quote.as_str()))
        .collect();

    let delisted: Vec<Uuid> = existing
        .iter()
        .filter(|contract| {
            !api_keys.contains(&(contract.asset_name.as_str(), contract.quote_name.as_str()))
        })
        .map(|contract| contract.id)
        .collect();
    let deprecated_count = delisted.len();
    uow.contracts().set_deprecated(&delisted, true).await?;

    let fresh: Vec<Contract> = api_contracts
        .iter()
        .map(|info| Contract {
            id: Uuid::new_v4(),
            asset_name: info.asset_name.clone(),
            quote_name: info.quote.clone(),
            section_name: section_name.to_string(),
            funding_interval: info.funding_interval,
            deprecated: false,
            synced: false,
        })
        .collect();
    uow.contracts().upsert_many(&fresh).await?;

    uow.commit().await?;

    info!(
        section = section_name,
        active = api_contracts.len(),
        deprecated = deprecated_count,
        "contract sync completed"
    );

    if let Some(refresher) = mv_refresher {
        refresher.signal_contracts_changed(section_name);
        debug!(section = section_name, "signaled materialized-view refresher");
    }

    Ok(())
}

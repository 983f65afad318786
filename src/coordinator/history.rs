//! Historical funding data fetchers: backward sync and forward update.

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::db::UnitOfWork;
use crate::exchange::Exchange;
use crate::model::{Contract, HistoricalFundingPoint};

/// Log backfill progress every this many batches.
const PROGRESS_LOG_BATCH_INTERVAL: u32 = 10;

/// Walk backward from the oldest stored point until the venue runs out of
/// history, then mark the contract as synced.
///
/// Each loop iteration opens a short transaction to read the oldest stored
/// timestamp, closes it, fetches one step upstream, and inserts the batch in
/// a fresh transaction. The one second shift keeps the boundary point from
/// being refetched.
pub async fn sync_contract(
    exchange: &dyn Exchange,
    contract: &Contract,
    pool: &PgPool,
) -> Result<u64> {
    if contract.synced {
        debug!(
            section = %contract.section_name,
            asset = %contract.asset_name,
            quote = %contract.quote_name,
            "already synced, skipping"
        );
        return Ok(0);
    }

    debug!(
        section = %contract.section_name,
        asset = %contract.asset_name,
        quote = %contract.quote_name,
        "starting backfill"
    );

    let mut total_points: u64 = 0;
    let mut batch_count: u32 = 0;

    loop {
        batch_count += 1;

        let oldest = {
            let mut uow = UnitOfWork::begin(pool).await?;
            let oldest = uow
                .historical()
                .get_oldest_for_contract(contract.id)
                .await?;
            uow.commit().await?;
            oldest
        };
        let before = oldest.map(|ts| ts - TimeDelta::seconds(1));

        let points = exchange.fetch_history_before(contract, before).await?;

        if points.is_empty() {
            let mut uow = UnitOfWork::begin(pool).await?;
            uow.contracts().mark_synced(contract.id).await?;
            uow.commit().await?;
            info!(
                section = %contract.section_name,
                asset = %contract.asset_name,
                quote = %contract.quote_name,
                batches = batch_count,
                points = total_points,
                "history exhausted, marked as synced"
            );
            break;
        }

        let records: Vec<HistoricalFundingPoint> = points
            .iter()
            .map(|point| HistoricalFundingPoint {
                contract_id: contract.id,
                timestamp: point.timestamp,
                funding_rate: point.rate,
            })
            .collect();

        {
            let mut uow = UnitOfWork::begin(pool).await?;
            uow.historical().bulk_insert_ignore(&records).await?;
            uow.commit().await?;
        }

        total_points += points.len() as u64;

        // Adapters do not guarantee ordering, so bounds are recomputed here.
        let oldest_fetched = points.iter().map(|p| p.timestamp).min();
        let newest_fetched = points.iter().map(|p| p.timestamp).max();
        debug!(
            section = %contract.section_name,
            asset = %contract.asset_name,
            batch = batch_count,
            points = points.len(),
            ?oldest_fetched,
            ?newest_fetched,
            "backfill batch stored"
        );

        if batch_count % PROGRESS_LOG_BATCH_INTERVAL == 0 {
            info!(
                section = %contract.section_name,
                asset = %contract.asset_name,
                quote = %contract.quote_name,
                batch = batch_count,
                total_points,
                ?oldest_fetched,
                ?newest_fetched,
                "backfill in progress"
            );
        }
    }

    Ok(total_points)
}

/// True once at least one funding interval has passed since the cutoff.
fn interval_elapsed(after: DateTime<Utc>, now: DateTime<Utc>, funding_interval: i32) -> bool {
    now - after >= TimeDelta::hours(i64::from(funding_interval))
}

/// Append settled points newer than the most recent stored one.
///
/// Returns 0 without an upstream call when the contract's funding interval
/// has not elapsed since the newest stored point.
pub async fn update_contract(
    exchange: &dyn Exchange,
    contract: &Contract,
    pool: &PgPool,
) -> Result<u64> {
    let newest = {
        let mut uow = UnitOfWork::begin(pool).await?;
        let newest = uow
            .historical()
            .get_newest_for_contract(contract.id)
            .await?;
        uow.commit().await?;
        newest
    };

    let Some(newest) = newest else {
        warn!(
            section = %contract.section_name,
            asset = %contract.asset_name,
            quote = %contract.quote_name,
            "no stored history, run sync first"
        );
        return Ok(0);
    };

    // Plus one second so the stored boundary point is not refetched.
    let after = newest + TimeDelta::seconds(1);

    if !interval_elapsed(after, Utc::now(), contract.funding_interval) {
        debug!(
            section = %contract.section_name,
            asset = %contract.asset_name,
            interval_hours = contract.funding_interval,
            "funding interval not yet elapsed, skipping"
        );
        return Ok(0);
    }

    let points = exchange.fetch_history_after(contract, after).await?;

    if points.is_empty() {
        debug!(
            section = %contract.section_name,
            asset = %contract.asset_name,
            "no new funding points"
        );
        return Ok(0);
    }

    let records: Vec<HistoricalFundingPoint> = points
        .iter()
        .map(|point| HistoricalFundingPoint {
            contract_id: contract.id,
            timestamp: point.timestamp,
            funding_rate: point.rate,
        })
        .collect();

    let mut uow = UnitOfWork::begin(pool).await?;
    uow.historical().bulk_insert_ignore(&records).await?;
    uow.commit().await?;

    debug!(
        section = %contract.section_name,
        asset = %contract.asset_name,
        points = points.len(),
        newest = ?points.iter().map(|p| p.timestamp).max(),
        "forward update stored"
    );

    Ok(points.len() as u64)
}

//! Live (unsettled) funding rate collection.

use anyhow::Result;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::db::UnitOfWork;
use crate::exchange::Exchange;
use crate::model::LiveFundingPoint;

/// Sample the current unsettled rate for every active contract of a section.
///
/// Empty results are logged, not fatal: the next minute tick retries.
pub async fn collect_live(
    exchange: &dyn Exchange,
    section_name: &str,
    pool: &PgPool,
) -> Result<()> {
    debug!(section = section_name, "starting live rate collection");

    let contracts = {
        let mut uow = UnitOfWork::begin(pool).await?;
        let contracts = uow.contracts().get_active_by_section(section_name).await?;
        uow.commit().await?;
        contracts
    };

    if contracts.is_empty() {
        warn!(section = section_name, "no active contracts");
        return Ok(());
    }

    let rates = exchange.fetch_live(&contracts).await?;

    if rates.is_empty() {
        warn!(section = section_name, "no live rates collected");
        return Ok(());
    }

    let records: Vec<LiveFundingPoint> = rates
        .into_iter()
        .map(|(contract_id, point)| LiveFundingPoint {
            contract_id,
            timestamp: point.timestamp,
            funding_rate: point.rate,
        })
        .collect();

    let collected = records.len();
    let missing = contracts.len() - collected;

    let mut uow = UnitOfWork::begin(pool).await?;
    uow.live().bulk_insert_ignore(&records).await?;
    uow.commit().await?;

    if missing > 0 {
        info!(
            section = section_name,
            collected, missing, "live rate collection finished with gaps"
        );
    } else {
        debug!(section = section_name, collected, "live rate collection finished");
    }

    Ok(())
}

//! Per-exchange orchestration.
//!
//! One orchestrator owns one adapter, its section name, the shared pool, a
//! per-exchange semaphore and the materialized-view refresher. `update()`
//! registers contracts first, then fans out per-contract sync/update work
//! under the semaphore with hard timeouts; every failure is contained so one
//! contract or one venue can never abort its siblings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::coordinator::{collect_live, register_contracts, sync_contract, update_contract};
use crate::db::UnitOfWork;
use crate::exchange::Exchange;
use crate::model::Contract;
use crate::refresher::MaterializedViewRefresher;

/// Per-exchange cap on concurrent contract processing.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 10;

/// Hard timeout for a full contract backfill.
const SYNC_TIMEOUT: Duration = Duration::from_secs(600);
/// Hard timeout for a forward update.
const UPDATE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ExchangeOrchestrator {
    exchange: Arc<dyn Exchange>,
    section_name: &'static str,
    pool: PgPool,
    semaphore: Arc<Semaphore>,
    mv_refresher: Arc<MaterializedViewRefresher>,
}

impl ExchangeOrchestrator {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        pool: PgPool,
        mv_refresher: Arc<MaterializedViewRefresher>,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            section_name: exchange.id(),
            exchange,
            pool,
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            mv_refresher,
        }
    }

    pub fn section_name(&self) -> &'static str {
        self.section_name
    }

    /// Register contracts, then sync or update history for each of them.
    pub async fn update(&self) {
        let started = Instant::now();
        info!(section = self.section_name, "starting update");

        if let Err(err) = register_contracts(
            self.exchange.as_ref(),
            self.section_name,
            &self.pool,
            Some(self.mv_refresher.as_ref()),
        )
        .await
        {
            error!(section = self.section_name, "failed to register contracts: {err:#}");
            return;
        }

        // Deprecated contracts are included: their backfill may still be
        // unfinished.
        let contracts = match self.load_contracts().await {
            Ok(contracts) => contracts,
            Err(err) => {
                error!(section = self.section_name, "failed to load contracts: {err:#}");
                return;
            }
        };

        if contracts.is_empty() {
            warn!(section = self.section_name, "no contracts to process");
            return;
        }

        debug!(
            section = self.section_name,
            count = contracts.len(),
            "processing contracts"
        );

        let contract_count = contracts.len();
        let mut tasks = JoinSet::new();
        for contract in contracts {
            let exchange = Arc::clone(&self.exchange);
            let pool = self.pool.clone();
            let semaphore = Arc::clone(&self.semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("orchestrator semaphore closed");
                process_contract(exchange.as_ref(), &contract, &pool).await
            });
        }

        let mut updated_count: u64 = 0;
        let mut total_points: u64 = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(points) => {
                    if points > 0 {
                        updated_count += 1;
                    }
                    total_points += points;
                }
                Err(err) => {
                    error!(section = self.section_name, "contract task panicked: {err}");
                }
            }
        }

        info!(
            section = self.section_name,
            updated = updated_count,
            unchanged = contract_count as u64 - updated_count,
            new_points = total_points,
            elapsed = ?started.elapsed(),
            "history update completed"
        );
    }

    /// Collect live funding rates for all active contracts.
    pub async fn update_live(&self) {
        debug!(section = self.section_name, "collecting live rates");

        if let Err(err) =
            collect_live(self.exchange.as_ref(), self.section_name, &self.pool).await
        {
            error!(section = self.section_name, "failed to collect live rates: {err:#}");
        }
    }

    async fn load_contracts(&self) -> anyhow::Result<Vec<Contract>> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let contracts = uow.contracts().get_by_section(self.section_name).await?;
        uow.commit().await?;
        Ok(contracts)
    }
}

/// Sync or update one contract under its timeout; returns new point count.
async fn process_contract(exchange: &dyn Exchange, contract: &Contract, pool: &PgPool) -> u64 {
    let (operation, limit) = if contract.synced {
        ("update", UPDATE_TIMEOUT)
    } else {
        ("sync", SYNC_TIMEOUT)
    };

    let work = async {
        if contract.synced {
            update_contract(exchange, contract, pool).await
        } else {
            sync_contract(exchange, contract, pool).await
        }
    };

    match tokio::time::timeout(limit, work).await {
        Ok(Ok(points)) => points,
        Ok(Err(err)) => {
            error!(
                section = %contract.section_name,
                asset = %contract.asset_name,
                quote = %contract.quote_name,
                operation,
                "failed to process contract: {err:#}"
            );
            0
        }
        Err(_) => {
            warn!(
                section = %contract.section_name,
                asset = %contract.asset_name,
                quote = %contract.quote_name,
                operation,
                timeout = ?limit,
                "contract processing timed out"
            );
            0
        }
    }
}

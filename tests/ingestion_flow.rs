//! End-to-end ingestion scenarios against a real PostgreSQL/TimescaleDB.
//!
//! Run with a `DATABASE_URL` pointing at a disposable database:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/funding_test cargo test -- --ignored
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use funding_harvester::coordinator::{
    collect_live, register_contracts, sync_contract, update_contract,
};
use funding_harvester::db::{run_migrations, UnitOfWork};
use funding_harvester::exchange::Exchange;
use funding_harvester::model::{Contract, ContractInfo, FundingPoint};
use funding_harvester::refresher::MaterializedViewRefresher;
use rust_decimal_macros::dec;
use sqlx::PgPool;
use uuid::Uuid;

/// Scripted venue: a mutable contract list, a queue of backfill pages and a
/// fixed forward-fetch response.
struct FakeExchange {
    id: &'static str,
    contracts: Mutex<Vec<ContractInfo>>,
    backfill_pages: Mutex<VecDeque<Vec<FundingPoint>>>,
    forward_points: Vec<FundingPoint>,
    live_rate: rust_decimal::Decimal,
}

impl FakeExchange {
    fn new(section: &str) -> Self {
        Self {
            id: Box::leak(section.to_string().into_boxed_str()),
            contracts: Mutex::new(Vec::new()),
            backfill_pages: Mutex::new(VecDeque::new()),
            forward_points: Vec::new(),
            live_rate: dec!(0.0001),
        }
    }

    fn set_contracts(&self, assets: &[&str]) {
        *self.contracts.lock().unwrap() = assets
            .iter()
            .map(|asset| ContractInfo {
                asset_name: asset.to_string(),
                quote: "USD".to_string(),
                funding_interval: 8,
                section_name: self.id.to_string(),
            })
            .collect();
    }
}

#[async_trait]
impl Exchange for FakeExchange {
    fn id(&self) -> &'static str {
        self.id
    }

    fn fetch_step_hours(&self) -> i64 {
        100
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        contract.asset_name.clone()
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        Ok(self.contracts.lock().unwrap().clone())
    }

    async fn fetch_window(
        &self,
        _contract: &Contract,
        _start_ms: i64,
        _end_ms: i64,
    ) -> Result<Vec<FundingPoint>> {
        anyhow::bail!("unused in scripted exchange")
    }

    async fn fetch_history_before(
        &self,
        _contract: &Contract,
        _before: Option<chrono::DateTime<Utc>>,
    ) -> Result<Vec<FundingPoint>> {
        Ok(self
            .backfill_pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn fetch_history_after(
        &self,
        _contract: &Contract,
        after: chrono::DateTime<Utc>,
    ) -> Result<Vec<FundingPoint>> {
        Ok(self
            .forward_points
            .iter()
            .filter(|point| point.timestamp > after)
            .cloned()
            .collect())
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        let now = Utc::now();
        Ok(contracts
            .iter()
            .map(|contract| {
                (
                    contract.id,
                    FundingPoint {
                        rate: self.live_rate,
                        timestamp: now,
                    },
                )
            })
            .collect())
    }
}

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to test database");
    run_migrations(&pool).await.expect("migrations failed");
    pool
}

fn unique_section() -> String {
    format!("testvenue_{}", Uuid::new_v4().simple())
}

async fn contracts_for(pool: &PgPool, section: &str) -> Vec<Contract> {
    let mut uow = UnitOfWork::begin(pool).await.unwrap();
    let contracts = uow.contracts().get_by_section(section).await.unwrap();
    uow.commit().await.unwrap();
    contracts
}

async fn active_contracts_for(pool: &PgPool, section: &str) -> Vec<Contract> {
    let mut uow = UnitOfWork::begin(pool).await.unwrap();
    let contracts = uow
        .contracts()
        .get_active_by_section(section)
        .await
        .unwrap();
    uow.commit().await.unwrap();
    contracts
}

async fn historical_count(pool: &PgPool, contract_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM funding_rate_record WHERE contract_id = $1")
        .bind(contract_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore]
async fn delisted_contracts_flip_deprecated_and_back() {
    let pool = test_pool().await;
    let section = unique_section();
    let exchange = FakeExchange::new(&section);

    exchange.set_contracts(&["BTC", "ETH"]);
    register_contracts(&exchange, &section, &pool, None)
        .await
        .unwrap();
    assert_eq!(active_contracts_for(&pool, &section).await.len(), 2);

    // ETH disappears from the venue listing.
    exchange.set_contracts(&["BTC"]);
    register_contracts(&exchange, &section, &pool, None)
        .await
        .unwrap();

    let all = contracts_for(&pool, &section).await;
    assert_eq!(all.len(), 2);
    let eth = all.iter().find(|c| c.asset_name == "ETH").unwrap();
    assert!(eth.deprecated);
    let active = active_contracts_for(&pool, &section).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].asset_name, "BTC");

    // Relisting un-deprecates it.
    exchange.set_contracts(&["BTC", "ETH"]);
    register_contracts(&exchange, &section, &pool, None)
        .await
        .unwrap();
    assert_eq!(active_contracts_for(&pool, &section).await.len(), 2);
}

#[tokio::test]
#[ignore]
async fn empty_registry_response_leaves_store_untouched() {
    let pool = test_pool().await;
    let section = unique_section();
    let exchange = FakeExchange::new(&section);

    exchange.set_contracts(&["BTC"]);
    register_contracts(&exchange, &section, &pool, None)
        .await
        .unwrap();

    exchange.set_contracts(&[]);
    register_contracts(&exchange, &section, &pool, None)
        .await
        .unwrap();

    // Nothing was deprecated by the transient empty response.
    assert_eq!(active_contracts_for(&pool, &section).await.len(), 1);
}

#[tokio::test]
#[ignore]
async fn duplicate_point_insert_is_a_noop() {
    let pool = test_pool().await;
    let section = unique_section();
    let exchange = FakeExchange::new(&section);
    exchange.set_contracts(&["BTC"]);
    register_contracts(&exchange, &section, &pool, None)
        .await
        .unwrap();
    let contract = contracts_for(&pool, &section).await.remove(0);

    let point = funding_harvester::model::HistoricalFundingPoint {
        contract_id: contract.id,
        timestamp: Utc::now() - TimeDelta::hours(1),
        funding_rate: dec!(0.0001),
    };

    for _ in 0..2 {
        let mut uow = UnitOfWork::begin(&pool).await.unwrap();
        uow.historical()
            .bulk_insert_ignore(std::slice::from_ref(&point))
            .await
            .unwrap();
        uow.commit().await.unwrap();
    }

    assert_eq!(historical_count(&pool, contract.id).await, 1);
}

#[tokio::test]
#[ignore]
async fn backfill_walks_to_exhaustion_and_marks_synced() {
    let pool = test_pool().await;
    let section = unique_section();
    let exchange = FakeExchange::new(&section);
    exchange.set_contracts(&["BTC"]);
    register_contracts(&exchange, &section, &pool, None)
        .await
        .unwrap();
    let contract = contracts_for(&pool, &section).await.remove(0);
    assert!(!contract.synced);

    let base = Utc::now() - TimeDelta::hours(48);
    let page = |offset: i64| {
        vec![
            FundingPoint {
                rate: dec!(0.0001),
                timestamp: base - TimeDelta::hours(offset),
            },
            FundingPoint {
                rate: dec!(0.0002),
                timestamp: base - TimeDelta::hours(offset + 8),
            },
        ]
    };
    *exchange.backfill_pages.lock().unwrap() = VecDeque::from(vec![page(0), page(16)]);

    let points = sync_contract(&exchange, &contract, &pool).await.unwrap();
    assert_eq!(points, 4);
    assert_eq!(historical_count(&pool, contract.id).await, 4);

    let synced = contracts_for(&pool, &section).await.remove(0);
    assert!(synced.synced);

    // A synced contract short-circuits.
    exchange.backfill_pages.lock().unwrap().push_back(page(32));
    assert_eq!(sync_contract(&exchange, &synced, &pool).await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn forward_update_respects_funding_interval() {
    let pool = test_pool().await;
    let section = unique_section();
    let mut exchange = FakeExchange::new(&section);
    exchange.set_contracts(&["BTC"]);
    register_contracts(&exchange, &section, &pool, None)
        .await
        .unwrap();
    let contract = contracts_for(&pool, &section).await.remove(0);

    // Newest stored point two hours old on an 8h interval: skip.
    let recent = funding_harvester::model::HistoricalFundingPoint {
        contract_id: contract.id,
        timestamp: Utc::now() - TimeDelta::hours(2),
        funding_rate: dec!(0.0001),
    };
    let mut uow = UnitOfWork::begin(&pool).await.unwrap();
    uow.historical()
        .bulk_insert_ignore(std::slice::from_ref(&recent))
        .await
        .unwrap();
    uow.commit().await.unwrap();

    exchange.forward_points = vec![FundingPoint {
        rate: dec!(0.0003),
        timestamp: Utc::now() - TimeDelta::hours(1),
    }];
    assert_eq!(update_contract(&exchange, &contract, &pool).await.unwrap(), 0);
    assert_eq!(historical_count(&pool, contract.id).await, 1);

    // Age the stored point past the interval: the update fires.
    sqlx::query("UPDATE funding_rate_record SET timestamp = $1 WHERE contract_id = $2")
        .bind(Utc::now() - TimeDelta::hours(9))
        .bind(contract.id)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(update_contract(&exchange, &contract, &pool).await.unwrap(), 1);
    assert_eq!(historical_count(&pool, contract.id).await, 2);
}

#[tokio::test]
#[ignore]
async fn live_collection_appends_samples_for_active_contracts() {
    let pool = test_pool().await;
    let section = unique_section();
    let exchange = FakeExchange::new(&section);
    exchange.set_contracts(&["BTC", "ETH"]);
    register_contracts(&exchange, &section, &pool, None)
        .await
        .unwrap();

    collect_live(&exchange, &section, &pool).await.unwrap();

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM unsettled_funding_rate_record r \
         JOIN contract c ON c.id = r.contract_id WHERE c.section_name = $1",
    )
    .bind(&section)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
#[ignore]
async fn materialized_view_refresh_round_trips() {
    let pool = test_pool().await;
    let section = unique_section();
    let exchange = FakeExchange::new(&section);
    exchange.set_contracts(&["BTC"]);

    let refresher = MaterializedViewRefresher::new(pool.clone(), 0);
    register_contracts(&exchange, &section, &pool, Some(&refresher))
        .await
        .unwrap();

    refresher.check_and_refresh_if_needed().await;

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM contract_enriched WHERE section_name = $1")
            .bind(&section)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

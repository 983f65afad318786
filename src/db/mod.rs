//! PostgreSQL/TimescaleDB access.
//!
//! `connect_pool` builds the process-wide pool; [`UnitOfWork`] scopes one
//! transaction around a set of repository handles.

mod uow;

use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use uow::{
    AssetRepo, ContractRepo, HistoricalRepo, LiveRepo, QuoteRepo, SectionRepo, UnitOfWork,
};

/// Steady-state connection count kept open.
const POOL_MIN_CONNECTIONS: u32 = 30;
/// Burst ceiling during backfill fan-out.
const POOL_MAX_CONNECTIONS: u32 = 200;

/// Connect the process-wide pool.
pub async fn connect_pool(db_connection: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .min_connections(POOL_MIN_CONNECTIONS)
        .max_connections(POOL_MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(30))
        .test_before_acquire(true)
        .connect(db_connection)
        .await
        .context("failed to connect to database")
}

/// Apply the bundled schema migrations.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to run database migrations")
}

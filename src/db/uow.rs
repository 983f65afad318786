//! Scoped transactional unit of work.
//!
//! One [`UnitOfWork`] owns one transaction. Repository handles borrow that
//! transaction, so every statement issued through them commits or rolls back
//! together. Dropping an uncommitted unit of work rolls the transaction back;
//! sqlx queues that rollback on the connection itself, so a task cancelled
//! mid-teardown cannot leak a dirty connection back into the pool.
//!
//! Transactions are held only for database statements, never across upstream
//! HTTP calls.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::model::{Asset, Contract, HistoricalFundingPoint, LiveFundingPoint, Quote, Section};

/// Rows per INSERT statement.
const INSERT_CHUNK_SIZE: usize = 1000;

pub struct UnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl UnitOfWork {
    /// Open a new transaction on the pool.
    pub async fn begin(pool: &PgPool) -> sqlx::Result<Self> {
        Ok(Self {
            tx: pool.begin().await?,
        })
    }

    pub async fn commit(self) -> sqlx::Result<()> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> sqlx::Result<()> {
        self.tx.rollback().await
    }

    pub fn assets(&mut self) -> AssetRepo<'_> {
        AssetRepo { tx: &mut self.tx }
    }

    pub fn quotes(&mut self) -> QuoteRepo<'_> {
        QuoteRepo { tx: &mut self.tx }
    }

    pub fn sections(&mut self) -> SectionRepo<'_> {
        SectionRepo { tx: &mut self.tx }
    }

    pub fn contracts(&mut self) -> ContractRepo<'_> {
        ContractRepo { tx: &mut self.tx }
    }

    pub fn historical(&mut self) -> HistoricalRepo<'_> {
        HistoricalRepo { tx: &mut self.tx }
    }

    pub fn live(&mut self) -> LiveRepo<'_> {
        LiveRepo { tx: &mut self.tx }
    }
}

pub struct AssetRepo<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
}

impl AssetRepo<'_> {
    pub async fn bulk_insert_ignore(&mut self, records: &[Asset]) -> sqlx::Result<()> {
        for chunk in records.chunks(INSERT_CHUNK_SIZE) {
            let mut builder = QueryBuilder::new("INSERT INTO asset (name) ");
            builder.push_values(chunk, |mut row, asset| {
                row.push_bind(&asset.name);
            });
            builder.push(" ON CONFLICT (name) DO NOTHING");
            builder.build().execute(&mut **self.tx).await?;
        }
        Ok(())
    }
}

pub struct QuoteRepo<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
}

impl QuoteRepo<'_> {
    pub async fn bulk_insert_ignore(&mut self, records: &[Quote]) -> sqlx::Result<()> {
        for chunk in records.chunks(INSERT_CHUNK_SIZE) {
            let mut builder = QueryBuilder::new("INSERT INTO quote (name) ");
            builder.push_values(chunk, |mut row, quote| {
                row.push_bind(&quote.name);
            });
            builder.push(" ON CONFLICT (name) DO NOTHING");
            builder.build().execute(&mut **self.tx).await?;
        }
        Ok(())
    }
}

pub struct SectionRepo<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
}

impl SectionRepo<'_> {
    pub async fn bulk_insert_ignore(&mut self, records: &[Section]) -> sqlx::Result<()> {
        for chunk in records.chunks(INSERT_CHUNK_SIZE) {
            let mut builder = QueryBuilder::new("INSERT INTO section (name, special_fields) ");
            builder.push_values(chunk, |mut row, section| {
                row.push_bind(&section.name);
                row.push_bind(&section.special_fields);
            });
            builder.push(" ON CONFLICT (name) DO NOTHING");
            builder.build().execute(&mut **self.tx).await?;
        }
        Ok(())
    }
}

pub struct ContractRepo<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
}

impl ContractRepo<'_> {
    /// Insert fresh contracts, updating `funding_interval` and `deprecated`
    /// on conflict with the `(asset_name, section_name, quote_name)` key.
    pub async fn upsert_many(&mut self, records: &[Contract]) -> sqlx::Result<()> {
        for chunk in records.chunks(INSERT_CHUNK_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO contract \
                 (id, asset_name, quote_name, section_name, funding_interval, deprecated, synced) ",
            );
            builder.push_values(chunk, |mut row, contract| {
                row.push_bind(contract.id);
                row.push_bind(&contract.asset_name);
                row.push_bind(&contract.quote_name);
                row.push_bind(&contract.section_name);
                row.push_bind(contract.funding_interval);
                row.push_bind(contract.deprecated);
                row.push_bind(contract.synced);
            });
            builder.push(
                " ON CONFLICT (asset_name, section_name, quote_name) DO UPDATE SET \
                 funding_interval = EXCLUDED.funding_interval, \
                 deprecated = EXCLUDED.deprecated",
            );
            builder.build().execute(&mut **self.tx).await?;
        }
        Ok(())
    }

    pub async fn get_by_section(&mut self, section_name: &str) -> sqlx::Result<Vec<Contract>> {
        sqlx::query_as(
            "SELECT id, asset_name, quote_name, section_name, funding_interval, deprecated, synced \
             FROM contract WHERE section_name = $1",
        )
        .bind(section_name)
        .fetch_all(&mut **self.tx)
        .await
    }

    /// Non-deprecated contracts only.
    pub async fn get_active_by_section(
        &mut self,
        section_name: &str,
    ) -> sqlx::Result<Vec<Contract>> {
        sqlx::query_as(
            "SELECT id, asset_name, quote_name, section_name, funding_interval, deprecated, synced \
             FROM contract WHERE section_name = $1 AND deprecated = FALSE",
        )
        .bind(section_name)
        .fetch_all(&mut **self.tx)
        .await
    }

    /// Flag deprecated by primary key.
    pub async fn set_deprecated(&mut self, ids: &[Uuid], deprecated: bool) -> sqlx::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE contract SET deprecated = $1 WHERE id = ANY($2)")
            .bind(deprecated)
            .bind(ids)
            .execute(&mut **self.tx)
            .await?;
        Ok(())
    }

    /// Mark a contract's backfill as complete. The row is re-addressed by
    /// primary key because it was loaded in an earlier, already-closed
    /// transaction.
    pub async fn mark_synced(&mut self, contract_id: Uuid) -> sqlx::Result<()> {
        sqlx::query("UPDATE contract SET synced = TRUE WHERE id = $1")
            .bind(contract_id)
            .execute(&mut **self.tx)
            .await?;
        Ok(())
    }
}

pub struct HistoricalRepo<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
}

impl HistoricalRepo<'_> {
    pub async fn bulk_insert_ignore(
        &mut self,
        records: &[HistoricalFundingPoint],
    ) -> sqlx::Result<()> {
        for chunk in records.chunks(INSERT_CHUNK_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO funding_rate_record (contract_id, timestamp, funding_rate) ",
            );
            builder.push_values(chunk, |mut row, point| {
                row.push_bind(point.contract_id);
                row.push_bind(point.timestamp);
                row.push_bind(point.funding_rate);
            });
            builder.push(" ON CONFLICT (contract_id, timestamp) DO NOTHING");
            builder.build().execute(&mut **self.tx).await?;
        }
        Ok(())
    }

    pub async fn get_oldest_for_contract(
        &mut self,
        contract_id: Uuid,
    ) -> sqlx::Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            "SELECT timestamp FROM funding_rate_record \
             WHERE contract_id = $1 ORDER BY timestamp ASC LIMIT 1",
        )
        .bind(contract_id)
        .fetch_optional(&mut **self.tx)
        .await
    }

    pub async fn get_newest_for_contract(
        &mut self,
        contract_id: Uuid,
    ) -> sqlx::Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            "SELECT timestamp FROM funding_rate_record \
             WHERE contract_id = $1 ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(contract_id)
        .fetch_optional(&mut **self.tx)
        .await
    }
}

pub struct LiveRepo<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
}

impl LiveRepo<'_> {
    pub async fn bulk_insert_ignore(&mut self, records: &[LiveFundingPoint]) -> sqlx::Result<()> {
        for chunk in records.chunks(INSERT_CHUNK_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO unsettled_funding_rate_record (contract_id, timestamp, funding_rate) ",
            );
            builder.push_values(chunk, |mut row, point| {
                row.push_bind(point.contract_id);
                row.push_bind(point.timestamp);
                row.push_bind(point.funding_rate);
            });
            builder.push(" ON CONFLICT (contract_id, timestamp) DO NOTHING");
            builder.build().execute(&mut **self.tx).await?;
        }
        Ok(())
    }
}

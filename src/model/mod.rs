//! Persistent rows and adapter data transfer types.
//!
//! Dimension rows (`Asset`, `Quote`, `Section`, `Contract`) are slow-changing
//! and process-global. Funding points are append-only facts living in
//! TimescaleDB hypertables keyed by `(contract_id, timestamp)`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Base instrument identifier (e.g. `BTC`). Name is the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, FromRow)]
pub struct Asset {
    pub name: String,
}

/// Quote currency identifier (e.g. `USDT`, `USD`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, FromRow)]
pub struct Quote {
    pub name: String,
}

/// An exchange. Carries an opaque JSON settings blob.
#[derive(Debug, Clone, FromRow)]
pub struct Section {
    pub name: String,
    pub special_fields: Value,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            special_fields: Value::Object(Default::default()),
        }
    }
}

/// A perpetual contract listed on one section.
///
/// Identified by the unique triple `(asset_name, section_name, quote_name)`;
/// the surrogate UUID keeps the hypertable foreign keys narrow.
#[derive(Debug, Clone, FromRow)]
pub struct Contract {
    pub id: Uuid,
    pub asset_name: String,
    pub quote_name: String,
    pub section_name: String,
    /// Hours between funding settlements.
    pub funding_interval: i32,
    /// True once the venue no longer lists this contract.
    pub deprecated: bool,
    /// True once backfill has reached the venue's earliest record.
    pub synced: bool,
}

/// A settled funding rate, composite-keyed by `(contract_id, timestamp)`.
#[derive(Debug, Clone, FromRow)]
pub struct HistoricalFundingPoint {
    pub contract_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub funding_rate: Decimal,
}

/// An unsettled funding-rate sample, appended roughly once per minute.
#[derive(Debug, Clone, FromRow)]
pub struct LiveFundingPoint {
    pub contract_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub funding_rate: Decimal,
}

/// One active perpetual listing as reported by a venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractInfo {
    pub asset_name: String,
    pub quote: String,
    /// Hours between funding payments.
    pub funding_interval: i32,
    pub section_name: String,
}

/// A single funding rate observation returned by an adapter.
///
/// `rate` is in decimal form: 0.0001 == 0.01%.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingPoint {
    pub rate: Decimal,
    pub timestamp: DateTime<Utc>,
}

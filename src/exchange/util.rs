//! Shared helpers for venue adapters.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use futures_util::{stream, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use tracing::warn;
use uuid::Uuid;

use super::Exchange;
use crate::model::{Contract, FundingPoint};

/// Concurrent single-contract requests per venue.
const LIVE_FAN_OUT: usize = 10;

/// Fetch live rates with one HTTP call per contract, at most [`LIVE_FAN_OUT`]
/// in flight. Per-contract failures are logged and dropped from the result so
/// one broken symbol never poisons the batch.
pub async fn fetch_live_parallel<E: Exchange + ?Sized>(
    exchange: &E,
    contracts: &[Contract],
) -> Result<HashMap<Uuid, FundingPoint>> {
    let samples: Vec<Option<(Uuid, FundingPoint)>> = stream::iter(contracts.to_vec())
        .map(|contract| fetch_one(exchange, contract))
        .buffer_unordered(LIVE_FAN_OUT)
        .collect()
        .await;

    Ok(samples.into_iter().flatten().collect())
}

async fn fetch_one<E: Exchange + ?Sized>(
    exchange: &E,
    contract: Contract,
) -> Option<(Uuid, FundingPoint)> {
    match exchange.fetch_live_single(&contract).await {
        Ok(point) => Some((contract.id, point)),
        Err(err) => {
            warn!(
                exchange = exchange.id(),
                asset = %contract.asset_name,
                "failed to fetch live rate: {err:#}"
            );
            None
        }
    }
}

/// Millisecond epoch to UTC datetime.
pub fn dt_from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .with_context(|| format!("millisecond timestamp {ms} out of range"))
}

/// Second epoch to UTC datetime.
pub fn dt_from_secs(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .with_context(|| format!("second timestamp {secs} out of range"))
}

/// Parse an ISO-8601 timestamp, with or without an offset.
pub fn parse_iso(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(value) {
        return Ok(with_offset.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .with_context(|| format!("unparseable timestamp {value:?}"))
}

/// Truncate to the containing hour.
pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::hours(1))
        .expect("hour truncation cannot overflow for valid timestamps")
}

/// Deserialize a decimal that a venue may encode as a JSON string or number.
pub fn flexible_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text.parse().map_err(D::Error::custom),
        Raw::Number(number) => number.to_string().parse().map_err(D::Error::custom),
    }
}

/// Like [`flexible_decimal`], tolerating absent or null fields.
pub fn flexible_decimal_opt<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Text(text)) if text.is_empty() => Ok(None),
        Some(Raw::Text(text)) => text.parse().map(Some).map_err(D::Error::custom),
        Some(Raw::Number(number)) => number
            .to_string()
            .parse()
            .map(Some)
            .map_err(D::Error::custom),
    }
}

/// Project an all-markets response onto the requested contracts by venue
/// symbol. Contracts whose symbol the venue did not report are dropped.
pub fn project_by_symbol<E: Exchange + ?Sized>(
    exchange: &E,
    contracts: &[Contract],
    mut all_rates: HashMap<String, FundingPoint>,
) -> HashMap<Uuid, FundingPoint> {
    contracts
        .iter()
        .filter_map(|contract| {
            all_rates
                .remove(&exchange.format_symbol(contract))
                .map(|point| (contract.id, point))
        })
        .collect()
}

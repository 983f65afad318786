//! Paradex adapter.
//!
//! The venue emits a funding record roughly every five seconds, each carrying
//! a cumulative 8-hour rate. Settled points are produced by bucketing raw
//! records into wall-clock hours, averaging within the bucket and dividing by
//! eight; the bucket is labelled with the end of its hour. Six hours per
//! request (~4320 raw records) stays under the 5000 record page limit.
//!
//! The live sampler feeds a per-contract cache keyed by hour start. The
//! forward history path consumes a cache entry on first use and only calls
//! the API for hours with fewer than 50 cached samples.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::util::{self, dt_from_ms, floor_to_hour};
use super::Exchange;
use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

const API_ENDPOINT: &str = "https://api.prod.paradex.trade/v1";
/// Cached samples required before an hour can settle without an API call.
const CACHE_SAMPLE_THRESHOLD: usize = 50;
/// The published rates cover an 8 hour funding period.
const FUNDING_PERIOD_HOURS: i64 = 8;

#[derive(Debug, Clone, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    results: Vec<Market>,
}

#[derive(Debug, Clone, Deserialize)]
struct Market {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    asset_kind: String,
    #[serde(default)]
    base_currency: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FundingDataResponse {
    #[serde(default)]
    results: Vec<RawFundingRecord>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawFundingRecord {
    #[serde(deserialize_with = "util::flexible_decimal")]
    funding_rate: Decimal,
    created_at: i64,
}

pub struct Paradex {
    http: HttpClient,
    base_url: String,
    /// contract id -> hour start (ms) -> raw 8h-period rates sampled that hour.
    live_cache: Mutex<HashMap<Uuid, HashMap<i64, Vec<Decimal>>>>,
}

impl Paradex {
    pub const ID: &'static str = "paradex";
    const FETCH_STEP_HOURS: i64 = 6;

    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, API_ENDPOINT)
    }

    pub fn with_base_url(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            live_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn funding_data(
        &self,
        symbol: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<RawFundingRecord>> {
        let mut full_query = vec![("market", symbol.to_string())];
        full_query.extend(query.iter().map(|(k, v)| (*k, v.clone())));

        let response: FundingDataResponse = serde_json::from_value(
            self.http
                .get_json(&format!("{}/funding/data", self.base_url), &full_query, &[])
                .await?,
        )?;
        Ok(response.results)
    }

    /// Bucket raw ~5 second records into hours, average each bucket and
    /// divide by the 8 hour funding period. Output points are labelled with
    /// the end of their hour and sorted chronologically.
    fn aggregate_to_hourly(records: &[RawFundingRecord]) -> Result<Vec<FundingPoint>> {
        let mut buckets: HashMap<i64, Vec<Decimal>> = HashMap::new();

        for record in records {
            let hour_end =
                floor_to_hour(dt_from_ms(record.created_at)?) + TimeDelta::hours(1);
            buckets
                .entry(hour_end.timestamp_millis())
                .or_default()
                .push(record.funding_rate);
        }

        let mut hour_ends: Vec<i64> = buckets.keys().copied().collect();
        hour_ends.sort_unstable();

        hour_ends
            .into_iter()
            .map(|hour_end_ms| {
                let rates = &buckets[&hour_end_ms];
                let average = rates.iter().sum::<Decimal>() / Decimal::from(rates.len());
                Ok(FundingPoint {
                    rate: average / Decimal::from(FUNDING_PERIOD_HOURS),
                    timestamp: dt_from_ms(hour_end_ms)?,
                })
            })
            .collect()
    }

    /// Remove and return the cached samples for one contract-hour.
    fn take_cached_hour(&self, contract_id: Uuid, hour_start_ms: i64) -> Option<Vec<Decimal>> {
        let mut cache = self.live_cache.lock().expect("live cache lock poisoned");
        cache.get_mut(&contract_id)?.remove(&hour_start_ms)
    }

    fn cache_sample(&self, contract_id: Uuid, hour_start_ms: i64, rate: Decimal) -> usize {
        let mut cache = self.live_cache.lock().expect("live cache lock poisoned");
        let bucket = cache
            .entry(contract_id)
            .or_default()
            .entry(hour_start_ms)
            .or_default();
        bucket.push(rate);
        bucket.len()
    }
}

#[async_trait]
impl Exchange for Paradex {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        format!("{}-USD-PERP", contract.asset_name)
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let response: MarketsResponse = serde_json::from_value(
            self.http
                .get_json(&format!("{}/markets", self.base_url), &[], &[])
                .await?,
        )?;

        Ok(response
            .results
            .into_iter()
            .filter(|market| {
                market.asset_kind == "PERP" && market.symbol.ends_with("-USD-PERP")
            })
            .map(|market| ContractInfo {
                asset_name: market.base_currency,
                quote: "USD".to_string(),
                // Raw records are aggregated to hourly points.
                funding_interval: 1,
                section_name: Self::ID.to_string(),
            })
            .collect())
    }

    async fn fetch_window(
        &self,
        _contract: &Contract,
        _start_ms: i64,
        _end_ms: i64,
    ) -> Result<Vec<FundingPoint>> {
        anyhow::bail!("{}: history is hour-aggregated, use the public methods", Self::ID)
    }

    async fn fetch_history_before(
        &self,
        contract: &Contract,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<FundingPoint>> {
        // Align to the hour so buckets are never split across requests.
        let end = floor_to_hour(before.unwrap_or_else(Utc::now));
        let start = end - TimeDelta::hours(Self::FETCH_STEP_HOURS);

        let symbol = self.format_symbol(contract);
        let records = self
            .funding_data(
                &symbol,
                &[
                    ("start_at", start.timestamp_millis().to_string()),
                    ("end_at", end.timestamp_millis().to_string()),
                    ("page_size", "5000".to_string()),
                ],
            )
            .await?;

        if records.is_empty() {
            return Ok(Vec::new());
        }

        let points = Self::aggregate_to_hourly(&records)?;
        debug!(
            exchange = Self::ID,
            symbol,
            raw = records.len(),
            hourly = points.len(),
            "aggregated funding history"
        );
        Ok(points)
    }

    async fn fetch_history_after(
        &self,
        contract: &Contract,
        after: DateTime<Utc>,
    ) -> Result<Vec<FundingPoint>> {
        let symbol = self.format_symbol(contract);
        let last_full_hour = floor_to_hour(Utc::now());

        let mut points = Vec::new();
        let mut hour_end = floor_to_hour(after) + TimeDelta::hours(1);

        while hour_end <= last_full_hour {
            let hour_start = hour_end - TimeDelta::hours(1);
            let hour_start_ms = hour_start.timestamp_millis();

            let cached = self.take_cached_hour(contract.id, hour_start_ms);
            match cached {
                Some(rates) if rates.len() >= CACHE_SAMPLE_THRESHOLD => {
                    let average = rates.iter().sum::<Decimal>() / Decimal::from(rates.len());
                    points.push(FundingPoint {
                        rate: average / Decimal::from(FUNDING_PERIOD_HOURS),
                        timestamp: hour_end,
                    });
                    debug!(
                        exchange = Self::ID,
                        symbol,
                        %hour_end,
                        samples = rates.len(),
                        "settled hour from live cache"
                    );
                }
                _ => {
                    let records = self
                        .funding_data(
                            &symbol,
                            &[
                                ("start_at", hour_start_ms.to_string()),
                                ("end_at", hour_end.timestamp_millis().to_string()),
                                ("page_size", "1000".to_string()),
                            ],
                        )
                        .await?;
                    points.extend(Self::aggregate_to_hourly(&records)?);
                }
            }

            hour_end += TimeDelta::hours(1);
        }

        Ok(points)
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        util::fetch_live_parallel(self, contracts).await
    }

    async fn fetch_live_single(&self, contract: &Contract) -> Result<FundingPoint> {
        let symbol = self.format_symbol(contract);
        let records = self
            .funding_data(&symbol, &[("page_size", "1".to_string())])
            .await?;

        let record = records
            .into_iter()
            .next()
            .with_context(|| format!("no funding rate data for {symbol}"))?;

        let now = Utc::now();
        let hour_start_ms = floor_to_hour(now).timestamp_millis();
        let samples = self.cache_sample(contract.id, hour_start_ms, record.funding_rate);

        debug!(
            exchange = Self::ID,
            symbol, samples, "cached live sample for the current hour"
        );

        Ok(FundingPoint {
            rate: record.funding_rate / Decimal::from(FUNDING_PERIOD_HOURS),
            timestamp: now,
        })
    }
}

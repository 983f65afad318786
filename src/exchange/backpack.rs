//! Backpack adapter.
//!
//! Every contract settles hourly and the funding endpoint has no record
//! limit, but it pages by *offset counted backward from now* in interval
//! units rather than by time: offset 0 is the not-yet-settled interval,
//! offset 1 the most recent settled one. Both history directions are
//! implemented directly on that scheme; the fetch step of 1000 hours is just
//! a convenient batch size.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::util::{self, parse_iso};
use super::Exchange;
use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

const API_ENDPOINT: &str = "https://api.backpack.exchange/api/v1";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Market {
    symbol: String,
    market_type: String,
    /// Milliseconds between settlements.
    #[serde(default)]
    funding_interval: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundingRecord {
    #[serde(deserialize_with = "util::flexible_decimal")]
    funding_rate: Decimal,
    interval_end_timestamp: String,
}

pub struct Backpack {
    http: HttpClient,
    base_url: String,
}

impl Backpack {
    pub const ID: &'static str = "backpack";
    const FETCH_STEP_HOURS: i64 = 1000;

    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, API_ENDPOINT)
    }

    pub fn with_base_url(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// The API accepts the symbol without the trailing interval qualifier.
    fn api_symbol(&self, contract: &Contract) -> String {
        format!("{}_{}_PERP", contract.asset_name, contract.quote_name)
    }

    async fn funding_page(
        &self,
        api_symbol: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FundingRecord>> {
        Ok(serde_json::from_value(
            self.http
                .get_json(
                    &format!("{}/fundingRates", self.base_url),
                    &[
                        ("symbol", api_symbol.to_string()),
                        ("limit", limit.to_string()),
                        ("offset", offset.to_string()),
                    ],
                    &[],
                )
                .await?,
        )?)
    }

    fn records_to_points(records: Vec<FundingRecord>) -> Result<Vec<FundingPoint>> {
        records
            .into_iter()
            .map(|record| {
                Ok(FundingPoint {
                    rate: record.funding_rate,
                    timestamp: parse_iso(&record.interval_end_timestamp)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Exchange for Backpack {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        format!(
            "{}_{}_PERP_{}",
            contract.asset_name, contract.quote_name, contract.funding_interval
        )
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let markets: Vec<Market> = serde_json::from_value(
            self.http
                .get_json(&format!("{}/markets", self.base_url), &[], &[])
                .await?,
        )?;

        markets
            .into_iter()
            .filter(|market| market.market_type == "PERP")
            .map(|market| {
                let mut parts = market.symbol.split('_');
                let asset = parts.next().context("market symbol missing asset part")?;
                let quote = parts.next().context("market symbol missing quote part")?;
                let interval_ms = market
                    .funding_interval
                    .with_context(|| format!("{}: missing fundingInterval", market.symbol))?;
                Ok(ContractInfo {
                    asset_name: asset.to_string(),
                    quote: quote.to_string(),
                    funding_interval: ((interval_ms as f64) / 3_600_000.0).round() as i32,
                    section_name: Self::ID.to_string(),
                })
            })
            .collect()
    }

    async fn fetch_window(
        &self,
        _contract: &Contract,
        _start_ms: i64,
        _end_ms: i64,
    ) -> Result<Vec<FundingPoint>> {
        bail!("{}: history is offset-paginated, not time-windowed", Self::ID)
    }

    async fn fetch_history_before(
        &self,
        contract: &Contract,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<FundingPoint>> {
        let interval_hours = i64::from(contract.funding_interval).max(1);
        let interval_secs = interval_hours * 3600;
        let end_time = before.unwrap_or_else(Utc::now);
        let now = Utc::now();

        // Offset 1 skips the still-accruing interval.
        let offset_end = 1 + (now - end_time).num_seconds().max(0) / interval_secs;
        let offset_start = offset_end + Self::FETCH_STEP_HOURS / interval_hours;

        let limit = offset_start - offset_end;
        if limit < 1 {
            return Ok(Vec::new());
        }

        let records = self
            .funding_page(&self.api_symbol(contract), limit, offset_end)
            .await?;
        Self::records_to_points(records)
    }

    async fn fetch_history_after(
        &self,
        contract: &Contract,
        after: DateTime<Utc>,
    ) -> Result<Vec<FundingPoint>> {
        let interval_secs = i64::from(contract.funding_interval).max(1) * 3600;
        let now = Utc::now();

        let offset_end = 1;
        let offset_start = 1 + (now - after).num_seconds().max(0) / interval_secs;

        let limit = offset_start - offset_end;
        if limit < 1 {
            return Ok(Vec::new());
        }

        let records = self
            .funding_page(&self.api_symbol(contract), limit, offset_end)
            .await?;

        Ok(Self::records_to_points(records)?
            .into_iter()
            .filter(|point| point.timestamp > after)
            .collect())
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        util::fetch_live_parallel(self, contracts).await
    }

    async fn fetch_live_single(&self, contract: &Contract) -> Result<FundingPoint> {
        let api_symbol = self.api_symbol(contract);
        let records: Vec<FundingRecord> = serde_json::from_value(
            self.http
                .get_json(
                    &format!("{}/fundingRates", self.base_url),
                    &[("symbol", api_symbol.clone()), ("limit", "1".to_string())],
                    &[],
                )
                .await?,
        )?;

        let record = records
            .into_iter()
            .next()
            .with_context(|| format!("no funding rate data for {api_symbol}"))?;

        Ok(FundingPoint {
            rate: record.funding_rate,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testutil::contract;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn symbol_carries_interval_qualifier() {
        let exchange = Backpack::new(HttpClient::new().unwrap());
        let c = contract("BTC", "USDC", "backpack", 1);
        assert_eq!(exchange.format_symbol(&c), "BTC_USDC_PERP_1");
        assert_eq!(exchange.api_symbol(&c), "BTC_USDC_PERP");
    }

    #[tokio::test]
    async fn interval_is_read_in_hours() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "BTC_USDC_PERP", "marketType": "PERP",
                 "fundingInterval": 3_600_000i64},
                {"symbol": "BTC_USDC", "marketType": "SPOT"}
            ])))
            .mount(&server)
            .await;

        let exchange = Backpack::with_base_url(HttpClient::new().unwrap(), server.uri());
        let contracts = exchange.get_contracts().await.unwrap();

        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].funding_interval, 1);
    }

    #[tokio::test]
    async fn forward_fetch_filters_boundary_points() {
        let server = MockServer::start().await;
        let after = Utc::now() - chrono::TimeDelta::hours(3);
        let older = (after - chrono::TimeDelta::hours(1)).to_rfc3339();
        let newer = (after + chrono::TimeDelta::hours(1)).to_rfc3339();

        Mock::given(method("GET"))
            .and(path("/fundingRates"))
            .and(query_param("offset", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"fundingRate": "0.0001", "intervalEndTimestamp": newer},
                {"fundingRate": "0.0002", "intervalEndTimestamp": older}
            ])))
            .mount(&server)
            .await;

        let exchange = Backpack::with_base_url(HttpClient::new().unwrap(), server.uri());
        let c = contract("BTC", "USDC", "backpack", 1);
        let points = exchange.fetch_history_after(&c, after).await.unwrap();

        assert_eq!(points.len(), 1);
        assert!(points[0].timestamp > after);
    }
}

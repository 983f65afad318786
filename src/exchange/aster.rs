//! Aster adapter.
//!
//! Binance-style API with per-symbol funding intervals (1, 4 or 8 hours) that
//! the venue never publishes directly. Discovery derives each interval from
//! the gap between the last settled funding time and `nextFundingTime`, with
//! at most ten probes in flight. History answers 1000 records; with the 8h
//! interval dominating, the fetch step is 8000 hours.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{stream, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::util::{self, dt_from_ms};
use super::Exchange;
use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

const API_ENDPOINT: &str = "https://fapi.asterdex.com/fapi";
/// Concurrent funding-interval probes during discovery.
const PROBE_FAN_OUT: usize = 10;

#[derive(Debug, Clone, Deserialize)]
struct ExchangeInfo {
    #[serde(default)]
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    contract_type: String,
    status: String,
    base_asset: String,
    quote_asset: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    symbol: String,
    next_funding_time: i64,
    #[serde(default, deserialize_with = "util::flexible_decimal_opt")]
    last_funding_rate: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundingRateRecord {
    #[serde(deserialize_with = "util::flexible_decimal")]
    funding_rate: Decimal,
    funding_time: i64,
}

pub struct Aster {
    http: HttpClient,
    base_url: String,
}

impl Aster {
    pub const ID: &'static str = "aster";
    const FETCH_STEP_HOURS: i64 = 8000;

    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, API_ENDPOINT)
    }

    pub fn with_base_url(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Derive the funding interval for one symbol from the distance between
    /// its last settled funding time and the published next one.
    async fn detect_funding_interval(
        &self,
        symbol: &str,
        next_funding_time: i64,
    ) -> Result<i32> {
        let records: Vec<FundingRateRecord> = serde_json::from_value(
            self.http
                .get_json(
                    &format!("{}/v1/fundingRate", self.base_url),
                    &[("symbol", symbol.to_string()), ("limit", "1".to_string())],
                    &[],
                )
                .await?,
        )?;

        let last = records
            .into_iter()
            .next()
            .with_context(|| format!("no settled funding data for {symbol}"))?;

        let interval_hours = (next_funding_time - last.funding_time) as f64 / 3_600_000.0;
        anyhow::ensure!(
            interval_hours > 0.0,
            "non-positive funding interval {interval_hours}h for {symbol}"
        );

        Ok((interval_hours.round() as i32).max(1))
    }
}

#[async_trait]
impl Exchange for Aster {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        format!("{}{}", contract.asset_name, contract.quote_name)
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let (exchange_info, premium): (ExchangeInfo, Vec<PremiumIndex>) = tokio::try_join!(
            async {
                Ok::<_, anyhow::Error>(serde_json::from_value(
                    self.http
                        .get_json(&format!("{}/v1/exchangeInfo", self.base_url), &[], &[])
                        .await?,
                )?)
            },
            async {
                Ok::<_, anyhow::Error>(serde_json::from_value(
                    self.http
                        .get_json(&format!("{}/v1/premiumIndex", self.base_url), &[], &[])
                        .await?,
                )?)
            },
        )?;

        let next_funding: HashMap<String, i64> = premium
            .into_iter()
            .map(|market| (market.symbol, market.next_funding_time))
            .collect();

        let candidates: Vec<(String, String, String, i64)> = exchange_info
            .symbols
            .into_iter()
            .filter(|s| s.contract_type == "PERPETUAL" && s.status == "TRADING")
            .filter_map(|s| {
                let symbol = format!("{}{}", s.base_asset, s.quote_asset);
                match next_funding.get(&symbol) {
                    Some(next) => Some((symbol, s.base_asset, s.quote_asset, *next)),
                    None => {
                        warn!(exchange = Self::ID, symbol, "symbol missing from premiumIndex");
                        None
                    }
                }
            })
            .collect();

        let contracts: Vec<ContractInfo> = stream::iter(candidates)
            .map(|(symbol, asset, quote, next)| async move {
                match self.detect_funding_interval(&symbol, next).await {
                    Ok(funding_interval) => Some(ContractInfo {
                        asset_name: asset,
                        quote,
                        funding_interval,
                        section_name: Self::ID.to_string(),
                    }),
                    Err(err) => {
                        warn!(
                            exchange = Self::ID,
                            symbol, "failed to derive funding interval: {err:#}"
                        );
                        None
                    }
                }
            })
            .buffer_unordered(PROBE_FAN_OUT)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        debug!(exchange = Self::ID, count = contracts.len(), "fetched contracts");
        Ok(contracts)
    }

    async fn fetch_window(
        &self,
        contract: &Contract,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingPoint>> {
        let records: Vec<FundingRateRecord> = serde_json::from_value(
            self.http
                .get_json(
                    &format!("{}/v1/fundingRate", self.base_url),
                    &[
                        ("symbol", self.format_symbol(contract)),
                        ("startTime", start_ms.to_string()),
                        ("endTime", end_ms.to_string()),
                        ("limit", "1000".to_string()),
                    ],
                    &[],
                )
                .await?,
        )?;

        records
            .into_iter()
            .map(|record| {
                Ok(FundingPoint {
                    rate: record.funding_rate,
                    timestamp: dt_from_ms(record.funding_time)?,
                })
            })
            .collect()
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        let markets: Vec<PremiumIndex> = serde_json::from_value(
            self.http
                .get_json(&format!("{}/v1/premiumIndex", self.base_url), &[], &[])
                .await?,
        )?;

        let now = Utc::now();
        let all_rates = markets
            .into_iter()
            .filter_map(|market| {
                market.last_funding_rate.map(|rate| {
                    (market.symbol, FundingPoint { rate, timestamp: now })
                })
            })
            .collect();

        Ok(util::project_by_symbol(self, contracts, all_rates))
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
    fn symbol_is_binance_style() {
        let exchange = Aster::new(HttpClient::new().unwrap());
        let c = contract("BTC", "USDT", "aster", 8);
        assert_eq!(exchange.format_symbol(&c), "BTCUSDT");
    }

    #[tokio::test]
    async fn interval_is_derived_per_symbol() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/exchangeInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "symbols": [
                    {"contractType": "PERPETUAL", "status": "TRADING",
                     "baseAsset": "BTC", "quoteAsset": "USDT"},
                    {"contractType": "PERPETUAL", "status": "TRADING",
                     "baseAsset": "ETH", "quoteAsset": "USDT"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/premiumIndex"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "BTCUSDT", "nextFundingTime": 28_800_000i64,
                 "lastFundingRate": "0.0001"},
                {"symbol": "ETHUSDT", "nextFundingTime": 14_400_000i64,
                 "lastFundingRate": "0.0001"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/fundingRate"))
            .and(query_param("symbol", "BTCUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"fundingRate": "0.0001", "fundingTime": 0i64}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/fundingRate"))
            .and(query_param("symbol", "ETHUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"fundingRate": "0.0001", "fundingTime": 0i64}
            ])))
            .mount(&server)
            .await;

        let exchange = Aster::with_base_url(HttpClient::new().unwrap(), server.uri());
        let mut contracts = exchange.get_contracts().await.unwrap();
        contracts.sort_by(|a, b| a.asset_name.cmp(&b.asset_name));

        assert_eq!(contracts.len(), 2);
        assert_eq!(contracts[0].asset_name, "BTC");
        assert_eq!(contracts[0].funding_interval, 8);
        assert_eq!(contracts[1].asset_name, "ETH");
        assert_eq!(contracts[1].funding_interval, 4);
    }
}

//! Binance USDⓈ-M adapter.
//!
//! Mixed funding intervals (1-8h) read from the secondary `fundingInfo`
//! endpoint, defaulting to 8h when a symbol is absent there. The history API
//! answers at most 1000 records; with the 1h minimum interval the fetch step
//! is 1000 hours.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::util::{self, dt_from_ms};
use super::Exchange;
use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

const API_ENDPOINT: &str = "https://fapi.binance.com/fapi";

#[derive(Debug, Clone, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    contract_type: String,
    base_asset: String,
    quote_asset: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundingInfo {
    symbol: String,
    funding_interval_hours: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundingRateRecord {
    #[serde(with = "rust_decimal::serde::str")]
    funding_rate: Decimal,
    funding_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    symbol: String,
    #[serde(deserialize_with = "util::flexible_decimal")]
    last_funding_rate: Decimal,
}

pub struct BinanceUsdm {
    http: HttpClient,
    base_url: String,
}

impl BinanceUsdm {
    pub const ID: &'static str = "binance_usd-m";
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
}

#[async_trait]
impl Exchange for BinanceUsdm {
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
        let exchange_info: ExchangeInfo = serde_json::from_value(
            self.http
                .get_json(&format!("{}/v1/exchangeInfo", self.base_url), &[], &[])
                .await?,
        )?;
        let funding_info: Vec<FundingInfo> = serde_json::from_value(
            self.http
                .get_json(&format!("{}/v1/fundingInfo", self.base_url), &[], &[])
                .await?,
        )?;

        let intervals: HashMap<String, i32> = funding_info
            .into_iter()
            .map(|info| (info.symbol, info.funding_interval_hours))
            .collect();

        let contracts = exchange_info
            .symbols
            .into_iter()
            .filter(|instrument| instrument.contract_type == "PERPETUAL")
            .map(|instrument| ContractInfo {
                funding_interval: intervals.get(&instrument.symbol).copied().unwrap_or(8),
                asset_name: instrument.base_asset,
                quote: instrument.quote_asset,
                section_name: Self::ID.to_string(),
            })
            .collect::<Vec<_>>();

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
            .map(|market| {
                (
                    market.symbol,
                    FundingPoint {
                        rate: market.last_funding_rate,
                        timestamp: now,
                    },
                )
            })
            .collect();

        Ok(util::project_by_symbol(self, contracts, all_rates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testutil::contract;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::new().unwrap()
    }

    #[test]
    fn symbol_concatenates_asset_and_quote() {
        let exchange = BinanceUsdm::new(client());
        let c = contract("BTC", "USDT", "binance_usd-m", 8);
        assert_eq!(exchange.format_symbol(&c), "BTCUSDT");
    }

    #[tokio::test]
    async fn intervals_come_from_funding_info_with_8h_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/exchangeInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "symbols": [
                    {"symbol": "BTCUSDT", "contractType": "PERPETUAL",
                     "baseAsset": "BTC", "quoteAsset": "USDT"},
                    {"symbol": "SOLUSDT", "contractType": "PERPETUAL",
                     "baseAsset": "SOL", "quoteAsset": "USDT"},
                    {"symbol": "BTCUSDT_240628", "contractType": "CURRENT_QUARTER",
                     "baseAsset": "BTC", "quoteAsset": "USDT"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/fundingInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "SOLUSDT", "fundingIntervalHours": 4}
            ])))
            .mount(&server)
            .await;

        let exchange = BinanceUsdm::with_base_url(client(), server.uri());
        let contracts = exchange.get_contracts().await.unwrap();

        assert_eq!(contracts.len(), 2);
        let btc = contracts.iter().find(|c| c.asset_name == "BTC").unwrap();
        assert_eq!(btc.funding_interval, 8);
        let sol = contracts.iter().find(|c| c.asset_name == "SOL").unwrap();
        assert_eq!(sol.funding_interval, 4);
    }

    #[tokio::test]
    async fn fetch_window_parses_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/fundingRate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "BTCUSDT", "fundingRate": "0.00010000", "fundingTime": 1717200000000i64}
            ])))
            .mount(&server)
            .await;

        let exchange = BinanceUsdm::with_base_url(client(), server.uri());
        let c = contract("BTC", "USDT", "binance_usd-m", 8);
        let points = exchange.fetch_window(&c, 0, 1717200000000).await.unwrap();

        assert_eq!(points.len(), 1);
        assert_eq!(points[0].rate, dec!(0.0001));
    }
}

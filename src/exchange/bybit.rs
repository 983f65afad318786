//! Bybit adapter.
//!
//! Linear perpetuals quoted in USDT and USDC; the USDC symbols carry a `PERP`
//! suffix instead of the quote. History answers at most 200 records with a 1h
//! minimum interval, so the fetch step is 198 hours. Contract discovery pages
//! through `nextPageCursor` until exhaustion; live rates come from the batch
//! tickers endpoint.

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

const API_ENDPOINT: &str = "https://api.bybit.com";

#[derive(Debug, Clone, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentsPage {
    list: Vec<Instrument>,
    #[serde(default)]
    next_page_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instrument {
    contract_type: String,
    base_coin: String,
    quote_coin: String,
    /// Minutes between settlements.
    funding_interval: i32,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryResult {
    #[serde(default)]
    list: Vec<HistoryRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(with = "rust_decimal::serde::str")]
    funding_rate: Decimal,
    funding_rate_timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TickersResult {
    list: Vec<Ticker>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    symbol: String,
    #[serde(default, deserialize_with = "util::flexible_decimal_opt")]
    funding_rate: Option<Decimal>,
}

pub struct Bybit {
    http: HttpClient,
    base_url: String,
}

impl Bybit {
    pub const ID: &'static str = "bybit";
    const FETCH_STEP_HOURS: i64 = 198;

    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, API_ENDPOINT)
    }

    pub fn with_base_url(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn quote_suffix(quote: &str) -> &str {
        match quote {
            "USDT" => "USDT",
            "USDC" => "PERP",
            other => other,
        }
    }
}

#[async_trait]
impl Exchange for Bybit {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        format!(
            "{}{}",
            contract.asset_name,
            Self::quote_suffix(&contract.quote_name)
        )
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let mut instruments = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![("category", "linear".to_string())];
            if let Some(cursor) = &cursor {
                query.push(("cursor", cursor.clone()));
            }

            let page: Envelope<InstrumentsPage> = serde_json::from_value(
                self.http
                    .get_json(
                        &format!("{}/v5/market/instruments-info", self.base_url),
                        &query,
                        &[],
                    )
                    .await?,
            )?;

            instruments.extend(page.result.list);

            match page.result.next_page_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        let contracts = instruments
            .into_iter()
            .filter(|instrument| instrument.contract_type == "LinearPerpetual")
            .map(|instrument| ContractInfo {
                asset_name: instrument.base_coin,
                quote: instrument.quote_coin,
                funding_interval: instrument.funding_interval / 60,
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
        let response: Envelope<HistoryResult> = serde_json::from_value(
            self.http
                .get_json(
                    &format!("{}/v5/market/funding/history", self.base_url),
                    &[
                        ("symbol", self.format_symbol(contract)),
                        ("category", "linear".to_string()),
                        ("startTime", start_ms.to_string()),
                        ("endTime", end_ms.to_string()),
                    ],
                    &[],
                )
                .await?,
        )?;

        response
            .result
            .list
            .into_iter()
            .map(|record| {
                let ms: i64 = record.funding_rate_timestamp.parse()?;
                Ok(FundingPoint {
                    rate: record.funding_rate,
                    timestamp: dt_from_ms(ms)?,
                })
            })
            .collect()
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        let response: Envelope<TickersResult> = serde_json::from_value(
            self.http
                .get_json(
                    &format!("{}/v5/market/tickers", self.base_url),
                    &[("category", "linear".to_string())],
                    &[],
                )
                .await?,
        )?;

        let now = Utc::now();
        let all_rates = response
            .result
            .list
            .into_iter()
            .filter_map(|ticker| {
                // Expiring futures report an empty funding rate.
                ticker
                    .funding_rate
                    .map(|rate| (ticker.symbol, FundingPoint { rate, timestamp: now }))
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
    fn quote_conditioned_suffix() {
        let exchange = Bybit::new(HttpClient::new().unwrap());
        assert_eq!(
            exchange.format_symbol(&contract("BTC", "USDT", "bybit", 8)),
            "BTCUSDT"
        );
        assert_eq!(
            exchange.format_symbol(&contract("BTC", "USDC", "bybit", 8)),
            "BTCPERP"
        );
    }

    #[tokio::test]
    async fn discovery_exhausts_cursor_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .and(query_param("cursor", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "list": [
                        {"contractType": "LinearPerpetual", "baseCoin": "ETH",
                         "quoteCoin": "USDT", "fundingInterval": 480}
                    ],
                    "nextPageCursor": ""
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "list": [
                        {"contractType": "LinearPerpetual", "baseCoin": "BTC",
                         "quoteCoin": "USDT", "fundingInterval": 60}
                    ],
                    "nextPageCursor": "page2"
                }
            })))
            .mount(&server)
            .await;

        let exchange = Bybit::with_base_url(HttpClient::new().unwrap(), server.uri());
        let contracts = exchange.get_contracts().await.unwrap();

        assert_eq!(contracts.len(), 2);
        assert_eq!(contracts[0].asset_name, "BTC");
        assert_eq!(contracts[0].funding_interval, 1);
        assert_eq!(contracts[1].asset_name, "ETH");
        assert_eq!(contracts[1].funding_interval, 8);
    }
}

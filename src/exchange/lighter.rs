//! Lighter adapter.
//!
//! Hourly funding with a 500 record history limit (fetch step 498 hours).
//! The venue addresses markets by numeric id, remembered here from contract
//! discovery. Rates are published in percent and converted to decimal form.
//! Live rates arrive over a WebSocket: one subscribe frame, one stats frame.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::util::{self, dt_from_secs};
use super::Exchange;
use crate::http::{ws_request_once, HttpClient};
use crate::model::{Contract, ContractInfo, FundingPoint};

const API_ENDPOINT: &str = "https://mainnet.zklighter.elliot.ai/api/v1";
const WS_ENDPOINT: &str = "wss://mainnet.zklighter.elliot.ai/stream";

#[derive(Debug, Clone, Deserialize)]
struct OrderBooksResponse {
    #[serde(default)]
    order_books: Vec<OrderBook>,
}

#[derive(Debug, Clone, Deserialize)]
struct OrderBook {
    symbol: String,
    market_type: String,
    market_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct FundingsResponse {
    #[serde(default)]
    fundings: Vec<FundingRecord>,
}

#[derive(Debug, Clone, Deserialize)]
struct FundingRecord {
    #[serde(deserialize_with = "util::flexible_decimal")]
    rate: Decimal,
    direction: String,
    timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct MarketStatsFrame {
    #[serde(default)]
    market_stats: HashMap<String, MarketStats>,
}

#[derive(Debug, Clone, Deserialize)]
struct MarketStats {
    #[serde(default, deserialize_with = "util::flexible_decimal_opt")]
    current_funding_rate: Option<Decimal>,
}

pub struct Lighter {
    http: HttpClient,
    base_url: String,
    ws_url: String,
    /// Asset name -> market id, filled by contract discovery.
    market_ids: RwLock<HashMap<String, i64>>,
}

impl Lighter {
    pub const ID: &'static str = "lighter";
    const FETCH_STEP_HOURS: i64 = 498;

    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, API_ENDPOINT, WS_ENDPOINT)
    }

    pub fn with_base_url(
        http: HttpClient,
        base_url: impl Into<String>,
        ws_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            ws_url: ws_url.into(),
            market_ids: RwLock::new(HashMap::new()),
        }
    }

    fn market_id(&self, contract: &Contract) -> Option<i64> {
        self.market_ids
            .read()
            .expect("market id map lock poisoned")
            .get(&contract.asset_name)
            .copied()
    }

    /// Percent to decimal form, signed by settlement direction.
    fn normalize_rate(record: &FundingRecord) -> Decimal {
        let rate = record.rate / Decimal::ONE_HUNDRED;
        if record.direction == "short" {
            -rate
        } else {
            rate
        }
    }
}

#[async_trait]
impl Exchange for Lighter {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        match self.market_id(contract) {
            Some(id) => id.to_string(),
            // Discovery has not run yet; the asset name at least identifies
            // the contract in logs.
            None => contract.asset_name.clone(),
        }
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let response: OrderBooksResponse = serde_json::from_value(
            self.http
                .get_json(&format!("{}/orderBooks", self.base_url), &[], &[])
                .await?,
        )?;

        let mut ids = HashMap::new();
        let contracts = response
            .order_books
            .into_iter()
            .filter(|market| market.market_type == "perp")
            .map(|market| {
                ids.insert(market.symbol.clone(), market.market_id);
                ContractInfo {
                    asset_name: market.symbol,
                    quote: "USD".to_string(),
                    funding_interval: 1,
                    section_name: Self::ID.to_string(),
                }
            })
            .collect::<Vec<_>>();

        *self.market_ids.write().expect("market id map lock poisoned") = ids;

        debug!(exchange = Self::ID, count = contracts.len(), "fetched contracts");
        Ok(contracts)
    }

    async fn fetch_window(
        &self,
        contract: &Contract,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingPoint>> {
        let market_id = self.market_id(contract).with_context(|| {
            format!(
                "{}: unknown market id for {}; run contract discovery first",
                Self::ID,
                contract.asset_name
            )
        })?;

        let response: FundingsResponse = serde_json::from_value(
            self.http
                .get_json(
                    &format!("{}/fundings", self.base_url),
                    &[
                        ("market_id", market_id.to_string()),
                        ("resolution", "1h".to_string()),
                        ("start_timestamp", (start_ms / 1000).to_string()),
                        ("end_timestamp", (end_ms / 1000).to_string()),
                        ("count_back", "500".to_string()),
                    ],
                    &[],
                )
                .await?,
        )?;

        response
            .fundings
            .into_iter()
            .map(|record| {
                Ok(FundingPoint {
                    rate: Self::normalize_rate(&record),
                    timestamp: dt_from_secs(record.timestamp)?,
                })
            })
            .collect()
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        let frame = ws_request_once(
            &self.ws_url,
            &json!({"type": "subscribe", "channel": "market_stats/all"}),
        )
        .await?;
        let stats: MarketStatsFrame = serde_json::from_value(frame)?;

        let now = Utc::now();
        let all_rates: HashMap<String, FundingPoint> = stats
            .market_stats
            .into_iter()
            .filter_map(|(market_id, payload)| {
                payload.current_funding_rate.map(|rate| {
                    (
                        market_id,
                        FundingPoint {
                            rate: rate / Decimal::ONE_HUNDRED,
                            timestamp: now,
                        },
                    )
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
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn exchange_with(server: &MockServer) -> Lighter {
        Lighter::with_base_url(HttpClient::new().unwrap(), server.uri(), "wss://unused")
    }

    #[tokio::test]
    async fn discovery_remembers_market_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orderBooks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "order_books": [
                    {"symbol": "BTC", "market_type": "perp", "market_id": 7},
                    {"symbol": "WIF", "market_type": "spot", "market_id": 9}
                ]
            })))
            .mount(&server)
            .await;

        let exchange = exchange_with(&server);
        let contracts = exchange.get_contracts().await.unwrap();

        assert_eq!(contracts.len(), 1);
        let c = contract("BTC", "USD", "lighter", 1);
        assert_eq!(exchange.format_symbol(&c), "7");
    }

    #[tokio::test]
    async fn percent_rates_are_normalized_and_signed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orderBooks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "order_books": [
                    {"symbol": "BTC", "market_type": "perp", "market_id": 7}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fundings"))
            .and(query_param("market_id", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "fundings": [
                    {"rate": "0.01", "direction": "long", "timestamp": 1717243200i64},
                    {"rate": "0.02", "direction": "short", "timestamp": 1717246800i64}
                ]
            })))
            .mount(&server)
            .await;

        let exchange = exchange_with(&server);
        exchange.get_contracts().await.unwrap();

        let c = contract("BTC", "USD", "lighter", 1);
        let points = exchange.fetch_window(&c, 0, 1717250400000).await.unwrap();

        assert_eq!(points[0].rate, dec!(0.0001));
        assert_eq!(points[1].rate, dec!(-0.0002));
    }
}

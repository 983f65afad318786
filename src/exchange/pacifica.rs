//! Pacifica adapter.
//!
//! Hourly funding; history uses cursor pagination (`next_cursor`, `has_more`)
//! ending at a 4000 point safety cap, which also sizes the fetch step.
//! Records arrive newest first.

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

const API_ENDPOINT: &str = "https://api.pacifica.fi/api/v1";
const MAX_POINTS_PER_WINDOW: usize = 4000;

#[derive(Debug, Clone, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MarketInfo {
    symbol: String,
    #[serde(default, deserialize_with = "util::flexible_decimal_opt")]
    funding: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryRecord {
    #[serde(deserialize_with = "util::flexible_decimal")]
    funding_rate: Decimal,
    created_at: i64,
}

pub struct Pacifica {
    http: HttpClient,
    base_url: String,
}

impl Pacifica {
    pub const ID: &'static str = "pacifica";
    const FETCH_STEP_HOURS: i64 = 4000;

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
impl Exchange for Pacifica {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        contract.asset_name.clone()
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let response: Envelope<MarketInfo> = serde_json::from_value(
            self.http
                .get_json(&format!("{}/info", self.base_url), &[], &[])
                .await?,
        )?;
        if !response.success {
            return Ok(Vec::new());
        }

        Ok(response
            .data
            .into_iter()
            .map(|market| ContractInfo {
                asset_name: market.symbol,
                quote: "USD".to_string(),
                funding_interval: 1,
                section_name: Self::ID.to_string(),
            })
            .collect())
    }

    async fn fetch_window(
        &self,
        contract: &Contract,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingPoint>> {
        let symbol = self.format_symbol(contract);
        let mut points = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![("symbol", symbol.clone()), ("limit", "1000".to_string())];
            if let Some(cursor) = &cursor {
                query.push(("cursor", cursor.clone()));
            }

            let response: Envelope<HistoryRecord> = serde_json::from_value(
                self.http
                    .get_json(
                        &format!("{}/funding_rate/history", self.base_url),
                        &query,
                        &[],
                    )
                    .await?,
            )?;

            if !response.success || response.data.is_empty() {
                break;
            }

            // Records are newest first; a record older than the window means
            // the rest of the page is older too.
            let mut crossed_start = false;
            for record in &response.data {
                if record.created_at > end_ms {
                    continue;
                }
                if record.created_at < start_ms {
                    crossed_start = true;
                    break;
                }
                points.push(FundingPoint {
                    rate: record.funding_rate,
                    timestamp: dt_from_ms(record.created_at)?,
                });
            }

            if crossed_start || !response.has_more || points.len() >= MAX_POINTS_PER_WINDOW {
                break;
            }
            match response.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(exchange = Self::ID, symbol, count = points.len(), "fetched funding history");
        Ok(points)
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        let response: Envelope<MarketInfo> = serde_json::from_value(
            self.http
                .get_json(&format!("{}/info/prices", self.base_url), &[], &[])
                .await?,
        )?;
        if !response.success {
            return Ok(HashMap::new());
        }

        let now = Utc::now();
        let all_rates = response
            .data
            .into_iter()
            .filter_map(|market| {
                market
                    .funding
                    .map(|rate| (market.symbol, FundingPoint { rate, timestamp: now }))
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
    fn symbol_is_bare_asset() {
        let exchange = Pacifica::new(HttpClient::new().unwrap());
        let c = contract("SOL", "USD", "pacifica", 1);
        assert_eq!(exchange.format_symbol(&c), "SOL");
    }

    #[tokio::test]
    async fn cursor_pagination_stops_at_window_start() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/funding_rate/history"))
            .and(query_param("cursor", "c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": [
                    {"funding_rate": "0.0001", "created_at": 5_000_000i64},
                    {"funding_rate": "0.0001", "created_at": 500_000i64}
                ],
                "has_more": true,
                "next_cursor": "c2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/funding_rate/history"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": [
                    {"funding_rate": "0.0002", "created_at": 9_000_000i64},
                    {"funding_rate": "0.0002", "created_at": 8_000_000i64}
                ],
                "has_more": true,
                "next_cursor": "c1"
            })))
            .mount(&server)
            .await;

        let exchange = Pacifica::with_base_url(HttpClient::new().unwrap(), server.uri());
        let c = contract("SOL", "USD", "pacifica", 1);
        let points = exchange.fetch_window(&c, 1_000_000, 10_000_000).await.unwrap();

        // Second page crosses the window start, so pagination stops there.
        assert_eq!(points.len(), 3);
    }
}

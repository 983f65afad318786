//! Derive (Lyra) adapter.
//!
//! Funding settles continuously but the history API serves hourly buckets
//! (`period = 3600`) and restricts each request to the 30 days preceding
//! `end_timestamp`, so the fetch step is 720 hours. Contract discovery pages
//! through `num_pages`.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::util::{self, dt_from_ms};
use super::Exchange;
use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

const API_ENDPOINT: &str = "https://api.lyra.finance/public";
const PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Clone, Deserialize)]
struct InstrumentsPage {
    #[serde(default)]
    instruments: Vec<Instrument>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    num_pages: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct Instrument {
    instrument_name: String,
    #[serde(default)]
    is_active: bool,
    #[serde(default)]
    perp_details: Option<PerpDetails>,
}

#[derive(Debug, Clone, Deserialize)]
struct PerpDetails {
    #[serde(default, deserialize_with = "util::flexible_decimal_opt")]
    funding_rate: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryResult {
    #[serde(default)]
    funding_rate_history: Vec<HistoryRecord>,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryRecord {
    #[serde(deserialize_with = "util::flexible_decimal")]
    funding_rate: Decimal,
    timestamp: i64,
}

pub struct Derive {
    http: HttpClient,
    base_url: String,
}

impl Derive {
    pub const ID: &'static str = "derive";
    const FETCH_STEP_HOURS: i64 = 720;

    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, API_ENDPOINT)
    }

    pub fn with_base_url(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn instruments_page(&self, page: i64) -> Result<InstrumentsPage> {
        let response: Envelope<InstrumentsPage> = serde_json::from_value(
            self.http
                .post_json(
                    &format!("{}/get_all_instruments", self.base_url),
                    &json!({
                        "currency": null,
                        "expired": true,
                        "instrument_type": "perp",
                        "page": page,
                        "page_size": PAGE_SIZE,
                    }),
                    &[("Content-Type", "application/json")],
                )
                .await?,
        )?;
        Ok(response.result)
    }
}

#[async_trait]
impl Exchange for Derive {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        format!("{}-PERP", contract.asset_name)
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let mut instruments = Vec::new();
        let mut page = 1;

        loop {
            let result = self.instruments_page(page).await?;
            let num_pages = result.pagination.num_pages.max(1);
            instruments.extend(result.instruments);
            if page >= num_pages {
                break;
            }
            page += 1;
        }

        Ok(instruments
            .into_iter()
            .filter(|instrument| instrument.is_active)
            .map(|instrument| ContractInfo {
                asset_name: instrument
                    .instrument_name
                    .trim_end_matches("-PERP")
                    .to_string(),
                quote: "USD".to_string(),
                funding_interval: 1,
                section_name: Self::ID.to_string(),
            })
            .collect())
    }

    async fn fetch_window(
        &self,
        contract: &Contract,
        _start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingPoint>> {
        // The venue bounds each call to the 30 days before end_timestamp; the
        // window start is implicit.
        let response: Envelope<HistoryResult> = serde_json::from_value(
            self.http
                .post_json(
                    &format!("{}/get_funding_rate_history", self.base_url),
                    &json!({
                        "instrument_name": self.format_symbol(contract),
                        "period": 3600,
                        "end_timestamp": end_ms,
                    }),
                    &[("Content-Type", "application/json")],
                )
                .await?,
        )?;

        response
            .result
            .funding_rate_history
            .into_iter()
            .map(|record| {
                Ok(FundingPoint {
                    rate: record.funding_rate,
                    timestamp: dt_from_ms(record.timestamp)?,
                })
            })
            .collect()
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        let result = self.instruments_page(1).await?;

        let now = Utc::now();
        let all_rates = result
            .instruments
            .into_iter()
            .filter(|instrument| instrument.is_active)
            .filter_map(|instrument| {
                let rate = instrument.perp_details.and_then(|d| d.funding_rate)?;
                Some((
                    instrument.instrument_name,
                    FundingPoint { rate, timestamp: now },
                ))
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
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn symbol_is_perp_suffixed() {
        let exchange = Derive::new(HttpClient::new().unwrap());
        let c = contract("ETH", "USD", "derive", 1);
        assert_eq!(exchange.format_symbol(&c), "ETH-PERP");
    }

    #[tokio::test]
    async fn discovery_walks_all_pages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_all_instruments"))
            .and(body_partial_json(json!({"page": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "instruments": [
                        {"instrument_name": "BTC-PERP", "is_active": true},
                        {"instrument_name": "DOGE-PERP", "is_active": false}
                    ],
                    "pagination": {"num_pages": 2}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/get_all_instruments"))
            .and(body_partial_json(json!({"page": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "instruments": [
                        {"instrument_name": "ETH-PERP", "is_active": true}
                    ],
                    "pagination": {"num_pages": 2}
                }
            })))
            .mount(&server)
            .await;

        let exchange = Derive::with_base_url(HttpClient::new().unwrap(), server.uri());
        let contracts = exchange.get_contracts().await.unwrap();

        let assets: Vec<&str> = contracts.iter().map(|c| c.asset_name.as_str()).collect();
        assert_eq!(assets, vec!["BTC", "ETH"]);
    }
}

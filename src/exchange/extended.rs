//! Extended (Starknet) adapter.
//!
//! Hourly funding with a ~4326 record limit per history request; the fetch
//! step of 2160 hours (90 days) stays safely under it. Responses use an
//! `{"status": "OK", "data": ...}` envelope.

use std::collections::HashMap;

use anyhow::{ensure, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::util::{self, dt_from_ms};
use super::Exchange;
use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

const API_ENDPOINT: &str = "https://api.starknet.extended.exchange";

#[derive(Debug, Clone, Deserialize)]
struct Envelope<T> {
    status: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Market {
    #[serde(default)]
    name: String,
    status: String,
    #[serde(default)]
    asset_name: String,
    #[serde(default)]
    collateral_asset_name: String,
    #[serde(default)]
    market_stats: Option<MarketStats>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketStats {
    #[serde(default, deserialize_with = "util::flexible_decimal_opt")]
    funding_rate: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryRecord {
    #[serde(rename = "f", deserialize_with = "util::flexible_decimal")]
    funding_rate: Decimal,
    #[serde(rename = "T")]
    timestamp_ms: i64,
}

pub struct Extended {
    http: HttpClient,
    base_url: String,
}

impl Extended {
    pub const ID: &'static str = "extended";
    const FETCH_STEP_HOURS: i64 = 2160;

    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, API_ENDPOINT)
    }

    pub fn with_base_url(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn markets(&self) -> Result<Vec<Market>> {
        let response: Envelope<Market> = serde_json::from_value(
            self.http
                .get_json(&format!("{}/api/v1/info/markets", self.base_url), &[], &[])
                .await?,
        )?;
        ensure!(
            response.status == "OK",
            "extended API error status {}",
            response.status
        );
        Ok(response.data)
    }
}

#[async_trait]
impl Exchange for Extended {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        format!("{}-{}", contract.asset_name, contract.quote_name)
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        Ok(self
            .markets()
            .await?
            .into_iter()
            .filter(|market| market.status == "ACTIVE")
            .map(|market| ContractInfo {
                asset_name: market.asset_name,
                quote: market.collateral_asset_name,
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
        let response: Envelope<HistoryRecord> = serde_json::from_value(
            self.http
                .get_json(
                    &format!(
                        "{}/api/v1/info/{}/funding",
                        self.base_url,
                        self.format_symbol(contract)
                    ),
                    &[
                        ("startTime", start_ms.to_string()),
                        ("endTime", end_ms.to_string()),
                    ],
                    &[],
                )
                .await?,
        )?;
        ensure!(
            response.status == "OK",
            "extended API error status {}",
            response.status
        );

        response
            .data
            .into_iter()
            .map(|record| {
                Ok(FundingPoint {
                    rate: record.funding_rate,
                    timestamp: dt_from_ms(record.timestamp_ms)?,
                })
            })
            .collect()
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        let now = Utc::now();
        let all_rates = self
            .markets()
            .await?
            .into_iter()
            .filter(|market| market.status == "ACTIVE")
            .filter_map(|market| {
                let rate = market.market_stats.and_then(|stats| stats.funding_rate)?;
                Some((market.name, FundingPoint { rate, timestamp: now }))
            })
            .collect();

        Ok(util::project_by_symbol(self, contracts, all_rates))
    }
}

//! dYdX v4 indexer adapter.
//!
//! Hourly funding; history answers at most 1000 records, so the fetch step is
//! 1000 hours. The history endpoint takes an ISO-8601 `effectiveBeforeOrAt`
//! upper bound rather than a millisecond window.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::util::{self, dt_from_ms, parse_iso};
use super::Exchange;
use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

const API_ENDPOINT: &str = "https://indexer.dydx.trade/v4";

#[derive(Debug, Clone, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    markets: HashMap<String, Market>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Market {
    #[serde(default, deserialize_with = "util::flexible_decimal_opt")]
    next_funding_rate: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    #[serde(default)]
    historical_funding: Vec<HistoryRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(with = "rust_decimal::serde::str")]
    rate: Decimal,
    effective_at: String,
}

pub struct Dydx {
    http: HttpClient,
    base_url: String,
}

impl Dydx {
    pub const ID: &'static str = "dydx";
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
impl Exchange for Dydx {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        format!("{}-USD", contract.asset_name)
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let response: MarketsResponse = serde_json::from_value(
            self.http
                .get_json(&format!("{}/perpetualMarkets", self.base_url), &[], &[])
                .await?,
        )?;

        Ok(response
            .markets
            .into_keys()
            .filter_map(|ticker| {
                let asset = ticker.strip_suffix("-USD")?;
                Some(ContractInfo {
                    asset_name: asset.to_string(),
                    quote: "USD".to_string(),
                    funding_interval: 1,
                    section_name: Self::ID.to_string(),
                })
            })
            .collect())
    }

    async fn fetch_window(
        &self,
        contract: &Contract,
        _start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingPoint>> {
        let end_iso = dt_from_ms(end_ms)?.to_rfc3339();
        let response: HistoryResponse = serde_json::from_value(
            self.http
                .get_json(
                    &format!(
                        "{}/historicalFunding/{}",
                        self.base_url,
                        self.format_symbol(contract)
                    ),
                    &[("effectiveBeforeOrAt", end_iso)],
                    &[],
                )
                .await?,
        )?;

        response
            .historical_funding
            .into_iter()
            .map(|record| {
                Ok(FundingPoint {
                    rate: record.rate,
                    timestamp: parse_iso(&record.effective_at)?,
                })
            })
            .collect()
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        let response: MarketsResponse = serde_json::from_value(
            self.http
                .get_json(&format!("{}/perpetualMarkets", self.base_url), &[], &[])
                .await?,
        )?;

        let now = Utc::now();
        let all_rates = response
            .markets
            .into_iter()
            .filter_map(|(ticker, market)| {
                market
                    .next_funding_rate
                    .map(|rate| (ticker, FundingPoint { rate, timestamp: now }))
            })
            .collect();

        Ok(util::project_by_symbol(self, contracts, all_rates))
    }
}

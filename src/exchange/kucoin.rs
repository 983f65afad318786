//! KuCoin futures adapter.
//!
//! Mixed 1/4/8h funding intervals published as `fundingRateGranularity` in
//! milliseconds; quarterly futures carry no granularity and are skipped. The
//! history window is limited to 100 hours (empirically tested).

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

const API_ENDPOINT: &str = "https://api-futures.kucoin.com";

#[derive(Debug, Clone, Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default = "Option::default")]
    data: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveContract {
    symbol: String,
    status: String,
    base_currency: String,
    quote_currency: String,
    #[serde(default)]
    funding_rate_granularity: Option<i64>,
    #[serde(default, deserialize_with = "util::flexible_decimal_opt")]
    funding_fee_rate: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(deserialize_with = "util::flexible_decimal")]
    funding_rate: Decimal,
    timepoint: i64,
}

pub struct Kucoin {
    http: HttpClient,
    base_url: String,
}

impl Kucoin {
    pub const ID: &'static str = "kucoin";
    const FETCH_STEP_HOURS: i64 = 100;
    const OK_CODE: &'static str = "200000";

    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, API_ENDPOINT)
    }

    pub fn with_base_url(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn active_contracts(&self) -> Result<Vec<ActiveContract>> {
        let response: Envelope<Vec<ActiveContract>> = serde_json::from_value(
            self.http
                .get_json(&format!("{}/api/v1/contracts/active", self.base_url), &[], &[])
                .await?,
        )?;
        ensure!(
            response.code == Self::OK_CODE,
            "kucoin API error code {}",
            response.code
        );
        Ok(response.data.unwrap_or_default())
    }
}

#[async_trait]
impl Exchange for Kucoin {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        format!("{}{}M", contract.asset_name, contract.quote_name)
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        Ok(self
            .active_contracts()
            .await?
            .into_iter()
            .filter(|instrument| instrument.status == "Open")
            .filter_map(|instrument| {
                // Quarterly futures have no funding granularity.
                let granularity_ms = instrument.funding_rate_granularity?;
                if granularity_ms <= 0 {
                    return None;
                }
                Some(ContractInfo {
                    asset_name: instrument.base_currency,
                    quote: instrument.quote_currency,
                    funding_interval: (granularity_ms / 1000 / 3600) as i32,
                    section_name: Self::ID.to_string(),
                })
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
        let response: Envelope<Vec<HistoryRecord>> = serde_json::from_value(
            self.http
                .get_json(
                    &format!("{}/api/v1/contract/funding-rates", self.base_url),
                    &[
                        ("symbol", symbol.clone()),
                        ("from", start_ms.to_string()),
                        ("to", end_ms.to_string()),
                    ],
                    &[],
                )
                .await?,
        )?;
        ensure!(
            response.code == Self::OK_CODE,
            "kucoin API error for {symbol}: code {}",
            response.code
        );

        response
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|record| {
                Ok(FundingPoint {
                    rate: record.funding_rate,
                    timestamp: dt_from_ms(record.timepoint)?,
                })
            })
            .collect()
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        let now = Utc::now();
        let all_rates = self
            .active_contracts()
            .await?
            .into_iter()
            .filter(|instrument| {
                instrument.status == "Open" && instrument.funding_rate_granularity.is_some()
            })
            .filter_map(|instrument| {
                instrument.funding_fee_rate.map(|rate| {
                    (instrument.symbol, FundingPoint { rate, timestamp: now })
                })
            })
            .collect();

        Ok(util::project_by_symbol(self, contracts, all_rates))
    }
}

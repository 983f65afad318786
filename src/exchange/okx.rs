//! OKX adapter.
//!
//! Swap instruments with 1-8h funding (modelled as 8h). History answers at
//! most 400 records, so the fetch step is 398 hours. No batch live endpoint:
//! live sampling fans out one request per contract.

use std::collections::HashMap;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::util::{self, dt_from_ms};
use super::Exchange;
use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

const API_ENDPOINT: &str = "https://www.okx.com/api/v5";

#[derive(Debug, Clone, Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instrument {
    inst_id: String,
    state: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(with = "rust_decimal::serde::str")]
    funding_rate: Decimal,
    funding_time: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveRecord {
    #[serde(with = "rust_decimal::serde::str")]
    funding_rate: Decimal,
}

pub struct Okx {
    http: HttpClient,
    base_url: String,
}

impl Okx {
    pub const ID: &'static str = "okx";
    const FETCH_STEP_HOURS: i64 = 398;

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
impl Exchange for Okx {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        format!("{}-{}-SWAP", contract.asset_name, contract.quote_name)
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let response: Envelope<Instrument> = serde_json::from_value(
            self.http
                .get_json(
                    &format!("{}/public/instruments", self.base_url),
                    &[("instType", "SWAP".to_string())],
                    &[],
                )
                .await?,
        )?;
        ensure!(response.code == "0", "okx API error code {}", response.code);

        response
            .data
            .into_iter()
            .filter(|instrument| instrument.state == "live")
            .map(|instrument| {
                let mut parts = instrument.inst_id.split('-');
                let asset = parts.next().context("instId missing asset part")?;
                let quote = parts.next().context("instId missing quote part")?;
                Ok(ContractInfo {
                    asset_name: asset.to_string(),
                    quote: quote.to_string(),
                    funding_interval: 8,
                    section_name: Self::ID.to_string(),
                })
            })
            .collect()
    }

    async fn fetch_window(
        &self,
        contract: &Contract,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingPoint>> {
        // OKX reverses the usual meaning: "after" bounds the newest record,
        // "before" the oldest.
        let response: Envelope<HistoryRecord> = serde_json::from_value(
            self.http
                .get_json(
                    &format!("{}/public/funding-rate-history", self.base_url),
                    &[
                        ("instId", self.format_symbol(contract)),
                        ("after", end_ms.to_string()),
                        ("before", start_ms.to_string()),
                        ("limit", "400".to_string()),
                    ],
                    &[],
                )
                .await?,
        )?;
        ensure!(response.code == "0", "okx API error code {}", response.code);

        response
            .data
            .into_iter()
            .map(|record| {
                let ms: i64 = record.funding_time.parse()?;
                Ok(FundingPoint {
                    rate: record.funding_rate,
                    timestamp: dt_from_ms(ms)?,
                })
            })
            .collect()
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        util::fetch_live_parallel(self, contracts).await
    }

    async fn fetch_live_single(&self, contract: &Contract) -> Result<FundingPoint> {
        let symbol = self.format_symbol(contract);
        let response: Envelope<LiveRecord> = serde_json::from_value(
            self.http
                .get_json(
                    &format!("{}/public/funding-rate", self.base_url),
                    &[("instId", symbol.clone())],
                    &[],
                )
                .await?,
        )?;

        let record = response
            .data
            .into_iter()
            .next()
            .with_context(|| format!("no funding rate data for {symbol}"))?;

        Ok(FundingPoint {
            rate: record.funding_rate,
            timestamp: Utc::now(),
        })
    }
}

//! Binance COIN-M adapter.
//!
//! Every contract settles on an 8 hour interval and the history API answers
//! at most 1000 records, so the fetch step is 8000 hours.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::util::{self, dt_from_ms};
use super::Exchange;
use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

const API_ENDPOINT: &str = "https://dapi.binance.com/dapi";

#[derive(Debug, Clone, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    contract_type: String,
    base_asset: String,
    quote_asset: String,
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
    #[serde(default, deserialize_with = "util::flexible_decimal_opt")]
    last_funding_rate: Option<Decimal>,
}

pub struct BinanceCoinm {
    http: HttpClient,
    base_url: String,
}

impl BinanceCoinm {
    pub const ID: &'static str = "binance_coin-m";
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
}

#[async_trait]
impl Exchange for BinanceCoinm {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        format!("{}{}_PERP", contract.asset_name, contract.quote_name)
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let exchange_info: ExchangeInfo = serde_json::from_value(
            self.http
                .get_json(&format!("{}/v1/exchangeInfo", self.base_url), &[], &[])
                .await?,
        )?;

        Ok(exchange_info
            .symbols
            .into_iter()
            .filter(|instrument| instrument.contract_type == "PERPETUAL")
            .map(|instrument| ContractInfo {
                asset_name: instrument.base_asset,
                quote: instrument.quote_asset,
                funding_interval: 8,
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

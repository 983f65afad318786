//! HyperLiquid adapter.
//!
//! Hourly funding across the board. The `/info` endpoint answers at most 500
//! `fundingHistory` records per call, so the fetch step is 498 hours with a
//! two hour safety buffer. Live rates come from a single `metaAndAssetCtxs`
//! batch request.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use super::util::{self, dt_from_ms};
use super::Exchange;
use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

const API_ENDPOINT: &str = "https://api.hyperliquid.xyz";

#[derive(Debug, Clone, Deserialize)]
struct Meta {
    universe: Vec<Listing>,
}

#[derive(Debug, Clone, Deserialize)]
struct Listing {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AssetCtx {
    #[serde(default, deserialize_with = "util::flexible_decimal_opt")]
    funding: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundingHistoryRecord {
    #[serde(with = "rust_decimal::serde::str")]
    funding_rate: Decimal,
    time: i64,
}

pub struct Hyperliquid {
    http: HttpClient,
    base_url: String,
    id: &'static str,
    /// Sub-dex selector forwarded on every `/info` request.
    dex: Option<&'static str>,
}

impl Hyperliquid {
    pub const ID: &'static str = "hyperliquid";
    const FETCH_STEP_HOURS: i64 = 498;

    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, API_ENDPOINT)
    }

    pub fn with_base_url(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            id: Self::ID,
            dex: None,
        }
    }

    pub(super) fn sub_dex(
        http: HttpClient,
        base_url: impl Into<String>,
        id: &'static str,
        dex: &'static str,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            id,
            dex: Some(dex),
        }
    }

    fn info_body(&self, mut body: Value) -> Value {
        if let Some(dex) = self.dex {
            body["dex"] = dex.into();
        }
        body
    }

    async fn info(&self, body: Value) -> Result<Value> {
        let url = format!("{}/info", self.base_url);
        Ok(self
            .http
            .post_json(&url, &self.info_body(body), &[("Content-Type", "application/json")])
            .await?)
    }

    /// Active listing names, in universe order.
    pub(super) async fn listing_names(&self) -> Result<Vec<String>> {
        let meta: Meta = serde_json::from_value(self.info(json!({"type": "meta"})).await?)?;
        Ok(meta.universe.into_iter().map(|l| l.name).collect())
    }

    pub(super) async fn fetch_window_symbol(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingPoint>> {
        let response = self
            .info(json!({
                "type": "fundingHistory",
                "coin": symbol,
                "startTime": start_ms,
                "endTime": end_ms,
            }))
            .await?;

        let records: Vec<FundingHistoryRecord> = serde_json::from_value(response)?;
        let points = records
            .into_iter()
            .map(|record| {
                Ok(FundingPoint {
                    rate: record.funding_rate,
                    timestamp: dt_from_ms(record.time)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(exchange = self.id, symbol, count = points.len(), "fetched funding history");
        Ok(points)
    }

    /// All current unsettled rates keyed by listing name.
    pub(super) async fn fetch_all_rates(&self) -> Result<HashMap<String, FundingPoint>> {
        let response = self.info(json!({"type": "metaAndAssetCtxs"})).await?;
        let (meta, ctxs): (Meta, Vec<AssetCtx>) = serde_json::from_value(response)?;

        let now = Utc::now();
        let rates = meta
            .universe
            .into_iter()
            .zip(ctxs)
            .filter_map(|(listing, ctx)| {
                ctx.funding
                    .map(|rate| (listing.name, FundingPoint { rate, timestamp: now }))
            })
            .collect::<HashMap<_, _>>();

        debug!(exchange = self.id, count = rates.len(), "fetched live rates");
        Ok(rates)
    }
}

#[async_trait]
impl Exchange for Hyperliquid {
    fn id(&self) -> &'static str {
        self.id
    }

    fn fetch_step_hours(&self) -> i64 {
        Self::FETCH_STEP_HOURS
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        contract.asset_name.clone()
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let contracts = self
            .listing_names()
            .await?
            .into_iter()
            .map(|name| ContractInfo {
                asset_name: name,
                quote: "USD".to_string(),
                funding_interval: 1,
                section_name: self.id.to_string(),
            })
            .collect();
        Ok(contracts)
    }

    async fn fetch_window(
        &self,
        contract: &Contract,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingPoint>> {
        self.fetch_window_symbol(&self.format_symbol(contract), start_ms, end_ms)
            .await
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        let all_rates = self.fetch_all_rates().await?;
        Ok(util::project_by_symbol(self, contracts, all_rates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testutil::contract;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::new().unwrap()
    }

    #[test]
    fn symbol_is_bare_asset() {
        let exchange = Hyperliquid::new(client());
        assert_eq!(exchange.format_symbol(&contract("BTC", "USD", "hyperliquid", 1)), "BTC");
    }

    #[tokio::test]
    async fn get_contracts_maps_universe() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/info"))
            .and(body_partial_json(serde_json::json!({"type": "meta"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "universe": [{"name": "BTC"}, {"name": "ETH"}]
            })))
            .mount(&server)
            .await;

        let exchange = Hyperliquid::with_base_url(client(), server.uri());
        let contracts = exchange.get_contracts().await.unwrap();

        assert_eq!(contracts.len(), 2);
        assert_eq!(contracts[0].asset_name, "BTC");
        assert_eq!(contracts[0].quote, "USD");
        assert_eq!(contracts[0].funding_interval, 1);
        assert_eq!(contracts[0].section_name, "hyperliquid");
    }

    #[tokio::test]
    async fn fetch_window_parses_history() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/info"))
            .and(body_partial_json(serde_json::json!({"type": "fundingHistory", "coin": "BTC"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"coin": "BTC", "fundingRate": "0.0000125", "time": 1717243200000i64},
                {"coin": "BTC", "fundingRate": "-0.0000042", "time": 1717246800000i64}
            ])))
            .mount(&server)
            .await;

        let exchange = Hyperliquid::with_base_url(client(), server.uri());
        let c = contract("BTC", "USD", "hyperliquid", 1);
        let points = exchange.fetch_window(&c, 0, 1717250400000).await.unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].rate, dec!(0.0000125));
        assert_eq!(points[1].rate, dec!(-0.0000042));
    }

    #[tokio::test]
    async fn fetch_live_projects_onto_requested_contracts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/info"))
            .and(body_partial_json(serde_json::json!({"type": "metaAndAssetCtxs"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"universe": [{"name": "BTC"}, {"name": "ETH"}, {"name": "SOL"}]},
                [
                    {"funding": "0.0000125"},
                    {"funding": "0.0000087"},
                    {}
                ]
            ])))
            .mount(&server)
            .await;

        let exchange = Hyperliquid::with_base_url(client(), server.uri());
        let btc = contract("BTC", "USD", "hyperliquid", 1);
        let sol = contract("SOL", "USD", "hyperliquid", 1);
        let rates = exchange.fetch_live(&[btc.clone(), sol]).await.unwrap();

        // SOL has no funding context and must be dropped.
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[&btc.id].rate, dec!(0.0000125));
    }
}

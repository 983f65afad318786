//! HyperLiquid `xyz` sub-dex adapter.
//!
//! Lists stocks, metals and forex under the `xyz:` dex. Metal listings use
//! commodity names on the venue side and ISO-style codes in the database, so
//! symbols are remapped in both directions (`GOLD` <-> `XAU`).

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use super::hyperliquid::Hyperliquid;
use super::Exchange;
use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

/// Venue name -> database code.
const SYMBOL_MAP: [(&str, &str); 5] = [
    ("GOLD", "XAU"),
    ("SILVER", "XAG"),
    ("PLATINUM", "XPT"),
    ("COPPER", "XCU"),
    ("ALUMINIUM", "XAL"),
];

fn to_db_symbol(venue_name: &str) -> &str {
    SYMBOL_MAP
        .iter()
        .find(|(venue, _)| *venue == venue_name)
        .map(|(_, db)| *db)
        .unwrap_or(venue_name)
}

fn to_venue_symbol(db_name: &str) -> &str {
    SYMBOL_MAP
        .iter()
        .find(|(_, db)| *db == db_name)
        .map(|(venue, _)| *venue)
        .unwrap_or(db_name)
}

pub struct HyperliquidXyz {
    inner: Hyperliquid,
}

impl HyperliquidXyz {
    pub const ID: &'static str = "hyperliquid-xyz";
    const DEX: &'static str = "xyz";

    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, "https://api.hyperliquid.xyz")
    }

    pub fn with_base_url(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            inner: Hyperliquid::sub_dex(http, base_url, Self::ID, Self::DEX),
        }
    }

    /// Listing names come back either bare or `xyz:`-prefixed; strip the dex
    /// qualifier before the metal remap.
    fn strip_dex(name: &str) -> &str {
        name.rsplit(':').next().unwrap_or(name)
    }
}

#[async_trait]
impl Exchange for HyperliquidXyz {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn fetch_step_hours(&self) -> i64 {
        self.inner.fetch_step_hours()
    }

    fn format_symbol(&self, contract: &Contract) -> String {
        format!("{}:{}", Self::DEX, to_venue_symbol(&contract.asset_name))
    }

    async fn get_contracts(&self) -> Result<Vec<ContractInfo>> {
        let contracts = self
            .inner
            .listing_names()
            .await?
            .into_iter()
            .map(|name| ContractInfo {
                asset_name: to_db_symbol(Self::strip_dex(&name)).to_string(),
                quote: "USD".to_string(),
                funding_interval: 1,
                section_name: Self::ID.to_string(),
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
        self.inner
            .fetch_window_symbol(&self.format_symbol(contract), start_ms, end_ms)
            .await
    }

    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>> {
        // Keyed by database asset code, not the venue symbol.
        let mut by_asset: HashMap<String, FundingPoint> = self
            .inner
            .fetch_all_rates()
            .await?
            .into_iter()
            .map(|(name, point)| (to_db_symbol(Self::strip_dex(&name)).to_string(), point))
            .collect();

        Ok(contracts
            .iter()
            .filter_map(|contract| {
                by_asset
                    .remove(&contract.asset_name)
                    .map(|point| (contract.id, point))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testutil::contract;

    #[test]
    fn metal_symbols_round_trip() {
        assert_eq!(to_db_symbol("GOLD"), "XAU");
        assert_eq!(to_venue_symbol("XAU"), "GOLD");
        assert_eq!(to_db_symbol("AAPL"), "AAPL");
        assert_eq!(to_venue_symbol("AAPL"), "AAPL");
    }

    #[test]
    fn symbol_carries_dex_prefix_and_remap() {
        let exchange = HyperliquidXyz::new(crate::http::HttpClient::new().unwrap());
        let gold = contract("XAU", "USD", "hyperliquid-xyz", 1);
        assert_eq!(exchange.format_symbol(&gold), "xyz:GOLD");

        let stock = contract("AAPL", "USD", "hyperliquid-xyz", 1);
        assert_eq!(exchange.format_symbol(&stock), "xyz:AAPL");
    }

    #[test]
    fn dex_qualifier_is_stripped() {
        assert_eq!(HyperliquidXyz::strip_dex("xyz:GOLD"), "GOLD");
        assert_eq!(HyperliquidXyz::strip_dex("SILVER"), "SILVER");
    }
}

//! Venue adapters.
//!
//! Every exchange implements the [`Exchange`] trait: contract discovery,
//! windowed history paging, live-rate sampling, and symbol formatting. The
//! trait normalizes ~15 incompatible upstream APIs into one capability set
//! consumed by the coordinators.
//!
//! History paging contract: a point fetched before `t` satisfies
//! `timestamp < t`, a point fetched after `t` satisfies `timestamp > t`;
//! callers shift the cutoff by one second to keep it exclusive. Adapters never
//! deduplicate; the repository's insert-ignore handles duplicates.

pub mod util;

mod aster;
mod backpack;
mod binance_coinm;
mod binance_usdm;
mod bybit;
mod derive;
mod dydx;
mod extended;
mod hyperliquid;
mod hyperliquid_xyz;
mod kucoin;
mod lighter;
mod okx;
mod pacifica;
mod paradex;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::http::HttpClient;
use crate::model::{Contract, ContractInfo, FundingPoint};

pub use aster::Aster;
pub use backpack::Backpack;
pub use binance_coinm::BinanceCoinm;
pub use binance_usdm::BinanceUsdm;
pub use bybit::Bybit;
pub use derive::Derive;
pub use dydx::Dydx;
pub use extended::Extended;
pub use hyperliquid::Hyperliquid;
pub use hyperliquid_xyz::HyperliquidXyz;
pub use kucoin::Kucoin;
pub use lighter::Lighter;
pub use okx::Okx;
pub use pacifica::Pacifica;
pub use paradex::Paradex;

/// Uniform capability set of one venue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Unique lowercase venue identifier, also used as the section name.
    fn id(&self) -> &'static str;

    /// Maximum hours of history one upstream call may cover, sized from the
    /// venue's record limit and minimum funding interval minus a safety buffer.
    fn fetch_step_hours(&self) -> i64;

    /// Venue-specific symbol for a contract.
    fn format_symbol(&self, contract: &Contract) -> String;

    /// All active perpetual listings.
    async fn get_contracts(&self) -> Result<Vec<ContractInfo>>;

    /// Fetch settled points inside `[start_ms, end_ms]`.
    ///
    /// Venues with non-time-based pagination override the two public history
    /// methods instead and leave this unimplemented.
    async fn fetch_window(
        &self,
        contract: &Contract,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingPoint>>;

    /// At most one fetch step of points older than the cutoff (backfill).
    async fn fetch_history_before(
        &self,
        contract: &Contract,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<FundingPoint>> {
        let end_ms = before.unwrap_or_else(Utc::now).timestamp_millis();
        let start_ms = end_ms - self.fetch_step_hours() * 3_600_000;
        self.fetch_window(contract, start_ms, end_ms).await
    }

    /// Points newer than the cutoff (forward update).
    async fn fetch_history_after(
        &self,
        contract: &Contract,
        after: DateTime<Utc>,
    ) -> Result<Vec<FundingPoint>> {
        let start_ms = after.timestamp_millis();
        let end_ms = Utc::now().timestamp_millis();
        self.fetch_window(contract, start_ms, end_ms).await
    }

    /// Current unsettled rate per contract, keyed by contract id.
    ///
    /// Batch-API venues answer from a single all-markets request projected
    /// onto the input set. Venues without a batch endpoint implement
    /// [`Exchange::fetch_live_single`] and route through
    /// [`util::fetch_live_parallel`].
    async fn fetch_live(&self, contracts: &[Contract]) -> Result<HashMap<Uuid, FundingPoint>>;

    /// Single-contract live sample, only for venues without a batch endpoint.
    async fn fetch_live_single(&self, _contract: &Contract) -> Result<FundingPoint> {
        bail!("{}: no single-contract live endpoint", self.id())
    }
}

/// Build the registry of all known venues, keyed and iterated in sorted order.
///
/// Fails fast on malformed adapter declarations so a bad build never reaches
/// the scheduler.
pub fn registry(http: &HttpClient) -> Result<BTreeMap<&'static str, Arc<dyn Exchange>>> {
    let adapters: Vec<Arc<dyn Exchange>> = vec![
        Arc::new(Aster::new(http.clone())),
        Arc::new(Backpack::new(http.clone())),
        Arc::new(BinanceUsdm::new(http.clone())),
        Arc::new(BinanceCoinm::new(http.clone())),
        Arc::new(Bybit::new(http.clone())),
        Arc::new(Derive::new(http.clone())),
        Arc::new(Dydx::new(http.clone())),
        Arc::new(Extended::new(http.clone())),
        Arc::new(Hyperliquid::new(http.clone())),
        Arc::new(HyperliquidXyz::new(http.clone())),
        Arc::new(Kucoin::new(http.clone())),
        Arc::new(Lighter::new(http.clone())),
        Arc::new(Okx::new(http.clone())),
        Arc::new(Pacifica::new(http.clone())),
        Arc::new(Paradex::new(http.clone())),
    ];

    let mut map: BTreeMap<&'static str, Arc<dyn Exchange>> = BTreeMap::new();
    for adapter in adapters {
        let id = adapter.id();
        if id.is_empty() || id.chars().any(|c| c.is_ascii_uppercase()) {
            bail!("adapter id {id:?} must be non-empty lowercase");
        }
        if adapter.fetch_step_hours() <= 0 {
            bail!("adapter {id}: fetch step must be positive");
        }
        if map.insert(id, adapter).is_some() {
            bail!("duplicate adapter id {id}");
        }
    }
    Ok(map)
}

#[cfg(test)]
pub(crate) mod testutil {
    use uuid::Uuid;

    use crate::model::Contract;

    pub fn contract(asset: &str, quote: &str, section: &str, funding_interval: i32) -> Contract {
        Contract {
            id: Uuid::new_v4(),
            asset_name: asset.to_string(),
            quote_name: quote.to_string(),
            section_name: section.to_string(),
            funding_interval,
            deprecated: false,
            synced: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_all_known_venues() {
        let http = HttpClient::new().unwrap();
        let registry = registry(&http).unwrap();

        let ids: Vec<&str> = registry.keys().copied().collect();
        assert_eq!(
            ids,
            vec![
                "aster",
                "backpack",
                "binance_coin-m",
                "binance_usd-m",
                "bybit",
                "derive",
                "dydx",
                "extended",
                "hyperliquid",
                "hyperliquid-xyz",
                "kucoin",
                "lighter",
                "okx",
                "pacifica",
                "paradex",
            ]
        );
    }

    #[test]
    fn fetch_steps_match_venue_limits() {
        let http = HttpClient::new().unwrap();
        let registry = registry(&http).unwrap();

        let steps: Vec<(&str, i64)> = registry
            .iter()
            .map(|(id, adapter)| (*id, adapter.fetch_step_hours()))
            .collect();

        assert!(steps.contains(&("hyperliquid", 498)));
        assert!(steps.contains(&("bybit", 198)));
        assert!(steps.contains(&("binance_usd-m", 1000)));
        assert!(steps.contains(&("binance_coin-m", 8000)));
        assert!(steps.contains(&("okx", 398)));
        assert!(steps.contains(&("kucoin", 100)));
        assert!(steps.contains(&("dydx", 1000)));
        assert!(steps.contains(&("derive", 720)));
        assert!(steps.contains(&("extended", 2160)));
        assert!(steps.contains(&("pacifica", 4000)));
        assert!(steps.contains(&("aster", 8000)));
        assert!(steps.contains(&("lighter", 498)));
        assert!(steps.contains(&("backpack", 1000)));
        assert!(steps.contains(&("paradex", 6)));
    }
}

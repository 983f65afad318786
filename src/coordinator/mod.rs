//! Adapter-agnostic ingestion flows.
//!
//! Each coordinator wires one [`crate::exchange::Exchange`] to the store:
//! contract registry sync, backward history sync, forward history update and
//! live-rate collection. Transactions stay open only for database statements,
//! never across upstream calls.

mod history;
mod live;
mod registry;

pub use history::{sync_contract, update_contract};
pub use live::collect_live;
pub use registry::register_contracts;

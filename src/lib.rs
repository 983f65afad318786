//! # Funding Harvester
//!
//! Continuous collection of perpetual-futures funding rates from a
//! heterogeneous set of crypto exchanges into PostgreSQL/TimescaleDB.
//!
//! ## Architecture
//!
//! - `config`: CLI/env settings, runtime config resolution, instance sharding
//! - `http`: retry-wrapped JSON fetch layer and one-shot WebSocket reads
//! - `model`: dimension rows, funding-point rows, adapter DTOs
//! - `db`: connection pool and transactional unit of work with repositories
//! - `exchange`: the venue adapter trait, registry, and 15 implementations
//! - `coordinator`: adapter-agnostic registry sync, backfill, update, live
//! - `orchestrator`: per-exchange update()/update_live() with bounded fan-out
//! - `scheduler`: recurring job runner with staggered live collection
//! - `refresher`: debounced materialized-view refresh

pub mod config;
pub mod coordinator;
pub mod db;
pub mod exchange;
pub mod http;
pub mod model;
pub mod orchestrator;
pub mod refresher;
pub mod scheduler;

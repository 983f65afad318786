//! Debounced materialized-view refresher.
//!
//! Contract-registry runs signal this refresher; a per-second check executes
//! `REFRESH MATERIALIZED VIEW CONCURRENTLY` once the debounce window has
//! passed since the last signal. Failure keeps the pending flag set so the
//! next tick retries. Best-effort by design: a refresh must never block
//! ingestion.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use sqlx::PgPool;
use tracing::{debug, error, info};

const REFRESH_SQL: &str = "REFRESH MATERIALIZED VIEW CONCURRENTLY contract_enriched;";

/// Default seconds to wait after the last signal before refreshing.
pub const DEFAULT_DEBOUNCE_SECONDS: u64 = 10;

#[derive(Debug, Default)]
struct State {
    pending: bool,
    last_signal: Option<Instant>,
}

pub struct MaterializedViewRefresher {
    pool: PgPool,
    debounce: Duration,
    state: Mutex<State>,
}

impl MaterializedViewRefresher {
    pub fn new(pool: PgPool, debounce_seconds: u64) -> Self {
        Self {
            pool,
            debounce: Duration::from_secs(debounce_seconds),
            state: Mutex::new(State::default()),
        }
    }

    /// Record that a section's contract set changed.
    pub fn signal_contracts_changed(&self, section_name: &str) {
        let mut state = self.state.lock().expect("refresher state lock poisoned");
        state.pending = true;
        state.last_signal = Some(Instant::now());
        debug!(section = section_name, "received contracts change signal");
    }

    fn due(&self) -> bool {
        let state = self.state.lock().expect("refresher state lock poisoned");
        state.pending
            && state
                .last_signal
                .is_some_and(|signal| signal.elapsed() >= self.debounce)
    }

    fn mark_refreshed(&self) {
        let mut state = self.state.lock().expect("refresher state lock poisoned");
        state.pending = false;
        state.last_signal = None;
    }

    /// Called once a second by the scheduler. No-op unless a signal is
    /// pending and the debounce window has elapsed.
    pub async fn check_and_refresh_if_needed(&self) {
        if !self.due() {
            return;
        }

        match self.refresh().await {
            Ok(()) => {
                self.mark_refreshed();
                info!("materialized view refresh completed");
            }
            Err(err) => {
                // State stays pending so the next tick retries.
                error!("materialized view refresh failed: {err:#}");
            }
        }
    }

    async fn refresh(&self) -> Result<()> {
        // CONCURRENTLY refuses explicit transaction blocks; a single
        // statement on a pooled connection runs in its own implicit one.
        sqlx::query(REFRESH_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

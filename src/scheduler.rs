//! Recurring job scheduler.
//!
//! Each job loops in its own task and computes the next wall-clock fire time
//! only after the previous run returns, so one job never overlaps itself and
//! ticks missed during a slow run are coalesced into the next future tick.
//!
//! Per exchange: `update()` runs once immediately at startup and then hourly
//! at minute 0 second 5; `update_live()` runs every minute at a second offset
//! staggered across the exchanges to smooth outbound traffic. Process-wide,
//! the materialized-view refresher check runs once a second.

use std::sync::Arc;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::orchestrator::ExchangeOrchestrator;
use crate::refresher::MaterializedViewRefresher;

/// Stagger offset within the minute for a given exchange ordinal.
pub fn live_stagger_second(index: usize, total: usize) -> i64 {
    (index as i64) * (60 / total.max(1) as i64)
}

/// Next instant at minute 0, second 5, strictly after `now`.
fn next_hourly_fire(now: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = now
        .duration_trunc(TimeDelta::hours(1))
        .expect("hour truncation cannot overflow")
        + TimeDelta::seconds(5);
    if candidate > now {
        candidate
    } else {
        candidate + TimeDelta::hours(1)
    }
}

/// Next instant at the given second of a minute, strictly after `now`.
fn next_minute_fire(now: DateTime<Utc>, second: i64) -> DateTime<Utc> {
    let candidate = now
        .duration_trunc(TimeDelta::minutes(1))
        .expect("minute truncation cannot overflow")
        + TimeDelta::seconds(second);
    if candidate > now {
        candidate
    } else {
        candidate + TimeDelta::minutes(1)
    }
}

async fn sleep_until(fire: DateTime<Utc>) {
    let wait = fire - Utc::now();
    if let Ok(wait) = wait.to_std() {
        tokio::time::sleep(wait).await;
    }
}

/// Owns the running job tasks; dropping or stopping aborts them all.
#[derive(Default)]
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Immediate run at startup, then hourly at minute 0 second 5.
    pub fn register_update_job(&mut self, orchestrator: Arc<ExchangeOrchestrator>) {
        info!(
            section = orchestrator.section_name(),
            "registered update job (immediate + hourly at :00:05)"
        );
        self.handles.push(tokio::spawn(async move {
            orchestrator.update().await;
            loop {
                let fire = next_hourly_fire(Utc::now());
                debug!(section = orchestrator.section_name(), %fire, "next update tick");
                sleep_until(fire).await;
                orchestrator.update().await;
            }
        }));
    }

    /// Every minute at the staggered second.
    pub fn register_live_job(&mut self, orchestrator: Arc<ExchangeOrchestrator>, second: i64) {
        info!(
            section = orchestrator.section_name(),
            second, "registered live collection job (every minute)"
        );
        self.handles.push(tokio::spawn(async move {
            loop {
                sleep_until(next_minute_fire(Utc::now(), second)).await;
                orchestrator.update_live().await;
            }
        }));
    }

    /// Per-second materialized-view refresh check.
    pub fn register_refresher_job(&mut self, refresher: Arc<MaterializedViewRefresher>) {
        info!("registered materialized view refresher (every second)");
        self.handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                refresher.check_and_refresh_if_needed().await;
            }
        }));
    }

    /// Abort all job tasks. In-flight awaits are cancelled at the next
    /// suspension point; database teardown is shielded inside the pool.
    pub fn shutdown(self) {
        info!(jobs = self.handles.len(), "stopping scheduler");
        for handle in self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_exchanges_spread_across_the_minute() {
        let seconds: Vec<i64> = (0..5).map(|i| live_stagger_second(i, 5)).collect();
        assert_eq!(seconds, vec![0, 12, 24, 36, 48]);
    }

    #[test]
    fn single_exchange_fires_at_second_zero() {
        assert_eq!(live_stagger_second(0, 1), 0);
    }

    #[test]
    fn hourly_fire_is_minute_zero_second_five() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 13, 37, 21).unwrap();
        assert_eq!(
            next_hourly_fire(now),
            Utc.with_ymd_and_hms(2024, 6, 1, 14, 0, 5).unwrap()
        );
    }

    #[test]
    fn hourly_fire_just_after_the_hour_stays_in_this_hour() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 14, 0, 1).unwrap();
        assert_eq!(
            next_hourly_fire(now),
            Utc.with_ymd_and_hms(2024, 6, 1, 14, 0, 5).unwrap()
        );
    }

    #[test]
    fn hourly_fire_never_repeats_the_same_instant() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 14, 0, 5).unwrap();
        assert_eq!(
            next_hourly_fire(now),
            Utc.with_ymd_and_hms(2024, 6, 1, 15, 0, 5).unwrap()
        );
    }

    #[test]
    fn minute_fire_lands_on_requested_second() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 34, 56).unwrap();
        assert_eq!(
            next_minute_fire(now, 12),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 35, 12).unwrap()
        );
        assert_eq!(
            next_minute_fire(now, 57),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 34, 57).unwrap()
        );
    }
}

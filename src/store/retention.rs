use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::Store;

/// Periodically drops finished executions older than `max_age`, logs
/// included. Non-terminal executions are never touched.
pub struct RetentionSweeper {
    store: Store,
    max_age: chrono::Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Store, max_age: chrono::Duration, interval: Duration) -> Self {
        Self {
            store,
            max_age,
            interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            max_age_days = self.max_age.num_days(),
            interval_secs = self.interval.as_secs(),
            "Retention sweeper started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.sweep_once(Utc::now()).await;
                    if removed > 0 {
                        tracing::info!(removed, "Purged finished executions");
                    }
                }
            }
        }
    }

    /// Purge everything that finished more than `max_age` before `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        match now.checked_sub_signed(self.max_age) {
            Some(cutoff) => self.store.purge_finished_before(cutoff).await,
            None => 0,
        }
    }
}

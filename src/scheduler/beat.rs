use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::scheduler::recurrence::parse_time_zone;
use crate::store::models::ExecutionRequest;

/// What one scan of due requests did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub claimed: usize,
    pub dispatched: usize,
    pub failed: usize,
}

/// Periodic loop that feeds due execution requests to the dispatcher.
///
/// Several Beats may run against the same store. Each due boundary is
/// claimed with a compare-and-set before dispatch, so a `(request, due_at)`
/// pair is dispatched at most once no matter how many Beats see it.
pub struct Beat {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    instance_id: String,
}

impl Beat {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration, instance_id: impl Into<String>) -> Self {
        Self {
            dispatcher,
            interval,
            instance_id: instance_id.into(),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(beat = %self.instance_id, interval_ms = self.interval.as_millis() as u64, "Beat started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(beat = %self.instance_id, "Beat stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.tick_once(Utc::now()).await;
                    if report.claimed > 0 || report.failed > 0 {
                        tracing::info!(
                            beat = %self.instance_id,
                            due = report.due,
                            claimed = report.claimed,
                            dispatched = report.dispatched,
                            failed = report.failed,
                            "Beat tick"
                        );
                    }
                }
            }
        }
    }

    /// Claim and dispatch every request due at `now`.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> TickReport {
        let due = self.dispatcher.store().due_requests(now).await;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for request in due {
            match self.claim(&request, now).await {
                Ok(true) => report.claimed += 1,
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(
                        beat = %self.instance_id,
                        request_id = %request.id,
                        error = %e,
                        "Failed to claim due request"
                    );
                    report.failed += 1;
                    continue;
                }
            }

            match self.dispatcher.dispatch_request(&request).await {
                Ok(result) => {
                    report.dispatched += 1;
                    tracing::info!(
                        beat = %self.instance_id,
                        request_id = %request.id,
                        execution_id = %result.id,
                        due_at = ?request.next_due_at,
                        "Due request dispatched"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        beat = %self.instance_id,
                        request_id = %request.id,
                        class_path = %request.class_path,
                        error = %e,
                        "Failed to dispatch due request"
                    );
                }
            }
        }
        report
    }

    /// Advance the request past its current boundary. Returns false when
    /// another Beat already claimed it.
    async fn claim(&self, request: &ExecutionRequest, now: DateTime<Utc>) -> Result<bool> {
        let Some(due_at) = request.next_due_at else {
            return Ok(false);
        };
        let tz = parse_time_zone(&request.time_zone)?;
        let next_due = request.recurrence.next_after(due_at, now, tz)?;
        self.dispatcher
            .store()
            .claim_due(&request.id, due_at, next_due)
            .await
    }
}

//! Background maintenance timers: daily reset, retention sweep, stale-call
//! sweep.
//!
//! Every scheduled transition in the system is driven by one of these sweeps
//! evaluating absolute timestamps stored on the records; nothing holds a
//! long-lived timer per record, which is what makes restart semantics
//! trivial.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use outdial_common::clock::{ResetTiming, SchedulePolicy};

use crate::redial::RedialQueue;
use crate::tracker::CallStateTracker;
use crate::webhook_log::WebhookLog;

/// How often the retention sweep scans for expired shards.
const RETENTION_SWEEP_EVERY: Duration = Duration::from_secs(60 * 60);
/// How often stale pending calls are reconciled.
const STALE_SWEEP_EVERY: Duration = Duration::from_secs(5 * 60);

/// Sleep until each reset boundary and reopen the queue.
pub fn spawn_daily_reset(
    redial: Arc<RedialQueue>,
    policy: Arc<SchedulePolicy>,
    timing: ResetTiming,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = policy.now();
            let next = policy.next_reset_boundary(&now, timing);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!("Next daily reset scheduled"; "at" => next.to_rfc3339());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let at = policy.now().timestamp() as u64;
                    match redial.daily_reset(at).await {
                        Ok(summary) => {
                            info!("Daily reset complete";
                                "examined" => summary.examined,
                                "reopened" => summary.reopened);
                        }
                        Err(e) => warn!("Daily reset failed"; "error" => %e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Hourly scan deleting redial and webhook-log shards past retention.
pub fn spawn_retention_sweep(
    redial: Arc<RedialQueue>,
    webhook_log: Arc<WebhookLog>,
    policy: Arc<SchedulePolicy>,
    retention_days: u32,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(RETENTION_SWEEP_EVERY);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now_secs = policy.now().timestamp() as u64;
                    match redial.retention_sweep(now_secs).await {
                        Ok(0) => {}
                        Ok(removed) => info!("Swept redial shards"; "removed" => removed),
                        Err(e) => warn!("Redial retention sweep failed"; "error" => %e),
                    }
                    match webhook_log.retention_sweep(now_secs, retention_days).await {
                        Ok(0) => {}
                        Ok(removed) => info!("Swept webhook logs"; "removed" => removed),
                        Err(e) => warn!("Webhook log retention sweep failed"; "error" => %e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Demote pending calls that outlived the stale horizon.
pub fn spawn_stale_sweep(
    tracker: Arc<CallStateTracker>,
    policy: Arc<SchedulePolicy>,
    max_age: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(STALE_SWEEP_EVERY);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now_secs = policy.now().timestamp() as u64;
                    let demoted = tracker.sweep_stale(max_age, now_secs).await;
                    if demoted > 0 {
                        info!("Stale pending calls demoted"; "count" => demoted);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

//! The call-state tracker: the in-flight registry of outbound calls.
//!
//! One `PendingCall` per dialed call, keyed by provider call id. A single
//! mutex over the map is what makes the dispatcher's "is any call pending to
//! this phone?" check sound against two ticks racing on the same record.
//! Flushes to `call-state-cache.json` on every mutation plus a coarse timer,
//! and rehydrates on startup so restarts never lose in-flight state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence::{Counted, CountedExt, StatsdClient};
use chrono::Utc;
use serde_derive::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use outdial_common::errors::Result;
use outdial_common::metric_name::MetricName;
use outdial_common::store::FileStore;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PendingCallStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PendingCall {
    pub call_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub lead_id: String,
    #[serde(default)]
    pub list_id: Option<String>,
    /// Normalized phone key.
    pub phone: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    pub created_at: u64,
    pub status: PendingCallStatus,
    #[serde(default)]
    pub error: Option<String>,
}

pub struct CallStateTracker {
    calls: Mutex<HashMap<String, PendingCall>>,
    store: FileStore,
    metrics: Arc<StatsdClient>,
    /// Epoch of the first persist failure in the current failing streak;
    /// zero while writes are healthy. Drives the sustained-failure alert.
    persist_failing_since: AtomicU64,
    /// Failing streak length past which the alert fires.
    persist_alert_after: Duration,
}

impl CallStateTracker {
    pub async fn open(
        path: impl Into<PathBuf>,
        persist_alert_after: Duration,
        metrics: Arc<StatsdClient>,
    ) -> Result<Self> {
        let store = FileStore::new(path);
        let calls: HashMap<String, PendingCall> = store.load().await?;
        if !calls.is_empty() {
            info!("Rehydrated call-state cache"; "entries" => calls.len());
        }
        Ok(Self {
            calls: Mutex::new(calls),
            store,
            metrics,
            persist_failing_since: AtomicU64::new(0),
            persist_alert_after,
        })
    }

    /// Register a freshly dialed call. Serialized with `any_pending_for`
    /// through the map mutex.
    pub async fn add(&self, call: PendingCall) {
        let mut calls = self.calls.lock().await;
        if let Some(previous) = calls.insert(call.call_id.clone(), call) {
            warn!("Replaced existing pending call";
                "call_id" => &previous.call_id, "phone" => &previous.phone);
        }
        self.persist_locked(&calls).await;
    }

    /// Remove and return the entry for a completed call.
    pub async fn complete(&self, call_id: &str) -> Option<PendingCall> {
        let mut calls = self.calls.lock().await;
        let removed = calls.remove(call_id);
        if removed.is_some() {
            self.persist_locked(&calls).await;
        }
        removed
    }

    /// Mark a call failed in place; failed entries stay operator-visible
    /// until the sweep prunes them.
    pub async fn fail(&self, call_id: &str, error: &str) -> bool {
        let mut calls = self.calls.lock().await;
        let Some(call) = calls.get_mut(call_id) else {
            return false;
        };
        call.status = PendingCallStatus::Failed;
        call.error = Some(error.to_owned());
        self.persist_locked(&calls).await;
        true
    }

    pub async fn get(&self, call_id: &str) -> Option<PendingCall> {
        self.calls.lock().await.get(call_id).cloned()
    }

    /// The dispatcher's last guard against concurrent dials: a linear scan
    /// of the small pending set.
    pub async fn any_pending_for(&self, phone: &str) -> Option<PendingCall> {
        let calls = self.calls.lock().await;
        calls
            .values()
            .find(|call| call.status == PendingCallStatus::Pending && call.phone == phone)
            .cloned()
    }

    pub async fn pending_count(&self) -> usize {
        let calls = self.calls.lock().await;
        calls
            .values()
            .filter(|call| call.status == PendingCallStatus::Pending)
            .count()
    }

    /// Demote over-age pending entries to failed and prune terminal entries
    /// twice as old, keeping the cache bounded. Returns how many were
    /// demoted.
    pub async fn sweep_stale(&self, max_age: Duration, now_secs: u64) -> usize {
        let max_age_secs = max_age.as_secs();
        let mut calls = self.calls.lock().await;
        let mut demoted = 0;

        for call in calls.values_mut() {
            if call.status == PendingCallStatus::Pending
                && now_secs.saturating_sub(call.created_at) > max_age_secs
            {
                call.status = PendingCallStatus::Failed;
                call.error = Some("stale: no completion before max age".to_owned());
                warn!("Demoted stale pending call";
                    "call_id" => &call.call_id, "phone" => &call.phone,
                    "age_secs" => now_secs.saturating_sub(call.created_at));
                demoted += 1;
            }
        }
        let prune_before = now_secs.saturating_sub(max_age_secs * 2);
        calls.retain(|_, call| {
            call.status == PendingCallStatus::Pending || call.created_at > prune_before
        });

        if demoted > 0 {
            let _ = self
                .metrics
                .count(MetricName::TrackerStaleDemoted.as_ref(), demoted as i64);
        }
        self.persist_locked(&calls).await;
        demoted
    }

    /// Flush the map to disk; the periodic timer and shutdown both land here.
    pub async fn flush(&self) -> Result<()> {
        let calls = self.calls.lock().await;
        self.store.persist(&*calls).await
    }

    /// Persist under the held map lock. Failures keep the in-memory state
    /// and are retried on the next mutation or timer tick; a sustained
    /// failing streak raises the operator alert.
    async fn persist_locked(&self, calls: &HashMap<String, PendingCall>) {
        match self.store.persist(calls).await {
            Ok(()) => {
                self.persist_failing_since.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let now = Utc::now().timestamp() as u64;
                let since = self
                    .persist_failing_since
                    .compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed)
                    .unwrap_or_else(|existing| existing);
                let _ = self.metrics.incr(MetricName::StorePersistError.as_ref());
                if now.saturating_sub(since) >= self.persist_alert_after.as_secs() {
                    error!("Call-state cache writes failing persistently";
                        "since" => since, "error" => %e);
                } else {
                    warn!("Call-state cache persist failed; will retry"; "error" => %e);
                }
            }
        }
    }

    /// Periodic flush loop; exits on shutdown after one final flush.
    pub fn spawn_periodic_flush(
        tracker: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = tracker.flush().await {
                            warn!("Periodic call-state flush failed"; "error" => %e);
                        }
                    }
                    _ = shutdown.changed() => {
                        if let Err(e) = tracker.flush().await {
                            warn!("Final call-state flush failed"; "error" => %e);
                        }
                        break;
                    }
                }
            }
        })
    }
}

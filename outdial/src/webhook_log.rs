//! Bounded daily audit log of ingress events and blocked contact attempts.

use std::path::PathBuf;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tokio::sync::Mutex;

use outdial_common::clock::SchedulePolicy;
use outdial_common::errors::Result;
use outdial_common::store::{shard_path, sweep_shards, FileStore};

pub const SHARD_PREFIX: &str = "webhook-logs";

/// Per-day entry cap; the oldest entries fall off once a day exceeds it.
const DAILY_CAP: usize = 5000;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WebhookKind {
    CallCompletion,
    InboundSms,
    BlockedAttempt,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebhookEvent {
    pub at: u64,
    pub kind: WebhookKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WebhookEvent {
    pub fn call_completion(at: u64, phone: &str, call_id: &str, detail: Option<String>) -> Self {
        Self {
            at,
            kind: WebhookKind::CallCompletion,
            phone: Some(phone.to_owned()),
            lead_id: None,
            call_id: Some(call_id.to_owned()),
            detail,
        }
    }

    pub fn inbound_sms(at: u64, phone: &str, detail: Option<String>) -> Self {
        Self {
            at,
            kind: WebhookKind::InboundSms,
            phone: Some(phone.to_owned()),
            lead_id: None,
            call_id: None,
            detail,
        }
    }

    pub fn blocked_attempt(
        at: u64,
        phone: &str,
        lead_id: Option<&str>,
        detail: Option<String>,
    ) -> Self {
        Self {
            at,
            kind: WebhookKind::BlockedAttempt,
            phone: Some(phone.to_owned()),
            lead_id: lead_id.map(str::to_owned),
            call_id: None,
            detail,
        }
    }
}

struct DayShard {
    key: String,
    events: Vec<WebhookEvent>,
    store: FileStore,
}

impl DayShard {
    async fn open(data_dir: &std::path::Path, key: &str) -> Result<Self> {
        let store = FileStore::new(shard_path(data_dir, SHARD_PREFIX, key));
        let events = store.load().await?;
        Ok(Self {
            key: key.to_owned(),
            events,
            store,
        })
    }
}

pub struct WebhookLog {
    inner: Mutex<DayShard>,
    policy: Arc<SchedulePolicy>,
    data_dir: PathBuf,
}

impl WebhookLog {
    pub async fn open(data_dir: impl Into<PathBuf>, policy: Arc<SchedulePolicy>) -> Result<Self> {
        let data_dir = data_dir.into();
        let key = policy.day_key(&policy.now());
        let shard = DayShard::open(&data_dir, &key).await?;
        Ok(Self {
            inner: Mutex::new(shard),
            policy,
            data_dir,
        })
    }

    /// Append one event to the current day's shard, rolling at the local
    /// day boundary and dropping the oldest entries past the cap.
    pub async fn append(&self, event: WebhookEvent) -> Result<()> {
        let key = self.policy.day_key(&self.policy.at(event.at));
        let mut shard = self.inner.lock().await;
        if shard.key != key {
            *shard = DayShard::open(&self.data_dir, &key).await?;
        }
        shard.events.push(event);
        if shard.events.len() > DAILY_CAP {
            let excess = shard.events.len() - DAILY_CAP;
            shard.events.drain(..excess);
        }
        shard.store.persist(&shard.events).await
    }

    pub async fn today_len(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    /// Delete day shards older than the retention window.
    pub async fn retention_sweep(&self, now_secs: u64, retention_days: u32) -> Result<usize> {
        let cutoff_secs = now_secs.saturating_sub(u64::from(retention_days) * 24 * 60 * 60);
        let cutoff_key = self.policy.day_key(&self.policy.at(cutoff_secs));
        let shard = self.inner.lock().await;
        sweep_shards(&self.data_dir, SHARD_PREFIX, &shard.key, &cutoff_key).await
    }
}

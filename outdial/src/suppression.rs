//! The suppression / blocklist store: the TCPA-compliance gate.
//!
//! One flag per unique `(field, normalized value)` pair, persisted as a
//! single `blocklist-config.json` document. Adds are idempotent; flags are
//! permanent unless an operator removes them. The global enable switch
//! exists for tests only and defaults on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cadence::{CountedExt, StatsdClient};
use chrono::Utc;
use serde_derive::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tokio::sync::RwLock;
use uuid::Uuid;

use outdial_common::errors::Result;
use outdial_common::metric_name::MetricName;
use outdial_common::phone::normalize_phone;
use outdial_common::store::FileStore;

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, AsRefStr, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SuppressionField {
    Phone,
    LeadId,
    Email,
}

impl SuppressionField {
    /// Normalize a raw value into its join-key form for this field.
    pub fn normalize(&self, raw: &str) -> String {
        match self {
            Self::Phone => normalize_phone(raw),
            Self::LeadId | Self::Email => raw.trim().to_lowercase(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SuppressionFlag {
    pub id: String,
    pub field: SuppressionField,
    /// Normalized value.
    pub value: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub added_at: u64,
}

/// The on-disk shape of `blocklist-config.json`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct BlocklistDoc {
    enabled: bool,
    flags: Vec<SuppressionFlag>,
}

impl Default for BlocklistDoc {
    fn default() -> Self {
        Self {
            enabled: true,
            flags: Vec::new(),
        }
    }
}

pub struct SuppressionStore {
    flags: RwLock<HashMap<(SuppressionField, String), SuppressionFlag>>,
    enabled: AtomicBool,
    store: FileStore,
    metrics: Arc<StatsdClient>,
}

impl SuppressionStore {
    pub async fn open(path: impl Into<PathBuf>, metrics: Arc<StatsdClient>) -> Result<Self> {
        let store = FileStore::new(path);
        let doc: BlocklistDoc = store.load().await?;
        let flags = doc
            .flags
            .into_iter()
            .map(|flag| ((flag.field, flag.value.clone()), flag))
            .collect();
        Ok(Self {
            flags: RwLock::new(flags),
            enabled: AtomicBool::new(doc.enabled),
            store,
            metrics,
        })
    }

    /// Whether the normalized value is blocked, and by which flag.
    pub async fn check(&self, field: SuppressionField, raw: &str) -> (bool, Option<SuppressionFlag>) {
        if !self.enabled.load(Ordering::Relaxed) {
            return (false, None);
        }
        let value = field.normalize(raw);
        let flags = self.flags.read().await;
        match flags.get(&(field, value)) {
            Some(flag) => (true, Some(flag.clone())),
            None => (false, None),
        }
    }

    /// Idempotent insert; an existing flag comes back unchanged with
    /// `already_existed` set.
    pub async fn add(
        &self,
        field: SuppressionField,
        raw: &str,
        reason: Option<&str>,
    ) -> Result<(SuppressionFlag, bool)> {
        let value = field.normalize(raw);
        let mut flags = self.flags.write().await;
        if let Some(existing) = flags.get(&(field, value.clone())) {
            return Ok((existing.clone(), true));
        }

        let flag = SuppressionFlag {
            id: Uuid::new_v4().to_string(),
            field,
            value: value.clone(),
            reason: reason.map(str::to_owned),
            added_at: Utc::now().timestamp() as u64,
        };
        flags.insert((field, value), flag.clone());
        self.persist(&flags).await?;
        info!("Suppression flag added";
            "field" => field.as_ref(),
            "value" => &flag.value,
            "reason" => flag.reason.as_deref().unwrap_or("-"));
        let _ = self.metrics.incr(MetricName::SuppressionAdded.as_ref());
        Ok((flag, false))
    }

    pub async fn remove(&self, flag_id: &str) -> Result<bool> {
        let mut flags = self.flags.write().await;
        let key = flags
            .iter()
            .find(|(_, flag)| flag.id == flag_id)
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => {
                flags.remove(&key);
                self.persist(&flags).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Global kill switch; only tests disable it.
    pub fn enable(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.flags.read().await.len()
    }

    pub async fn flush(&self) -> Result<()> {
        let flags = self.flags.read().await;
        self.persist(&flags).await
    }

    async fn persist(
        &self,
        flags: &HashMap<(SuppressionField, String), SuppressionFlag>,
    ) -> Result<()> {
        let mut list: Vec<SuppressionFlag> = flags.values().cloned().collect();
        list.sort_by(|a, b| (a.added_at, &a.id).cmp(&(b.added_at, &b.id)));
        let doc = BlocklistDoc {
            enabled: self.enabled.load(Ordering::Relaxed),
            flags: list,
        };
        self.store.persist(&doc).await.map_err(|e| {
            warn!("Blocklist persist failed"; "error" => %e);
            let _ = self.metrics.incr(MetricName::StorePersistError.as_ref());
            e
        })
    }
}

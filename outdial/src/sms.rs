//! The SMS follow-up scheduler: a day-gap message sequencer.
//!
//! Leads whose calls land on voicemail or no-answer enter a bounded message
//! series. Day gaps are measured from the initial enqueue instant, not from
//! the prior send, so a late send never shifts the rest of the series. The
//! weekday/hours clock gate only makes a record wait; it never advances or
//! mutates it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use cadence::{CountedExt, StatsdClient};
use chrono::DateTime;
use chrono_tz::Tz;
use serde_derive::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tokio::sync::Mutex;

use outdial_common::clock::SchedulePolicy;
use outdial_common::errors::Result;
use outdial_common::metric_name::MetricName;
use outdial_common::store::FileStore;

use crate::redial::record::Lead;
use crate::redial::schedule::RetryPolicy;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SmsStatus {
    Active,
    Completed,
    OptedOut,
    Cancelled,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SentMessage {
    pub position: usize,
    pub msg_id: String,
    pub at: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SmsRecord {
    /// Normalized phone key.
    pub phone: String,
    pub lead_id: String,
    #[serde(default)]
    pub list_id: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,

    /// Zero-based index of the next message to send.
    pub sequence_position: usize,
    /// Instant the sequence was (re)started; day gaps anchor here.
    pub enqueued_at: u64,
    pub next_eligible_timestamp: u64,
    #[serde(default)]
    pub last_sent_timestamp: Option<u64>,
    pub status: SmsStatus,
    #[serde(default)]
    pub sent: Vec<SentMessage>,
    /// Consecutive adapter failures at the current position.
    #[serde(default)]
    pub send_failures: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Clone, Debug)]
pub struct SmsConfig {
    /// Message templates, `{first_name}` placeholder supported.
    pub templates: Vec<String>,
    /// Day offsets from enqueue per position; `day_gaps[0]` is zero.
    pub day_gaps: Vec<u32>,
    pub business_hours_only: bool,
    /// Backoff for adapter send failures; never advances the sequence.
    pub failure_retry: RetryPolicy,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            templates: vec![
                "Hi {first_name}, we just tried to reach you about your health \
                 coverage options. Call us back at your convenience."
                    .to_owned(),
                "Hi {first_name}, following up on your health coverage inquiry. \
                 We're available 11am-8pm ET."
                    .to_owned(),
                "{first_name}, open enrollment windows close quickly. Reply or \
                 call to finish your quote."
                    .to_owned(),
                "Last note from us, {first_name}: your quote is still on file \
                 whenever you're ready. Reply STOP to opt out."
                    .to_owned(),
            ],
            day_gaps: vec![0, 1, 3, 7],
            business_hours_only: true,
            failure_retry: RetryPolicy::default(),
        }
    }
}

pub struct SmsScheduler {
    records: Mutex<HashMap<String, SmsRecord>>,
    store: FileStore,
    config: SmsConfig,
    policy: Arc<SchedulePolicy>,
    metrics: Arc<StatsdClient>,
}

impl SmsScheduler {
    pub async fn open(
        path: impl Into<PathBuf>,
        config: SmsConfig,
        policy: Arc<SchedulePolicy>,
        metrics: Arc<StatsdClient>,
    ) -> Result<Self> {
        let store = FileStore::new(path);
        let records = store.load().await?;
        Ok(Self {
            records: Mutex::new(records),
            store,
            config,
            policy,
            metrics,
        })
    }

    /// Template count; the sequence completes at this position.
    pub fn sequence_len(&self) -> usize {
        self.config.templates.len()
    }

    /// The SMS clock gate. Weekends are always suppressed; the hours window
    /// applies unless configured off. Ineligible instants only make records
    /// wait.
    pub fn clock_allows(&self, now: &DateTime<Tz>) -> bool {
        if !self.policy.is_weekday(now) || self.policy.is_blackout(now.date_naive()) {
            return false;
        }
        !self.config.business_hours_only || self.policy.in_business_hours(now)
    }

    /// Start (or restart) the follow-up sequence for a lead. Position zero
    /// is immediately eligible. Opted-out records are never restarted.
    pub async fn enqueue(&self, lead: &Lead, now_secs: u64) -> Result<Option<SmsRecord>> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(&lead.phone) {
            if existing.status == SmsStatus::OptedOut {
                return Ok(None);
            }
        }
        let record = SmsRecord {
            phone: lead.phone.clone(),
            lead_id: lead.lead_id.clone(),
            list_id: lead.list_id.clone(),
            first_name: lead.first_name.clone(),
            last_name: lead.last_name.clone(),
            state: lead.state.clone(),
            sequence_position: 0,
            enqueued_at: now_secs,
            next_eligible_timestamp: now_secs,
            last_sent_timestamp: None,
            status: SmsStatus::Active,
            sent: Vec::new(),
            send_failures: 0,
            created_at: now_secs,
            updated_at: now_secs,
        };
        records.insert(lead.phone.clone(), record.clone());
        self.persist(&records).await?;
        Ok(Some(record))
    }

    /// Records whose next message is due, earliest first. The clock gate and
    /// the suppression guard stay with the dispatcher.
    pub async fn eligible(&self, now: &DateTime<Tz>) -> Vec<SmsRecord> {
        let now_secs = now.timestamp() as u64;
        let records = self.records.lock().await;
        let mut due: Vec<SmsRecord> = records
            .values()
            .filter(|record| {
                record.status == SmsStatus::Active
                    && record.sequence_position < self.sequence_len()
                    && now_secs >= record.next_eligible_timestamp
            })
            .cloned()
            .collect();
        due.sort_by_key(|record| record.next_eligible_timestamp);
        due
    }

    /// Render the next message body for a record.
    pub fn render(&self, record: &SmsRecord) -> Option<String> {
        let template = self.config.templates.get(record.sequence_position)?;
        let first_name = record.first_name.as_deref().unwrap_or("there");
        Some(template.replace("{first_name}", first_name))
    }

    /// Advance the sequence after a successful send. The next eligible
    /// instant is anchored to `enqueued_at`, not to this send.
    pub async fn record_send(
        &self,
        phone: &str,
        msg_id: &str,
        now_secs: u64,
    ) -> Result<Option<SmsRecord>> {
        let sequence_len = self.sequence_len();
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(phone) else {
            return Ok(None);
        };

        record.sent.push(SentMessage {
            position: record.sequence_position,
            msg_id: msg_id.to_owned(),
            at: now_secs,
        });
        record.last_sent_timestamp = Some(now_secs);
        record.send_failures = 0;
        record.sequence_position += 1;
        record.updated_at = now_secs;

        if record.sequence_position >= sequence_len {
            record.status = SmsStatus::Completed;
            let _ = self
                .metrics
                .incr(MetricName::SmsSequenceCompleted.as_ref());
        } else {
            let gap_days = self
                .config
                .day_gaps
                .get(record.sequence_position)
                .copied()
                .unwrap_or(0);
            record.next_eligible_timestamp =
                self.policy.add_days(record.enqueued_at, u64::from(gap_days));
        }

        let snapshot = record.clone();
        self.persist(&records).await?;
        Ok(Some(snapshot))
    }

    /// Push the record's next attempt out after an adapter failure; the
    /// sequence position never moves on failure.
    pub async fn record_send_failure(&self, phone: &str, now_secs: u64) -> Result<()> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(phone) else {
            return Ok(());
        };
        record.send_failures += 1;
        record.next_eligible_timestamp = self
            .config
            .failure_retry
            .next_redial(now_secs, record.send_failures);
        record.updated_at = now_secs;
        self.persist(&records).await
    }

    /// Inbound STOP: the sequence ends permanently.
    pub async fn opt_out(&self, phone: &str, now_secs: u64) -> Result<bool> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(phone) else {
            return Ok(false);
        };
        if record.status == SmsStatus::OptedOut {
            return Ok(false);
        }
        record.status = SmsStatus::OptedOut;
        record.updated_at = now_secs;
        self.persist(&records).await?;
        Ok(true)
    }

    /// Admin cancel; unlike opt-out the lead may be re-enqueued later.
    pub async fn cancel(&self, phone: &str, now_secs: u64) -> Result<bool> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(phone) else {
            return Ok(false);
        };
        if record.status != SmsStatus::Active {
            return Ok(false);
        }
        record.status = SmsStatus::Cancelled;
        record.updated_at = now_secs;
        self.persist(&records).await?;
        Ok(true)
    }

    pub async fn get(&self, phone: &str) -> Option<SmsRecord> {
        self.records.lock().await.get(phone).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn reload(&self) -> Result<()> {
        let mut records = self.records.lock().await;
        *records = self.store.load().await?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let records = self.records.lock().await;
        self.persist(&records).await
    }

    async fn persist(&self, records: &HashMap<String, SmsRecord>) -> Result<()> {
        self.store.persist(records).await.map_err(|e| {
            warn!("SMS store persist failed"; "error" => %e);
            let _ = self.metrics.incr(MetricName::StorePersistError.as_ref());
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use outdial_common::clock::ScheduleConfig;
    use outdial_common::metrics::new_test_metrics;

    use super::*;

    fn policy() -> Arc<SchedulePolicy> {
        Arc::new(SchedulePolicy::from_config(&ScheduleConfig::default()).unwrap())
    }

    async fn scheduler_in(dir: &std::path::Path) -> SmsScheduler {
        SmsScheduler::open(
            dir.join("sms-pending-leads.json"),
            SmsConfig::default(),
            policy(),
            Arc::new(new_test_metrics()),
        )
        .await
        .unwrap()
    }

    fn lead(phone: &str) -> Lead {
        Lead {
            phone: phone.to_owned(),
            lead_id: format!("lead-{phone}"),
            first_name: Some("Pat".to_owned()),
            ..Default::default()
        }
    }

    /// 2026-08-05 (a Wednesday) at the given local time, epoch seconds.
    fn wednesday_at(hour: u32, minute: u32) -> u64 {
        policy()
            .local(2026, 8, 5, hour, minute, 0)
            .unwrap()
            .timestamp() as u64
    }

    #[tokio::test]
    async fn first_message_is_immediately_eligible() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        let at = wednesday_at(11, 6);
        let record = scheduler.enqueue(&lead("5558675309"), at).await.unwrap().unwrap();
        assert_eq!(record.sequence_position, 0);
        assert_eq!(record.next_eligible_timestamp, at);

        let due = scheduler.eligible(&policy().at(at)).await;
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn day_gaps_anchor_to_the_enqueue_instant() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        let enqueued = wednesday_at(11, 6);
        scheduler.enqueue(&lead("5558675309"), enqueued).await.unwrap();

        // First send happens three hours late; the second message is still
        // anchored one calendar day after enqueue, not after the send.
        let sent_at = wednesday_at(14, 6);
        let record = scheduler
            .record_send("5558675309", "msg-1", sent_at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sequence_position, 1);
        assert_eq!(
            record.next_eligible_timestamp,
            policy().add_days(enqueued, 1)
        );
    }

    #[tokio::test]
    async fn sequence_completes_after_the_last_template() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        let enqueued = wednesday_at(11, 0);
        scheduler.enqueue(&lead("5558675309"), enqueued).await.unwrap();

        for i in 0..4u64 {
            let at = policy().add_days(enqueued, 7 * i);
            scheduler
                .record_send("5558675309", &format!("msg-{i}"), at)
                .await
                .unwrap();
        }
        let record = scheduler.get("5558675309").await.unwrap();
        assert_eq!(record.status, SmsStatus::Completed);
        assert_eq!(record.sequence_position, 4);
        assert_eq!(record.sent.len(), 4);
        // Position never decreases and nothing further is due.
        assert!(scheduler
            .eligible(&policy().at(record.next_eligible_timestamp + 60))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn re_enqueue_restarts_but_opt_out_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        let at = wednesday_at(11, 0);
        scheduler.enqueue(&lead("5558675309"), at).await.unwrap();
        scheduler.record_send("5558675309", "msg-0", at).await.unwrap();

        // A later no-answer restarts the series from the top.
        let again = wednesday_at(15, 0);
        let record = scheduler
            .enqueue(&lead("5558675309"), again)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sequence_position, 0);
        assert_eq!(record.enqueued_at, again);

        assert!(scheduler.opt_out("5558675309", again + 60).await.unwrap());
        // Opt-out blocks any restart.
        assert!(scheduler
            .enqueue(&lead("5558675309"), again + 120)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            scheduler.get("5558675309").await.unwrap().status,
            SmsStatus::OptedOut
        );
    }

    #[tokio::test]
    async fn send_failure_backs_off_without_advancing() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        let at = wednesday_at(11, 0);
        scheduler.enqueue(&lead("5558675309"), at).await.unwrap();

        scheduler.record_send_failure("5558675309", at).await.unwrap();
        let record = scheduler.get("5558675309").await.unwrap();
        assert_eq!(record.sequence_position, 0);
        assert_eq!(record.send_failures, 1);
        // One failure: two-minute floor applies.
        assert_eq!(record.next_eligible_timestamp, at + 120);
    }

    #[tokio::test]
    async fn clock_gate_waits_without_mutating() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        // Saturday noon: weekday rule suppresses SMS.
        let saturday = policy().local(2026, 8, 8, 12, 0, 0).unwrap();
        assert!(!scheduler.clock_allows(&saturday));
        // Wednesday before hours.
        let early = policy().local(2026, 8, 5, 8, 0, 0).unwrap();
        assert!(!scheduler.clock_allows(&early));
        let midday = policy().local(2026, 8, 5, 12, 0, 0).unwrap();
        assert!(scheduler.clock_allows(&midday));
    }

    #[tokio::test]
    async fn renders_template_with_first_name() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path()).await;
        let at = wednesday_at(11, 0);
        let record = scheduler.enqueue(&lead("5558675309"), at).await.unwrap().unwrap();
        let body = scheduler.render(&record).unwrap();
        assert!(body.starts_with("Hi Pat,"));

        let mut anonymous = record.clone();
        anonymous.first_name = None;
        assert!(scheduler.render(&anonymous).unwrap().starts_with("Hi there,"));
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let at = wednesday_at(11, 0);
        {
            let scheduler = scheduler_in(dir.path()).await;
            scheduler.enqueue(&lead("5558675309"), at).await.unwrap();
            scheduler.record_send("5558675309", "msg-0", at).await.unwrap();
        }
        let reopened = scheduler_in(dir.path()).await;
        let record = reopened.get("5558675309").await.unwrap();
        assert_eq!(record.sequence_position, 1);
        assert_eq!(record.sent[0].msg_id, "msg-0");
    }
}

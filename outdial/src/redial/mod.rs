//! The redial queue: a durable, per-phone retry state machine.
//!
//! Records live in monthly JSON shards under `<data>/redial-queue/`. The
//! queue owns the current month's map and lazily retains the previous
//! month's so reconciliation writes (and multi-day retries straddling a
//! rollover) keep targeting their historical shard. Attempt counters only
//! advance in [`RedialQueue::apply_completion`]; dispatch never touches
//! them, which is what makes duplicate webhooks and adapter retries safe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cadence::{Counted, CountedExt, StatsdClient};
use chrono::{DateTime, Datelike};
use chrono_tz::Tz;
use tokio::sync::Mutex;

use outdial_common::clock::SchedulePolicy;
use outdial_common::errors::Result;
use outdial_common::metric_name::MetricName;
use outdial_common::store::{shard_path, sweep_shards, FileStore};

pub mod outcome;
pub mod record;
pub mod schedule;

pub use outcome::{classify_completion, CallOutcome, Classification, OutcomeClass};
pub use record::{CallAttempt, Lead, OutcomeEntry, RedialRecord, RedialStatus};
pub use schedule::RetryPolicy;

pub const SHARD_PREFIX: &str = "redial-queue";

/// Consecutive adapter failures tolerated before a record is paused.
const MAX_DISPATCH_FAILURES: u32 = 3;

#[derive(Clone, Debug)]
pub struct RedialConfig {
    pub retry: RetryPolicy,
    /// When set, only records touched during the current policy day are
    /// eligible; the filter reads `updated_at` so daily-reset-touched
    /// records stay dialable.
    pub same_day_only: bool,
    pub retention_days: u32,
}

impl Default for RedialConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            same_day_only: false,
            retention_days: 30,
        }
    }
}

/// Everything the ingress needs to reconcile one completion webhook.
#[derive(Clone, Debug)]
pub struct CompletionUpdate {
    /// Normalized phone key.
    pub phone: String,
    pub call_id: String,
    pub outcome: CallOutcome,
    /// Completion instant, epoch seconds.
    pub at: u64,
    pub requested_callback_at: Option<u64>,
    pub summary: Option<String>,
    /// Lead identity for records created by their first outcome webhook.
    pub lead: Option<Lead>,
}

/// What a completion did to the record, so the caller can drive the
/// cross-store effects (suppression, SMS enqueue, CRM update).
#[derive(Clone, Debug)]
pub struct CompletionEffect {
    pub record: RedialRecord,
    pub status_before: RedialStatus,
    pub duplicate: bool,
    pub attempts_incremented: bool,
    /// Terminal-stop outcomes also write the suppression store.
    pub suppress: bool,
    pub enqueue_sms: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ResetSummary {
    pub examined: usize,
    pub reopened: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct DispatchErrorEffect {
    pub consecutive_failures: u32,
    pub paused: bool,
}

struct Shard {
    key: String,
    records: HashMap<String, RedialRecord>,
    store: FileStore,
}

impl Shard {
    async fn open(data_dir: &Path, key: &str) -> Result<Self> {
        let store = FileStore::new(shard_path(data_dir, SHARD_PREFIX, key));
        let records = store.load().await?;
        Ok(Self {
            key: key.to_owned(),
            records,
            store,
        })
    }

    async fn persist(&self, metrics: &StatsdClient) -> Result<()> {
        self.store.persist(&self.records).await.map_err(|e| {
            warn!("Redial shard persist failed";
                "shard" => &self.key, "error" => %e);
            let _ = metrics.incr(MetricName::StorePersistError.as_ref());
            e
        })
    }
}

struct Inner {
    current: Shard,
    previous: Option<Shard>,
}

impl Inner {
    fn record_shards(&mut self) -> impl Iterator<Item = &mut Shard> + '_ {
        std::iter::once(&mut self.current).chain(self.previous.as_mut())
    }

    fn find(&self, phone: &str) -> Option<&RedialRecord> {
        self.current
            .records
            .get(phone)
            .or_else(|| self.previous.as_ref().and_then(|s| s.records.get(phone)))
    }

    /// Which shard holds the phone: true for current, false for previous.
    fn holding_shard(&self, phone: &str) -> Option<bool> {
        if self.current.records.contains_key(phone) {
            Some(true)
        } else if self
            .previous
            .as_ref()
            .map_or(false, |s| s.records.contains_key(phone))
        {
            Some(false)
        } else {
            None
        }
    }
}

pub struct RedialQueue {
    inner: Mutex<Inner>,
    config: RedialConfig,
    policy: Arc<SchedulePolicy>,
    metrics: Arc<StatsdClient>,
    data_dir: PathBuf,
}

impl RedialQueue {
    /// Open the current month's shard, plus last month's when it exists on
    /// disk (multi-day retries straddle the rollover).
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        config: RedialConfig,
        policy: Arc<SchedulePolicy>,
        metrics: Arc<StatsdClient>,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        let now = policy.now();
        let current_key = policy.month_key(&now);
        let current = Shard::open(&data_dir, &current_key).await?;

        let first_of_month = now.date_naive().with_day(1).unwrap_or_else(|| now.date_naive());
        let prev_key = first_of_month
            .pred_opt()
            .unwrap_or(first_of_month)
            .format("%Y-%m")
            .to_string();
        let previous = if prev_key != current_key
            && shard_path(&data_dir, SHARD_PREFIX, &prev_key).exists()
        {
            Some(Shard::open(&data_dir, &prev_key).await?)
        } else {
            None
        };

        Ok(Self {
            inner: Mutex::new(Inner { current, previous }),
            config,
            policy,
            metrics,
            data_dir,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Month-boundary rollover: the current shard becomes the previous and a
    /// fresh (or existing) shard for the new month is loaded.
    async fn roll_if_needed(&self, inner: &mut Inner, now_secs: u64) -> Result<()> {
        let key = self.policy.month_key(&self.policy.at(now_secs));
        if inner.current.key == key {
            return Ok(());
        }
        info!("Redial shard rollover"; "from" => &inner.current.key, "to" => &key);
        let fresh = Shard::open(&self.data_dir, &key).await?;
        let old = std::mem::replace(&mut inner.current, fresh);
        inner.previous = Some(old);
        Ok(())
    }

    /// Re-read the active shards from disk; disk is authoritative because
    /// every mutation persists before returning.
    pub async fn reload(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.current.records = inner.current.store.load().await?;
        if let Some(prev) = inner.previous.as_mut() {
            prev.records = prev.store.load().await?;
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.current.records.len()
            + inner.previous.as_ref().map_or(0, |s| s.records.len())
    }

    pub async fn get(&self, phone: &str) -> Option<RedialRecord> {
        let inner = self.inner.lock().await;
        inner.find(phone).cloned()
    }

    /// Insert a new lead as pending, immediately eligible. Touches an
    /// existing record's demographics and `updated_at` instead of resetting
    /// its counters.
    pub async fn upsert_lead(&self, lead: Lead, now_secs: u64) -> Result<RedialRecord> {
        let mut inner = self.inner.lock().await;
        self.roll_if_needed(&mut inner, now_secs).await?;

        let record = match inner.holding_shard(&lead.phone) {
            Some(in_current) => {
                let shard = if in_current || inner.previous.is_none() {
                    &mut inner.current
                } else {
                    inner.previous.as_mut().unwrap()
                };
                let record = shard
                    .records
                    .get_mut(&lead.phone)
                    .ok_or("lead vanished during upsert")?;
                record.list_id = lead.list_id.or(record.list_id.take());
                record.first_name = lead.first_name.or(record.first_name.take());
                record.last_name = lead.last_name.or(record.last_name.take());
                record.state = lead.state.or(record.state.take());
                record.touch(now_secs);
                let snapshot = record.clone();
                shard.persist(&self.metrics).await?;
                snapshot
            }
            None => {
                let record = RedialRecord::new(lead, now_secs);
                inner
                    .current
                    .records
                    .insert(record.phone.clone(), record.clone());
                inner.current.persist(&self.metrics).await?;
                record
            }
        };
        Ok(record)
    }

    /// Predicate rules that read only the record (status, callback time,
    /// caps, next-redial instant, same-day scoping). The clock gate and the
    /// pre-contact guards are the dispatcher's to re-check.
    pub fn is_record_eligible(&self, record: &RedialRecord, now_secs: u64) -> bool {
        if !record.status.is_dialable() {
            return false;
        }
        if record.status == RedialStatus::Rescheduled {
            if let Some(callback_at) = record.scheduled_callback_time {
                if callback_at > now_secs {
                    return false;
                }
            }
        }
        let retry = &self.config.retry;
        if retry.lifetime_capped(record.attempts) || retry.daily_capped(record.attempts_today) {
            return false;
        }
        if record.next_redial_timestamp.map_or(false, |t| t > now_secs) {
            return false;
        }
        if self.config.same_day_only
            && !self.policy.same_policy_day(record.updated_at, now_secs)
        {
            return false;
        }
        true
    }

    /// Records ready to dial at `now`, earliest-ready and least-tried first.
    pub async fn eligible(&self, now: &DateTime<Tz>) -> Vec<RedialRecord> {
        let now_secs = now.timestamp() as u64;
        let mut inner = self.inner.lock().await;
        if let Err(e) = self.roll_if_needed(&mut inner, now_secs).await {
            warn!("Shard rollover failed during scan"; "error" => %e);
        }
        let mut ready: Vec<RedialRecord> = inner
            .current
            .records
            .values()
            .chain(inner.previous.iter().flat_map(|s| s.records.values()))
            .filter(|record| self.is_record_eligible(record, now_secs))
            .cloned()
            .collect();
        ready.sort_by_key(|r| (r.next_redial_timestamp.unwrap_or(0), r.attempts));
        ready
    }

    /// Apply one completion webhook to its record.
    ///
    /// A repeated `call_id` is a duplicate: counters and histories stay
    /// untouched, and only a terminal classification may still move the
    /// status. Otherwise the attempt counters advance exactly once and the
    /// next-redial instant is recomputed from the progressive table.
    pub async fn apply_completion(&self, update: CompletionUpdate) -> Result<CompletionEffect> {
        let mut inner = self.inner.lock().await;
        self.roll_if_needed(&mut inner, update.at).await?;

        let in_current = match inner.holding_shard(&update.phone) {
            Some(in_current) => in_current,
            None => {
                // First outcome webhook for this phone creates the record.
                let lead = update.lead.clone().unwrap_or_else(|| Lead {
                    phone: update.phone.clone(),
                    ..Default::default()
                });
                let record = RedialRecord::new(lead, update.at);
                inner.current.records.insert(update.phone.clone(), record);
                true
            }
        };
        let shard = if in_current {
            &mut inner.current
        } else {
            match inner.previous.as_mut() {
                Some(prev) => prev,
                None => &mut inner.current,
            }
        };
        let record = shard
            .records
            .get_mut(&update.phone)
            .ok_or("record vanished during completion")?;

        let status_before = record.status;
        let retry = &self.config.retry;

        if record.last_call_id.as_deref() == Some(update.call_id.as_str()) {
            // Duplicate webhook: only terminal-status fields may move.
            let suppress = update.outcome.class() == OutcomeClass::TerminalStop;
            if update.outcome.is_terminal() && !record.status.is_terminal() {
                record.status = RedialStatus::Completed;
                record.last_outcome = Some(update.outcome);
                record.touch(update.at);
                let snapshot = record.clone();
                shard.persist(&self.metrics).await?;
                return Ok(CompletionEffect {
                    record: snapshot,
                    status_before,
                    duplicate: true,
                    attempts_incremented: false,
                    suppress,
                    enqueue_sms: false,
                });
            }
            return Ok(CompletionEffect {
                record: record.clone(),
                status_before,
                duplicate: true,
                attempts_incremented: false,
                suppress,
                enqueue_sms: false,
            });
        }

        // The daily counter rolls when the previous attempt was on an
        // earlier policy day and no reset ran in between (process downtime).
        if let Some(prev) = record.last_call_timestamp {
            if !self.policy.same_policy_day(prev, update.at) {
                record.attempts_today = 0;
            }
        }

        let mut incremented = false;
        if record.attempts < retry.max_attempts {
            record.attempts += 1;
            incremented = true;
        }
        if record.attempts_today < retry.max_daily_attempts {
            record.attempts_today += 1;
        }

        record.push_outcome(update.outcome, update.at);
        record.push_attempt(CallAttempt {
            call_id: update.call_id.clone(),
            at: update.at,
            outcome: Some(update.outcome),
            summary: update.summary.clone(),
        });
        record.last_call_id = Some(update.call_id.clone());
        record.last_outcome = Some(update.outcome);
        record.last_call_timestamp = Some(update.at);
        record.scheduled_callback_time = None;
        record.dispatch_failures = 0;
        record.touch(update.at);

        let mut suppress = false;
        match update.outcome.class() {
            OutcomeClass::TerminalSuccess => {
                record.status = RedialStatus::Completed;
                record.next_redial_timestamp = None;
            }
            OutcomeClass::TerminalStop => {
                record.status = RedialStatus::Completed;
                record.next_redial_timestamp = None;
                suppress = true;
            }
            OutcomeClass::RetryableContact | OutcomeClass::RetryableFailure => {
                record.next_redial_timestamp = Some(retry.next_redial(update.at, record.attempts));
                if retry.lifetime_capped(record.attempts) {
                    // The lifetime cap wins even when the daily cap fires on
                    // the same attempt.
                    record.status = RedialStatus::MaxAttempts;
                } else if update.outcome == CallOutcome::CallbackRequested
                    && update.requested_callback_at.map_or(false, |t| t > update.at)
                {
                    let callback_at = update.requested_callback_at.unwrap_or(update.at);
                    record.scheduled_callback_time = Some(callback_at);
                    record.next_redial_timestamp = Some(callback_at);
                    record.status = RedialStatus::Rescheduled;
                } else if retry.daily_capped(record.attempts_today) {
                    record.status = RedialStatus::DailyMaxReached;
                } else if record.status != RedialStatus::Paused {
                    // Paused is admin-owned; a retryable completion does not
                    // reopen it.
                    record.status = RedialStatus::Pending;
                }
            }
        }

        let enqueue_sms = update.outcome.triggers_sms();
        let snapshot = record.clone();
        shard.persist(&self.metrics).await?;

        Ok(CompletionEffect {
            record: snapshot,
            status_before,
            duplicate: false,
            attempts_incremented: incremented,
            suppress,
            enqueue_sms,
        })
    }

    /// Push a record's next-redial instant out (used when the tracker still
    /// holds a pending call for the phone).
    pub async fn defer(&self, phone: &str, until_secs: u64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(in_current) = inner.holding_shard(phone) else {
            return Ok(false);
        };
        let shard = if in_current {
            &mut inner.current
        } else {
            match inner.previous.as_mut() {
                Some(prev) => prev,
                None => return Ok(false),
            }
        };
        if let Some(record) = shard.records.get_mut(phone) {
            record.next_redial_timestamp = Some(until_secs);
            shard.persist(&self.metrics).await?;
        }
        Ok(true)
    }

    /// Record an adapter dial failure: reschedule by the progressive table
    /// without touching attempt counters; the third consecutive failure
    /// pauses the record for operator attention.
    pub async fn note_dispatch_error(
        &self,
        phone: &str,
        now_secs: u64,
    ) -> Result<DispatchErrorEffect> {
        let mut inner = self.inner.lock().await;
        let Some(in_current) = inner.holding_shard(phone) else {
            return Ok(DispatchErrorEffect {
                consecutive_failures: 0,
                paused: false,
            });
        };
        let shard = if in_current {
            &mut inner.current
        } else {
            match inner.previous.as_mut() {
                Some(prev) => prev,
                None => {
                    return Ok(DispatchErrorEffect {
                        consecutive_failures: 0,
                        paused: false,
                    })
                }
            }
        };
        let record = shard
            .records
            .get_mut(phone)
            .ok_or("record vanished during dispatch error")?;

        record.dispatch_failures += 1;
        let paused = record.dispatch_failures >= MAX_DISPATCH_FAILURES;
        if paused {
            record.status = RedialStatus::Paused;
        } else {
            record.next_redial_timestamp = Some(
                self.config
                    .retry
                    .next_redial(now_secs, record.attempts.max(1)),
            );
        }
        record.touch(now_secs);
        let failures = record.dispatch_failures;
        shard.persist(&self.metrics).await?;
        Ok(DispatchErrorEffect {
            consecutive_failures: failures,
            paused,
        })
    }

    /// The daily reset: zero `attempts_today` everywhere, reopen
    /// daily-capped records with lifetime remaining, leave rescheduled
    /// callbacks and terminal records alone, and skip retention-age leads.
    pub async fn daily_reset(&self, now_secs: u64) -> Result<ResetSummary> {
        let retention_secs = u64::from(self.config.retention_days) * 24 * 60 * 60;
        let max_attempts = self.config.retry.max_attempts;
        let mut summary = ResetSummary::default();

        let mut inner = self.inner.lock().await;
        self.roll_if_needed(&mut inner, now_secs).await?;
        for shard in inner.record_shards() {
            let mut dirty = false;
            for record in shard.records.values_mut() {
                if record.status.is_terminal() {
                    continue;
                }
                if now_secs.saturating_sub(record.created_at) > retention_secs {
                    // Aged out; the retention sweep owns it now.
                    continue;
                }
                summary.examined += 1;
                // The reset is the day boundary: every live record is
                // touched so the same-day scoping sees it as current.
                record.attempts_today = 0;
                record.touch(now_secs);
                dirty = true;
                if record.status == RedialStatus::DailyMaxReached && record.attempts < max_attempts
                {
                    record.status = RedialStatus::Pending;
                    record.next_redial_timestamp = Some(now_secs);
                    summary.reopened += 1;
                }
            }
            if dirty {
                shard.persist(&self.metrics).await?;
            }
        }

        if summary.reopened > 0 {
            let _ = self
                .metrics
                .count(MetricName::RedialResetReopened.as_ref(), summary.reopened as i64);
        }
        Ok(summary)
    }

    /// Terminal-complete a non-terminal record from outside the dial path
    /// (SMS opt-out, admin action). Returns whether a record changed.
    pub async fn complete_externally(&self, phone: &str, reason: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(in_current) = inner.holding_shard(phone) else {
            return Ok(false);
        };
        let shard = if in_current {
            &mut inner.current
        } else {
            match inner.previous.as_mut() {
                Some(prev) => prev,
                None => return Ok(false),
            }
        };
        let record = shard
            .records
            .get_mut(phone)
            .ok_or("record vanished during external completion")?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        let status_before = record.status;
        record.status = RedialStatus::Completed;
        record.next_redial_timestamp = None;
        record.touch(self.policy.now_secs());
        info!("Redial record completed externally";
            "phone" => phone,
            "status_before" => status_before.as_ref(),
            "status_after" => RedialStatus::Completed.as_ref(),
            "reason" => reason);
        shard.persist(&self.metrics).await?;
        Ok(true)
    }

    /// Delete month shards older than the retention window; never the
    /// current shard. Drops the in-memory previous shard when its file goes.
    pub async fn retention_sweep(&self, now_secs: u64) -> Result<usize> {
        let cutoff_secs =
            now_secs.saturating_sub(u64::from(self.config.retention_days) * 24 * 60 * 60);
        let cutoff_key = self.policy.month_key(&self.policy.at(cutoff_secs));

        let mut inner = self.inner.lock().await;
        let current_key = inner.current.key.clone();
        let removed =
            sweep_shards(&self.data_dir, SHARD_PREFIX, &current_key, &cutoff_key).await?;
        let previous_expired = inner
            .previous
            .as_ref()
            .map_or(false, |prev| prev.key < cutoff_key);
        if previous_expired {
            inner.previous = None;
        }
        if removed > 0 {
            let _ = self
                .metrics
                .count(MetricName::RetentionSwept.as_ref(), removed as i64);
        }
        Ok(removed)
    }

    pub async fn flush(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.current.persist(&self.metrics).await?;
        if let Some(prev) = inner.previous.as_ref() {
            prev.persist(&self.metrics).await?;
        }
        Ok(())
    }
}

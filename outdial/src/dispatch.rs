//! The two dispatch loops: redial and SMS.
//!
//! Each loop runs on its own timer, fast-exits when disabled, overlapped, or
//! outside its clock window, and re-checks the pre-contact gate per record
//! immediately before the adapter call. Attempt counters never advance here;
//! only the completion ingress moves them, so a tick that dies mid-flight
//! costs nothing but time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence::{CountedExt, StatsdClient};
use chrono::DateTime;
use chrono_tz::Tz;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use outdial_common::metric_name::MetricName;

use crate::adapters::DialRequest;
use crate::app_state::AppState;
use crate::gate::{pre_contact_gate, ContactPurpose, GateDenial};
use crate::sms::SmsStatus;
use crate::tracker::{PendingCall, PendingCallStatus};

/// Per-tick accounting, logged and counted at the end of each pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// False when the tick fast-exited (disabled, overlap, clock window).
    pub ran: bool,
    pub scanned: usize,
    pub eligible: usize,
    pub dispatched: usize,
    pub skipped_suppressed: usize,
    pub skipped_pending: usize,
    pub errored: usize,
}

fn incr_skip(metrics: &StatsdClient, name: MetricName, reason: &str) {
    metrics
        .incr_with_tags(name.as_ref())
        .with_tag("reason", reason)
        .send();
}

pub struct RedialDispatcher {
    state: AppState,
    busy: AtomicBool,
}

impl RedialDispatcher {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            busy: AtomicBool::new(false),
        }
    }

    pub fn spawn(
        dispatcher: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        dispatcher.tick().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    pub async fn tick(&self) -> TickSummary {
        self.tick_at(self.state.policy.now()).await
    }

    /// One dispatch pass at an explicit instant. Public so the clock can be
    /// pinned; the timer always passes the policy "now".
    pub async fn tick_at(&self, now: DateTime<Tz>) -> TickSummary {
        if !self.state.settings.redial_enabled {
            return TickSummary::default();
        }
        // Discard overlapping ticks outright.
        if self.busy.swap(true, Ordering::SeqCst) {
            let _ = self
                .state
                .metrics
                .incr(MetricName::RedialTickOverlap.as_ref());
            return TickSummary::default();
        }
        let summary = self.run_tick(now).await;
        self.busy.store(false, Ordering::SeqCst);
        summary
    }

    async fn run_tick(&self, now: DateTime<Tz>) -> TickSummary {
        let state = &self.state;
        let mut summary = TickSummary::default();
        if !state.policy.dispatchable(&now) {
            debug!("Redial tick outside the dial window");
            return summary;
        }
        summary.ran = true;

        if let Err(e) = state.redial.reload().await {
            warn!("Redial shard reload failed; using in-memory set"; "error" => %e);
        }
        summary.scanned = state.redial.len().await;
        let eligible = state.redial.eligible(&now).await;
        summary.eligible = eligible.len();
        let now_secs = now.timestamp() as u64;
        let grace_secs = state.settings.pending_grace_minutes * 60;

        for record in eligible {
            // Completion ingress runs concurrently; re-read before dialing.
            let Some(record) = state.redial.get(&record.phone).await else {
                continue;
            };
            if !state.redial.is_record_eligible(&record, now_secs) {
                continue;
            }

            match pre_contact_gate(
                &state.suppression,
                &state.tracker,
                &state.webhook_log,
                &state.metrics,
                &record.phone,
                Some(&record.lead_id),
                ContactPurpose::Dial,
            )
            .await
            {
                Err(GateDenial::Suppressed(_)) => {
                    summary.skipped_suppressed += 1;
                    incr_skip(&state.metrics, MetricName::RedialSkipped, "suppressed");
                    continue;
                }
                Err(GateDenial::CallInFlight(_)) => {
                    if let Err(e) = state
                        .redial
                        .defer(&record.phone, now_secs + grace_secs)
                        .await
                    {
                        warn!("Failed to defer record"; "phone" => &record.phone, "error" => %e);
                    }
                    summary.skipped_pending += 1;
                    incr_skip(&state.metrics, MetricName::RedialSkipped, "call_in_flight");
                    continue;
                }
                Ok(()) => {}
            }

            let request = DialRequest {
                request_id: Uuid::new_v4().to_string(),
                phone: record.phone.clone(),
                lead_id: record.lead_id.clone(),
                first_name: record.first_name.clone(),
                last_name: record.last_name.clone(),
            };
            match state.voice.dial(&request).await {
                Ok(response) => {
                    state
                        .tracker
                        .add(PendingCall {
                            call_id: response.call_id.clone(),
                            request_id: Some(request.request_id),
                            lead_id: record.lead_id.clone(),
                            list_id: record.list_id.clone(),
                            phone: record.phone.clone(),
                            first_name: record.first_name.clone(),
                            last_name: record.last_name.clone(),
                            created_at: now_secs,
                            status: PendingCallStatus::Pending,
                            error: None,
                        })
                        .await;
                    info!("Dispatched outbound call";
                        "phone" => &record.phone,
                        "lead_id" => &record.lead_id,
                        "call_id" => &response.call_id,
                        "attempt" => record.attempts + 1);
                    let _ = state.metrics.incr(MetricName::RedialDispatched.as_ref());
                    summary.dispatched += 1;
                }
                Err(e) => {
                    warn!("Voice dial failed";
                        "phone" => &record.phone, "error" => %e);
                    incr_skip(
                        &state.metrics,
                        MetricName::RedialDispatchError,
                        e.metric_label(),
                    );
                    summary.errored += 1;
                    match state.redial.note_dispatch_error(&record.phone, now_secs).await {
                        Ok(effect) if effect.paused => {
                            error!("Record paused after repeated adapter failures";
                                "phone" => &record.phone,
                                "failures" => effect.consecutive_failures);
                            let _ = state.metrics.incr(MetricName::RedialPaused.as_ref());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Failed to reschedule after dial error";
                                "phone" => &record.phone, "error" => %e);
                        }
                    }
                }
            }
        }

        info!("Redial tick complete";
            "scanned" => summary.scanned,
            "eligible" => summary.eligible,
            "dispatched" => summary.dispatched,
            "skipped_suppressed" => summary.skipped_suppressed,
            "skipped_pending" => summary.skipped_pending,
            "errored" => summary.errored);
        let _ = state.metrics.incr(MetricName::RedialTick.as_ref());
        summary
    }
}

pub struct SmsDispatcher {
    state: AppState,
    busy: AtomicBool,
}

impl SmsDispatcher {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            busy: AtomicBool::new(false),
        }
    }

    pub fn spawn(
        dispatcher: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        dispatcher.tick().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    pub async fn tick(&self) -> TickSummary {
        self.tick_at(self.state.policy.now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Tz>) -> TickSummary {
        if !self.state.settings.sms_enabled {
            return TickSummary::default();
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            return TickSummary::default();
        }
        let summary = self.run_tick(now).await;
        self.busy.store(false, Ordering::SeqCst);
        summary
    }

    async fn run_tick(&self, now: DateTime<Tz>) -> TickSummary {
        let state = &self.state;
        let mut summary = TickSummary::default();
        // Ineligible instants just make records wait; nothing advances.
        if !state.sms.clock_allows(&now) {
            debug!("SMS tick outside the send window");
            return summary;
        }
        summary.ran = true;

        if let Err(e) = state.sms.reload().await {
            warn!("SMS store reload failed; using in-memory set"; "error" => %e);
        }
        summary.scanned = state.sms.len().await;
        let due = state.sms.eligible(&now).await;
        summary.eligible = due.len();
        let now_secs = now.timestamp() as u64;
        let from_number = state.settings.sms.from_number.clone();

        for record in due {
            let Some(record) = state.sms.get(&record.phone).await else {
                continue;
            };
            if record.status != SmsStatus::Active
                || now_secs < record.next_eligible_timestamp
                || record.sequence_position >= state.sms.sequence_len()
            {
                continue;
            }

            if pre_contact_gate(
                &state.suppression,
                &state.tracker,
                &state.webhook_log,
                &state.metrics,
                &record.phone,
                None,
                ContactPurpose::Sms,
            )
            .await
            .is_err()
            {
                summary.skipped_suppressed += 1;
                incr_skip(&state.metrics, MetricName::SmsSkipped, "suppressed");
                continue;
            }

            let Some(body) = state.sms.render(&record) else {
                warn!("No template for sequence position";
                    "phone" => &record.phone, "position" => record.sequence_position);
                continue;
            };
            match state.sms_adapter.send(&record.phone, &from_number, &body).await {
                Ok(response) => {
                    match state
                        .sms
                        .record_send(&record.phone, &response.msg_id, now_secs)
                        .await
                    {
                        Ok(updated) => {
                            info!("Sent follow-up SMS";
                                "phone" => &record.phone,
                                "lead_id" => &record.lead_id,
                                "msg_id" => &response.msg_id,
                                "position" => record.sequence_position);
                            if let Some(updated) = updated {
                                if updated.status == SmsStatus::Completed {
                                    debug!("SMS sequence complete"; "phone" => &updated.phone);
                                }
                            }
                            let _ = state.metrics.incr(MetricName::SmsSent.as_ref());
                            summary.dispatched += 1;
                        }
                        Err(e) => {
                            warn!("Failed to record SMS send";
                                "phone" => &record.phone, "error" => %e);
                            summary.errored += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("SMS send failed"; "phone" => &record.phone, "error" => %e);
                    incr_skip(&state.metrics, MetricName::SmsSendError, e.metric_label());
                    summary.errored += 1;
                    if let Err(e) = state.sms.record_send_failure(&record.phone, now_secs).await {
                        warn!("Failed to back off SMS record";
                            "phone" => &record.phone, "error" => %e);
                    }
                }
            }
        }

        info!("SMS tick complete";
            "scanned" => summary.scanned,
            "eligible" => summary.eligible,
            "sent" => summary.dispatched,
            "skipped_suppressed" => summary.skipped_suppressed,
            "errored" => summary.errored);
        let _ = state.metrics.incr(MetricName::SmsTick.as_ref());
        summary
    }
}

#[cfg(test)]
mod tests {
    use crate::adapters::mock::{MockSmsAdapter, MockUpstreamCrm, MockVoiceAdapter};
    use crate::adapters::{AdapterError, DialResponse, SendResponse};
    use crate::app_state::test_support::state_with_mocks;
    use crate::redial::{Lead, RedialStatus};
    use crate::suppression::SuppressionField;

    use super::*;

    fn lead(phone: &str) -> Lead {
        Lead {
            phone: phone.to_owned(),
            lead_id: format!("lead-{phone}"),
            first_name: Some("Pat".to_owned()),
            ..Default::default()
        }
    }

    /// Wednesday 2026-08-05 13:00 in the policy zone: mid business hours.
    fn midday(state: &AppState) -> DateTime<Tz> {
        state.policy.local(2026, 8, 5, 13, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn dispatches_eligible_records_and_tracks_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut voice = MockVoiceAdapter::new();
        voice.expect_dial().times(1).returning(|_| {
            Ok(DialResponse {
                call_id: "call-1".to_owned(),
            })
        });
        let state = state_with_mocks(
            dir.path(),
            voice,
            MockSmsAdapter::new(),
            MockUpstreamCrm::new(),
        )
        .await;
        let now = midday(&state);
        state
            .redial
            .upsert_lead(lead("5558675309"), now.timestamp() as u64)
            .await
            .unwrap();

        let dispatcher = RedialDispatcher::new(state.clone());
        let summary = dispatcher.tick_at(now).await;

        assert!(summary.ran);
        assert_eq!(summary.dispatched, 1);
        let pending = state.tracker.any_pending_for("5558675309").await.unwrap();
        assert_eq!(pending.call_id, "call-1");
        // Dispatch never advances counters.
        assert_eq!(state.redial.get("5558675309").await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn in_flight_call_defers_by_the_grace_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut voice = MockVoiceAdapter::new();
        voice.expect_dial().times(0);
        let state = state_with_mocks(
            dir.path(),
            voice,
            MockSmsAdapter::new(),
            MockUpstreamCrm::new(),
        )
        .await;
        let now = midday(&state);
        let now_secs = now.timestamp() as u64;
        state
            .redial
            .upsert_lead(lead("5558675309"), now_secs)
            .await
            .unwrap();
        state
            .tracker
            .add(PendingCall {
                call_id: "call-0".to_owned(),
                request_id: None,
                lead_id: "lead-5558675309".to_owned(),
                list_id: None,
                phone: "5558675309".to_owned(),
                first_name: None,
                last_name: None,
                created_at: now_secs - 60,
                status: PendingCallStatus::Pending,
                error: None,
            })
            .await;

        let dispatcher = RedialDispatcher::new(state.clone());
        let summary = dispatcher.tick_at(now).await;

        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.skipped_pending, 1);
        let record = state.redial.get("5558675309").await.unwrap();
        // Deferred by the five-minute grace.
        assert_eq!(record.next_redial_timestamp, Some(now_secs + 300));
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test]
    async fn suppressed_records_are_skipped_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut voice = MockVoiceAdapter::new();
        voice.expect_dial().times(0);
        let state = state_with_mocks(
            dir.path(),
            voice,
            MockSmsAdapter::new(),
            MockUpstreamCrm::new(),
        )
        .await;
        let now = midday(&state);
        let now_secs = now.timestamp() as u64;
        state
            .redial
            .upsert_lead(lead("5558675309"), now_secs)
            .await
            .unwrap();
        let before = state.redial.get("5558675309").await.unwrap();
        state
            .suppression
            .add(SuppressionField::Phone, "5558675309", Some("dnc"))
            .await
            .unwrap();

        let dispatcher = RedialDispatcher::new(state.clone());
        let summary = dispatcher.tick_at(now).await;

        assert_eq!(summary.skipped_suppressed, 1);
        let after = state.redial.get("5558675309").await.unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(after.next_redial_timestamp, before.next_redial_timestamp);
        assert_eq!(after.attempts, 0);
        // The block left an audit entry.
        assert_eq!(state.webhook_log.today_len().await, 1);
    }

    #[tokio::test]
    async fn outside_business_hours_nothing_dispatches() {
        let dir = tempfile::tempdir().unwrap();
        let mut voice = MockVoiceAdapter::new();
        voice.expect_dial().times(0);
        let state = state_with_mocks(
            dir.path(),
            voice,
            MockSmsAdapter::new(),
            MockUpstreamCrm::new(),
        )
        .await;
        let now_secs = midday(&state).timestamp() as u64;
        state
            .redial
            .upsert_lead(lead("5558675309"), now_secs)
            .await
            .unwrap();

        let dispatcher = RedialDispatcher::new(state.clone());
        // 22:00 the same day: past close.
        let evening = state.policy.local(2026, 8, 5, 22, 0, 0).unwrap();
        let summary = dispatcher.tick_at(evening).await;
        assert!(!summary.ran);
        assert_eq!(summary.dispatched, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_ticks_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut voice = MockVoiceAdapter::new();
        // The single dial blocks long enough for the second tick to fire.
        voice.expect_dial().times(1).returning(|_| {
            std::thread::sleep(Duration::from_millis(250));
            Ok(DialResponse {
                call_id: "call-slow".to_owned(),
            })
        });
        let state = state_with_mocks(
            dir.path(),
            voice,
            MockSmsAdapter::new(),
            MockUpstreamCrm::new(),
        )
        .await;
        let now = midday(&state);
        state
            .redial
            .upsert_lead(lead("5558675309"), now.timestamp() as u64)
            .await
            .unwrap();

        let dispatcher = Arc::new(RedialDispatcher::new(state));
        let first = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.tick_at(now).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = dispatcher.tick_at(now).await;
        assert!(!second.ran);
        assert_eq!(second.dispatched, 0);

        let first = first.await.unwrap();
        assert_eq!(first.dispatched, 1);
    }

    #[tokio::test]
    async fn adapter_error_reschedules_without_counting() {
        let dir = tempfile::tempdir().unwrap();
        let mut voice = MockVoiceAdapter::new();
        voice.expect_dial().times(1).returning(|_| {
            Err(AdapterError::Upstream {
                status: "503".to_owned(),
                message: "down".to_owned(),
            })
        });
        let state = state_with_mocks(
            dir.path(),
            voice,
            MockSmsAdapter::new(),
            MockUpstreamCrm::new(),
        )
        .await;
        let now = midday(&state);
        let now_secs = now.timestamp() as u64;
        state
            .redial
            .upsert_lead(lead("5558675309"), now_secs)
            .await
            .unwrap();

        let dispatcher = RedialDispatcher::new(state.clone());
        let summary = dispatcher.tick_at(now).await;

        assert_eq!(summary.errored, 1);
        let record = state.redial.get("5558675309").await.unwrap();
        assert_eq!(record.attempts, 0);
        assert_eq!(record.status, RedialStatus::Pending);
        // Pushed by the progressive table (two-minute floor).
        assert_eq!(record.next_redial_timestamp, Some(now_secs + 120));
    }

    #[tokio::test]
    async fn sms_tick_sends_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let mut sms_adapter = MockSmsAdapter::new();
        sms_adapter.expect_send().times(1).returning(|to, _, body| {
            assert_eq!(to, "5558675309");
            assert!(body.starts_with("Hi Pat,"));
            Ok(SendResponse {
                msg_id: "msg-1".to_owned(),
            })
        });
        let state = state_with_mocks(
            dir.path(),
            MockVoiceAdapter::new(),
            sms_adapter,
            MockUpstreamCrm::new(),
        )
        .await;
        let now = midday(&state);
        let now_secs = now.timestamp() as u64;
        state
            .sms
            .enqueue(&lead("5558675309"), now_secs)
            .await
            .unwrap();

        let dispatcher = SmsDispatcher::new(state.clone());
        let summary = dispatcher.tick_at(now).await;

        assert!(summary.ran);
        assert_eq!(summary.dispatched, 1);
        let record = state.sms.get("5558675309").await.unwrap();
        assert_eq!(record.sequence_position, 1);
    }

    #[tokio::test]
    async fn sms_tick_waits_on_weekends() {
        let dir = tempfile::tempdir().unwrap();
        let mut sms_adapter = MockSmsAdapter::new();
        sms_adapter.expect_send().times(0);
        let state = state_with_mocks(
            dir.path(),
            MockVoiceAdapter::new(),
            sms_adapter,
            MockUpstreamCrm::new(),
        )
        .await;
        let now_secs = midday(&state).timestamp() as u64;
        state
            .sms
            .enqueue(&lead("5558675309"), now_secs)
            .await
            .unwrap();

        let dispatcher = SmsDispatcher::new(state.clone());
        // Saturday noon.
        let saturday = state.policy.local(2026, 8, 8, 12, 0, 0).unwrap();
        let summary = dispatcher.tick_at(saturday).await;
        assert!(!summary.ran);
        // The record is untouched, just waiting.
        let record = state.sms.get("5558675309").await.unwrap();
        assert_eq!(record.sequence_position, 0);
        assert_eq!(record.next_eligible_timestamp, now_secs);
    }

    #[tokio::test]
    async fn sms_suppression_blocks_without_advancing() {
        let dir = tempfile::tempdir().unwrap();
        let mut sms_adapter = MockSmsAdapter::new();
        sms_adapter.expect_send().times(0);
        let state = state_with_mocks(
            dir.path(),
            MockVoiceAdapter::new(),
            sms_adapter,
            MockUpstreamCrm::new(),
        )
        .await;
        let now = midday(&state);
        let now_secs = now.timestamp() as u64;
        state
            .sms
            .enqueue(&lead("5558675309"), now_secs)
            .await
            .unwrap();
        state
            .suppression
            .add(SuppressionField::Phone, "5558675309", Some("stop"))
            .await
            .unwrap();

        let dispatcher = SmsDispatcher::new(state.clone());
        let summary = dispatcher.tick_at(now).await;
        assert_eq!(summary.skipped_suppressed, 1);
        assert_eq!(
            state.sms.get("5558675309").await.unwrap().sequence_position,
            0
        );
    }
}

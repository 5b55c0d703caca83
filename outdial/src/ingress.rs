//! Completion ingress: the single entry point for provider callbacks.
//!
//! The webhook transports (out of scope here) parse and normalize payloads,
//! then call into this component. State mutation runs synchronously inside
//! the call so a returned error tells the transport to redeliver; duplicate
//! detection makes redelivery safe.

use cadence::CountedExt;

use outdial_common::errors::{DialerErrorKind, Result};
use outdial_common::metric_name::MetricName;
use outdial_common::phone::normalize_phone;

use crate::adapters::sms::InboundSms;
use crate::adapters::voice::CallCompletion;
use crate::app_state::AppState;
use crate::redial::outcome::{classify_completion, CallOutcome};
use crate::redial::{CompletionEffect, CompletionUpdate, Lead};
use crate::suppression::SuppressionField;
use crate::webhook_log::WebhookEvent;

/// Opt-out keywords honored on inbound SMS, matched as standalone words.
const OPT_OUT_KEYWORDS: &[&str] = &["STOP", "STOPALL", "UNSUBSCRIBE", "CANCEL", "END", "QUIT"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundDisposition {
    OptOut,
    Recorded,
}

pub struct CompletionIngress {
    state: AppState,
}

impl CompletionIngress {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Apply one call-completion webhook: classify, reconcile the redial
    /// record, release the tracker entry, and fan out the side effects
    /// (suppression, SMS enqueue, CRM update).
    pub async fn handle_call_completion(
        &self,
        completion: CallCompletion,
    ) -> Result<CompletionEffect> {
        let state = &self.state;
        let at = state.policy.now_secs();

        // Phone from the payload, or from the tracked call it answers.
        let mut phone = normalize_phone(&completion.phone);
        if phone.is_empty() {
            phone = state
                .tracker
                .get(&completion.call_id)
                .await
                .map(|call| call.phone)
                .ok_or_else(|| {
                    DialerErrorKind::Validation(format!(
                        "completion {} carries no phone and no tracked call",
                        completion.call_id
                    ))
                })?;
        }

        state
            .webhook_log
            .append(WebhookEvent::call_completion(
                at,
                &phone,
                &completion.call_id,
                completion.disposition_tag.clone(),
            ))
            .await?;

        let classified = classify_completion(&completion);
        if let Some(tag) = classified.unknown_tag.as_deref() {
            warn!("Unknown outcome tag; classified as confused";
                "tag" => tag, "call_id" => &completion.call_id);
            let _ = state
                .metrics
                .incr(MetricName::IngressUnknownOutcome.as_ref());
        }

        // Release the in-flight entry; its lead identity seeds records
        // created by their first completion.
        let tracked = state.tracker.complete(&completion.call_id).await;
        let lead = tracked.map(|call| Lead {
            phone: phone.clone(),
            lead_id: call.lead_id,
            list_id: call.list_id,
            first_name: call.first_name,
            last_name: call.last_name,
            state: None,
        });

        let effect = state
            .redial
            .apply_completion(CompletionUpdate {
                phone: phone.clone(),
                call_id: completion.call_id.clone(),
                outcome: classified.outcome,
                at,
                requested_callback_at: completion.requested_callback_at,
                summary: completion.summary.clone(),
                lead,
            })
            .await?;

        let _ = state
            .metrics
            .incr(MetricName::IngressCallCompletion.as_ref());
        if effect.duplicate {
            debug!("Duplicate completion webhook";
                "call_id" => &completion.call_id, "phone" => &phone);
            let _ = state.metrics.incr(MetricName::IngressDuplicate.as_ref());
        }

        if effect.suppress {
            state
                .suppression
                .add(
                    SuppressionField::Phone,
                    &phone,
                    Some(classified.outcome.as_ref()),
                )
                .await?;
            if classified.outcome == CallOutcome::DncRequested
                && !effect.record.lead_id.is_empty()
            {
                state
                    .suppression
                    .add(
                        SuppressionField::LeadId,
                        &effect.record.lead_id,
                        Some(classified.outcome.as_ref()),
                    )
                    .await?;
            }
        }

        if effect.enqueue_sms && !effect.duplicate {
            state.sms.enqueue(&effect.record.lead(), at).await?;
        }

        if effect.record.status.is_terminal() && !effect.record.lead_id.is_empty() {
            // Best effort, off the request path; the CRM is never allowed
            // to block core progression.
            let crm = state.crm.clone();
            let lead_id = effect.record.lead_id.clone();
            let status = effect.record.status.as_ref().to_owned();
            let summary = completion.summary.clone();
            tokio::spawn(async move {
                if let Err(e) = crm.update(&lead_id, &status, summary.as_deref()).await {
                    warn!("CRM update failed"; "lead_id" => &lead_id, "error" => %e);
                }
            });
        }

        info!("Applied call completion";
            "phone" => &phone,
            "lead_id" => &effect.record.lead_id,
            "call_id" => &completion.call_id,
            "attempt" => effect.record.attempts,
            "status_before" => effect.status_before.as_ref(),
            "status_after" => effect.record.status.as_ref(),
            "reason" => classified.outcome.as_ref());
        Ok(effect)
    }

    /// Apply one inbound SMS: opt-outs suppress the phone, end the SMS
    /// sequence, and close any live redial record.
    pub async fn handle_inbound_sms(&self, inbound: InboundSms) -> Result<InboundDisposition> {
        let state = &self.state;
        let at = state.policy.now_secs();
        let phone = normalize_phone(&inbound.from);
        if phone.is_empty() {
            return Err(
                DialerErrorKind::Validation("inbound SMS carries no usable phone".to_owned())
                    .into(),
            );
        }

        let preview: String = inbound.body.chars().take(64).collect();
        state
            .webhook_log
            .append(WebhookEvent::inbound_sms(at, &phone, Some(preview)))
            .await?;
        let _ = state.metrics.incr(MetricName::IngressInboundSms.as_ref());

        if !is_opt_out(&inbound.body) {
            debug!("Inbound SMS recorded"; "phone" => &phone);
            return Ok(InboundDisposition::Recorded);
        }

        let _ = state.metrics.incr(MetricName::IngressOptOut.as_ref());
        state
            .suppression
            .add(SuppressionField::Phone, &phone, Some("sms_opt_out"))
            .await?;
        let sms_marked = state.sms.opt_out(&phone, at).await?;
        let redial_closed = state.redial.complete_externally(&phone, "sms_opt_out").await?;
        info!("Processed SMS opt-out";
            "phone" => &phone,
            "sms_record" => sms_marked,
            "redial_record" => redial_closed);
        Ok(InboundDisposition::OptOut)
    }
}

/// Whether an inbound body is an opt-out request: any standalone keyword
/// match, case-insensitive.
pub fn is_opt_out(body: &str) -> bool {
    body.split_whitespace()
        .any(|word| OPT_OUT_KEYWORDS.contains(&word.to_ascii_uppercase().as_str()))
}

#[cfg(test)]
mod tests {
    use crate::adapters::mock::{MockSmsAdapter, MockUpstreamCrm, MockVoiceAdapter};
    use crate::adapters::voice::AnsweredBy;
    use crate::app_state::test_support::state_with_mocks;
    use crate::redial::{CallOutcome, Lead, RedialStatus};
    use crate::sms::SmsStatus;
    use crate::tracker::{PendingCall, PendingCallStatus};

    use super::*;

    fn completion(call_id: &str, phone: &str, tag: &str) -> CallCompletion {
        CallCompletion {
            call_id: call_id.to_owned(),
            phone: phone.to_owned(),
            answered_by: None,
            disposition_tag: Some(tag.to_owned()),
            transfer_merged: false,
            summary: None,
            requested_callback_at: None,
        }
    }

    async fn ingress_with_crm(
        dir: &std::path::Path,
        crm: MockUpstreamCrm,
    ) -> (CompletionIngress, AppState) {
        let state =
            state_with_mocks(dir, MockVoiceAdapter::new(), MockSmsAdapter::new(), crm).await;
        (CompletionIngress::new(state.clone()), state)
    }

    async fn ingress(dir: &std::path::Path) -> (CompletionIngress, AppState) {
        let mut crm = MockUpstreamCrm::new();
        crm.expect_update().returning(|_, _, _| Ok(()));
        ingress_with_crm(dir, crm).await
    }

    #[tokio::test]
    async fn voicemail_completion_feeds_the_sms_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let (ingress, state) = ingress(dir.path()).await;
        state
            .tracker
            .add(PendingCall {
                call_id: "call-1".to_owned(),
                request_id: None,
                lead_id: "lead-1".to_owned(),
                list_id: None,
                phone: "5558675309".to_owned(),
                first_name: Some("Pat".to_owned()),
                last_name: None,
                created_at: state.policy.now_secs(),
                status: PendingCallStatus::Pending,
                error: None,
            })
            .await;

        let effect = ingress
            .handle_call_completion(completion("call-1", "+1 555 867 5309", "voicemail"))
            .await
            .unwrap();

        assert_eq!(effect.record.attempts, 1);
        assert_eq!(effect.record.status, RedialStatus::Pending);
        // Tracker entry released.
        assert!(state.tracker.any_pending_for("5558675309").await.is_none());
        // SMS sequence started from the tracked lead identity.
        let sms = state.sms.get("5558675309").await.unwrap();
        assert_eq!(sms.sequence_position, 0);
        assert_eq!(sms.lead_id, "lead-1");
        assert_eq!(sms.status, SmsStatus::Active);
    }

    #[tokio::test]
    async fn duplicate_webhook_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (ingress, state) = ingress(dir.path()).await;

        ingress
            .handle_call_completion(completion("call-1", "5558675309", "no_answer"))
            .await
            .unwrap();
        let first = state.redial.get("5558675309").await.unwrap();

        let effect = ingress
            .handle_call_completion(completion("call-1", "5558675309", "no_answer"))
            .await
            .unwrap();
        assert!(effect.duplicate);
        let second = state.redial.get("5558675309").await.unwrap();
        assert_eq!(second.attempts, first.attempts);
        assert_eq!(second.next_redial_timestamp, first.next_redial_timestamp);
    }

    #[tokio::test]
    async fn dnc_completion_suppresses_phone_and_lead() {
        let dir = tempfile::tempdir().unwrap();
        let mut crm = MockUpstreamCrm::new();
        crm.expect_update().returning(|_, _, _| Ok(()));
        let (ingress, state) = ingress_with_crm(dir.path(), crm).await;
        state
            .tracker
            .add(PendingCall {
                call_id: "call-1".to_owned(),
                request_id: None,
                lead_id: "lead-9".to_owned(),
                list_id: None,
                phone: "5558675309".to_owned(),
                first_name: None,
                last_name: None,
                created_at: state.policy.now_secs(),
                status: PendingCallStatus::Pending,
                error: None,
            })
            .await;

        let effect = ingress
            .handle_call_completion(completion("call-1", "5558675309", "dnc"))
            .await
            .unwrap();
        assert_eq!(effect.record.status, RedialStatus::Completed);

        let (blocked, _) = state
            .suppression
            .check(SuppressionField::Phone, "5558675309")
            .await;
        assert!(blocked);
        let (blocked, _) = state
            .suppression
            .check(SuppressionField::LeadId, "lead-9")
            .await;
        assert!(blocked);
        // No SMS sequence for a stop.
        assert!(state.sms.get("5558675309").await.is_none());
    }

    #[tokio::test]
    async fn completion_without_phone_resolves_through_the_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let (ingress, state) = ingress(dir.path()).await;
        state
            .tracker
            .add(PendingCall {
                call_id: "call-7".to_owned(),
                request_id: None,
                lead_id: "lead-7".to_owned(),
                list_id: None,
                phone: "5550001234".to_owned(),
                first_name: None,
                last_name: None,
                created_at: state.policy.now_secs(),
                status: PendingCallStatus::Pending,
                error: None,
            })
            .await;

        let effect = ingress
            .handle_call_completion(completion("call-7", "", "busy"))
            .await
            .unwrap();
        assert_eq!(effect.record.phone, "5550001234");
        assert_eq!(effect.record.lead_id, "lead-7");
    }

    #[tokio::test]
    async fn completion_with_no_phone_and_no_tracked_call_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (ingress, _state) = ingress(dir.path()).await;
        let err = ingress
            .handle_call_completion(completion("call-unknown", "", "busy"))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, DialerErrorKind::Validation(_)));
    }

    #[tokio::test]
    async fn ambiguous_human_answer_retries_as_confused() {
        let dir = tempfile::tempdir().unwrap();
        let (ingress, state) = ingress(dir.path()).await;
        let mut payload = completion("call-1", "5558675309", "");
        payload.disposition_tag = None;
        payload.answered_by = Some(AnsweredBy::Human);

        let effect = ingress.handle_call_completion(payload).await.unwrap();
        assert_eq!(effect.record.last_outcome, Some(CallOutcome::Confused));
        assert_eq!(effect.record.status, RedialStatus::Pending);
        assert!(state.sms.get("5558675309").await.is_none());
    }

    #[tokio::test]
    async fn sms_opt_out_closes_every_store() {
        let dir = tempfile::tempdir().unwrap();
        let (ingress, state) = ingress(dir.path()).await;
        let now = state.policy.now_secs();
        state
            .redial
            .upsert_lead(
                Lead {
                    phone: "5558675309".to_owned(),
                    lead_id: "lead-1".to_owned(),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        state
            .sms
            .enqueue(
                &Lead {
                    phone: "5558675309".to_owned(),
                    lead_id: "lead-1".to_owned(),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();

        let disposition = ingress
            .handle_inbound_sms(InboundSms {
                from: "+15558675309".to_owned(),
                to: "5550001111".to_owned(),
                body: "please STOP texting me".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(disposition, InboundDisposition::OptOut);

        let (blocked, _) = state
            .suppression
            .check(SuppressionField::Phone, "5558675309")
            .await;
        assert!(blocked);
        assert_eq!(
            state.sms.get("5558675309").await.unwrap().status,
            SmsStatus::OptedOut
        );
        assert_eq!(
            state.redial.get("5558675309").await.unwrap().status,
            RedialStatus::Completed
        );
    }

    #[tokio::test]
    async fn non_opt_out_inbound_is_only_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (ingress, state) = ingress(dir.path()).await;
        let disposition = ingress
            .handle_inbound_sms(InboundSms {
                from: "5558675309".to_owned(),
                to: "5550001111".to_owned(),
                body: "what times are you open?".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(disposition, InboundDisposition::Recorded);
        let (blocked, _) = state
            .suppression
            .check(SuppressionField::Phone, "5558675309")
            .await;
        assert!(!blocked);
        assert_eq!(state.webhook_log.today_len().await, 1);
    }

    #[test]
    fn opt_out_keywords_match_as_words() {
        assert!(is_opt_out("STOP"));
        assert!(is_opt_out("stop"));
        assert!(is_opt_out("Please STOP now"));
        assert!(is_opt_out("unsubscribe"));
        assert!(!is_opt_out("nonstop fun"));
        assert!(!is_opt_out("I want to stop-gap this"));
    }
}

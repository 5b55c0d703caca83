//! The consolidated pre-contact gate.
//!
//! Every outbound contact, dial or SMS, from the dispatchers or from an
//! ingress-driven path, goes through this one function immediately before
//! the adapter is invoked. Consolidating the suppression and in-flight-call
//! checks here is what structurally prevents any path from skipping them.

use cadence::{CountedExt, StatsdClient};
use chrono::Utc;
use strum::{AsRefStr, Display};

use outdial_common::metric_name::MetricName;

use crate::suppression::{SuppressionField, SuppressionFlag, SuppressionStore};
use crate::tracker::CallStateTracker;
use crate::webhook_log::{WebhookEvent, WebhookLog};

#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ContactPurpose {
    Dial,
    Sms,
}

/// Why a contact attempt was refused. A denial never mutates redial or SMS
/// records; it only leaves an audit trail.
#[derive(Clone, Debug)]
pub enum GateDenial {
    Suppressed(SuppressionFlag),
    /// A call to this phone is already in flight.
    CallInFlight(String),
}

/// Check a phone (and for dials, the lead id and the in-flight registry)
/// against the compliance gates. `Ok(())` means the adapter may be invoked.
pub async fn pre_contact_gate(
    suppression: &SuppressionStore,
    tracker: &CallStateTracker,
    webhook_log: &WebhookLog,
    metrics: &StatsdClient,
    phone: &str,
    lead_id: Option<&str>,
    purpose: ContactPurpose,
) -> Result<(), GateDenial> {
    let (blocked, flag) = suppression.check(SuppressionField::Phone, phone).await;
    let flag = match (blocked, flag) {
        (true, Some(flag)) => Some(flag),
        _ => match (purpose, lead_id) {
            (ContactPurpose::Dial, Some(lead)) if !lead.is_empty() => {
                let (blocked, flag) = suppression.check(SuppressionField::LeadId, lead).await;
                if blocked {
                    flag
                } else {
                    None
                }
            }
            _ => None,
        },
    };

    if let Some(flag) = flag {
        warn!("Contact attempt blocked by suppression";
            "phone" => phone,
            "lead_id" => lead_id.unwrap_or("-"),
            "purpose" => purpose.as_ref(),
            "field" => flag.field.as_ref(),
            "reason" => flag.reason.as_deref().unwrap_or("-"));
        metrics
            .incr_with_tags(MetricName::SuppressionBlocked.as_ref())
            .with_tag("purpose", purpose.as_ref())
            .send();
        if let Err(e) = webhook_log
            .append(WebhookEvent::blocked_attempt(
                Utc::now().timestamp() as u64,
                phone,
                lead_id,
                Some(format!("suppressed by {} flag", flag.field)),
            ))
            .await
        {
            warn!("Failed to audit blocked attempt"; "error" => %e);
        }
        return Err(GateDenial::Suppressed(flag));
    }

    if purpose == ContactPurpose::Dial {
        if let Some(pending) = tracker.any_pending_for(phone).await {
            debug!("Dial skipped; call already in flight";
                "phone" => phone, "call_id" => &pending.call_id);
            return Err(GateDenial::CallInFlight(pending.call_id));
        }
    }

    Ok(())
}

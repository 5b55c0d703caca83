//! The per-phone redial record and its bounded histories.

use serde_derive::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use super::outcome::CallOutcome;

/// Most recent outcomes kept on a record.
pub const OUTCOME_HISTORY_CAP: usize = 20;
/// Most recent dial attempts kept on a record.
pub const CALL_HISTORY_CAP: usize = 50;

/// Lead identity and demographics as they travel between stores.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Lead {
    /// Normalized phone key.
    pub phone: String,
    pub lead_id: String,
    #[serde(default)]
    pub list_id: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// Two-letter state code, when the CRM supplied one.
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RedialStatus {
    /// Waiting for its next eligible instant.
    Pending,
    /// Customer asked for a specific callback time.
    Rescheduled,
    /// Out of attempts for the current policy day; reopened by the reset.
    DailyMaxReached,
    /// Terminal: converted, transferred, stopped, or opted out.
    Completed,
    /// Terminal: lifetime attempt cap reached.
    MaxAttempts,
    /// Admin hold; dispatcher events never move a paused record.
    Paused,
}

impl RedialStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::MaxAttempts)
    }

    /// Statuses the eligibility predicate will consider at all.
    pub fn is_dialable(&self) -> bool {
        matches!(self, Self::Pending | Self::Rescheduled)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct OutcomeEntry {
    pub outcome: CallOutcome,
    pub at: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CallAttempt {
    pub call_id: String,
    pub at: u64,
    #[serde(default)]
    pub outcome: Option<CallOutcome>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// One per phone key; the retry state machine's durable state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RedialRecord {
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

    pub status: RedialStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub attempts_today: u32,

    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub last_call_timestamp: Option<u64>,
    #[serde(default)]
    pub next_redial_timestamp: Option<u64>,

    /// The most recent outbound call id; repeats of it are duplicate
    /// completion webhooks.
    #[serde(default)]
    pub last_call_id: Option<String>,
    #[serde(default)]
    pub last_outcome: Option<CallOutcome>,
    #[serde(default)]
    pub outcomes: Vec<OutcomeEntry>,
    #[serde(default)]
    pub call_history: Vec<CallAttempt>,

    /// Customer-requested callback instant, when one was given.
    #[serde(default)]
    pub scheduled_callback_time: Option<u64>,

    /// Consecutive adapter failures since the last successful dial; the
    /// third demotes the record to paused.
    #[serde(default)]
    pub dispatch_failures: u32,
}

impl RedialRecord {
    pub fn new(lead: Lead, now: u64) -> Self {
        Self {
            phone: lead.phone,
            lead_id: lead.lead_id,
            list_id: lead.list_id,
            first_name: lead.first_name,
            last_name: lead.last_name,
            state: lead.state,
            status: RedialStatus::Pending,
            attempts: 0,
            attempts_today: 0,
            created_at: now,
            updated_at: now,
            last_call_timestamp: None,
            next_redial_timestamp: Some(now),
            last_call_id: None,
            last_outcome: None,
            outcomes: Vec::new(),
            call_history: Vec::new(),
            scheduled_callback_time: None,
            dispatch_failures: 0,
        }
    }

    pub fn lead(&self) -> Lead {
        Lead {
            phone: self.phone.clone(),
            lead_id: self.lead_id.clone(),
            list_id: self.list_id.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            state: self.state.clone(),
        }
    }

    pub fn touch(&mut self, now: u64) {
        self.updated_at = now;
    }

    pub fn push_outcome(&mut self, outcome: CallOutcome, at: u64) {
        self.outcomes.push(OutcomeEntry { outcome, at });
        if self.outcomes.len() > OUTCOME_HISTORY_CAP {
            let excess = self.outcomes.len() - OUTCOME_HISTORY_CAP;
            self.outcomes.drain(..excess);
        }
    }

    pub fn push_attempt(&mut self, attempt: CallAttempt) {
        self.call_history.push(attempt);
        if self.call_history.len() > CALL_HISTORY_CAP {
            let excess = self.call_history.len() - CALL_HISTORY_CAP;
            self.call_history.drain(..excess);
        }
    }
}

//! The closed outcome taxonomy and provider-payload classification.

use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use serde_derive::Serialize;
use strum::{AsRefStr, Display, EnumString};

use crate::adapters::voice::{AnsweredBy, CallCompletion};

/// Every call completion maps into exactly one of these.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallOutcome {
    /// Customer leg bridged with the agent leg; the only terminal success
    /// besides an explicit sale.
    TransferredMerged,
    Sale,
    DncRequested,
    NotInterested,
    Voicemail,
    NoAnswer,
    Busy,
    CallbackRequested,
    HumanHangup,
    AmdDetected,
    Failed,
    Confused,
}

// The migration point for legacy shards: any since-retired tag on disk
// deserializes as `confused` rather than poisoning the whole document.
impl<'de> Deserialize<'de> for CallOutcome {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::from_str(&tag).unwrap_or(Self::Confused))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeClass {
    /// End of the retry sequence; the lead converted.
    TerminalSuccess,
    /// End of the retry sequence; the lead must also be suppressed.
    TerminalStop,
    /// Retry; the customer (or their voicemail) was reached.
    RetryableContact,
    /// Retry; the call never meaningfully connected.
    RetryableFailure,
}

impl CallOutcome {
    pub fn class(&self) -> OutcomeClass {
        match self {
            Self::TransferredMerged | Self::Sale => OutcomeClass::TerminalSuccess,
            Self::DncRequested | Self::NotInterested => OutcomeClass::TerminalStop,
            Self::Voicemail | Self::NoAnswer | Self::Busy | Self::CallbackRequested => {
                OutcomeClass::RetryableContact
            }
            Self::HumanHangup | Self::AmdDetected | Self::Failed | Self::Confused => {
                OutcomeClass::RetryableFailure
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.class(),
            OutcomeClass::TerminalSuccess | OutcomeClass::TerminalStop
        )
    }

    /// Outcomes that feed the lead into the SMS follow-up sequence.
    pub fn triggers_sms(&self) -> bool {
        matches!(self, Self::Voicemail | Self::NoAnswer)
    }
}

/// A classified completion, carrying the raw tag when it was unrecognized so
/// the ingress can surface it for operator review.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub outcome: CallOutcome,
    pub unknown_tag: Option<String>,
}

impl Classification {
    fn known(outcome: CallOutcome) -> Self {
        Self {
            outcome,
            unknown_tag: None,
        }
    }
}

/// Map a provider completion onto the closed taxonomy.
///
/// Transfer requires the explicit merged-legs marker; a completion that
/// merely says "human answered" with no recognized disposition is classified
/// `confused` and retried, never `transferred`.
pub fn classify_completion(completion: &CallCompletion) -> Classification {
    if completion.transfer_merged {
        return Classification::known(CallOutcome::TransferredMerged);
    }

    let tag = completion
        .disposition_tag
        .as_deref()
        .map(|t| t.trim().to_ascii_lowercase());
    if let Some(tag) = tag.as_deref() {
        if !tag.is_empty() {
            return match tag {
                "sale" | "converted" => Classification::known(CallOutcome::Sale),
                "dnc" | "dnc_requested" | "do_not_call" => {
                    Classification::known(CallOutcome::DncRequested)
                }
                "not_interested" | "declined" => Classification::known(CallOutcome::NotInterested),
                "voicemail" | "voicemail_left" => Classification::known(CallOutcome::Voicemail),
                "no_answer" | "no-answer" | "unanswered" => {
                    Classification::known(CallOutcome::NoAnswer)
                }
                "busy" => Classification::known(CallOutcome::Busy),
                "callback" | "callback_requested" => {
                    Classification::known(CallOutcome::CallbackRequested)
                }
                "hangup" | "human_hangup" | "customer_hangup" => {
                    Classification::known(CallOutcome::HumanHangup)
                }
                "amd" | "amd_detected" | "machine" => {
                    Classification::known(CallOutcome::AmdDetected)
                }
                "failed" | "error" => Classification::known(CallOutcome::Failed),
                "confused" => Classification::known(CallOutcome::Confused),
                other => Classification {
                    outcome: CallOutcome::Confused,
                    unknown_tag: Some(other.to_owned()),
                },
            };
        }
    }

    // No disposition at all; fall back to who answered.
    match completion.answered_by {
        Some(AnsweredBy::Machine) => Classification::known(CallOutcome::AmdDetected),
        // Ambiguous human answer: retry, never a transfer.
        Some(AnsweredBy::Human) => Classification::known(CallOutcome::Confused),
        Some(AnsweredBy::Unknown) | None => Classification::known(CallOutcome::Failed),
    }
}

//! Defines standard metric names used across the application.
//!
//! This module provides a type-safe way to refer to metrics by replacing
//! string literals with enum variants, ensuring consistency and discoverability.

use strum::{AsRefStr, Display, EnumString};
use strum_macros::IntoStaticStr;

/// Represents all metric names used in the application.
#[derive(Debug, Clone, IntoStaticStr, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum MetricName {
    //
    // Redial dispatch metrics
    //
    /// One redial dispatch tick ran to completion
    #[strum(serialize = "redial.tick")]
    RedialTick,

    /// A tick fired while the previous one was still running
    #[strum(serialize = "redial.tick.overlap")]
    RedialTickOverlap,

    /// A record passed all guards and was handed to the voice adapter
    #[strum(serialize = "redial.dispatched")]
    RedialDispatched,

    /// A record was skipped by a pre-dial guard
    #[strum(serialize = "redial.skipped")]
    RedialSkipped,

    /// Voice adapter dial failure
    #[strum(serialize = "redial.dispatch.error")]
    RedialDispatchError,

    /// A record was demoted to paused after repeated adapter failures
    #[strum(serialize = "redial.paused")]
    RedialPaused,

    /// Records reopened by the daily reset
    #[strum(serialize = "redial.daily_reset.reopened")]
    RedialResetReopened,

    //
    // SMS dispatch metrics
    //
    /// One SMS dispatch tick ran to completion
    #[strum(serialize = "sms.tick")]
    SmsTick,

    /// A follow-up message was sent
    #[strum(serialize = "sms.sent")]
    SmsSent,

    /// An SMS record was skipped by a pre-send guard
    #[strum(serialize = "sms.skipped")]
    SmsSkipped,

    /// SMS adapter send failure
    #[strum(serialize = "sms.send.error")]
    SmsSendError,

    /// An SMS sequence reached its final message
    #[strum(serialize = "sms.sequence.completed")]
    SmsSequenceCompleted,

    //
    // Ingress metrics
    //
    /// A call completion webhook was processed
    #[strum(serialize = "ingress.call_completion")]
    IngressCallCompletion,

    /// A completion webhook repeated an already-seen call id
    #[strum(serialize = "ingress.duplicate")]
    IngressDuplicate,

    /// An inbound SMS was processed
    #[strum(serialize = "ingress.inbound_sms")]
    IngressInboundSms,

    /// An inbound SMS was classified as an opt-out
    #[strum(serialize = "ingress.opt_out")]
    IngressOptOut,

    /// A provider outcome tag had no known classification
    #[strum(serialize = "ingress.unknown_outcome")]
    IngressUnknownOutcome,

    //
    // Suppression metrics
    //
    /// A contact attempt was blocked by the suppression store
    #[strum(serialize = "suppression.blocked")]
    SuppressionBlocked,

    /// A flag was added to the suppression store
    #[strum(serialize = "suppression.added")]
    SuppressionAdded,

    //
    // Tracker and maintenance metrics
    //
    /// Pending calls demoted to failed by the stale sweep
    #[strum(serialize = "tracker.stale_demoted")]
    TrackerStaleDemoted,

    /// A store persist failed and will be retried
    #[strum(serialize = "store.persist_error")]
    StorePersistError,

    /// Shard files removed by the retention sweep
    #[strum(serialize = "retention.swept")]
    RetentionSwept,
}

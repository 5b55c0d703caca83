//! Outbound calling orchestrator core.
//!
//! Drives leads through a bounded, compliant, multi-day retry sequence:
//! dialing through a voice-AI provider, recording outcomes, feeding the same
//! leads a follow-up SMS series, and permanently suppressing contacts that
//! opt out or convert. The webhook transports that feed [`ingress`] and the
//! admin surfaces that read the stores live outside this crate; everything
//! here is the durable state and the scheduling discipline between them.

#[macro_use]
extern crate slog;
#[macro_use]
extern crate slog_scope;

pub mod adapters;
pub mod app_state;
pub mod dispatch;
pub mod gate;
pub mod ingress;
pub mod maintenance;
pub mod redial;
pub mod settings;
pub mod sms;
pub mod suppression;
pub mod tracker;
pub mod webhook_log;

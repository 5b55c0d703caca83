//! Provider adapters: the named interfaces the core consumes.
//!
//! The orchestrator never speaks a provider wire format directly; it hands a
//! normalized request to one of these traits and interprets a normalized
//! error. HTTP implementations live beside each trait, mocks in [`mock`].

use async_trait::async_trait;
use thiserror::Error;

pub mod crm;
pub mod mock;
pub mod sms;
pub mod voice;

pub use crm::UpstreamCrm;
pub use sms::SmsAdapter;
pub use voice::VoiceAdapter;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Provider request timeout")]
    RequestTimeout,

    #[error("Error while connecting to the provider")]
    Connect(#[source] reqwest::Error),

    #[error("Provider error, {status}: {message}")]
    Upstream { status: String, message: String },

    #[error("Could not deserialize the provider response")]
    DeserializeResponse(#[source] reqwest::Error),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Adapter not configured: {0}")]
    NotConfigured(&'static str),
}

impl AdapterError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::RequestTimeout => "timeout",
            Self::Connect(_) => "connect",
            Self::Upstream { .. } => "upstream",
            Self::DeserializeResponse(_) => "deserialize",
            Self::InvalidResponse(_) => "invalid_response",
            Self::NotConfigured(_) => "not_configured",
        }
    }
}

/// A normalized outbound dial request; the adapter supplies provider
/// plumbing like the caller id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialRequest {
    pub request_id: String,
    /// Normalized phone key.
    pub phone: String,
    pub lead_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialResponse {
    pub call_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendResponse {
    pub msg_id: String,
}

//! The voice-AI dialing provider adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use url::Url;

use super::{AdapterError, DialRequest, DialResponse};

#[async_trait]
pub trait VoiceAdapter: Send + Sync {
    /// Initiate an outbound call; returns the provider call id.
    async fn dial(&self, request: &DialRequest) -> Result<DialResponse, AdapterError>;
}

/// Who picked up, as reported by the provider's answering-machine detection.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnsweredBy {
    Human,
    Machine,
    Unknown,
}

/// A completion webhook payload, normalized by the transport layer before it
/// reaches the ingress.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CallCompletion {
    pub call_id: String,
    pub phone: String,
    #[serde(default)]
    pub answered_by: Option<AnsweredBy>,
    /// Provider disposition string; classified into the closed taxonomy.
    #[serde(default)]
    pub disposition_tag: Option<String>,
    /// Provider-state marker: customer and agent legs were bridged. The
    /// only signal that can classify a completion as transferred.
    #[serde(default)]
    pub transfer_merged: bool,
    #[serde(default)]
    pub summary: Option<String>,
    /// Customer-requested callback instant, epoch seconds.
    #[serde(default)]
    pub requested_callback_at: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub base_url: String,
    pub auth_token: String,
    /// Outbound caller id presented to customers.
    pub caller_id: String,
    pub timeout_secs: u64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9040".to_owned(),
            auth_token: String::new(),
            caller_id: String::new(),
            timeout_secs: 30,
        }
    }
}

/// What the dial endpoint returns; providers disagree about the id field.
#[derive(Debug, Deserialize)]
struct DialProviderResponse {
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

pub struct HttpVoiceAdapter {
    endpoint: Url,
    auth_token: String,
    caller_id: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpVoiceAdapter {
    pub fn new(settings: &VoiceSettings, http: reqwest::Client) -> Result<Self, AdapterError> {
        let base = Url::parse(&settings.base_url)
            .map_err(|e| AdapterError::InvalidResponse(format!("voice base_url: {e}")))?;
        let endpoint = base
            .join("v1/calls")
            .map_err(|e| AdapterError::InvalidResponse(format!("voice endpoint: {e}")))?;
        Ok(Self {
            endpoint,
            auth_token: settings.auth_token.clone(),
            caller_id: settings.caller_id.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            http,
        })
    }
}

#[async_trait]
impl VoiceAdapter for HttpVoiceAdapter {
    async fn dial(&self, request: &DialRequest) -> Result<DialResponse, AdapterError> {
        let message = serde_json::json!({
            "request_id": request.request_id,
            "phone": request.phone,
            "caller_id": self.caller_id,
            "lead": {
                "lead_id": request.lead_id,
                "first_name": request.first_name,
                "last_name": request.last_name,
            },
        });

        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.auth_token)
            .json(&message)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::RequestTimeout
                } else {
                    AdapterError::Connect(e)
                }
            })?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(AdapterError::Upstream {
                status: status.to_string(),
                message,
            });
        }

        let data: DialProviderResponse = response
            .json()
            .await
            .map_err(AdapterError::DeserializeResponse)?;
        let call_id = data
            .call_id
            .or(data.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AdapterError::InvalidResponse("dial response missing call id".to_owned())
            })?;
        Ok(DialResponse { call_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Each test dials under its own path prefix so the shared mock server
    /// never cross-matches concurrent tests.
    fn adapter(prefix: &str) -> HttpVoiceAdapter {
        let settings = VoiceSettings {
            base_url: format!("{}/{prefix}/", mockito::server_url()),
            auth_token: "token".to_owned(),
            caller_id: "5550001111".to_owned(),
            timeout_secs: 2,
        };
        HttpVoiceAdapter::new(&settings, reqwest::Client::new()).unwrap()
    }

    fn request() -> DialRequest {
        DialRequest {
            request_id: "req-1".to_owned(),
            phone: "5558675309".to_owned(),
            lead_id: "lead-1".to_owned(),
            first_name: Some("Pat".to_owned()),
            last_name: None,
        }
    }

    #[tokio::test]
    async fn dial_returns_the_provider_call_id() {
        let _mock = mockito::mock("POST", "/ok/v1/calls")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"call_id": "call-abc"}"#)
            .create();

        let response = adapter("ok").dial(&request()).await.unwrap();
        assert_eq!(response.call_id, "call-abc");
    }

    #[tokio::test]
    async fn dial_accepts_the_alternate_id_field() {
        let _mock = mockito::mock("POST", "/alt/v1/calls")
            .with_status(200)
            .with_body(r#"{"id": "call-xyz"}"#)
            .create();

        let response = adapter("alt").dial(&request()).await.unwrap();
        assert_eq!(response.call_id, "call-xyz");
    }

    #[tokio::test]
    async fn upstream_errors_surface_status_and_body() {
        let _mock = mockito::mock("POST", "/down/v1/calls")
            .with_status(503)
            .with_body("maintenance")
            .create();

        let err = adapter("down").dial(&request()).await.unwrap_err();
        match err {
            AdapterError::Upstream { status, message } => {
                assert!(status.starts_with("503"));
                assert_eq!(message, "maintenance");
            }
            other => panic!("expected Upstream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_call_id_is_invalid() {
        let _mock = mockito::mock("POST", "/noid/v1/calls")
            .with_status(200)
            .with_body(r#"{"status": "queued"}"#)
            .create();

        let err = adapter("noid").dial(&request()).await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidResponse(_)));
    }

    #[test]
    fn completion_payload_deserializes_with_defaults() {
        let completion: CallCompletion = serde_json::from_str(
            r#"{"call_id": "call-1", "phone": "5558675309", "disposition_tag": "voicemail"}"#,
        )
        .unwrap();
        assert!(!completion.transfer_merged);
        assert!(completion.answered_by.is_none());
        assert_eq!(completion.disposition_tag.as_deref(), Some("voicemail"));
    }
}

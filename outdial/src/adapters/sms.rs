//! The SMS provider adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use url::Url;

use super::{AdapterError, SendResponse};

#[async_trait]
pub trait SmsAdapter: Send + Sync {
    /// Send a rendered message; returns the provider message id.
    async fn send(&self, to: &str, from: &str, body: &str) -> Result<SendResponse, AdapterError>;
}

/// An inbound message webhook payload, normalized by the transport layer.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InboundSms {
    pub from: String,
    pub to: String,
    pub body: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SmsProviderSettings {
    pub base_url: String,
    pub auth_token: String,
    /// Sender number for the follow-up series.
    pub from_number: String,
    pub timeout_secs: u64,
}

impl Default for SmsProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9041".to_owned(),
            auth_token: String::new(),
            from_number: String::new(),
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendProviderResponse {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

pub struct HttpSmsAdapter {
    endpoint: Url,
    auth_token: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpSmsAdapter {
    pub fn new(settings: &SmsProviderSettings, http: reqwest::Client) -> Result<Self, AdapterError> {
        let base = Url::parse(&settings.base_url)
            .map_err(|e| AdapterError::InvalidResponse(format!("sms base_url: {e}")))?;
        let endpoint = base
            .join("v1/messages")
            .map_err(|e| AdapterError::InvalidResponse(format!("sms endpoint: {e}")))?;
        Ok(Self {
            endpoint,
            auth_token: settings.auth_token.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            http,
        })
    }
}

#[async_trait]
impl SmsAdapter for HttpSmsAdapter {
    async fn send(&self, to: &str, from: &str, body: &str) -> Result<SendResponse, AdapterError> {
        let message = serde_json::json!({
            "to": to,
            "from": from,
            "body": body,
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

        let data: SendProviderResponse = response
            .json()
            .await
            .map_err(AdapterError::DeserializeResponse)?;
        let msg_id = data
            .message_id
            .or(data.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AdapterError::InvalidResponse("send response missing message id".to_owned())
            })?;
        Ok(SendResponse { msg_id })
    }
}

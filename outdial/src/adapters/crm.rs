//! Best-effort upstream CRM status propagation.
//!
//! Authoritative outcomes live upstream; this adapter pushes them there but
//! never blocks core progression. An unconfigured CRM is a quiet no-op.

use std::time::Duration;

use async_trait::async_trait;
use serde_derive::Deserialize;
use url::Url;

use super::AdapterError;

#[async_trait]
pub trait UpstreamCrm: Send + Sync {
    async fn update(
        &self,
        lead_id: &str,
        status: &str,
        transcript: Option<&str>,
    ) -> Result<(), AdapterError>;
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CrmSettings {
    /// Unset means CRM propagation is disabled.
    pub base_url: Option<String>,
    pub auth_token: String,
    pub timeout_secs: u64,
}

pub struct HttpUpstreamCrm {
    base: Option<Url>,
    auth_token: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpUpstreamCrm {
    pub fn new(settings: &CrmSettings, http: reqwest::Client) -> Result<Self, AdapterError> {
        let base = match settings.base_url.as_deref() {
            Some(url) => Some(
                Url::parse(url)
                    .map_err(|e| AdapterError::InvalidResponse(format!("crm base_url: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            base,
            auth_token: settings.auth_token.clone(),
            timeout: Duration::from_secs(settings.timeout_secs.max(1)),
            http,
        })
    }
}

#[async_trait]
impl UpstreamCrm for HttpUpstreamCrm {
    async fn update(
        &self,
        lead_id: &str,
        status: &str,
        transcript: Option<&str>,
    ) -> Result<(), AdapterError> {
        let Some(base) = self.base.as_ref() else {
            debug!("CRM not configured; skipping update"; "lead_id" => lead_id);
            return Ok(());
        };
        let endpoint = base
            .join(&format!("v1/leads/{lead_id}/status"))
            .map_err(|e| AdapterError::InvalidResponse(format!("crm endpoint: {e}")))?;

        let message = serde_json::json!({
            "status": status,
            "transcript": transcript,
        });
        let response = self
            .http
            .post(endpoint)
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

        let http_status = response.status();
        if http_status.is_client_error() || http_status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(AdapterError::Upstream {
                status: http_status.to_string(),
                message,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_crm_is_a_noop() {
        let crm = HttpUpstreamCrm::new(&CrmSettings::default(), reqwest::Client::new()).unwrap();
        crm.update("lead-1", "completed", None).await.unwrap();
    }

    #[tokio::test]
    async fn configured_crm_posts_the_status() {
        let mock = mockito::mock("POST", "/crm/v1/leads/lead-1/status")
            .with_status(200)
            .with_body("{}")
            .create();
        let settings = CrmSettings {
            base_url: Some(format!("{}/crm/", mockito::server_url())),
            auth_token: "token".to_owned(),
            timeout_secs: 2,
        };
        let crm = HttpUpstreamCrm::new(&settings, reqwest::Client::new()).unwrap();
        crm.update("lead-1", "completed", Some("transcript")).await.unwrap();
        mock.assert();
    }
}

// mockall::mock currently generates these warnings
#![allow(clippy::unused_unit)]
#![allow(clippy::ptr_arg)]

use std::sync::Arc;

use async_trait::async_trait;

use super::crm::UpstreamCrm;
use super::sms::SmsAdapter;
use super::voice::VoiceAdapter;
use super::{AdapterError, DialRequest, DialResponse, SendResponse};

// mockall has issues mocking async traits with #[automock], so the mocks are
// declared sync and forwarded through Arc impls below.
mockall::mock! {
    pub VoiceAdapter {
        pub fn dial(&self, request: &DialRequest) -> Result<DialResponse, AdapterError>;
    }
}

mockall::mock! {
    pub SmsAdapter {
        pub fn send(&self, to: &str, from: &str, body: &str) -> Result<SendResponse, AdapterError>;
    }
}

mockall::mock! {
    pub UpstreamCrm {
        pub fn update<'a>(
            &self,
            lead_id: &str,
            status: &str,
            transcript: Option<&'a str>,
        ) -> Result<(), AdapterError>;
    }
}

#[async_trait]
impl VoiceAdapter for Arc<MockVoiceAdapter> {
    async fn dial(&self, request: &DialRequest) -> Result<DialResponse, AdapterError> {
        Arc::as_ref(self).dial(request)
    }
}

#[async_trait]
impl SmsAdapter for Arc<MockSmsAdapter> {
    async fn send(&self, to: &str, from: &str, body: &str) -> Result<SendResponse, AdapterError> {
        Arc::as_ref(self).send(to, from, body)
    }
}

#[async_trait]
impl UpstreamCrm for Arc<MockUpstreamCrm> {
    async fn update(
        &self,
        lead_id: &str,
        status: &str,
        transcript: Option<&str>,
    ) -> Result<(), AdapterError> {
        Arc::as_ref(self).update(lead_id, status, transcript)
    }
}

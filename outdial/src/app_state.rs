//! Shared application state: every component, constructed once from settings.

use std::sync::Arc;
use std::time::Duration;

use cadence::StatsdClient;
use config::ConfigError;

use outdial_common::clock::{ScheduleConfig, SchedulePolicy};
use outdial_common::store::FileStore;

use crate::adapters::crm::HttpUpstreamCrm;
use crate::adapters::sms::HttpSmsAdapter;
use crate::adapters::voice::HttpVoiceAdapter;
use crate::adapters::{SmsAdapter, UpstreamCrm, VoiceAdapter};
use crate::redial::RedialQueue;
use crate::settings::Settings;
use crate::sms::SmsScheduler;
use crate::suppression::SuppressionStore;
use crate::tracker::CallStateTracker;
use crate::webhook_log::WebhookLog;

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<StatsdClient>,
    pub http: reqwest::Client,
    pub policy: Arc<SchedulePolicy>,

    pub suppression: Arc<SuppressionStore>,
    pub tracker: Arc<CallStateTracker>,
    pub redial: Arc<RedialQueue>,
    pub sms: Arc<SmsScheduler>,
    pub webhook_log: Arc<WebhookLog>,

    pub voice: Arc<dyn VoiceAdapter>,
    pub sms_adapter: Arc<dyn SmsAdapter>,
    pub crm: Arc<dyn UpstreamCrm>,

    pub settings: Settings,
}

impl AppState {
    pub async fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        let metrics = Arc::new(
            outdial_common::metrics::builder(
                &settings.statsd_label,
                &settings.statsd_host,
                settings.statsd_port,
            )
            .map_err(|e| ConfigError::Message(e.to_string()))?
            .build(),
        );

        // A persisted scheduler-config.json overrides the settings slice.
        let schedule = if settings.scheduler_config_path().exists() {
            FileStore::new(settings.scheduler_config_path())
                .load::<ScheduleConfig>()
                .await
                .map_err(|e| ConfigError::Message(e.to_string()))?
        } else {
            settings.schedule_config()
        };
        let policy = Arc::new(
            SchedulePolicy::from_config(&schedule)
                .map_err(|e| ConfigError::Message(e.to_string()))?,
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| panic!("Error while building reqwest::Client: {}", e));

        let suppression = Arc::new(
            SuppressionStore::open(settings.blocklist_path(), metrics.clone())
                .await
                .map_err(|e| ConfigError::Message(e.to_string()))?,
        );
        let tracker = Arc::new(
            CallStateTracker::open(
                settings.call_state_path(),
                Duration::from_secs(settings.call_state_persist_interval_seconds * 3),
                metrics.clone(),
            )
            .await
            .map_err(|e| ConfigError::Message(e.to_string()))?,
        );
        let redial = Arc::new(
            RedialQueue::open(
                &settings.data_dir,
                settings.redial_config(),
                policy.clone(),
                metrics.clone(),
            )
            .await
            .map_err(|e| ConfigError::Message(e.to_string()))?,
        );
        let sms = Arc::new(
            SmsScheduler::open(
                settings.sms_store_path(),
                settings.sms_config(),
                policy.clone(),
                metrics.clone(),
            )
            .await
            .map_err(|e| ConfigError::Message(e.to_string()))?,
        );
        let webhook_log = Arc::new(
            WebhookLog::open(&settings.data_dir, policy.clone())
                .await
                .map_err(|e| ConfigError::Message(e.to_string()))?,
        );

        let voice: Arc<dyn VoiceAdapter> = Arc::new(
            HttpVoiceAdapter::new(&settings.voice, http.clone())
                .map_err(|e| ConfigError::Message(e.to_string()))?,
        );
        let sms_adapter: Arc<dyn SmsAdapter> = Arc::new(
            HttpSmsAdapter::new(&settings.sms, http.clone())
                .map_err(|e| ConfigError::Message(e.to_string()))?,
        );
        let crm: Arc<dyn UpstreamCrm> = Arc::new(
            HttpUpstreamCrm::new(&settings.crm, http.clone())
                .map_err(|e| ConfigError::Message(e.to_string()))?,
        );

        Ok(Self {
            metrics,
            http,
            policy,
            suppression,
            tracker,
            redial,
            sms,
            webhook_log,
            voice,
            sms_adapter,
            crm,
            settings,
        })
    }

    /// Flush every durable store; used at shutdown and safe to repeat.
    pub async fn flush_all(&self) {
        if let Err(e) = self.redial.flush().await {
            warn!("Redial flush failed at shutdown"; "error" => %e);
        }
        if let Err(e) = self.sms.flush().await {
            warn!("SMS flush failed at shutdown"; "error" => %e);
        }
        if let Err(e) = self.tracker.flush().await {
            warn!("Tracker flush failed at shutdown"; "error" => %e);
        }
        if let Err(e) = self.suppression.flush().await {
            warn!("Blocklist flush failed at shutdown"; "error" => %e);
        }
    }
}

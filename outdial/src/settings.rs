//! Application settings, read from config files then the environment.

use config::{Config, ConfigError, Environment, File};
use serde_derive::Deserialize;

use outdial_common::clock::{ResetTiming, ScheduleConfig};

use crate::adapters::crm::CrmSettings;
use crate::adapters::sms::SmsProviderSettings;
use crate::adapters::voice::VoiceSettings;
use crate::redial::schedule::RetryPolicy;
use crate::redial::RedialConfig;
use crate::sms::SmsConfig;

pub const ENV_PREFIX: &str = "outdial";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the persisted stores.
    pub data_dir: String,
    /// Use human readable (non-JSON) logs.
    pub human_logs: bool,
    /// The host name to send recorded metrics.
    pub statsd_host: Option<String>,
    /// The port number to send recorded metrics.
    pub statsd_port: u16,
    /// The root label to apply to metrics.
    pub statsd_label: String,

    /// IANA zone governing every calendar decision.
    pub timezone: String,
    /// Local business-hours window, `HH:MM`.
    pub business_open: String,
    pub business_close: String,
    /// `YYYY-MM-DD` dates on which all dispatch is suppressed.
    pub blackout_dates: Vec<String>,

    pub redial_enabled: bool,
    /// Lifetime dial cap per phone.
    pub max_attempts: u32,
    /// Dial cap per policy calendar day.
    pub max_daily_attempts: u32,
    /// Minutes of delay before attempt k+1, indexed by attempt count.
    pub progressive_intervals: Vec<u32>,
    /// Floor under every retry delay.
    pub min_retry_gap_minutes: u32,
    pub redial_tick_minutes: u64,
    /// When the daily reset reopens capped records.
    pub reset_timing: ResetTiming,
    /// Restrict dispatch to records touched during the current policy day.
    pub same_day_only: bool,
    /// How far to push a record when a call to it is already in flight.
    pub pending_grace_minutes: u64,

    pub sms_enabled: bool,
    /// Day offsets from enqueue per sequence position; first entry is zero.
    pub sms_day_gaps: Vec<u32>,
    pub sms_tick_minutes: u64,
    pub sms_business_hours_only: bool,
    /// Follow-up message templates; `{first_name}` placeholder supported.
    pub sms_templates: Vec<String>,

    pub retention_days: u32,
    pub call_state_persist_interval_seconds: u64,
    pub stale_pending_max_minutes: u64,
    pub shutdown_budget_seconds: u64,

    pub voice: VoiceSettings,
    pub sms: SmsProviderSettings,
    pub crm: CrmSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let sms_defaults = SmsConfig::default();
        Self {
            data_dir: "./data".to_owned(),
            human_logs: false,
            statsd_host: None,
            statsd_port: 8125,
            statsd_label: "outdial".to_owned(),
            timezone: "America/New_York".to_owned(),
            business_open: "11:00".to_owned(),
            business_close: "20:00".to_owned(),
            blackout_dates: Vec::new(),
            redial_enabled: true,
            max_attempts: 8,
            max_daily_attempts: 8,
            progressive_intervals: vec![0, 0, 5, 10, 30, 60, 120],
            min_retry_gap_minutes: 2,
            redial_tick_minutes: 5,
            reset_timing: ResetTiming::Midnight,
            same_day_only: false,
            pending_grace_minutes: 5,
            sms_enabled: true,
            sms_day_gaps: sms_defaults.day_gaps,
            sms_tick_minutes: 5,
            sms_business_hours_only: true,
            sms_templates: sms_defaults.templates,
            retention_days: 30,
            call_state_persist_interval_seconds: 30,
            stale_pending_max_minutes: 180,
            shutdown_budget_seconds: 10,
            voice: VoiceSettings::default(),
            sms: SmsProviderSettings::default(),
            crm: CrmSettings::default(),
        }
    }
}

impl Settings {
    /// Load the settings from the config files in order first then the environment.
    pub fn with_env_and_config_files(filenames: &[String]) -> Result<Self, ConfigError> {
        let mut s = Config::builder();

        // Merge the configs from the files
        for filename in filenames {
            s = s.add_source(File::with_name(filename));
        }

        // Merge the environment overrides
        s = s.add_source(Environment::with_prefix(&ENV_PREFIX.to_uppercase()).separator("__"));

        let built = s.build()?;
        let s = built.try_deserialize::<Settings>()?;
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = |val: u64, name: &str| {
            if val == 0 {
                return Err(ConfigError::Message(format!(
                    "Invalid {}_{}: cannot be 0",
                    ENV_PREFIX, name
                )));
            }
            Ok(())
        };
        non_zero(self.redial_tick_minutes, "REDIAL_TICK_MINUTES")?;
        non_zero(self.sms_tick_minutes, "SMS_TICK_MINUTES")?;
        non_zero(u64::from(self.max_attempts), "MAX_ATTEMPTS")?;
        non_zero(u64::from(self.max_daily_attempts), "MAX_DAILY_ATTEMPTS")?;
        non_zero(
            self.call_state_persist_interval_seconds,
            "CALL_STATE_PERSIST_INTERVAL_SECONDS",
        )?;
        non_zero(self.stale_pending_max_minutes, "STALE_PENDING_MAX_MINUTES")?;

        if self.progressive_intervals.is_empty() {
            return Err(ConfigError::Message(format!(
                "Invalid {ENV_PREFIX}_PROGRESSIVE_INTERVALS: cannot be empty"
            )));
        }
        if self.sms_templates.is_empty() {
            return Err(ConfigError::Message(format!(
                "Invalid {ENV_PREFIX}_SMS_TEMPLATES: cannot be empty"
            )));
        }
        if self.sms_day_gaps.len() != self.sms_templates.len() {
            return Err(ConfigError::Message(format!(
                "Invalid {ENV_PREFIX}_SMS_DAY_GAPS: must match the template count"
            )));
        }
        if self.sms_day_gaps.first() != Some(&0) {
            return Err(ConfigError::Message(format!(
                "Invalid {ENV_PREFIX}_SMS_DAY_GAPS: the first message sends immediately"
            )));
        }
        // Fail fast on a bad zone or window rather than at the first tick.
        outdial_common::clock::SchedulePolicy::from_config(&self.schedule_config())
            .map_err(|e| ConfigError::Message(e.to_string()))?;
        Ok(())
    }

    /// The schedule-policy slice of the settings; a persisted
    /// `scheduler-config.json` takes precedence over these fields.
    pub fn schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            timezone: self.timezone.clone(),
            business_open: self.business_open.clone(),
            business_close: self.business_close.clone(),
            weekdays_only: true,
            blackout_dates: self
                .blackout_dates
                .iter()
                .filter_map(|d| d.parse().ok())
                .collect(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            intervals: self.progressive_intervals.clone(),
            min_gap_minutes: self.min_retry_gap_minutes,
            max_attempts: self.max_attempts,
            max_daily_attempts: self.max_daily_attempts,
        }
    }

    pub fn redial_config(&self) -> RedialConfig {
        RedialConfig {
            retry: self.retry_policy(),
            same_day_only: self.same_day_only,
            retention_days: self.retention_days,
        }
    }

    pub fn sms_config(&self) -> SmsConfig {
        SmsConfig {
            templates: self.sms_templates.clone(),
            day_gaps: self.sms_day_gaps.clone(),
            business_hours_only: self.sms_business_hours_only,
            failure_retry: self.retry_policy(),
        }
    }

    pub fn blocklist_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("blocklist-config.json")
    }

    pub fn call_state_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("call-state-cache.json")
    }

    pub fn sms_store_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("sms-pending-leads.json")
    }

    pub fn scheduler_config_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("scheduler-config.json")
    }

    pub fn test_settings() -> Self {
        Self {
            data_dir: "./test-data".to_owned(),
            human_logs: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().unwrap();
        Settings::test_settings().validate().unwrap();
    }

    #[test]
    fn mismatched_sms_lists_are_rejected() {
        let settings = Settings {
            sms_day_gaps: vec![0, 1],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn first_day_gap_must_be_zero() {
        let mut settings = Settings::default();
        settings.sms_day_gaps[0] = 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn bad_timezone_is_rejected() {
        let settings = Settings {
            timezone: "Not/AZone".to_owned(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_tick_is_rejected() {
        let settings = Settings {
            redial_tick_minutes: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}

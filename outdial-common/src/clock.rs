//! The policy clock: timezone, business hours, weekdays, blackout dates.
//!
//! Every business-hours, weekday, and blackout decision in the orchestrator
//! goes through a [`SchedulePolicy`] built from a single IANA timezone. All
//! persisted instants are whole seconds since the UNIX epoch; the policy is
//! the only place they are projected into local calendar terms.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde_derive::{Deserialize, Serialize};

use crate::errors::{DialerErrorKind, Result};

/// How many minutes before business open the morning reset fires.
const RESET_LEAD_MINUTES: i64 = 5;

/// When the daily reset reopens capped records.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResetTiming {
    /// Once per day at local midnight.
    #[default]
    Midnight,
    /// Twice per day, pegged to the business window: five minutes before
    /// open and again at close.
    BusinessHours,
}

/// The serde document behind `scheduler-config.json`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// IANA zone name governing all calendar arithmetic.
    pub timezone: String,
    /// Local opening time, `HH:MM`.
    pub business_open: String,
    /// Local closing time, `HH:MM`.
    pub business_close: String,
    /// Suppress Saturday and Sunday dispatch.
    pub weekdays_only: bool,
    /// Calendar dates on which all dispatch is suppressed.
    pub blackout_dates: Vec<NaiveDate>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_owned(),
            business_open: "11:00".to_owned(),
            business_close: "20:00".to_owned(),
            weekdays_only: true,
            blackout_dates: Vec::new(),
        }
    }
}

/// Evaluates the time-window predicates shared by both dispatchers.
#[derive(Clone, Debug)]
pub struct SchedulePolicy {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
    weekdays_only: bool,
    blackout_dates: HashSet<NaiveDate>,
}

impl SchedulePolicy {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        let tz = Tz::from_str(&config.timezone)
            .map_err(|_| DialerErrorKind::UnknownTimezone(config.timezone.clone()))?;
        Ok(Self {
            tz,
            open: parse_time_of_day(&config.business_open)?,
            close: parse_time_of_day(&config.business_close)?,
            weekdays_only: config.weekdays_only,
            blackout_dates: config.blackout_dates.iter().copied().collect(),
        })
    }

    /// "now" in the policy timezone.
    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    /// "now" as the epoch seconds the persisted records carry.
    pub fn now_secs(&self) -> u64 {
        self.now().timestamp() as u64
    }

    /// Project an epoch instant into the policy timezone.
    pub fn at(&self, epoch_secs: u64) -> DateTime<Tz> {
        DateTime::from_timestamp(epoch_secs as i64, 0)
            .unwrap_or_default()
            .with_timezone(&self.tz)
    }

    pub fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    /// Resolve a local calendar date and time of day, leaning on the earlier
    /// instant when DST folds the wall clock.
    pub fn localize(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
        let naive = date.and_time(time);
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .unwrap_or_else(|| self.tz.from_utc_datetime(&naive))
    }

    /// Build a local instant from components. `None` when the combination
    /// does not exist on the local calendar.
    pub fn local(
        &self,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    ) -> Option<DateTime<Tz>> {
        self.tz
            .with_ymd_and_hms(year, month, day, hour, minute, second)
            .single()
    }

    pub fn is_weekday(&self, at: &DateTime<Tz>) -> bool {
        !matches!(at.weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// Inside the open..close window, weekday rule not included.
    pub fn in_business_hours(&self, at: &DateTime<Tz>) -> bool {
        let t = at.time();
        t >= self.open && t < self.close
    }

    pub fn is_blackout(&self, date: NaiveDate) -> bool {
        self.blackout_dates.contains(&date)
    }

    /// The dial-window predicate: weekday (when configured), inside business
    /// hours, and not a blackout date.
    pub fn dispatchable(&self, at: &DateTime<Tz>) -> bool {
        if self.weekdays_only && !self.is_weekday(at) {
            return false;
        }
        self.in_business_hours(at) && !self.is_blackout(at.date_naive())
    }

    /// Whether two instants fall on the same policy-timezone calendar day.
    pub fn same_policy_day(&self, a: u64, b: u64) -> bool {
        self.at(a).date_naive() == self.at(b).date_naive()
    }

    /// Monthly shard key, e.g. `2026-08`.
    pub fn month_key(&self, at: &DateTime<Tz>) -> String {
        at.format("%Y-%m").to_string()
    }

    /// Daily shard key, e.g. `2026-08-01`.
    pub fn day_key(&self, at: &DateTime<Tz>) -> String {
        at.format("%Y-%m-%d").to_string()
    }

    /// Add whole policy-calendar days to an instant, keeping its local time
    /// of day. Used by the SMS day-gap sequencer.
    pub fn add_days(&self, epoch_secs: u64, days: u64) -> u64 {
        let local = self.at(epoch_secs);
        let date = local
            .date_naive()
            .checked_add_days(Days::new(days))
            .unwrap_or_else(|| local.date_naive());
        self.localize(date, local.time()).timestamp() as u64
    }

    /// The next instant after `from` at which the daily reset should run.
    pub fn next_reset_boundary(&self, from: &DateTime<Tz>, timing: ResetTiming) -> DateTime<Tz> {
        match timing {
            ResetTiming::Midnight => {
                let tomorrow = from
                    .date_naive()
                    .checked_add_days(Days::new(1))
                    .unwrap_or_else(|| from.date_naive());
                self.localize(tomorrow, NaiveTime::MIN)
            }
            ResetTiming::BusinessHours => {
                let lead = self
                    .open
                    .overflowing_sub_signed(Duration::minutes(RESET_LEAD_MINUTES))
                    .0;
                let today = from.date_naive();
                let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
                [
                    self.localize(today, lead),
                    self.localize(today, self.close),
                    self.localize(tomorrow, lead),
                ]
                .into_iter()
                .find(|candidate| candidate > from)
                .unwrap_or_else(|| self.localize(tomorrow, lead))
            }
        }
    }
}

fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|_| DialerErrorKind::InvalidTimeOfDay(value.to_owned()).into())
}

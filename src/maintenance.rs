//! Maintenance windows, during which alerts are not sent.

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MaintenanceError {
    #[error("invalid maintenance start {0:?}: must be hh:mm between 00:00 and 23:59")]
    InvalidStart(String),
    #[error("invalid maintenance duration: must be between 1 and 1440 minutes")]
    InvalidDuration,
    #[error("invalid maintenance day {0:?}")]
    InvalidDay(String),
}

/// A daily (or weekly, when `every` is set) window in UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Start time of day, e.g. "23:00"
    pub start: String,
    pub duration_minutes: u32,
    /// Days on which the window starts (e.g. "Monday"); every day if empty
    #[serde(default)]
    pub every: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl MaintenanceWindow {
    pub fn new(start: &str, duration_minutes: u32) -> Self {
        Self {
            enabled: true,
            start: start.to_string(),
            duration_minutes,
            every: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), MaintenanceError> {
        if !self.enabled {
            return Ok(());
        }
        parse_hhmm(&self.start)?;
        if self.duration_minutes == 0 || self.duration_minutes > 24 * 60 {
            return Err(MaintenanceError::InvalidDuration);
        }
        for day in &self.every {
            day.parse::<Weekday>()
                .map_err(|_| MaintenanceError::InvalidDay(day.clone()))?;
        }
        Ok(())
    }

    /// Whether `now` falls inside the window. A window that started the day
    /// before and runs past midnight counts.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let Ok((hour, minute)) = parse_hhmm(&self.start) else {
            return false;
        };
        let today = now.date_naive();
        [Some(today), today.pred_opt()]
            .into_iter()
            .flatten()
            .filter(|day| self.starts_on(*day))
            .filter_map(|day| day.and_hms_opt(hour, minute, 0))
            .any(|start| {
                let start = start.and_utc();
                let end = start + TimeDelta::minutes(self.duration_minutes as i64);
                now >= start && now < end
            })
    }

    fn starts_on(&self, day: NaiveDate) -> bool {
        self.every.is_empty()
            || self
                .every
                .iter()
                .any(|d| d.parse::<Weekday>().ok() == Some(day.weekday()))
    }
}

fn parse_hhmm(s: &str) -> Result<(u32, u32), MaintenanceError> {
    let invalid = || MaintenanceError::InvalidStart(s.to_string());
    let (h, m) = s.split_once(':').ok_or_else(invalid)?;
    if h.len() != 2 || m.len() != 2 {
        return Err(invalid());
    }
    let hour: u32 = h.parse().map_err(|_| invalid())?;
    let minute: u32 = m.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

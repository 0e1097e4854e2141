//! Per-endpoint aggregate state.

use super::{CheckResult, Endpoint, Event, EventType};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything known about an endpoint: bounded history, hourly uptime and
/// the current result streak.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub group: String,
    pub key: String,
    /// Oldest first
    pub results: Vec<CheckResult>,
    /// Oldest first; the first event is always `START`
    pub events: Vec<Event>,
    #[serde(skip)]
    pub uptime: Uptime,
    pub successes_in_a_row: u32,
    pub failures_in_a_row: u32,
}

impl Status {
    pub fn new(endpoint: &Endpoint) -> Self {
        Self {
            name: endpoint.name.clone(),
            group: endpoint.group.clone(),
            key: endpoint.key(),
            ..Default::default()
        }
    }

    /// Copy of the identity and streak, with empty history.
    pub fn skeleton(&self) -> Self {
        Self {
            name: self.name.clone(),
            group: self.group.clone(),
            key: self.key.clone(),
            successes_in_a_row: self.successes_in_a_row,
            failures_in_a_row: self.failures_in_a_row,
            ..Default::default()
        }
    }

    pub fn streak(&self) -> Streak {
        Streak {
            successes_in_a_row: self.successes_in_a_row,
            failures_in_a_row: self.failures_in_a_row,
        }
    }

    pub(crate) fn record_streak(&mut self, success: bool) {
        if success {
            self.successes_in_a_row = self.successes_in_a_row.saturating_add(1);
            self.failures_in_a_row = 0;
        } else {
            self.failures_in_a_row = self.failures_in_a_row.saturating_add(1);
            self.successes_in_a_row = 0;
        }
    }
}

/// Consecutive same-outcome results for an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Streak {
    pub successes_in_a_row: u32,
    pub failures_in_a_row: u32,
}

/// Hourly execution statistics, keyed by the unix timestamp of the hour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Uptime {
    pub hourly_statistics: BTreeMap<i64, HourlyUptimeStatistics>,
}

/// One hour worth of executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyUptimeStatistics {
    pub total_executions: u64,
    pub successful_executions: u64,
    /// Sum of durations in milliseconds
    pub total_executions_response_time: u64,
}

/// Drop the oldest events beyond `max`, keeping a leading `START` event in place.
pub fn cap_events(events: &mut Vec<Event>, max: usize) {
    if events.len() <= max {
        return;
    }
    let excess = events.len() - max;
    let keep_start = max > 0 && events[0].event_type == EventType::Start;
    if keep_start {
        events.drain(1..1 + excess);
    } else {
        events.drain(..excess);
    }
}

/// Drop the oldest results beyond `max`.
pub fn cap_results(results: &mut Vec<CheckResult>, max: usize) {
    if results.len() > max {
        let excess = results.len() - max;
        results.drain(..excess);
    }
}

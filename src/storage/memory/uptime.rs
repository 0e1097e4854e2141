//! Hourly uptime aggregation.

use crate::endpoint::{CheckResult, HourlyUptimeStatistics, Uptime};
use crate::storage::{truncate_to_hour, uptime_cleanup_cutoff, UPTIME_CLEANUP_THRESHOLD};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Add `result` to its hourly bucket.
///
/// Old buckets are only purged once there are more than ten days worth of
/// them, and then everything older than the retention goes at once.
pub fn record_uptime(uptime: &mut Uptime, result: &CheckResult, now: DateTime<Utc>) {
    let bucket = uptime
        .hourly_statistics
        .entry(truncate_to_hour(result.timestamp))
        .or_default();
    bucket.total_executions += 1;
    if result.success {
        bucket.successful_executions += 1;
    }
    bucket.total_executions_response_time += result.duration.as_millis() as u64;

    if uptime.hourly_statistics.len() > UPTIME_CLEANUP_THRESHOLD {
        let cutoff = uptime_cleanup_cutoff(now);
        uptime.hourly_statistics.retain(|hour, _| *hour >= cutoff);
    }
}

fn buckets_between(
    uptime: &Uptime,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> impl Iterator<Item = (&i64, &HourlyUptimeStatistics)> {
    let first = truncate_to_hour(from);
    let last = to.timestamp();
    uptime
        .hourly_statistics
        .range(first..=last.max(first))
        .filter(move |(hour, stats)| **hour <= last && stats.total_executions > 0)
}

/// Successful over total executions in the range; 0 without data.
pub fn uptime_between(uptime: &Uptime, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let (successful, total) = buckets_between(uptime, from, to)
        .fold((0u64, 0u64), |(s, t), (_, stats)| {
            (s + stats.successful_executions, t + stats.total_executions)
        });
    if total == 0 {
        return 0.0;
    }
    successful as f64 / total as f64
}

/// Average duration in milliseconds over the range; 0 without data.
pub fn average_response_time_between(uptime: &Uptime, from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    let (response_time, total) = buckets_between(uptime, from, to)
        .fold((0u64, 0u64), |(r, t), (_, stats)| {
            (r + stats.total_executions_response_time, t + stats.total_executions)
        });
    if total == 0 {
        return 0;
    }
    response_time / total
}

/// Average duration in milliseconds of each hour with executions.
pub fn hourly_average_response_time_between(
    uptime: &Uptime,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> BTreeMap<i64, u64> {
    buckets_between(uptime, from, to)
        .map(|(hour, stats)| (*hour, stats.total_executions_response_time / stats.total_executions))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use std::time::Duration;

    fn result_at(ts: DateTime<Utc>, success: bool, millis: u64) -> CheckResult {
        CheckResult::new(ts, success, Duration::from_millis(millis))
    }

    #[test]
    fn test_record_accumulates_per_hour() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();
        let mut uptime = Uptime::default();
        record_uptime(&mut uptime, &result_at(now, true, 100), now);
        record_uptime(&mut uptime, &result_at(now + TimeDelta::minutes(10), false, 300), now);
        record_uptime(&mut uptime, &result_at(now + TimeDelta::hours(1), true, 50), now);

        assert_eq!(uptime.hourly_statistics.len(), 2);
        let bucket = uptime.hourly_statistics[&truncate_to_hour(now)];
        assert_eq!(bucket.total_executions, 2);
        assert_eq!(bucket.successful_executions, 1);
        assert_eq!(bucket.total_executions_response_time, 400);
    }

    #[test]
    fn test_uptime_is_order_independent() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ok = result_at(now + TimeDelta::minutes(1), true, 10);
        let ko = result_at(now + TimeDelta::minutes(2), false, 30);

        let mut a = Uptime::default();
        record_uptime(&mut a, &ok, now);
        record_uptime(&mut a, &ko, now);
        let mut b = Uptime::default();
        record_uptime(&mut b, &ko, now);
        record_uptime(&mut b, &ok, now);

        assert_eq!(a, b);
        let to = now + TimeDelta::hours(1);
        assert_eq!(uptime_between(&a, now, to), 0.5);
        assert_eq!(average_response_time_between(&a, now, to), 20);
    }

    #[test]
    fn test_queries_without_data() {
        let now = Utc::now();
        let uptime = Uptime::default();
        assert_eq!(uptime_between(&uptime, now - TimeDelta::hours(24), now), 0.0);
        assert_eq!(average_response_time_between(&uptime, now - TimeDelta::hours(24), now), 0);
        assert!(hourly_average_response_time_between(&uptime, now - TimeDelta::hours(24), now).is_empty());
    }

    #[test]
    fn test_range_includes_bucket_containing_from() {
        let hour = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut uptime = Uptime::default();
        record_uptime(&mut uptime, &result_at(hour + TimeDelta::minutes(5), true, 10), hour);
        record_uptime(&mut uptime, &result_at(hour + TimeDelta::hours(3), false, 10), hour);

        // from in the middle of the first bucket, to before the second one
        let from = hour + TimeDelta::minutes(30);
        assert_eq!(uptime_between(&uptime, from, hour + TimeDelta::hours(2)), 1.0);
        assert_eq!(uptime_between(&uptime, from, hour + TimeDelta::hours(3)), 0.5);
        assert_eq!(uptime_between(&uptime, hour + TimeDelta::hours(4), hour + TimeDelta::hours(5)), 0.0);
    }

    #[test]
    fn test_hourly_average_response_time() {
        let hour = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut uptime = Uptime::default();
        record_uptime(&mut uptime, &result_at(hour, true, 100), hour);
        record_uptime(&mut uptime, &result_at(hour, true, 201), hour);
        record_uptime(&mut uptime, &result_at(hour + TimeDelta::hours(2), true, 40), hour);

        let hourly = hourly_average_response_time_between(&uptime, hour, hour + TimeDelta::hours(5));
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[&hour.timestamp()], 150);
        assert_eq!(hourly[&(hour + TimeDelta::hours(2)).timestamp()], 40);
    }

    #[test]
    fn test_cleanup_is_deferred_until_threshold() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut uptime = Uptime::default();
        // Exactly the threshold: nothing is purged even though most buckets are old
        for h in 0..UPTIME_CLEANUP_THRESHOLD as i64 {
            record_uptime(&mut uptime, &result_at(now - TimeDelta::hours(h), true, 1), now);
        }
        assert_eq!(uptime.hourly_statistics.len(), UPTIME_CLEANUP_THRESHOLD);

        // One more bucket crosses the threshold and purges everything past the retention
        record_uptime(&mut uptime, &result_at(now + TimeDelta::hours(1), true, 1), now);
        let cutoff = uptime_cleanup_cutoff(now);
        assert!(uptime.hourly_statistics.keys().all(|hour| *hour >= cutoff));
        assert_eq!(uptime.hourly_statistics.len(), 7 * 24 + 1 + 1 + 1);
    }
}

//! Retry backoff, jitter and circuit breaking.

use crate::config::{CircuitBreakerPolicy, SchedulePolicy, setting_duration};
use crate::record::FiscalRecord;
use crate::store::MAX_RETRY_COUNT;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// `base * 2^retry`, never more than `cap`.
pub fn backoff_window(retry_count: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let exponent = retry_count.min(MAX_RETRY_COUNT);
    let window = base_secs.saturating_mul(1u64 << exponent).min(cap_secs);
    setting_duration(window)
}

/// Whether an errored record may be retried at `now`. Records that were never
/// attempted are always due.
pub fn is_due(record: &FiscalRecord, policy: &SchedulePolicy, jitter_secs: u64, now: DateTime<Utc>) -> bool {
    let Some(last) = record.last_attempt_at.as_ref() else {
        return true;
    };
    let wait = backoff_window(
        record.retry_count,
        policy.backoff_base_secs,
        policy.backoff_cap_secs,
    ) + setting_duration(jitter_secs.min(policy.jitter_max_secs));
    last.to_datetime_utc()
        .checked_add_signed(wait)
        .is_some_and(|ready_at| now >= ready_at)
}

/// Open when the failures seen in the window reach the threshold.
pub fn breaker_open(failures: usize, policy: &CircuitBreakerPolicy) -> bool {
    policy.threshold > 0 && failures >= policy.threshold
}

pub trait JitterSource: Send + Sync + std::fmt::Debug {
    /// A value in `0..=max_secs`.
    fn jitter(&self, max_secs: u64) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn jitter(&self, max_secs: u64) -> u64 {
        if max_secs == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..=max_secs)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn jitter(&self, _max_secs: u64) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordStatus;
    use crate::timestamp::{CalendarDate, TimeStamp};
    use chrono::TimeZone;

    #[test]
    fn third_retry_hits_the_cap() {
        assert_eq!(backoff_window(3, 600, 3600), Duration::minutes(60));
        assert_eq!(backoff_window(0, 600, 3600), Duration::minutes(10));
        assert_eq!(backoff_window(1, 600, 3600), Duration::minutes(20));
        assert_eq!(backoff_window(40, 600, 3600), Duration::minutes(60));
    }

    #[test]
    fn errored_record_waits_for_backoff_and_jitter() {
        let policy = SchedulePolicy::default();
        let attempted = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let mut record =
            FiscalRecord::new("t", "j", "A-1", CalendarDate::from_ymd(2025, 3, 1).unwrap());
        record.status = RecordStatus::Error;
        record.retry_count = 1;
        record.last_attempt_at = Some(TimeStamp(attempted));

        let window_end = attempted + Duration::minutes(20);
        assert!(!is_due(&record, &policy, 0, window_end - Duration::seconds(1)));
        assert!(is_due(&record, &policy, 0, window_end));
        assert!(!is_due(&record, &policy, 30, window_end));
        assert!(is_due(&record, &policy, 30, window_end + Duration::seconds(30)));
    }

    #[test]
    fn breaker_trips_at_threshold() {
        let policy = CircuitBreakerPolicy::default();
        assert!(!breaker_open(4, &policy));
        assert!(breaker_open(5, &policy));
    }

    #[test]
    fn random_jitter_stays_in_range() {
        for _ in 0..100 {
            assert!(RandomJitter.jitter(60) <= 60);
        }
        assert_eq!(RandomJitter.jitter(0), 0);
    }
}

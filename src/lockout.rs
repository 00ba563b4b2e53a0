use crate::errors::{AppError, AppResult};
use crate::models::TrackerSettings;
use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut current) = self.current.lock() {
            *current = *current + by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.current
            .lock()
            .map(|current| *current)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_failed_attempts: u32,
    pub duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        let settings = TrackerSettings::default();
        Self {
            max_failed_attempts: settings.max_failed_attempts,
            duration: Duration::minutes(settings.lockout_duration_minutes),
        }
    }
}

impl LockoutPolicy {
    pub fn from_settings(settings: &TrackerSettings) -> AppResult<Self> {
        Ok(Self {
            max_failed_attempts: settings.max_failed_attempts,
            duration: minutes_setting(settings.lockout_duration_minutes, "lockoutDurationMinutes")?,
        })
    }

    pub fn ensure_unlocked(&self, locked_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> AppResult<()> {
        match locked_until {
            Some(until) if until > now => Err(AppError::Locked {
                retry_in_minutes: remaining_minutes(until, now),
            }),
            _ => Ok(()),
        }
    }

    /// `failed_attempts` already counts this failure. The counter is not reset when a lock expires,
    /// so a failure right after expiry locks again.
    pub fn evaluate_failure(&self, failed_attempts: u32, now: DateTime<Utc>) -> AppResult<FailureOutcome> {
        let locked_until = if failed_attempts >= self.max_failed_attempts {
            Some(expires_after(now, self.duration)?)
        } else {
            None
        };
        Ok(FailureOutcome {
            failed_attempts,
            locked_until,
        })
    }

    pub fn lockout_error(&self) -> AppError {
        AppError::Locked {
            retry_in_minutes: self.duration.num_minutes(),
        }
    }
}

/// A positive duration in minutes that chrono can represent.
pub fn minutes_setting(minutes: i64, name: &str) -> AppResult<Duration> {
    Duration::try_minutes(minutes)
        .filter(|duration| *duration > Duration::zero())
        .ok_or_else(|| AppError::Validation(format!("{} has an out-of-range value {}", name, minutes)))
}

pub fn expires_after(now: DateTime<Utc>, ttl: Duration) -> AppResult<DateTime<Utc>> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| AppError::Validation(format!("Duration of {} minutes is out of range", ttl.num_minutes())))
}

/// Whole minutes left, rounded up so a user is never told to retry "in 0 minutes".
pub fn remaining_minutes(locked_until: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let remaining = (locked_until - now).num_seconds().max(0);
    remaining / 60 + 1
}

#[cfg(test)]
mod tests {
    use super::{expires_after, minutes_setting, remaining_minutes, Clock, LockoutPolicy, ManualClock};
    use crate::errors::AppError;
    use crate::models::TrackerSettings;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn third_failure_locks_for_configured_duration() {
        let policy = LockoutPolicy::default();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("time");

        let first = policy.evaluate_failure(1, now).expect("first");
        assert_eq!(first.failed_attempts, 1);
        assert!(first.locked_until.is_none());

        let second = policy.evaluate_failure(2, now).expect("second");
        assert!(second.locked_until.is_none());

        let third = policy.evaluate_failure(3, now).expect("third");
        assert_eq!(third.failed_attempts, 3);
        assert_eq!(third.locked_until, Some(now + Duration::minutes(15)));
    }

    #[test]
    fn oversized_durations_are_errors_not_panics() {
        let huge = TrackerSettings {
            lockout_duration_minutes: 10_000_000_000_000,
            ..TrackerSettings::default()
        };
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("time");
        let policy = LockoutPolicy::from_settings(&huge).expect("representable duration");
        assert!(policy.evaluate_failure(2, now).expect("below threshold").locked_until.is_none());
        assert!(matches!(policy.evaluate_failure(3, now), Err(AppError::Validation(_))));
        assert!(matches!(
            minutes_setting(i64::MAX, "sessionTtlMinutes"),
            Err(AppError::Validation(_))
        ));
        assert!(minutes_setting(0, "sessionTtlMinutes").is_err());

        let far = Duration::try_days(100_000_000).expect("representable");
        assert!(matches!(expires_after(now, far), Err(AppError::Validation(_))));
        assert_eq!(
            expires_after(now, Duration::minutes(30)).expect("expiry"),
            now + Duration::minutes(30)
        );
    }

    #[test]
    fn active_lock_reports_remaining_minutes() {
        let policy = LockoutPolicy::default();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("time");
        let until = now + Duration::minutes(15);

        match policy.ensure_unlocked(Some(until), now) {
            Err(AppError::Locked { retry_in_minutes }) => assert_eq!(retry_in_minutes, 16),
            other => panic!("expected lock, got {:?}", other),
        }
        match policy.ensure_unlocked(Some(until), now + Duration::seconds(14 * 60 + 30)) {
            Err(AppError::Locked { retry_in_minutes }) => assert_eq!(retry_in_minutes, 1),
            other => panic!("expected lock, got {:?}", other),
        }
        assert!(policy.ensure_unlocked(Some(until), until).is_ok());
        assert!(policy.ensure_unlocked(None, now).is_ok());
    }

    #[test]
    fn remaining_minutes_never_goes_below_one() {
        let now = Utc::now();
        assert_eq!(remaining_minutes(now - Duration::minutes(3), now), 1);
        assert_eq!(remaining_minutes(now + Duration::seconds(59), now), 1);
        assert_eq!(remaining_minutes(now + Duration::seconds(60), now), 2);
    }

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("time");
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(16));
        assert_eq!(clock.now(), start + Duration::minutes(16));
    }
}

//! Refresh scheduling.
//!
//! Two expression forms are accepted: a minute-step cron (`*/4 * * * *`)
//! which ticks at a fixed period, and a duration (`90s`, `4m`, `1h`, or bare
//! milliseconds) which ticks with up to 30 s of jitter either way.

use std::time::Duration;

use thiserror::Error;

use crate::humanize;

/// Jitter applied to interval schedules.
pub const INTERVAL_JITTER: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Empty schedule expression")]
    Empty,
    #[error("Unsupported cron expression '{0}': only '*/N * * * *' is supported")]
    UnsupportedCron(String),
    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),
    #[error("Schedule period must be greater than zero")]
    Zero,
}

/// A parsed refresh schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSchedule {
    /// Every N minutes, no jitter.
    Cron { every: Duration },
    /// Fixed period with jitter.
    Interval { every: Duration },
}

impl RefreshSchedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ScheduleError::Empty);
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() > 1 {
            return parse_cron(expr, &fields);
        }

        let every = parse_duration(expr)?;
        if every.is_zero() {
            return Err(ScheduleError::Zero);
        }
        Ok(Self::Interval { every })
    }

    pub fn period(&self) -> Duration {
        match *self {
            Self::Cron { every } | Self::Interval { every } => every,
        }
    }

    pub fn jitter(&self) -> Duration {
        match self {
            Self::Cron { .. } => Duration::ZERO,
            Self::Interval { .. } => INTERVAL_JITTER,
        }
    }

    pub fn scheduler(&self) -> IntervalScheduler {
        IntervalScheduler::new(self.period(), self.jitter())
    }
}

fn parse_cron(expr: &str, fields: &[&str]) -> Result<RefreshSchedule, ScheduleError> {
    let unsupported = || ScheduleError::UnsupportedCron(expr.to_string());
    if fields.len() != 5 || fields[1..].iter().any(|f| *f != "*") {
        return Err(unsupported());
    }

    let minutes: u64 = match fields[0] {
        "*" => 1,
        step => step
            .strip_prefix("*/")
            .and_then(|n| n.parse().ok())
            .ok_or_else(unsupported)?,
    };
    if minutes == 0 {
        return Err(ScheduleError::Zero);
    }
    Ok(RefreshSchedule::Cron {
        every: Duration::from_secs(minutes * 60),
    })
}

fn parse_duration(expr: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidDuration(expr.to_string());
    let lower = expr.to_ascii_lowercase();

    let (digits, unit_ms) = if let Some(n) = lower.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = lower.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = lower.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (lower.as_str(), 1)
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    let ms = value.checked_mul(unit_ms).ok_or_else(invalid)?;
    Ok(Duration::from_millis(ms))
}

/// Yields the delay until the next refresh.
pub trait Scheduler: Send + Sync {
    fn next_delay(&self) -> Duration;
}

/// Fixed period with optional symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalScheduler {
    pub every: Duration,
    pub jitter: Duration,
}

impl IntervalScheduler {
    pub fn new(every: Duration, jitter: Duration) -> Self {
        Self { every, jitter }
    }

    /// Interval in milliseconds with the standard jitter.
    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms), INTERVAL_JITTER)
    }
}

impl Scheduler for IntervalScheduler {
    fn next_delay(&self) -> Duration {
        humanize::jittered(self.every, self.jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cron_step() {
        assert_eq!(
            RefreshSchedule::parse("*/4 * * * *").unwrap(),
            RefreshSchedule::Cron {
                every: Duration::from_secs(240)
            }
        );
        assert_eq!(
            RefreshSchedule::parse("* * * * *").unwrap().period(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_parse_rejects_unsupported_cron() {
        assert!(matches!(
            RefreshSchedule::parse("0 */2 * * *"),
            Err(ScheduleError::UnsupportedCron(_))
        ));
        assert!(matches!(
            RefreshSchedule::parse("*/4 * *"),
            Err(ScheduleError::UnsupportedCron(_))
        ));
        assert_eq!(
            RefreshSchedule::parse("*/0 * * * *"),
            Err(ScheduleError::Zero)
        );
    }

    #[test]
    fn test_parse_durations() {
        let cases = [
            ("90s", 90_000),
            ("4m", 240_000),
            ("1h", 3_600_000),
            ("250ms", 250),
            ("180000", 180_000),
        ];
        for (expr, ms) in cases {
            assert_eq!(
                RefreshSchedule::parse(expr).unwrap(),
                RefreshSchedule::Interval {
                    every: Duration::from_millis(ms)
                },
                "{}",
                expr
            );
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(RefreshSchedule::parse("  "), Err(ScheduleError::Empty));
        assert_eq!(RefreshSchedule::parse("0s"), Err(ScheduleError::Zero));
        assert!(matches!(
            RefreshSchedule::parse("soon"),
            Err(ScheduleError::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_cron_has_no_jitter() {
        let scheduler = RefreshSchedule::parse("*/4 * * * *").unwrap().scheduler();
        assert_eq!(scheduler.next_delay(), Duration::from_secs(240));
    }

    #[test]
    fn test_interval_jitter_bounds() {
        let scheduler = RefreshSchedule::parse("4m").unwrap().scheduler();
        for _ in 0..100 {
            let d = scheduler.next_delay();
            assert!(d >= Duration::from_secs(210) && d <= Duration::from_secs(270));
        }
    }
}

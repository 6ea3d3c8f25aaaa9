use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use geocollect_core::Schedule;

use crate::error::{Result, SchedulerError};

/// Time unit of a `Schedule::Frequency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

impl FrequencyUnit {
    fn seconds(self) -> i64 {
        match self {
            FrequencyUnit::Second => 1,
            FrequencyUnit::Minute => 60,
            FrequencyUnit::Hour => 3_600,
            FrequencyUnit::Day => 86_400,
            FrequencyUnit::Week => 604_800,
        }
    }
}

impl FromStr for FrequencyUnit {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => Ok(FrequencyUnit::Second),
            "m" | "min" | "mins" | "minute" | "minutes" => Ok(FrequencyUnit::Minute),
            "h" | "hour" | "hours" => Ok(FrequencyUnit::Hour),
            "d" | "day" | "days" => Ok(FrequencyUnit::Day),
            "w" | "wk" | "week" | "weeks" => Ok(FrequencyUnit::Week),
            other => Err(SchedulerError::InvalidSchedule(format!(
                "unknown frequency unit: {other:?}"
            ))),
        }
    }
}

/// Fixed period of a frequency schedule; `None` for grid schedules
/// (daily, weekly, cron) whose spacing varies.
pub fn period(schedule: &Schedule) -> Result<Option<Duration>> {
    match schedule {
        Schedule::Frequency { frequency, unit } => {
            if *frequency <= 0 {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "frequency must be positive, got {frequency}"
                )));
            }
            let unit: FrequencyUnit = unit.parse()?;
            frequency
                .checked_mul(unit.seconds())
                .and_then(Duration::try_seconds)
                .map(Some)
                .ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!("frequency {frequency} {unit:?} overflows"))
                })
        }
        _ => Ok(None),
    }
}

/// Reject schedules that can never fire.
pub fn validate(schedule: &Schedule) -> Result<()> {
    match schedule {
        Schedule::Frequency { .. } => period(schedule).map(|_| ()),
        Schedule::Daily { hour, minute } => time_of_day(*hour, *minute).map(|_| ()),
        Schedule::Weekly { day, hour, minute } => {
            if *day > 6 {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "weekday must be 0 (Monday) to 6 (Sunday), got {day}"
                )));
            }
            time_of_day(*hour, *minute).map(|_| ())
        }
        Schedule::Cron { expression } => parse_cron(expression).map(|_| ()),
    }
}

fn time_of_day(hour: u8, minute: u8) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour.into(), minute.into(), 0).ok_or_else(|| {
        SchedulerError::InvalidSchedule(format!("invalid time of day {hour:02}:{minute:02}"))
    })
}

fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expression).map_err(|e| {
        SchedulerError::InvalidSchedule(format!("invalid cron expression {expression:?}: {e}"))
    })
}

/// Compute the next fire time strictly *after* `from`.
///
/// For a frequency schedule this is exactly one period later.
pub fn compute_next_run(schedule: &Schedule, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match schedule {
        Schedule::Frequency { .. } => {
            let step = period(schedule)?.ok_or_else(|| {
                SchedulerError::InvalidSchedule("frequency schedule without a period".into())
            })?;
            from.checked_add_signed(step).ok_or_else(|| {
                SchedulerError::InvalidSchedule("next fire time out of range".into())
            })
        }

        Schedule::Daily { hour, minute } => {
            let at = time_of_day(*hour, *minute)?;
            // Today's candidate, or tomorrow's if it already passed.
            let today = Utc.from_utc_datetime(&from.date_naive().and_time(at));
            Ok(if today > from {
                today
            } else {
                today + Duration::days(1)
            })
        }

        Schedule::Weekly { day, hour, minute } => {
            validate(schedule)?;
            let at = time_of_day(*hour, *minute)?;
            // `day` follows chrono's `num_days_from_monday`: 0=Monday … 6=Sunday.
            let today_dow = i64::from(from.weekday().num_days_from_monday());
            let days_ahead = (i64::from(*day) - today_dow).rem_euclid(7);
            let date = from.date_naive() + Duration::days(days_ahead);
            let candidate = Utc.from_utc_datetime(&date.and_time(at));
            Ok(if candidate > from {
                candidate
            } else {
                // Same weekday, time already passed.
                candidate + Duration::days(7)
            })
        }

        Schedule::Cron { expression } => parse_cron(expression)?
            .after(&from)
            .next()
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule(format!(
                    "cron expression {expression:?} has no future occurrence"
                ))
            }),
    }
}

/// First fire time for a freshly armed timer.
///
/// No prior completed run fires immediately (`now`); otherwise the next grid
/// point after the last run. The result may lie in the past, in which case
/// the timer fires right away.
pub fn first_fire(
    schedule: &Schedule,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    validate(schedule)?;
    match last_run {
        None => Ok(now),
        Some(last) => compute_next_run(schedule, last),
    }
}

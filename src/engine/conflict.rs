use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::model::{Booking, LabState, TimeRange};
use crate::observability;

use super::EngineError;

/// Interval shape check. Runs before conflict detection ever sees the range,
/// so the detector never has to handle `end <= start`.
pub(crate) fn validate_interval(range: &TimeRange) -> Result<(), EngineError> {
    if range.end <= range.start {
        return Err(EngineError::Validation("end must be after start"));
    }
    Ok(())
}

/// Creation-time check only: a booking must start in the future. Not
/// re-enforced on updates that leave the interval untouched.
pub(crate) fn validate_future(range: &TimeRange, now: DateTime<Utc>) -> Result<(), EngineError> {
    if range.start < now {
        return Err(EngineError::Validation("booking cannot start in the past"));
    }
    Ok(())
}

/// Find an active booking overlapping `range`, ignoring `exclude` (used when
/// re-validating an edit against itself). Pure query, no side effects.
///
/// "Active" is `BookingStatus::is_active()` — pending or approved — and
/// nothing else, everywhere. Cancelled/rejected never block; completed is
/// historical and does not block either.
pub fn find_conflict<'a>(
    ls: &'a LabState,
    range: &TimeRange,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    ls.overlapping(range)
        .find(|b| b.status.is_active() && Some(b.id) != exclude)
}

pub fn has_conflict(ls: &LabState, range: &TimeRange, exclude: Option<Ulid>) -> bool {
    find_conflict(ls, range, exclude).is_some()
}

pub(crate) fn check_no_conflict(
    ls: &LabState,
    range: &TimeRange,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if let Some(existing) = find_conflict(ls, range, exclude) {
        metrics::counter!(observability::CONFLICTS_DETECTED_TOTAL).increment(1);
        return Err(EngineError::Conflict {
            booking_id: existing.id,
            range: existing.range,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BookingStatus;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 6, 3, h, m, 0).unwrap()
    }

    fn lab_with(bookings: Vec<(DateTime<Utc>, DateTime<Utc>, BookingStatus)>) -> LabState {
        let mut ls = LabState::new(Ulid::new(), "Lab A".into(), "Main".into(), 20, vec![]);
        for (start, end, status) in bookings {
            ls.insert_booking(Booking {
                id: Ulid::new(),
                lab_id: ls.id,
                requester: Ulid::new(),
                range: TimeRange::new(start, end),
                status,
                purpose: String::new(),
                created_at: Utc::now(),
                approved_by: None,
                admin_notes: None,
                is_recurring: false,
                frequency: None,
                recurrence_until: None,
                parent: None,
                is_policy_exception: false,
                exception_reason: None,
                exception_approved_by: None,
            });
        }
        ls
    }

    #[test]
    fn overlap_against_active_statuses() {
        let ls = lab_with(vec![(at(10, 0), at(11, 0), BookingStatus::Approved)]);
        assert!(has_conflict(&ls, &TimeRange::new(at(10, 30), at(11, 30)), None));
        assert!(has_conflict(&ls, &TimeRange::new(at(9, 30), at(10, 30)), None));
        assert!(has_conflict(&ls, &TimeRange::new(at(10, 15), at(10, 45)), None));
        assert!(has_conflict(&ls, &TimeRange::new(at(9, 0), at(12, 0)), None));
    }

    #[test]
    fn boundary_touch_is_not_a_conflict() {
        let ls = lab_with(vec![(at(10, 0), at(11, 0), BookingStatus::Approved)]);
        assert!(!has_conflict(&ls, &TimeRange::new(at(11, 0), at(12, 0)), None));
        assert!(!has_conflict(&ls, &TimeRange::new(at(9, 0), at(10, 0)), None));
    }

    #[test]
    fn inactive_statuses_never_block() {
        for status in [
            BookingStatus::Cancelled,
            BookingStatus::Rejected,
            BookingStatus::Completed,
        ] {
            let ls = lab_with(vec![(at(10, 0), at(11, 0), status)]);
            assert!(
                !has_conflict(&ls, &TimeRange::new(at(10, 0), at(11, 0)), None),
                "{status:?} should not block"
            );
        }
    }

    #[test]
    fn pending_blocks() {
        let ls = lab_with(vec![(at(10, 0), at(11, 0), BookingStatus::Pending)]);
        assert!(has_conflict(&ls, &TimeRange::new(at(10, 0), at(11, 0)), None));
    }

    #[test]
    fn exclusion_for_self_edit() {
        let ls = lab_with(vec![(at(10, 0), at(11, 0), BookingStatus::Approved)]);
        let own_id = ls.bookings[0].id;
        // Re-validating the same interval against itself passes
        assert!(!has_conflict(&ls, &TimeRange::new(at(10, 0), at(11, 0)), Some(own_id)));
        // But a different booking still conflicts
        assert!(has_conflict(&ls, &TimeRange::new(at(10, 0), at(11, 0)), Some(Ulid::new())));
    }

    #[test]
    fn conflict_error_names_the_blocker() {
        let ls = lab_with(vec![(at(10, 0), at(11, 0), BookingStatus::Approved)]);
        let blocker = ls.bookings[0].id;
        let err = check_no_conflict(&ls, &TimeRange::new(at(10, 30), at(11, 30)), None)
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::Conflict {
                booking_id: blocker,
                range: TimeRange::new(at(10, 0), at(11, 0)),
            }
        );
    }

    #[test]
    fn malformed_interval_rejected_upstream() {
        assert!(validate_interval(&TimeRange {
            start: at(11, 0),
            end: at(10, 0)
        })
        .is_err());
        assert!(validate_interval(&TimeRange {
            start: at(10, 0),
            end: at(10, 0)
        })
        .is_err());
        assert!(validate_interval(&TimeRange::new(at(10, 0), at(10, 1))).is_ok());
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Utc};

use crate::limits::{DEFAULT_WORK_END_HOUR, DEFAULT_WORK_START_HOUR};
use crate::model::{DaySummary, LabState, Policy, Slot, SlotStatus, TimeRange};

use super::conflict::find_conflict;

// ── Availability Algorithm ────────────────────────────────────────

fn hour_on(date: NaiveDate, hour: u32) -> DateTime<Utc> {
    date.and_hms_opt(hour, 0, 0)
        .expect("working hours validated to 0..=23")
        .and_utc()
}

/// The bookable window for one day: the policy's working hours, or the
/// default 08:00–20:00 when no policy is active.
pub fn day_window(date: NaiveDate, policy: Option<&Policy>) -> TimeRange {
    let (start_hour, end_hour) = match policy {
        Some(p) => (p.work_start_hour, p.work_end_hour),
        None => (DEFAULT_WORK_START_HOUR, DEFAULT_WORK_END_HOUR),
    };
    TimeRange::new(hour_on(date, start_hour), hour_on(date, end_hour))
}

/// Whether a date falls inside the policy's bookable window (advance notice
/// through horizon). Date-granular on both ends; no policy means every date
/// qualifies.
pub fn date_bookable(date: NaiveDate, policy: Option<&Policy>, now: DateTime<Utc>) -> bool {
    let Some(p) = policy else { return true };
    let min_date = (now + TimeDelta::days(p.advance_notice_days as i64)).date_naive();
    let max_date = (now + TimeDelta::days(p.max_advance_days as i64)).date_naive();
    date >= min_date && date <= max_date
}

/// Partition a day's working window into fixed-size slots and mark each free
/// or booked against the lab's active bookings. No date gating — callers that
/// need the policy horizon applied use `day_slots`.
pub fn slot_grid(ls: &LabState, date: NaiveDate, slot_minutes: u32, policy: Option<&Policy>) -> Vec<Slot> {
    if slot_minutes == 0 {
        return Vec::new();
    }
    let window = day_window(date, policy);
    let step = TimeDelta::minutes(slot_minutes as i64);

    let mut slots = Vec::new();
    let mut current = window.start;
    // Last slot is the one still fully inside the window.
    while current + step <= window.end {
        let range = TimeRange::new(current, current + step);
        let status = if find_conflict(ls, &range, None).is_some() {
            SlotStatus::Booked
        } else {
            SlotStatus::Free
        };
        slots.push(Slot { range, status });
        current += step;
    }
    slots
}

/// The day grid a requester sees: empty when the date lies outside the
/// policy's notice/horizon window (not an error — there is simply nothing
/// bookable there), otherwise every slot with its free/booked status.
pub fn day_slots(
    ls: &LabState,
    date: NaiveDate,
    slot_minutes: u32,
    policy: Option<&Policy>,
    now: DateTime<Utc>,
) -> Vec<Slot> {
    if !date_bookable(date, policy, now) {
        return Vec::new();
    }
    slot_grid(ls, date, slot_minutes, policy)
}

/// Contiguous runs of free slots long enough for `duration_minutes`.
///
/// A window of consecutive slots qualifies only if every slot in it is free —
/// a sliding-window AND over the grid, not per-slot independence. Durations
/// that are not a multiple of the slot size truncate via integer division
/// with a floor of one slot.
pub fn available_windows(slots: &[Slot], duration_minutes: u32, slot_minutes: u32) -> Vec<TimeRange> {
    if slot_minutes == 0 || slots.is_empty() {
        return Vec::new();
    }
    let needed = ((duration_minutes / slot_minutes) as usize).max(1);
    if needed > slots.len() {
        return Vec::new();
    }

    let mut windows = Vec::new();
    for i in 0..=(slots.len() - needed) {
        if slots[i..i + needed].iter().all(Slot::is_free) {
            windows.push(TimeRange::new(
                slots[i].range.start,
                slots[i + needed - 1].range.end,
            ));
        }
    }
    windows
}

/// Per-day free/total/booked counts for every day of a month. The month grid
/// is a calendar overview, so it is not horizon-filtered; only `day_slots`
/// gates on the bookable window.
pub fn month_summary(
    ls: &LabState,
    year: i32,
    month: u32,
    slot_minutes: u32,
    policy: Option<&Policy>,
) -> BTreeMap<NaiveDate, DaySummary> {
    let mut out = BTreeMap::new();
    let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return out;
    };

    let mut day = first;
    while day.month() == month {
        let slots = slot_grid(ls, day, slot_minutes, policy);
        let total_slots = slots.len() as u32;
        let free_slots = slots.iter().filter(|s| s.is_free()).count() as u32;

        let window = day_window(day, policy);
        let booked_count = ls
            .overlapping(&window)
            .filter(|b| b.status.is_active())
            .count() as u32;

        out.insert(
            day,
            DaySummary {
                free_slots,
                total_slots,
                booked_count,
            },
        );
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    out
}

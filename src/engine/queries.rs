use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use ulid::Ulid;

use crate::limits::DEFAULT_SLOT_MINUTES;
use crate::model::*;

use super::availability::{available_windows, day_slots, month_summary};
use super::{Engine, EngineError};

/// Read-side queries. Each one resolves the active policy once at the
/// boundary and takes the lab's read lock for the duration of the scan, so a
/// single result is always a consistent point-in-time view.
impl Engine {
    pub async fn booking(&self, booking_id: Ulid) -> Option<Booking> {
        let lab_id = self.lab_for_booking(&booking_id)?;
        let ls = self.get_lab(&lab_id)?;
        let guard = ls.read().await;
        guard.booking(booking_id).cloned()
    }

    /// All bookings for a lab, optionally restricted to a window.
    pub async fn bookings_for_lab(
        &self,
        lab_id: Ulid,
        window: Option<TimeRange>,
    ) -> Result<Vec<Booking>, EngineError> {
        let ls = self
            .get_lab(&lab_id)
            .ok_or(EngineError::NotFound(lab_id))?;
        let guard = ls.read().await;
        Ok(match window {
            Some(w) => guard.overlapping(&w).cloned().collect(),
            None => guard.bookings.clone(),
        })
    }

    /// The occupied intervals of one calendar day — the active bookings'
    /// ranges, in start order. Feeds the day grid's "taken" display.
    pub async fn booked_intervals_for_day(
        &self,
        lab_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeRange>, EngineError> {
        let ls = self
            .get_lab(&lab_id)
            .ok_or(EngineError::NotFound(lab_id))?;
        let guard = ls.read().await;
        let day = date
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .ok_or(EngineError::Validation("invalid date"))?;
        let window = TimeRange::new(day, day + TimeDelta::days(1));
        Ok(guard
            .overlapping(&window)
            .filter(|b| b.status.is_active())
            .map(|b| b.range)
            .collect())
    }

    pub async fn bookings_by_status(&self, status: BookingStatus) -> Vec<Booking> {
        let mut out = Vec::new();
        for entry in self.labs.iter() {
            let guard = entry.value().read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.status == status)
                    .cloned(),
            );
        }
        out
    }

    pub async fn bookings_for_requester(&self, requester: Ulid) -> Vec<Booking> {
        let mut out = Vec::new();
        for entry in self.labs.iter() {
            let guard = entry.value().read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.requester == requester)
                    .cloned(),
            );
        }
        out
    }

    /// The materialized occurrences of a series, in start order.
    pub async fn series_children(&self, parent_id: Ulid) -> Vec<Booking> {
        let Some(ids) = self.children.get(&parent_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let Some(lab_id) = self.lab_for_booking(&parent_id) else {
            return Vec::new();
        };
        let Some(ls) = self.get_lab(&lab_id) else {
            return Vec::new();
        };
        let guard = ls.read().await;
        let mut out: Vec<Booking> = ids
            .iter()
            .filter_map(|id| guard.booking(*id).cloned())
            .collect();
        out.sort_by_key(|b| b.range.start);
        out
    }

    pub async fn labs(&self) -> Vec<LabInfo> {
        let mut out = Vec::new();
        for entry in self.labs.iter() {
            let guard = entry.value().read().await;
            out.push(LabInfo {
                id: guard.id,
                name: guard.name.clone(),
                campus: guard.campus.clone(),
                capacity: guard.capacity,
                equipment: guard.equipment.clone(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    // ── Availability ─────────────────────────────────────

    /// The slot grid a requester sees for one day: empty when the date is
    /// outside the policy's bookable window. `slot_minutes` of `None` uses
    /// the conventional half-hour granularity.
    pub async fn day_grid(
        &self,
        lab_id: Ulid,
        date: NaiveDate,
        slot_minutes: Option<u32>,
    ) -> Result<Vec<Slot>, EngineError> {
        let slot_minutes = slot_minutes.unwrap_or(DEFAULT_SLOT_MINUTES);
        let policy = self.active_policy().await;
        let ls = self
            .get_lab(&lab_id)
            .ok_or(EngineError::NotFound(lab_id))?;
        let guard = ls.read().await;
        Ok(day_slots(&guard, date, slot_minutes, policy.as_ref(), Utc::now()))
    }

    /// Free runs long enough for `duration_minutes` on one day.
    pub async fn find_windows(
        &self,
        lab_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
        slot_minutes: Option<u32>,
    ) -> Result<Vec<TimeRange>, EngineError> {
        let slot_minutes = slot_minutes.unwrap_or(DEFAULT_SLOT_MINUTES);
        let slots = self.day_grid(lab_id, date, Some(slot_minutes)).await?;
        Ok(available_windows(&slots, duration_minutes, slot_minutes))
    }

    /// Per-day counts for a whole month's calendar view.
    pub async fn month_grid(
        &self,
        lab_id: Ulid,
        year: i32,
        month: u32,
        slot_minutes: Option<u32>,
    ) -> Result<BTreeMap<NaiveDate, DaySummary>, EngineError> {
        let slot_minutes = slot_minutes.unwrap_or(DEFAULT_SLOT_MINUTES);
        let policy = self.active_policy().await;
        let ls = self
            .get_lab(&lab_id)
            .ok_or(EngineError::NotFound(lab_id))?;
        let guard = ls.read().await;
        Ok(month_summary(&guard, year, month, slot_minutes, policy.as_ref()))
    }

    // ── Exceptions, policies, audit ──────────────────────

    pub fn exception(&self, id: Ulid) -> Option<PolicyException> {
        self.exceptions.get(&id).map(|e| e.value().clone())
    }

    pub fn pending_exceptions(&self) -> Vec<PolicyException> {
        let mut out: Vec<PolicyException> = self
            .exceptions
            .iter()
            .filter(|e| e.value().status == ExceptionStatus::Pending)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|e| e.created_at);
        out
    }

    pub async fn policies(&self) -> Vec<Policy> {
        self.policies.read().await.clone()
    }

    /// The full audit trail in append order.
    pub fn audit_trail(&self) -> Vec<AuditEntry> {
        self.audit.lock().expect("audit lock").clone()
    }

    /// Approved bookings whose interval has fully elapsed — the sweeper's
    /// work list.
    pub async fn collect_elapsed_approved(&self, now: DateTime<Utc>) -> Vec<Ulid> {
        let mut out = Vec::new();
        for entry in self.labs.iter() {
            let guard = entry.value().read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Approved && b.range.end <= now)
                    .map(|b| b.id),
            );
        }
        out
    }
}

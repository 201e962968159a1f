use chrono::{DateTime, NaiveDate, Utc};
use ulid::Ulid;

use crate::auth::Actor;
use crate::limits::MAX_OCCURRENCES_PER_SERIES;
use crate::model::{Booking, Event, RecurrenceFrequency};
use crate::observability;

use super::conflict::check_no_conflict;
use super::{entry_for, snapshot, Engine, EngineError};

/// Start instants for the occurrences after the parent: one fixed step at a
/// time until the start date passes `until`, hard-capped per series. The
/// monthly step is a fixed 30 days, not calendar-month arithmetic.
pub fn series_starts(
    parent_start: DateTime<Utc>,
    frequency: RecurrenceFrequency,
    until: NaiveDate,
) -> Vec<DateTime<Utc>> {
    let step = frequency.step();
    let mut starts = Vec::new();
    let mut current = parent_start + step;
    while current.date_naive() <= until && starts.len() < MAX_OCCURRENCES_PER_SERIES {
        starts.push(current);
        current += step;
    }
    starts
}

impl Engine {
    /// Materialize the occurrences of a recurring booking. Each occurrence is
    /// conflict-checked individually; a colliding occurrence is skipped (and
    /// logged), never fails the whole series. Runs under the lab's write lock
    /// so the expansion is atomic with respect to concurrent requests.
    pub async fn expand_series(
        &self,
        actor: &Actor,
        parent_id: Ulid,
    ) -> Result<Vec<Booking>, EngineError> {
        if !actor.caps().create_recurring {
            return Err(EngineError::Permission("cannot create recurring bookings"));
        }
        let (_, mut guard) = self.resolve_booking_write(&parent_id).await?;
        let parent = guard
            .booking(parent_id)
            .ok_or(EngineError::NotFound(parent_id))?
            .clone();
        if parent.parent.is_some() {
            return Err(EngineError::Validation(
                "occurrences cannot be expanded again",
            ));
        }
        let (Some(frequency), Some(until)) = (parent.frequency, parent.recurrence_until) else {
            return Err(EngineError::Validation("booking is not a series parent"));
        };
        if self.children.contains_key(&parent_id) {
            return Err(EngineError::Validation("series already expanded"));
        }
        if let Some(p) = self.active_policy().await
            && !p.allow_recurring
        {
            return Err(EngineError::Validation(
                "recurring bookings are disabled by policy",
            ));
        }

        let duration = parent.range.duration();
        let mut created = Vec::new();
        for start in series_starts(parent.range.start, frequency, until) {
            let range = crate::model::TimeRange::new(start, start + duration);
            if let Err(e) = check_no_conflict(&guard, &range, None) {
                metrics::counter!(observability::RECURRENCE_SKIPS_TOTAL).increment(1);
                tracing::warn!(
                    parent = %parent_id,
                    start = %start,
                    error = %e,
                    "occurrence skipped"
                );
                continue;
            }
            let child = Booking {
                id: Ulid::new(),
                lab_id: parent.lab_id,
                requester: parent.requester,
                range,
                // Occurrences inherit the parent's approval state
                status: parent.status,
                purpose: parent.purpose.clone(),
                created_at: Utc::now(),
                approved_by: parent.approved_by,
                admin_notes: None,
                is_recurring: true,
                frequency: Some(frequency),
                recurrence_until: Some(until),
                parent: Some(parent_id),
                is_policy_exception: false,
                exception_reason: None,
                exception_approved_by: None,
            };
            let entry = entry_for(
                Some(actor.id),
                Event::BookingRequested {
                    booking: child.clone(),
                },
                None,
                snapshot(&child),
            );
            self.persist_and_apply(&mut guard, entry).await?;
            created.push(child);
        }
        tracing::info!(
            parent = %parent_id,
            occurrences = created.len(),
            "series expanded"
        );
        Ok(created)
    }

    /// Cancel every future active booking in a series, the parent included.
    /// Past and terminal occurrences are left untouched; the booked history
    /// stays as it happened.
    pub async fn cancel_series(
        &self,
        actor: &Actor,
        parent_id: Ulid,
    ) -> Result<usize, EngineError> {
        let now = Utc::now();
        let (lab_id, mut guard) = self.resolve_booking_write(&parent_id).await?;
        let parent = guard
            .booking(parent_id)
            .ok_or(EngineError::NotFound(parent_id))?;
        if parent.requester != actor.id && !actor.caps().edit_any_booking {
            return Err(EngineError::Permission("cannot cancel this series"));
        }

        let mut ids = vec![parent_id];
        if let Some(kids) = self.children.get(&parent_id) {
            ids.extend(kids.iter().copied());
        }

        let mut cancelled = 0;
        for id in ids {
            let Some(b) = guard.booking(id) else { continue };
            if !b.status.is_active() || b.range.start < now {
                continue;
            }
            let before = snapshot(b);
            let entry = entry_for(
                Some(actor.id),
                Event::BookingCancelled {
                    id,
                    lab_id,
                    actor: actor.id,
                },
                before,
                None,
            );
            self.persist_and_apply(&mut guard, entry).await?;
            metrics::counter!(observability::TRANSITIONS_TOTAL).increment(1);
            cancelled += 1;
        }
        Ok(cancelled)
    }
}

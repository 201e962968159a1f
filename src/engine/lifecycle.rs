use chrono::{NaiveDate, Utc};
use ulid::Ulid;

use crate::auth::Actor;
use crate::limits;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, validate_future, validate_interval};
use super::policy::{evaluate, validate_policy};
use super::{entry_for, snapshot, Engine, EngineError};

/// Parameters for a new booking. `frequency`/`recurrence_until` mark the
/// parent of a series; occurrences are expanded separately. A non-empty
/// `exception_reason` turns a policy violation into a pending exception
/// instead of a hard rejection.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub lab_id: Ulid,
    pub range: TimeRange,
    pub purpose: String,
    pub frequency: Option<RecurrenceFrequency>,
    pub recurrence_until: Option<NaiveDate>,
    pub exception_reason: Option<String>,
}

/// Per-item result of a bulk approve/reject. One bad id never aborts the
/// rest of the batch.
#[derive(Debug)]
pub struct BulkOutcome {
    pub succeeded: Vec<Ulid>,
    pub skipped: Vec<(Ulid, EngineError)>,
}

impl Engine {
    // ── Lab registry ─────────────────────────────────────

    pub async fn register_lab(
        &self,
        actor: &Actor,
        name: String,
        campus: String,
        capacity: u32,
        equipment: Vec<String>,
    ) -> Result<LabInfo, EngineError> {
        if !actor.caps().edit_any_booking {
            return Err(EngineError::Permission("cannot manage labs"));
        }
        if name.is_empty() || name.len() > limits::MAX_NAME_LEN {
            return Err(EngineError::Validation("lab name empty or too long"));
        }
        if capacity == 0 {
            return Err(EngineError::Validation("lab capacity must be nonzero"));
        }
        if self.labs.len() >= limits::MAX_LABS {
            return Err(EngineError::LimitExceeded("lab limit reached"));
        }

        let id = Ulid::new();
        let entry = entry_for(
            Some(actor.id),
            Event::LabRegistered {
                id,
                name: name.clone(),
                campus: campus.clone(),
                capacity,
                equipment: equipment.clone(),
            },
            None,
            None,
        );
        self.persist_engine_event(entry).await?;
        let ls = LabState::new(id, name.clone(), campus.clone(), capacity, equipment.clone());
        self.labs
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(ls)));
        tracing::info!(lab = %id, %name, "lab registered");
        Ok(LabInfo {
            id,
            name,
            campus,
            capacity,
            equipment,
        })
    }

    pub async fn update_lab(
        &self,
        actor: &Actor,
        lab_id: Ulid,
        name: String,
        campus: String,
        capacity: u32,
        equipment: Vec<String>,
    ) -> Result<(), EngineError> {
        if !actor.caps().edit_any_booking {
            return Err(EngineError::Permission("cannot manage labs"));
        }
        if name.is_empty() || name.len() > limits::MAX_NAME_LEN {
            return Err(EngineError::Validation("lab name empty or too long"));
        }
        let ls = self
            .get_lab(&lab_id)
            .ok_or(EngineError::NotFound(lab_id))?;
        let mut guard = ls.write_owned().await;
        let entry = entry_for(
            Some(actor.id),
            Event::LabUpdated {
                id: lab_id,
                name,
                campus,
                capacity,
                equipment,
            },
            None,
            None,
        );
        self.persist_and_apply(&mut guard, entry).await
    }

    /// Remove a lab from the registry. Refused while any active booking
    /// remains, so nothing loses its reservation silently.
    pub async fn remove_lab(&self, actor: &Actor, lab_id: Ulid) -> Result<(), EngineError> {
        if !actor.caps().delete_any_booking {
            return Err(EngineError::Permission("cannot remove labs"));
        }
        let ls = self
            .get_lab(&lab_id)
            .ok_or(EngineError::NotFound(lab_id))?;
        let guard = ls.write_owned().await;
        if guard.bookings.iter().any(|b| b.status.is_active()) {
            return Err(EngineError::Validation(
                "lab still has active bookings",
            ));
        }
        let entry = entry_for(Some(actor.id), Event::LabRemoved { id: lab_id }, None, None);
        self.persist_engine_event(entry).await?;
        for b in &guard.bookings {
            self.booking_to_lab.remove(&b.id);
        }
        drop(guard);
        self.labs.remove(&lab_id);
        self.notify.remove(&lab_id);
        tracing::info!(lab = %lab_id, "lab removed");
        Ok(())
    }

    // ── Policy definition ────────────────────────────────

    /// Define a policy. Defining an active one deactivates all previous
    /// policies, keeping a single authoritative rule set.
    pub async fn define_policy(&self, actor: &Actor, policy: Policy) -> Result<(), EngineError> {
        if !actor.caps().approve_exceptions {
            return Err(EngineError::Permission("cannot manage policies"));
        }
        validate_policy(&policy)?;
        let entry = entry_for(
            Some(actor.id),
            Event::PolicyDefined {
                policy: policy.clone(),
            },
            None,
            None,
        );
        self.persist_engine_event(entry).await?;
        let mut policies = self.policies.write().await;
        super::apply_policy_definition(&mut policies, policy);
        Ok(())
    }

    // ── Booking lifecycle ────────────────────────────────

    /// Create a booking. Validation, policy evaluation and conflict detection
    /// all happen under the lab's write lock, so no concurrent request can
    /// slip into the same slot between the check and the insert.
    pub async fn request_booking(
        &self,
        actor: &Actor,
        req: BookingRequest,
    ) -> Result<Booking, EngineError> {
        let now = Utc::now();
        validate_interval(&req.range)?;
        validate_future(&req.range, now)?;
        if req.purpose.len() > limits::MAX_PURPOSE_LEN {
            return Err(EngineError::Validation("purpose too long"));
        }
        if let Some(reason) = &req.exception_reason
            && reason.len() > limits::MAX_REASON_LEN
        {
            return Err(EngineError::Validation("exception reason too long"));
        }
        if req.frequency.is_some() {
            if !actor.caps().create_recurring {
                return Err(EngineError::Permission("cannot create recurring bookings"));
            }
            if req.recurrence_until.is_none() {
                return Err(EngineError::Validation(
                    "recurring bookings need an end date",
                ));
            }
        }

        let ls = self
            .get_lab(&req.lab_id)
            .ok_or(EngineError::NotFound(req.lab_id))?;
        let mut guard = ls.write_owned().await;
        if guard.bookings.len() >= limits::MAX_BOOKINGS_PER_LAB {
            return Err(EngineError::LimitExceeded("booking limit reached for lab"));
        }

        let policy = self.active_policy().await;
        if req.frequency.is_some()
            && let Some(p) = &policy
            && !p.allow_recurring
        {
            return Err(EngineError::Validation(
                "recurring bookings are disabled by policy",
            ));
        }

        // Policy first; a violation with an attached reason becomes a pending
        // exception rather than a rejection.
        let mut pending_exception = false;
        if let Err(violation) = evaluate(&req.range, policy.as_ref(), now, false) {
            metrics::counter!(observability::POLICY_VIOLATIONS_TOTAL).increment(1);
            match &req.exception_reason {
                Some(reason) if !reason.is_empty() => pending_exception = true,
                _ => return Err(violation.into()),
            }
        }

        // Conflict detection is never skippable, exception or not.
        check_no_conflict(&guard, &req.range, None)?;

        let auto_approve = actor.caps().approve_bookings && !pending_exception;
        let booking = Booking {
            id: Ulid::new(),
            lab_id: req.lab_id,
            requester: actor.id,
            range: req.range,
            status: if auto_approve {
                BookingStatus::Approved
            } else {
                BookingStatus::Pending
            },
            purpose: req.purpose,
            created_at: now,
            approved_by: auto_approve.then_some(actor.id),
            admin_notes: None,
            is_recurring: req.frequency.is_some(),
            frequency: req.frequency,
            recurrence_until: req.recurrence_until,
            parent: None,
            is_policy_exception: pending_exception,
            exception_reason: pending_exception
                .then(|| req.exception_reason.clone())
                .flatten(),
            exception_approved_by: None,
        };

        let entry = entry_for(
            Some(actor.id),
            Event::BookingRequested {
                booking: booking.clone(),
            },
            None,
            snapshot(&booking),
        );
        self.persist_and_apply(&mut guard, entry).await?;
        metrics::counter!(observability::BOOKINGS_REQUESTED_TOTAL).increment(1);

        if pending_exception {
            let exception = PolicyException {
                id: Ulid::new(),
                booking_id: booking.id,
                lab_id: booking.lab_id,
                requested_by: actor.id,
                reason: booking.exception_reason.clone().unwrap_or_default(),
                status: ExceptionStatus::Pending,
                reviewed_by: None,
                reviewed_at: None,
                review_notes: None,
                created_at: now,
            };
            let entry = entry_for(
                Some(actor.id),
                Event::ExceptionRequested { exception },
                snapshot(&booking),
                None,
            );
            self.persist_and_apply(&mut guard, entry).await?;
        }

        tracing::info!(
            booking = %booking.id,
            lab = %booking.lab_id,
            status = booking.status.as_str(),
            "booking requested"
        );
        Ok(booking)
    }

    pub async fn approve_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
    ) -> Result<(), EngineError> {
        if !actor.caps().approve_bookings {
            return Err(EngineError::Permission("cannot approve bookings"));
        }
        let (lab_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let b = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if b.status != BookingStatus::Pending {
            return Err(EngineError::Transition {
                from: b.status,
                action: "approve",
            });
        }
        if b.is_policy_exception {
            return Err(EngineError::Validation(
                "booking has a pending policy exception; resolve the exception instead",
            ));
        }
        let before = snapshot(b);
        let entry = entry_for(
            Some(actor.id),
            Event::BookingApproved {
                id: booking_id,
                lab_id,
                approver: actor.id,
            },
            before,
            None,
        );
        self.persist_and_apply(&mut guard, entry).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL).increment(1);
        Ok(())
    }

    /// Reject a pending booking. A reason is mandatory; the requester has to
    /// see why.
    pub async fn reject_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        reason: String,
    ) -> Result<(), EngineError> {
        if !actor.caps().approve_bookings {
            return Err(EngineError::Permission("cannot reject bookings"));
        }
        if reason.is_empty() {
            return Err(EngineError::Validation("rejection reason required"));
        }
        if reason.len() > limits::MAX_NOTES_LEN {
            return Err(EngineError::Validation("rejection reason too long"));
        }
        let (lab_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let b = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if b.status != BookingStatus::Pending {
            return Err(EngineError::Transition {
                from: b.status,
                action: "reject",
            });
        }
        let before = snapshot(b);
        let entry = entry_for(
            Some(actor.id),
            Event::BookingRejected {
                id: booking_id,
                lab_id,
                approver: actor.id,
                reason,
            },
            before,
            None,
        );
        self.persist_and_apply(&mut guard, entry).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL).increment(1);
        Ok(())
    }

    /// Cancel an active booking. Requesters cancel their own; the edit-any
    /// capability cancels anyone's.
    pub async fn cancel_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
    ) -> Result<(), EngineError> {
        let (lab_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let b = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if b.requester != actor.id && !actor.caps().edit_any_booking {
            return Err(EngineError::Permission("cannot cancel this booking"));
        }
        if !b.status.is_active() {
            return Err(EngineError::Transition {
                from: b.status,
                action: "cancel",
            });
        }
        let before = snapshot(b);
        let entry = entry_for(
            Some(actor.id),
            Event::BookingCancelled {
                id: booking_id,
                lab_id,
                actor: actor.id,
            },
            before,
            None,
        );
        self.persist_and_apply(&mut guard, entry).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL).increment(1);
        Ok(())
    }

    /// Mark an approved booking completed. Driven by the sweeper once the
    /// interval has elapsed; manual completion uses the same path.
    pub async fn complete_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
    ) -> Result<(), EngineError> {
        if !actor.caps().approve_bookings {
            return Err(EngineError::Permission("cannot complete bookings"));
        }
        let (lab_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let b = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if b.status != BookingStatus::Approved {
            return Err(EngineError::Transition {
                from: b.status,
                action: "complete",
            });
        }
        let before = snapshot(b);
        let entry = entry_for(
            Some(actor.id),
            Event::BookingCompleted {
                id: booking_id,
                lab_id,
                actor: actor.id,
            },
            before,
            None,
        );
        self.persist_and_apply(&mut guard, entry).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL).increment(1);
        Ok(())
    }

    /// Move or repurpose a booking. Requesters may edit their own while still
    /// pending; the edit-any capability edits any active booking. The new
    /// interval is revalidated in full, excluding the booking itself from
    /// conflict detection.
    pub async fn edit_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        range: TimeRange,
        purpose: String,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        validate_interval(&range)?;
        validate_future(&range, now)?;
        if purpose.len() > limits::MAX_PURPOSE_LEN {
            return Err(EngineError::Validation("purpose too long"));
        }
        let (lab_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let b = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if b.requester == actor.id && !actor.caps().edit_any_booking {
            if b.status != BookingStatus::Pending {
                return Err(EngineError::Transition {
                    from: b.status,
                    action: "edit",
                });
            }
        } else if !actor.caps().edit_any_booking {
            return Err(EngineError::Permission("cannot edit this booking"));
        } else if !b.status.is_active() {
            return Err(EngineError::Transition {
                from: b.status,
                action: "edit",
            });
        }

        let policy = self.active_policy().await;
        let exempt = b.exception_approved_by.is_some();
        evaluate(&range, policy.as_ref(), now, exempt).map_err(|v| {
            metrics::counter!(observability::POLICY_VIOLATIONS_TOTAL).increment(1);
            EngineError::Policy(v)
        })?;
        check_no_conflict(&guard, &range, Some(booking_id))?;

        let b = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let before = snapshot(b);
        let mut after_b = b.clone();
        after_b.range = range;
        after_b.purpose = purpose.clone();
        let entry = entry_for(
            Some(actor.id),
            Event::BookingEdited {
                id: booking_id,
                lab_id,
                range,
                purpose,
            },
            before,
            snapshot(&after_b),
        );
        self.persist_and_apply(&mut guard, entry).await
    }

    /// Remove a booking record entirely. Requesters may delete their own
    /// active bookings; otherwise the delete-any capability is required.
    /// Unlike cancel, this erases the record from the lab.
    pub async fn delete_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
    ) -> Result<(), EngineError> {
        let (lab_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let b = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let own_active = b.requester == actor.id && b.status.is_active();
        if !own_active && !actor.caps().delete_any_booking {
            return Err(EngineError::Permission("cannot delete this booking"));
        }
        let before = snapshot(b);
        let entry = entry_for(
            Some(actor.id),
            Event::BookingDeleted {
                id: booking_id,
                lab_id,
                actor: actor.id,
            },
            before,
            None,
        );
        self.persist_and_apply(&mut guard, entry).await
    }

    // ── Bulk actions ─────────────────────────────────────

    pub async fn bulk_approve(
        &self,
        actor: &Actor,
        booking_ids: &[Ulid],
    ) -> Result<BulkOutcome, EngineError> {
        if booking_ids.len() > limits::MAX_BULK_ACTION {
            return Err(EngineError::LimitExceeded("bulk action too large"));
        }
        if !actor.caps().approve_bookings {
            return Err(EngineError::Permission("cannot approve bookings"));
        }
        let mut outcome = BulkOutcome {
            succeeded: Vec::new(),
            skipped: Vec::new(),
        };
        for &id in booking_ids {
            match self.approve_booking(actor, id).await {
                Ok(()) => outcome.succeeded.push(id),
                Err(e) => outcome.skipped.push((id, e)),
            }
        }
        Ok(outcome)
    }

    pub async fn bulk_reject(
        &self,
        actor: &Actor,
        booking_ids: &[Ulid],
        reason: String,
    ) -> Result<BulkOutcome, EngineError> {
        if booking_ids.len() > limits::MAX_BULK_ACTION {
            return Err(EngineError::LimitExceeded("bulk action too large"));
        }
        if !actor.caps().approve_bookings {
            return Err(EngineError::Permission("cannot reject bookings"));
        }
        let mut outcome = BulkOutcome {
            succeeded: Vec::new(),
            skipped: Vec::new(),
        };
        for &id in booking_ids {
            match self.reject_booking(actor, id, reason.clone()).await {
                Ok(()) => outcome.succeeded.push(id),
                Err(e) => outcome.skipped.push((id, e)),
            }
        }
        Ok(outcome)
    }

    // ── Policy exceptions ────────────────────────────────

    /// Attach an exception request to an existing pending booking (the
    /// after-the-fact path; violations at creation time attach one
    /// automatically when a reason is supplied).
    pub async fn request_exception(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        reason: String,
    ) -> Result<PolicyException, EngineError> {
        if reason.is_empty() {
            return Err(EngineError::Validation("exception reason required"));
        }
        if reason.len() > limits::MAX_REASON_LEN {
            return Err(EngineError::Validation("exception reason too long"));
        }
        let (lab_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let b = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if b.requester != actor.id && !actor.caps().edit_any_booking {
            return Err(EngineError::Permission("cannot request an exception here"));
        }
        if b.status != BookingStatus::Pending {
            return Err(EngineError::Transition {
                from: b.status,
                action: "attach an exception to",
            });
        }
        if b.is_policy_exception {
            return Err(EngineError::Validation("exception already pending"));
        }
        let exception = PolicyException {
            id: Ulid::new(),
            booking_id,
            lab_id,
            requested_by: actor.id,
            reason,
            status: ExceptionStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
            created_at: Utc::now(),
        };
        let before = snapshot(b);
        let entry = entry_for(
            Some(actor.id),
            Event::ExceptionRequested {
                exception: exception.clone(),
            },
            before,
            None,
        );
        self.persist_and_apply(&mut guard, entry).await?;
        Ok(exception)
    }

    /// Resolve a pending exception. Approving also approves the booking;
    /// rejecting also rejects it. Both sides land in a single journal record
    /// so a crash can never separate them.
    pub async fn resolve_exception(
        &self,
        actor: &Actor,
        exception_id: Ulid,
        approve: bool,
        notes: Option<String>,
    ) -> Result<(), EngineError> {
        let exception = self
            .exceptions
            .get(&exception_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(exception_id))?;
        if exception.status != ExceptionStatus::Pending {
            return Err(EngineError::Validation("exception already resolved"));
        }

        let policy = self.active_policy().await;
        let needs_manager = policy.map(|p| p.exceptions_require_manager).unwrap_or(true);
        let caps = actor.caps();
        let allowed = if needs_manager {
            caps.approve_exceptions
        } else {
            caps.approve_bookings
        };
        if !allowed {
            return Err(EngineError::Permission("cannot resolve policy exceptions"));
        }

        let (lab_id, mut guard) = self.resolve_booking_write(&exception.booking_id).await?;
        // Re-check under the lab lock: a concurrent resolution or a cancel of
        // the underlying booking may have landed since the reads above.
        let still_pending = self
            .exceptions
            .get(&exception_id)
            .map(|e| e.status == ExceptionStatus::Pending)
            .unwrap_or(false);
        if !still_pending {
            return Err(EngineError::Validation("exception already resolved"));
        }
        let b = guard
            .booking(exception.booking_id)
            .ok_or(EngineError::NotFound(exception.booking_id))?;
        if b.status != BookingStatus::Pending {
            return Err(EngineError::Transition {
                from: b.status,
                action: "resolve an exception for",
            });
        }
        let before = snapshot(b);
        let entry = entry_for(
            Some(actor.id),
            Event::ExceptionResolved {
                id: exception_id,
                booking_id: exception.booking_id,
                lab_id,
                approved: approve,
                reviewer: actor.id,
                reviewed_at: Utc::now(),
                notes,
            },
            before,
            None,
        );
        self.persist_and_apply(&mut guard, entry).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL).increment(1);
        Ok(())
    }
}

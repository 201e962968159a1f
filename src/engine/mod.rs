mod availability;
mod conflict;
mod error;
mod lifecycle;
mod policy;
mod queries;
mod recurrence;

pub use availability::{available_windows, date_bookable, day_slots, day_window, month_summary, slot_grid};
pub use conflict::{find_conflict, has_conflict};
pub use error::EngineError;
pub use lifecycle::{BookingRequest, BulkOutcome};
pub use recurrence::series_starts;
pub use policy::{
    check_advance_notice, check_duration, check_horizon, check_working_hours, evaluate,
    resolve_active, validate_policy, PolicyViolation,
};

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::journal::Journal;
use crate::model::*;
use crate::notify::{Notice, NoticeKind, NotifyHub};
use crate::observability;

pub type SharedLabState = Arc<RwLock<LabState>>;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
    Append {
        entry: AuditEntry,
        response: oneshot::Sender<io::Result<()>>,
    },
}

/// Background task that owns the journal and batches appends for group
/// commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let JournalCommand::Append { entry, response } = cmd;
        let mut batch = vec![(entry, response)];

        // Drain all immediately available appends
        while let Ok(JournalCommand::Append { entry, response }) = rx.try_recv() {
            batch.push((entry, response));
        }

        metrics::histogram!(observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut journal, &mut batch);
        metrics::histogram!(observability::JOURNAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(&mut batch, &result);
    }
}

fn flush_batch(
    journal: &mut Journal,
    batch: &mut [(AuditEntry, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (entry, _) in batch.iter() {
        if let Err(e) = journal.append_buffered(entry) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = journal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(
    batch: &mut Vec<(AuditEntry, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

pub struct Engine {
    pub labs: DashMap<Ulid, SharedLabState>,
    pub(super) journal_tx: mpsc::Sender<JournalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → lab id.
    pub(super) booking_to_lab: DashMap<Ulid, Ulid>,
    /// Series parent → child occurrence ids.
    pub(super) children: DashMap<Ulid, Vec<Ulid>>,
    /// Policy-exception records by exception id.
    pub(super) exceptions: DashMap<Ulid, PolicyException>,
    /// All defined policies; `resolve_active` picks the authoritative one.
    pub(super) policies: RwLock<Vec<Policy>>,
    /// In-memory mirror of the journal for audit queries.
    pub(super) audit: Mutex<Vec<AuditEntry>>,
}

impl Engine {
    pub fn new(journal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let entries = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let engine = Self {
            labs: DashMap::new(),
            journal_tx,
            notify,
            booking_to_lab: DashMap::new(),
            children: DashMap::new(),
            exceptions: DashMap::new(),
            policies: RwLock::new(Vec::new()),
            audit: Mutex::new(Vec::new()),
        };

        // Replay — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never block here because
        // this may run inside an async context.
        for entry in &entries {
            match &entry.event {
                Event::LabRegistered {
                    id,
                    name,
                    campus,
                    capacity,
                    equipment,
                } => {
                    let ls = LabState::new(
                        *id,
                        name.clone(),
                        campus.clone(),
                        *capacity,
                        equipment.clone(),
                    );
                    engine.labs.insert(*id, Arc::new(RwLock::new(ls)));
                }
                Event::LabRemoved { id } => {
                    engine.labs.remove(id);
                }
                Event::PolicyDefined { policy } => {
                    let mut policies = engine
                        .policies
                        .try_write()
                        .expect("replay: uncontended write");
                    apply_policy_definition(&mut policies, policy.clone());
                }
                other => {
                    if let Some(lab_id) = event_lab_id(other)
                        && let Some(e) = engine.labs.get(&lab_id)
                    {
                        let ls_arc = e.value().clone();
                        let mut guard = ls_arc.try_write().expect("replay: uncontended write");
                        engine.apply_event(&mut guard, other);
                    }
                }
            }
        }
        engine
            .audit
            .lock()
            .expect("replay: audit lock")
            .extend(entries);

        Ok(engine)
    }

    /// Apply an event to a LabState (no locking — caller holds the lock).
    pub(super) fn apply_event(&self, ls: &mut LabState, event: &Event) {
        match event {
            Event::BookingRequested { booking } => {
                self.booking_to_lab.insert(booking.id, booking.lab_id);
                if let Some(parent) = booking.parent {
                    self.children.entry(parent).or_default().push(booking.id);
                }
                ls.insert_booking(booking.clone());
            }
            Event::BookingApproved { id, approver, .. } => {
                if let Some(b) = ls.booking_mut(*id) {
                    b.status = BookingStatus::Approved;
                    b.approved_by = Some(*approver);
                }
            }
            Event::BookingRejected {
                id,
                approver,
                reason,
                ..
            } => {
                if let Some(b) = ls.booking_mut(*id) {
                    b.status = BookingStatus::Rejected;
                    b.approved_by = Some(*approver);
                    b.admin_notes = Some(reason.clone());
                    b.is_policy_exception = false;
                }
                self.withdraw_pending_exception(*id);
            }
            Event::BookingCancelled { id, .. } => {
                if let Some(b) = ls.booking_mut(*id) {
                    b.status = BookingStatus::Cancelled;
                    b.is_policy_exception = false;
                }
                self.withdraw_pending_exception(*id);
            }
            Event::BookingCompleted { id, .. } => {
                if let Some(b) = ls.booking_mut(*id) {
                    b.status = BookingStatus::Completed;
                }
            }
            Event::BookingEdited {
                id, range, purpose, ..
            } => {
                // Remove + reinsert keeps the start-sorted order intact.
                if let Some(mut b) = ls.remove_booking(*id) {
                    b.range = *range;
                    b.purpose = purpose.clone();
                    ls.insert_booking(b);
                }
            }
            Event::BookingDeleted { id, .. } => {
                if let Some(b) = ls.remove_booking(*id) {
                    self.booking_to_lab.remove(id);
                    if let Some(parent) = b.parent
                        && let Some(mut kids) = self.children.get_mut(&parent)
                    {
                        kids.retain(|c| c != id);
                    }
                    self.children.remove(id);
                    // Exception records follow their booking out entirely.
                    self.exceptions.retain(|_, ex| ex.booking_id != *id);
                }
            }
            Event::ExceptionRequested { exception } => {
                self.exceptions.insert(exception.id, exception.clone());
                if let Some(b) = ls.booking_mut(exception.booking_id) {
                    b.is_policy_exception = true;
                    b.exception_reason = Some(exception.reason.clone());
                }
            }
            Event::ExceptionResolved {
                id,
                booking_id,
                approved,
                reviewer,
                reviewed_at,
                notes,
                ..
            } => {
                if let Some(mut ex) = self.exceptions.get_mut(id) {
                    ex.status = if *approved {
                        ExceptionStatus::Approved
                    } else {
                        ExceptionStatus::Rejected
                    };
                    ex.reviewed_by = Some(*reviewer);
                    ex.reviewed_at = Some(*reviewed_at);
                    ex.review_notes = notes.clone();
                }
                if let Some(b) = ls.booking_mut(*booking_id) {
                    if *approved {
                        b.status = BookingStatus::Approved;
                        b.approved_by = Some(*reviewer);
                        b.exception_approved_by = Some(*reviewer);
                    } else {
                        b.status = BookingStatus::Rejected;
                        b.exception_reason = None;
                    }
                    b.is_policy_exception = false;
                }
            }
            Event::LabUpdated {
                name,
                campus,
                capacity,
                equipment,
                ..
            } => {
                ls.name = name.clone();
                ls.campus = campus.clone();
                ls.capacity = *capacity;
                ls.equipment = equipment.clone();
            }
            // Registered/Removed/PolicyDefined are handled at the map level
            Event::LabRegistered { .. } | Event::LabRemoved { .. } | Event::PolicyDefined { .. } => {}
        }
    }

    /// A booking leaving the pending state takes its unresolved exception
    /// with it; there is nothing left to review. Resolved exceptions stay as
    /// history.
    fn withdraw_pending_exception(&self, booking_id: Ulid) {
        self.exceptions.retain(|_, ex| {
            !(ex.booking_id == booking_id && ex.status == ExceptionStatus::Pending)
        });
    }

    /// Write an entry to the journal via the background group-commit writer.
    pub(super) async fn journal_append(&self, entry: &AuditEntry) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                entry: entry.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    pub fn get_lab(&self, id: &Ulid) -> Option<SharedLabState> {
        self.labs.get(id).map(|e| e.value().clone())
    }

    pub fn lab_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_lab.get(booking_id).map(|e| *e.value())
    }

    /// The authoritative policy, resolved once per operation at the boundary.
    pub async fn active_policy(&self) -> Option<Policy> {
        resolve_active(&self.policies.read().await).cloned()
    }

    /// Journal-append + apply + audit + notify in one call. The caller holds
    /// the lab's write lock, so validation, the durable append and the state
    /// mutation form one atomic check-then-act unit.
    pub(super) async fn persist_and_apply(
        &self,
        ls: &mut LabState,
        entry: AuditEntry,
    ) -> Result<(), EngineError> {
        self.journal_append(&entry).await?;
        self.apply_event(ls, &entry.event);
        self.dispatch_notice(ls, &entry);
        self.audit.lock().expect("audit lock").push(entry);
        Ok(())
    }

    /// Journal + audit for events that touch no lab (policy definitions,
    /// lab registry changes). The caller mutates engine maps afterwards.
    pub(super) async fn persist_engine_event(&self, entry: AuditEntry) -> Result<(), EngineError> {
        self.journal_append(&entry).await?;
        self.audit.lock().expect("audit lock").push(entry);
        Ok(())
    }

    /// Fire-and-forget notification fan-out. Exactly one notice per applied
    /// transition; failures never affect the mutation that produced them.
    fn dispatch_notice(&self, ls: &LabState, entry: &AuditEntry) {
        let (kind, booking_id) = match &entry.event {
            Event::BookingRequested { booking } => (NoticeKind::Created, booking.id),
            Event::BookingApproved { id, .. } => (NoticeKind::Approved, *id),
            Event::BookingRejected { id, .. } => (NoticeKind::Rejected, *id),
            Event::BookingCancelled { id, .. } => (NoticeKind::Cancelled, *id),
            Event::BookingCompleted { id, .. } => (NoticeKind::Completed, *id),
            Event::ExceptionRequested { exception } => {
                (NoticeKind::ExceptionRequested, exception.booking_id)
            }
            Event::ExceptionResolved { booking_id, .. } => {
                (NoticeKind::ExceptionResolved, *booking_id)
            }
            _ => return,
        };
        let Some(b) = ls.booking(booking_id) else { return };
        self.notify.send(Notice {
            kind,
            booking_id,
            lab_id: ls.id,
            requester: b.requester,
            range: b.range,
            actor: entry.actor,
            at: entry.at,
        });
    }

    /// Lookup booking → lab, get lab, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<LabState>), EngineError> {
        let lab_id = self
            .lab_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ls = self
            .get_lab(&lab_id)
            .ok_or(EngineError::NotFound(lab_id))?;
        let guard = ls.write_owned().await;
        Ok((lab_id, guard))
    }
}

/// Record a policy definition. An active definition supersedes every earlier
/// policy; replay applies the same rule, so restart converges on the same
/// authoritative policy.
pub(super) fn apply_policy_definition(policies: &mut Vec<Policy>, policy: Policy) {
    if policy.is_active {
        for p in policies.iter_mut() {
            p.is_active = false;
        }
    }
    policies.push(policy);
}

/// Build a journal entry stamped now.
pub(super) fn entry_for(
    actor: Option<Ulid>,
    event: Event,
    before: Option<String>,
    after: Option<String>,
) -> AuditEntry {
    AuditEntry {
        at: Utc::now(),
        actor,
        event,
        before,
        after,
    }
}

/// JSON snapshot of a booking for audit before/after fields.
pub(super) fn snapshot(booking: &Booking) -> Option<String> {
    serde_json::to_string(booking).ok()
}

/// Extract the lab id from an event (for events applied to a lab's state).
fn event_lab_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingRequested { booking } => Some(booking.lab_id),
        Event::BookingApproved { lab_id, .. }
        | Event::BookingRejected { lab_id, .. }
        | Event::BookingCancelled { lab_id, .. }
        | Event::BookingCompleted { lab_id, .. }
        | Event::BookingEdited { lab_id, .. }
        | Event::BookingDeleted { lab_id, .. }
        | Event::ExceptionResolved { lab_id, .. } => Some(*lab_id),
        Event::ExceptionRequested { exception } => Some(exception.lab_id),
        Event::LabUpdated { id, .. } => Some(*id),
        Event::LabRegistered { .. } | Event::LabRemoved { .. } | Event::PolicyDefined { .. } => None,
    }
}

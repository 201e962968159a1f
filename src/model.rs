use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open interval `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration().num_minutes()
    }

    /// Two half-open intervals overlap iff `s1 < e2 && s2 < e1`.
    /// Touching endpoints (`a.end == b.start`) do NOT overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// Booking lifecycle states. `Rejected`, `Cancelled` and `Completed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// The single source of truth for conflict detection: a booking counts
    /// toward overlap checks iff it is pending or approved. This set is used
    /// uniformly by creation, edit, availability grids and recurrence.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Rejected | BookingStatus::Cancelled | BookingStatus::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrenceFrequency {
    Daily,
    Weekly,
    Biweekly,
    /// 30-day approximation, not calendar-month arithmetic. Existing series
    /// depend on the fixed step, so it stays.
    Monthly,
}

impl RecurrenceFrequency {
    pub fn step(&self) -> TimeDelta {
        match self {
            RecurrenceFrequency::Daily => TimeDelta::days(1),
            RecurrenceFrequency::Weekly => TimeDelta::days(7),
            RecurrenceFrequency::Biweekly => TimeDelta::days(14),
            RecurrenceFrequency::Monthly => TimeDelta::days(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrenceFrequency::Daily => "daily",
            RecurrenceFrequency::Weekly => "weekly",
            RecurrenceFrequency::Biweekly => "biweekly",
            RecurrenceFrequency::Monthly => "monthly",
        }
    }
}

/// A reservation of one lab for one half-open interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub lab_id: Ulid,
    pub requester: Ulid,
    pub range: TimeRange,
    pub status: BookingStatus,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<Ulid>,
    pub admin_notes: Option<String>,
    // Recurrence metadata
    pub is_recurring: bool,
    pub frequency: Option<RecurrenceFrequency>,
    pub recurrence_until: Option<NaiveDate>,
    /// Back-reference to the series parent; never set on the parent itself.
    pub parent: Option<Ulid>,
    // Policy-exception metadata
    pub is_policy_exception: bool,
    pub exception_reason: Option<String>,
    pub exception_approved_by: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionStatus {
    Pending,
    Approved,
    Rejected,
}

/// A requester's appeal to bypass policy constraints for one booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyException {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub lab_id: Ulid,
    pub requested_by: Ulid,
    pub reason: String,
    pub status: ExceptionStatus,
    pub reviewed_by: Option<Ulid>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The rule set governing bookings. Exactly one policy should be active at a
/// time; the engine warns if several are flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: Ulid,
    pub name: String,
    /// Max booking duration in hours.
    pub max_hours: u32,
    /// Bookings must start at least this many days from now.
    pub advance_notice_days: u32,
    /// Bookings may start at most this many days from now.
    pub max_advance_days: u32,
    /// Working-hours window, whole hours 0..=23, start < end.
    pub work_start_hour: u32,
    pub work_end_hour: u32,
    pub allow_recurring: bool,
    /// Restrict exception resolution to the exception-approval capability
    /// (as opposed to any approver).
    pub exceptions_require_manager: bool,
    pub is_active: bool,
}

/// Per-lab state: metadata plus all bookings sorted by `range.start`.
#[derive(Debug, Clone)]
pub struct LabState {
    pub id: Ulid,
    pub name: String,
    pub campus: String,
    pub capacity: u32,
    pub equipment: Vec<String>,
    /// All bookings, every status, sorted by `range.start`.
    pub bookings: Vec<Booking>,
}

impl LabState {
    pub fn new(
        id: Ulid,
        name: String,
        campus: String,
        capacity: u32,
        equipment: Vec<String>,
    ) -> Self {
        Self {
            id,
            name,
            campus,
            capacity,
            equipment,
            bookings: Vec::new(),
        }
    }

    /// Insert a booking maintaining sort order by range.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.range.start, |b| b.range.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose range overlaps the query window (any status).
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &TimeRange) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.range.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.range.end > query.start)
    }
}

/// Journal record payload — flat, no nesting. Replayed at startup to
/// reconstruct engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    LabRegistered {
        id: Ulid,
        name: String,
        campus: String,
        capacity: u32,
        equipment: Vec<String>,
    },
    LabUpdated {
        id: Ulid,
        name: String,
        campus: String,
        capacity: u32,
        equipment: Vec<String>,
    },
    LabRemoved {
        id: Ulid,
    },
    PolicyDefined {
        policy: Policy,
    },
    BookingRequested {
        booking: Booking,
    },
    BookingApproved {
        id: Ulid,
        lab_id: Ulid,
        approver: Ulid,
    },
    BookingRejected {
        id: Ulid,
        lab_id: Ulid,
        approver: Ulid,
        reason: String,
    },
    BookingCancelled {
        id: Ulid,
        lab_id: Ulid,
        actor: Ulid,
    },
    BookingCompleted {
        id: Ulid,
        lab_id: Ulid,
        actor: Ulid,
    },
    BookingEdited {
        id: Ulid,
        lab_id: Ulid,
        range: TimeRange,
        purpose: String,
    },
    BookingDeleted {
        id: Ulid,
        lab_id: Ulid,
        actor: Ulid,
    },
    ExceptionRequested {
        exception: PolicyException,
    },
    /// Resolves the exception AND transitions the linked booking in one
    /// record, so replay can never observe one without the other.
    ExceptionResolved {
        id: Ulid,
        booking_id: Ulid,
        lab_id: Ulid,
        approved: bool,
        reviewer: Ulid,
        reviewed_at: DateTime<Utc>,
        notes: Option<String>,
    },
}

/// One append-only audit record: who did what, when, with before/after
/// snapshots of the touched booking serialized as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub actor: Option<Ulid>,
    pub event: Event,
    pub before: Option<String>,
    pub after: Option<String>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabInfo {
    pub id: Ulid,
    pub name: String,
    pub campus: String,
    pub capacity: u32,
    pub equipment: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Free,
    Booked,
}

/// One fixed-size subdivision of a day's working-hours window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub range: TimeRange,
    pub status: SlotStatus,
}

impl Slot {
    pub fn is_free(&self) -> bool {
        self.status == SlotStatus::Free
    }
}

/// Per-day availability counts for a month grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySummary {
    pub free_slots: u32,
    pub total_slots: u32,
    pub booked_count: u32,
}

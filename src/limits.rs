//! Hard caps that bound worst-case work per operation.

/// Recurrence expansion stops after this many occurrences regardless of the
/// requested end date (one year of weekly bookings).
pub const MAX_OCCURRENCES_PER_SERIES: usize = 52;

/// Upper bound on bookings held by a single lab.
pub const MAX_BOOKINGS_PER_LAB: usize = 100_000;

/// Upper bound on labs in one engine.
pub const MAX_LABS: usize = 10_000;

pub const MAX_NAME_LEN: usize = 120;
pub const MAX_PURPOSE_LEN: usize = 255;
pub const MAX_REASON_LEN: usize = 2_000;
pub const MAX_NOTES_LEN: usize = 2_000;

/// Working-hours window used when no policy is active.
pub const DEFAULT_WORK_START_HOUR: u32 = 8;
pub const DEFAULT_WORK_END_HOUR: u32 = 20;

/// Slot granularity for availability grids.
pub const DEFAULT_SLOT_MINUTES: u32 = 30;

/// Bulk approve/reject batch cap.
pub const MAX_BULK_ACTION: usize = 500;

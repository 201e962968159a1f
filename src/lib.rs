//! labbook — a single-node lab-resource booking engine.
//!
//! The engine answers one hard question — "is this time slot free?" — and
//! wraps it in the machinery a booking system needs around it: policy gating
//! (working hours, advance notice, horizon, duration caps), a role-guarded
//! booking lifecycle, availability grids, recurring-series expansion, and an
//! append-only audit journal that doubles as crash recovery.
//!
//! All state lives in memory behind per-lab `RwLock`s; every mutation is
//! journalled before it is applied, so a restart replays the journal and
//! reconstructs the exact booking state.

pub mod auth;
pub mod engine;
pub mod journal;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sweeper;

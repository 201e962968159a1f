use ulid::Ulid;

use crate::model::{BookingStatus, TimeRange};

use super::policy::PolicyViolation;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Malformed input rejected before any side effect.
    Validation(&'static str),
    /// The requested interval overlaps an active booking; carries the
    /// blocking booking and its slot so callers can show what is taken.
    Conflict {
        booking_id: Ulid,
        range: TimeRange,
    },
    /// A policy rule failed and no approved exception was attached.
    Policy(PolicyViolation),
    /// Capability check failed; rejected before any mutation.
    Permission(&'static str),
    /// Invalid (state, action) pair; booking left unchanged.
    Transition {
        from: BookingStatus,
        action: &'static str,
    },
    LimitExceeded(&'static str),
    JournalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::Conflict { booking_id, range } => write!(
                f,
                "conflicts with booking {booking_id} occupying [{}, {})",
                range.start, range.end
            ),
            EngineError::Policy(v) => write!(f, "policy violation: {v}"),
            EngineError::Permission(msg) => write!(f, "permission denied: {msg}"),
            EngineError::Transition { from, action } => {
                write!(f, "cannot {action} a {} booking", from.as_str())
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::JournalError(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<PolicyViolation> for EngineError {
    fn from(v: PolicyViolation) -> Self {
        EngineError::Policy(v)
    }
}

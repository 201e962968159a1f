//! Role → capability resolution.
//!
//! The identity provider is an external collaborator; the engine only consumes
//! an actor's capability set. Mapping a role string to capabilities happens
//! here, in one testable function, instead of being scattered across dynamic
//! flags on the identity object.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Student,
    Lecturer,
    ProgramAdmin,
    LabTechnician,
    ItSupport,
    Manager,
}

/// What an actor is allowed to do. Derived from the role, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub approve_bookings: bool,
    pub create_recurring: bool,
    pub edit_any_booking: bool,
    pub delete_any_booking: bool,
    pub approve_exceptions: bool,
}

impl Role {
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Role::Student => Capabilities::default(),
            Role::Lecturer => Capabilities {
                approve_bookings: true,
                create_recurring: true,
                edit_any_booking: true,
                delete_any_booking: true,
                approve_exceptions: false,
            },
            Role::ProgramAdmin => Capabilities {
                approve_bookings: true,
                create_recurring: true,
                edit_any_booking: true,
                delete_any_booking: true,
                approve_exceptions: false,
            },
            Role::LabTechnician => Capabilities {
                approve_bookings: true,
                create_recurring: false,
                edit_any_booking: true,
                delete_any_booking: false,
                approve_exceptions: false,
            },
            Role::ItSupport => Capabilities {
                approve_bookings: true,
                create_recurring: false,
                edit_any_booking: false,
                delete_any_booking: false,
                approve_exceptions: false,
            },
            Role::Manager => Capabilities {
                approve_bookings: true,
                create_recurring: true,
                edit_any_booking: true,
                delete_any_booking: true,
                approve_exceptions: true,
            },
        }
    }
}

/// The identity performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    /// Internal actor used by background tasks (the sweeper). Carries the
    /// manager capability set and the nil id.
    pub fn system() -> Self {
        Self {
            id: Ulid::nil(),
            role: Role::Manager,
        }
    }

    pub fn caps(&self) -> Capabilities {
        self.role.capabilities()
    }
}

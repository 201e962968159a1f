use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::TimeRange;

const CHANNEL_CAPACITY: usize = 256;

/// What happened, for delivery fan-out. Mail/SMS/dashboard delivery is an
/// external collaborator; the engine only emits these and never waits on
/// anyone consuming them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Created,
    Approved,
    Rejected,
    Cancelled,
    Completed,
    ExceptionRequested,
    ExceptionResolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub booking_id: Ulid,
    pub lab_id: Ulid,
    pub requester: Ulid,
    pub range: TimeRange,
    /// Who triggered the transition; None for the booking requester's own
    /// actions where the counterpart is the admin pool.
    pub actor: Option<Ulid>,
    pub at: DateTime<Utc>,
}

/// Broadcast hub: one channel per lab. Fire-and-forget — a send with no
/// subscribers is a no-op, and a failed send never affects the booking
/// mutation that produced it.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for a lab. Creates the channel if needed.
    pub fn subscribe(&self, lab_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(lab_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, notice: Notice) {
        if let Some(sender) = self.channels.get(&notice.lab_id) {
            let _ = sender.send(notice);
        }
    }

    /// Remove a channel (e.g. when a lab is removed).
    pub fn remove(&self, lab_id: &Ulid) {
        self.channels.remove(lab_id);
    }
}

//! Fire-and-forget notification boundary
//!
//! Events are advisory. Nothing in the core depends on a notification
//! being delivered; the embedding application wires a real channel.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    RequestSubmitted {
        request_id: String,
        approver_id: String,
    },
    RequestDecided {
        request_id: String,
        approved: bool,
        decided_by: String,
    },
    RequestEscalated {
        request_id: String,
    },
    RequestFinalized {
        request_id: String,
        employee_id: String,
    },
    RequestCanceled {
        request_id: String,
    },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotifyEvent);
}

/// Discards every event.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: NotifyEvent) {}
}

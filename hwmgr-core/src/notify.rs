//! Notification engine.
//!
//! A FIFO queue of notifications stamped with a monotonically increasing
//! 64-bit id. Dispatch is in order and drains on every scheduling cycle;
//! per-subscriber watermarks make delivery idempotent and monotonic, so a
//! subscriber that joins a row mid-flight never sees notifications stamped
//! before its join, and nothing is ever delivered twice.
//!
//! The queue knows nothing about transports: delivery goes through
//! [`NotifySink`], which the service implements. A sink may report that a
//! subscriber has no usable transport yet; the notification then stays
//! queued with a positive `ref_count` and is retried on the next drain.

use std::collections::VecDeque;

use tracing::trace;

use crate::ids::EntityId;
use crate::subs::SubscriptionTable;

/// What happened to an entity, from a subscriber's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    NodeActive,
    NodeInactive,
    ProcessCreated,
    ProcessDestroyed,
    InterfaceAdded,
    InterfaceDeleted,
    LocationActive,
    LocationInactive,
    /// Role resolution: delivered to the affected node only.
    RoleActive,
    RolePassive,
}

/// Who a notification is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyScope {
    /// Every subscriber of the affected row.
    Subscribers,
    /// Exactly one recipient (late-join synthesis, role updates).
    Only(EntityId),
}

/// A queued notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: u64,
    pub kind: NotifyKind,
    /// The entity the notification is about.
    pub entity: EntityId,
    pub scope: NotifyScope,
    /// Subscribers still owed delivery as of the last drain.
    pub ref_count: u32,
    delivered_direct: bool,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverStatus {
    /// Frame enqueued on the subscriber's transport.
    Delivered,
    /// Subscriber lives behind a peer transport; peers learn through
    /// NODE_UPDATE/PROCESS_UPDATE, not NOTIFY. Counts as processed.
    DiscardedRemote,
    /// Subscriber has no connected transport right now; retry later.
    NoTransport,
}

/// Delivery backend provided by the service layer.
pub trait NotifySink {
    fn deliver(&mut self, note: &Notification, subscriber: EntityId) -> DeliverStatus;
}

/// The notification queue.
#[derive(Debug, Default)]
pub struct NotifyQueue {
    queue: VecDeque<Notification>,
    next_id: u64,
}

impl NotifyQueue {
    #[must_use]
    pub fn new() -> Self {
        Self { queue: VecDeque::new(), next_id: 1 }
    }

    /// Stamp and enqueue. Returns the assigned id.
    pub fn push(&mut self, kind: NotifyKind, entity: EntityId, scope: NotifyScope) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        trace!(id, ?kind, ?entity, "notification queued");
        self.queue.push_back(Notification {
            id,
            kind,
            entity,
            scope,
            ref_count: 0,
            delivered_direct: false,
        });
        id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.queue.iter()
    }

    /// Service the queue in order. Fully-delivered notifications are
    /// freed; the rest stay with their remaining subscriber count.
    pub fn drain(&mut self, subs: &mut SubscriptionTable, sink: &mut impl NotifySink) {
        let mut retained = VecDeque::new();

        while let Some(mut note) = self.queue.pop_front() {
            let remaining = match note.scope {
                NotifyScope::Subscribers => Self::serve_row(&mut note, subs, sink),
                NotifyScope::Only(target) => Self::serve_one(&mut note, target, subs, sink),
            };
            if remaining > 0 {
                note.ref_count = remaining;
                retained.push_back(note);
            }
        }

        self.queue = retained;
    }

    fn serve_row(
        note: &mut Notification,
        subs: &mut SubscriptionTable,
        sink: &mut impl NotifySink,
    ) -> u32 {
        let Some(row) = subs.row_for_entity_mut(note.entity) else {
            trace!(id = note.id, "no subscription row; dropping notification");
            return 0;
        };
        if row.subscribers.is_empty() {
            return 0;
        }

        let mut remaining = 0;
        for sub in &mut row.subscribers {
            if sub.last_processed >= note.id {
                continue;
            }
            match sink.deliver(note, sub.entity) {
                DeliverStatus::Delivered | DeliverStatus::DiscardedRemote => {
                    sub.last_processed = note.id;
                }
                DeliverStatus::NoTransport => remaining += 1,
            }
        }
        remaining
    }

    fn serve_one(
        note: &mut Notification,
        target: EntityId,
        subs: &mut SubscriptionTable,
        sink: &mut impl NotifySink,
    ) -> u32 {
        // Prefer the row entry so the watermark still advances for a
        // subscriber that also sits on the row.
        if let Some(row) = subs.row_for_entity_mut(note.entity) {
            if let Some(sub) = row.subscribers.iter_mut().find(|s| s.entity == target) {
                if sub.last_processed >= note.id {
                    return 0;
                }
                return match sink.deliver(note, target) {
                    DeliverStatus::Delivered | DeliverStatus::DiscardedRemote => {
                        sub.last_processed = note.id;
                        0
                    }
                    DeliverStatus::NoTransport => 1,
                };
            }
        }

        // Direct delivery (role updates target the node itself, which is
        // not necessarily its own subscriber).
        if note.delivered_direct {
            return 0;
        }
        match sink.deliver(note, target) {
            DeliverStatus::Delivered | DeliverStatus::DiscardedRemote => {
                note.delivered_direct = true;
                0
            }
            DeliverStatus::NoTransport => 1,
        }
    }
}

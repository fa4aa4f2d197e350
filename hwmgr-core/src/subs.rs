//! Subscription engine.
//!
//! Two tables of subscription rows, pending (no live target seen yet) and
//! active (target has run at least once), plus the wildcard list. A row
//! is keyed `(table, value)` and lives in exactly one of the two tables.
//! Group, process and interface subscriptions always route through the
//! wildcard list (a zero value matches everything of the kind); node and
//! location subscriptions with a non-zero value are singular rows.
//!
//! Cross-binding: a subscriber that registered with `cross_bind` also gets
//! the reverse edge: the entity it subscribed to becomes a subscriber of
//! the subscriber's own row, so either end's state changes notify the
//! other. Reverse edges are installed both when the subscription is made
//! (for targets that already exist) and when a matching entity arrives
//! later.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::globaldb::GlobalDb;
use crate::ids::{EntityId, GroupIndex, LocationIndex, ProcessKey, SubsKind, TableKind};
use crate::notify::{NotifyKind, NotifyQueue, NotifyScope};

/// Key of a subscription row: target table plus match value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubKey {
    pub table: TableKind,
    pub value: u32,
}

impl SubKey {
    #[must_use]
    pub const fn new(table: TableKind, value: u32) -> Self {
        Self { table, value }
    }
}

/// One subscriber on a row, with its delivery watermark. Delivery is
/// monotonic: a subscriber never sees a notification stamped at or below
/// its watermark, which also shields late joiners from old notifications.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub entity: EntityId,
    pub last_processed: u64,
}

/// A subscription row.
#[derive(Debug, Clone)]
pub struct SubRow {
    pub key: SubKey,
    pub target: Option<EntityId>,
    pub live: bool,
    pub subscribers: Vec<Subscriber>,
}

impl SubRow {
    fn new(key: SubKey, target: Option<EntityId>) -> Self {
        Self { key, target, live: false, subscribers: Vec::new() }
    }

    #[must_use]
    pub fn has_subscriber(&self, entity: EntityId) -> bool {
        self.subscribers.iter().any(|s| s.entity == entity)
    }
}

/// A wildcard list entry. `value == 0` matches every entity of the kind.
#[derive(Debug, Clone)]
pub struct WildcardSubscriber {
    pub kind: SubsKind,
    pub value: u32,
    pub cross_bind: bool,
    pub subscriber: EntityId,
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    /// Identical subscription already present; tables unchanged.
    Duplicate,
}

/// The pending/active tables plus the wildcard list.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    pending: BTreeMap<SubKey, SubRow>,
    active: BTreeMap<SubKey, SubRow>,
    wildcards: Vec<WildcardSubscriber>,
}

impl SubscriptionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a row in either table, active first.
    #[must_use]
    pub fn row(&self, key: SubKey) -> Option<&SubRow> {
        self.active.get(&key).or_else(|| self.pending.get(&key))
    }

    pub fn row_mut(&mut self, key: SubKey) -> Option<&mut SubRow> {
        if self.active.contains_key(&key) {
            self.active.get_mut(&key)
        } else {
            self.pending.get_mut(&key)
        }
    }

    /// The row an entity's notifications resolve through.
    pub fn row_for_entity_mut(&mut self, entity: EntityId) -> Option<&mut SubRow> {
        self.row_mut(GlobalDb::sub_key_of(entity))
    }

    #[must_use]
    pub fn wildcards(&self) -> &[WildcardSubscriber] {
        &self.wildcards
    }

    #[must_use]
    pub fn is_pending(&self, key: SubKey) -> bool {
        self.pending.contains_key(&key)
    }

    #[must_use]
    pub fn is_active(&self, key: SubKey) -> bool {
        self.active.contains_key(&key)
    }

    /// Create (or adopt) the subscription entry for a new entity. A
    /// pending row created by an early subscriber adopts the target; an
    /// active row (another process of the same type, typically) is left
    /// as is.
    pub fn create_entry(&mut self, key: SubKey, target: EntityId) {
        if let Some(row) = self.active.get_mut(&key) {
            trace!(?key, "entry already active; keeping established target");
            if row.target.is_none() {
                row.target = Some(target);
            }
            return;
        }
        if let Some(row) = self.pending.get_mut(&key) {
            if let Some(prior) = row.target {
                if prior != target {
                    trace!(?key, ?prior, ?target, "pending row re-targeted");
                }
            }
            row.target = Some(target);
            return;
        }
        trace!(?key, ?target, "pending subscription row created");
        self.pending.insert(key, SubRow::new(key, Some(target)));
    }

    /// Move a row to the active table and mark it live. Subscribers
    /// already queued on the row begin receiving notifications.
    pub fn promote(&mut self, key: SubKey) {
        if self.active.contains_key(&key) {
            return;
        }
        let Some(mut row) = self.pending.remove(&key) else {
            return;
        };
        debug!(?key, "subscription promoted to active");
        row.live = true;
        self.active.insert(key, row);
    }

    /// Add a subscription for `subscriber`.
    ///
    /// Wildcard-capable kinds (and any kind with `value == 0`) install a
    /// wildcard and sweep both tables for matching rows; other kinds bind
    /// a single row, creating a pending one if the target has not been
    /// seen. Duplicates are reported, never inserted.
    pub fn subscribe(
        &mut self,
        kind: SubsKind,
        value: u32,
        subscriber: EntityId,
        cross_bind: bool,
        db: &GlobalDb,
        notify: &mut NotifyQueue,
    ) -> SubscribeOutcome {
        if kind.is_wildcard() || value == 0 {
            return self.subscribe_wildcard(kind, value, subscriber, cross_bind, db, notify);
        }

        let key = SubKey::new(kind.table(), value);
        if self.row(key).is_none() {
            self.pending.insert(key, SubRow::new(key, None));
        }
        let outcome = self.insert_subscriber(key, subscriber, db, notify);

        if cross_bind {
            let target = self.row(key).and_then(|r| r.target);
            match target {
                Some(target) => self.reverse_bind(subscriber, target, db, notify),
                None => trace!(?key, "cross-bind deferred; target not present yet"),
            }
        }
        outcome
    }

    fn subscribe_wildcard(
        &mut self,
        kind: SubsKind,
        value: u32,
        subscriber: EntityId,
        cross_bind: bool,
        db: &GlobalDb,
        notify: &mut NotifyQueue,
    ) -> SubscribeOutcome {
        // Re-subscribing to the same or a broader rule is a no-op.
        let duplicate = self.wildcards.iter().any(|w| {
            w.subscriber == subscriber
                && w.kind == kind
                && (w.value == 0 || w.value == value)
        });
        if duplicate {
            warn!(?kind, value, ?subscriber, "duplicate wildcard subscription");
        } else {
            self.wildcards.push(WildcardSubscriber {
                kind,
                value,
                cross_bind,
                subscriber,
            });
        }

        // Attach to every row the rule already matches, both tables.
        let matches: SmallVec<[SubKey; 8]> = self
            .active
            .values()
            .chain(self.pending.values())
            .filter(|row| {
                row.key.table == kind.table()
                    && row.target.is_some_and(|t| {
                        t != subscriber && wildcard_matches(kind, value, t, db)
                    })
            })
            .map(|row| row.key)
            .collect();

        for key in matches {
            self.insert_subscriber(key, subscriber, db, notify);
            if cross_bind {
                if let Some(target) = self.row(key).and_then(|r| r.target) {
                    self.reverse_bind(subscriber, target, db, notify);
                }
            }
        }

        if duplicate {
            SubscribeOutcome::Duplicate
        } else {
            SubscribeOutcome::Added
        }
    }

    /// Install `target` as a subscriber of `subscriber`'s own row: the
    /// reverse half of a cross-binding. Never propagates further.
    fn reverse_bind(
        &mut self,
        subscriber: EntityId,
        target: EntityId,
        db: &GlobalDb,
        notify: &mut NotifyQueue,
    ) {
        let key = GlobalDb::sub_key_of(subscriber);
        if self.row(key).is_none() {
            self.pending.insert(key, SubRow::new(key, Some(subscriber)));
        }
        self.insert_subscriber(key, target, db, notify);
    }

    /// Append a subscriber to a row. Duplicate detection is non-fatal. If
    /// the row is live and its target currently up, synthesize the
    /// "already running" notification for the new subscriber alone.
    pub fn insert_subscriber(
        &mut self,
        key: SubKey,
        subscriber: EntityId,
        db: &GlobalDb,
        notify: &mut NotifyQueue,
    ) -> SubscribeOutcome {
        let Some(row) = self.row_mut(key) else {
            return SubscribeOutcome::Duplicate;
        };
        if row.has_subscriber(subscriber) {
            warn!(?key, ?subscriber, "duplicate subscription");
            return SubscribeOutcome::Duplicate;
        }
        row.subscribers.push(Subscriber { entity: subscriber, last_processed: 0 });
        trace!(?key, ?subscriber, total = row.subscribers.len(), "subscriber added");

        if row.live {
            if let Some(target) = row.target {
                if db.entity_is_up(target) {
                    let kind = match target {
                        EntityId::Location(_) => NotifyKind::LocationActive,
                        EntityId::Node(_) => NotifyKind::NodeActive,
                        EntityId::Process(_) => NotifyKind::ProcessCreated,
                    };
                    notify.push(kind, target, NotifyScope::Only(subscriber));
                }
            }
        }
        SubscribeOutcome::Added
    }

    /// Hook for a node entering the system: create its row and wire any
    /// matching wildcard subscribers (plus their reverse edges).
    pub fn on_node_added(
        &mut self,
        node: crate::ids::NodeIndex,
        group: GroupIndex,
        db: &GlobalDb,
        notify: &mut NotifyQueue,
    ) {
        let entity = EntityId::Node(node);
        let key = GlobalDb::sub_key_of(entity);
        self.create_entry(key, entity);
        self.attach_wildcards(entity, key, db, notify, |w| match w.kind {
            SubsKind::Group => w.value == 0 || w.value == group.0,
            SubsKind::Node => w.value == 0,
            _ => false,
        });
    }

    /// Hook for a process entering the system.
    pub fn on_process_added(
        &mut self,
        process: ProcessKey,
        db: &GlobalDb,
        notify: &mut NotifyQueue,
    ) {
        let entity = EntityId::Process(process);
        let key = GlobalDb::sub_key_of(entity);
        self.create_entry(key, entity);
        self.attach_wildcards(entity, key, db, notify, |w| {
            matches!(w.kind, SubsKind::Process) && (w.value == 0 || w.value == process.ptype.0)
        });
    }

    /// Hook for a location entering the system.
    pub fn on_location_added(
        &mut self,
        location: LocationIndex,
        db: &GlobalDb,
        notify: &mut NotifyQueue,
    ) {
        let entity = EntityId::Location(location);
        let key = GlobalDb::sub_key_of(entity);
        self.create_entry(key, entity);
        self.attach_wildcards(entity, key, db, notify, |w| {
            matches!(w.kind, SubsKind::Location) && w.value == 0
        });
    }

    fn attach_wildcards(
        &mut self,
        entity: EntityId,
        key: SubKey,
        db: &GlobalDb,
        notify: &mut NotifyQueue,
        matcher: impl Fn(&WildcardSubscriber) -> bool,
    ) {
        let matched: SmallVec<[(EntityId, bool); 4]> = self
            .wildcards
            .iter()
            .filter(|w| w.subscriber != entity && matcher(w))
            .map(|w| (w.subscriber, w.cross_bind))
            .collect();

        for (subscriber, cross_bind) in matched {
            self.insert_subscriber(key, subscriber, db, notify);
            if cross_bind {
                self.reverse_bind(subscriber, entity, db, notify);
            }
        }
    }
}

/// Whether a wildcard rule matches an entity, comparing the field the
/// kind is about (group for group rules, process type for process rules).
fn wildcard_matches(kind: SubsKind, value: u32, target: EntityId, db: &GlobalDb) -> bool {
    if value == 0 {
        return match (kind, target) {
            (SubsKind::Group | SubsKind::Node, EntityId::Node(_)) => true,
            (SubsKind::Process, EntityId::Process(_)) => true,
            (SubsKind::Location, EntityId::Location(_)) => true,
            _ => false,
        };
    }
    match (kind, target) {
        (SubsKind::Group, EntityId::Node(ix)) => {
            db.node(ix).is_some_and(|n| n.group.0 == value)
        }
        (SubsKind::Process, EntityId::Process(key)) => key.ptype.0 == value,
        _ => false,
    }
}

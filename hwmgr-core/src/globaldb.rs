//! Global index rows.
//!
//! For every location, node and process there is a parallel global row
//! keyed for cross-cluster lookup. The row holds a status snapshot, a role
//! and the key of its attached subscription row. Subscription and
//! notification operate only on these rows, so local and remote entities
//! are referenced uniformly; the canonical records of `model` stay the
//! single source of data.

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::{HwmError, Result};
use crate::ids::{
    EntityId, GroupIndex, LocationIndex, NodeIndex, NodeRole, ProcessKey, SubsKind,
};
use crate::subs::SubKey;

/// Status snapshot mirrored into a global row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalStatus {
    /// Location or node is up.
    Active,
    /// Location or node is down.
    Inactive,
    /// Process is running.
    Running,
    /// Process is not running.
    Down,
}

impl GlobalStatus {
    #[inline]
    #[must_use]
    pub const fn is_up(self) -> bool {
        matches!(self, Self::Active | Self::Running)
    }
}

#[derive(Debug, Clone)]
pub struct GlobalLocationRow {
    pub index: LocationIndex,
    pub status: GlobalStatus,
}

#[derive(Debug, Clone)]
pub struct GlobalNodeRow {
    pub index: NodeIndex,
    pub location: LocationIndex,
    pub group: GroupIndex,
    pub role: NodeRole,
    pub status: GlobalStatus,
}

#[derive(Debug, Clone)]
pub struct GlobalProcessRow {
    pub key: ProcessKey,
    pub location: LocationIndex,
    pub status: GlobalStatus,
}

/// The three global tables. Node rows are keyed by bare node index; the
/// current deployment guarantees cluster-unique node indices and the
/// cluster protocol relies on it.
#[derive(Debug, Default)]
pub struct GlobalDb {
    locations: BTreeMap<LocationIndex, GlobalLocationRow>,
    nodes: BTreeMap<NodeIndex, GlobalNodeRow>,
    processes: BTreeMap<ProcessKey, GlobalProcessRow>,
}

impl GlobalDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The subscription row key an entity's row attaches to. Processes
    /// share a row per process type; nodes and locations have one row
    /// each.
    #[must_use]
    pub fn sub_key_of(entity: EntityId) -> SubKey {
        match entity {
            EntityId::Location(ix) => SubKey::new(SubsKind::Location.table(), ix.0),
            EntityId::Node(ix) => SubKey::new(SubsKind::Node.table(), ix.0),
            EntityId::Process(key) => SubKey::new(SubsKind::Process.table(), key.ptype.0),
        }
    }

    pub fn add_location(&mut self, index: LocationIndex, status: GlobalStatus) -> Result<()> {
        if self.locations.contains_key(&index) {
            return Err(HwmError::DuplicateEntity(EntityId::Location(index)));
        }
        trace!(%index, ?status, "global location row added");
        self.locations.insert(index, GlobalLocationRow { index, status });
        Ok(())
    }

    pub fn add_node(
        &mut self,
        index: NodeIndex,
        location: LocationIndex,
        group: GroupIndex,
        role: NodeRole,
        status: GlobalStatus,
    ) -> Result<()> {
        if self.nodes.contains_key(&index) {
            return Err(HwmError::DuplicateEntity(EntityId::Node(index)));
        }
        trace!(%index, %location, ?status, "global node row added");
        self.nodes
            .insert(index, GlobalNodeRow { index, location, group, role, status });
        Ok(())
    }

    pub fn add_process(
        &mut self,
        key: ProcessKey,
        location: LocationIndex,
        status: GlobalStatus,
    ) -> Result<()> {
        if self.processes.contains_key(&key) {
            return Err(HwmError::DuplicateEntity(EntityId::Process(key)));
        }
        trace!(%key, %location, ?status, "global process row added");
        self.processes.insert(key, GlobalProcessRow { key, location, status });
        Ok(())
    }

    #[must_use]
    pub fn location(&self, index: LocationIndex) -> Option<&GlobalLocationRow> {
        self.locations.get(&index)
    }

    #[must_use]
    pub fn node(&self, index: NodeIndex) -> Option<&GlobalNodeRow> {
        self.nodes.get(&index)
    }

    #[must_use]
    pub fn process(&self, key: ProcessKey) -> Option<&GlobalProcessRow> {
        self.processes.get(&key)
    }

    pub fn set_location_status(&mut self, index: LocationIndex, status: GlobalStatus) {
        if let Some(row) = self.locations.get_mut(&index) {
            row.status = status;
        }
    }

    pub fn set_node_status(&mut self, index: NodeIndex, status: GlobalStatus) {
        if let Some(row) = self.nodes.get_mut(&index) {
            row.status = status;
        }
    }

    pub fn set_node_role(&mut self, index: NodeIndex, role: NodeRole) {
        if let Some(row) = self.nodes.get_mut(&index) {
            row.role = role;
        }
    }

    pub fn set_process_status(&mut self, key: ProcessKey, status: GlobalStatus) {
        if let Some(row) = self.processes.get_mut(&key) {
            row.status = status;
        }
    }

    /// Current liveness of an entity, for the synthesized notification a
    /// late subscriber gets on joining a live row.
    #[must_use]
    pub fn entity_is_up(&self, entity: EntityId) -> bool {
        match entity {
            EntityId::Location(ix) => {
                self.locations.get(&ix).is_some_and(|r| r.status.is_up())
            }
            EntityId::Node(ix) => self.nodes.get(&ix).is_some_and(|r| r.status.is_up()),
            EntityId::Process(key) => {
                self.processes.get(&key).is_some_and(|r| r.status.is_up())
            }
        }
    }

    /// The location an entity lives on, if its row exists.
    #[must_use]
    pub fn location_of(&self, entity: EntityId) -> Option<LocationIndex> {
        match entity {
            EntityId::Location(ix) => Some(ix),
            EntityId::Node(ix) => self.nodes.get(&ix).map(|r| r.location),
            EntityId::Process(key) => self.processes.get(&key).map(|r| r.location),
        }
    }

    /// Iterate node rows, ordered by index.
    pub fn nodes(&self) -> impl Iterator<Item = &GlobalNodeRow> {
        self.nodes.values()
    }

    /// Iterate process rows, ordered by `(type, node, pid)`.
    pub fn processes(&self) -> impl Iterator<Item = &GlobalProcessRow> {
        self.processes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{Pid, ProcType};

    #[test]
    fn duplicate_node_row_is_an_error() {
        let mut db = GlobalDb::new();
        db.add_node(
            NodeIndex(1),
            LocationIndex(1),
            GroupIndex(1),
            NodeRole::None,
            GlobalStatus::Inactive,
        )
        .unwrap();
        let err = db
            .add_node(
                NodeIndex(1),
                LocationIndex(2),
                GroupIndex(1),
                NodeRole::None,
                GlobalStatus::Inactive,
            )
            .unwrap_err();
        assert!(matches!(err, HwmError::DuplicateEntity(EntityId::Node(_))));
    }

    #[test]
    fn processes_share_a_sub_row_per_type() {
        let a = ProcessKey { ptype: ProcType(7), node: NodeIndex(1), pid: Pid(10) };
        let b = ProcessKey { ptype: ProcType(7), node: NodeIndex(2), pid: Pid(11) };
        assert_eq!(
            GlobalDb::sub_key_of(EntityId::Process(a)),
            GlobalDb::sub_key_of(EntityId::Process(b))
        );
    }

    #[test]
    fn entity_liveness_tracks_status() {
        let mut db = GlobalDb::new();
        let key = ProcessKey { ptype: ProcType(7), node: NodeIndex(1), pid: Pid(10) };
        db.add_process(key, LocationIndex(1), GlobalStatus::Running).unwrap();
        assert!(db.entity_is_up(EntityId::Process(key)));
        db.set_process_status(key, GlobalStatus::Down);
        assert!(!db.entity_is_up(EntityId::Process(key)));
    }
}

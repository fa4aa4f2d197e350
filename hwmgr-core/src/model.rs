//! Canonical entity records.
//!
//! Ownership is strict: a location owns its node records, a node owns its
//! process records. Everything else refers to these by id. One location
//! per manager is local; all others mirror remote state.

use std::collections::BTreeMap;

use tracing::debug;

use crate::fsm::node::{NodeFsm, NodeState};
use crate::fsm::peer::{PeerFsm, PeerState};
use crate::ids::{
    GroupIndex, LocationIndex, NodeIndex, NodeRole, Pid, ProcType, ProcessKey, TimerId,
    TransportId,
};

/// An interface exposed by a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub if_type: u32,
}

/// A unit of work inside a node, identified by `(type, pid)` within it.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub ptype: ProcType,
    pub pid: Pid,
    pub name: String,
    pub running: bool,
    pub role: NodeRole,
    pub partner: Option<ProcessKey>,
    pub interfaces: Vec<InterfaceRecord>,
}

impl ProcessRecord {
    #[must_use]
    pub fn new(ptype: ProcType, pid: Pid, name: impl Into<String>) -> Self {
        Self {
            ptype,
            pid,
            name: name.into(),
            running: false,
            role: NodeRole::None,
            partner: None,
            interfaces: Vec::new(),
        }
    }

    #[must_use]
    pub fn key(&self, node: NodeIndex) -> ProcessKey {
        ProcessKey { ptype: self.ptype, node, pid: self.pid }
    }
}

/// A managed application instance hosted on a location.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub index: NodeIndex,
    pub group: GroupIndex,
    pub name: String,
    pub desired_role: NodeRole,
    pub current_role: NodeRole,
    pub fsm: NodeFsm,
    pub keepalive_period_ms: u32,
    pub keepalive_missed: u32,
    /// Ordered by `(type, pid)`.
    pub processes: BTreeMap<(ProcType, Pid), ProcessRecord>,
    pub partner: Option<NodeIndex>,
    /// For local nodes the accepted node socket; for remote nodes the
    /// shared peer transport of the parent location.
    pub transport: Option<TransportId>,
    pub keepalive_timer: Option<TimerId>,
    pub location: LocationIndex,
}

impl NodeRecord {
    #[must_use]
    pub fn new(
        index: NodeIndex,
        group: GroupIndex,
        name: impl Into<String>,
        desired_role: NodeRole,
        location: LocationIndex,
    ) -> Self {
        Self {
            index,
            group,
            name: name.into(),
            desired_role,
            current_role: NodeRole::None,
            fsm: NodeFsm::new(),
            keepalive_period_ms: 0,
            keepalive_missed: 0,
            processes: BTreeMap::new(),
            partner: None,
            transport: None,
            keepalive_timer: None,
            location,
        }
    }

    /// A mirror for a node learned from a peer, already in a given state.
    #[must_use]
    pub fn remote(
        index: NodeIndex,
        group: GroupIndex,
        role: NodeRole,
        state: NodeState,
        location: LocationIndex,
    ) -> Self {
        let mut node = Self::new(index, group, String::new(), NodeRole::None, location);
        node.current_role = role;
        node.fsm = NodeFsm::in_state(state);
        node
    }

    #[must_use]
    pub fn running_processes(&self) -> u32 {
        self.processes.values().filter(|p| p.running).count() as u32
    }

    #[must_use]
    pub fn process(&self, ptype: ProcType, pid: Pid) -> Option<&ProcessRecord> {
        self.processes.get(&(ptype, pid))
    }

    pub fn process_mut(&mut self, ptype: ProcType, pid: Pid) -> Option<&mut ProcessRecord> {
        self.processes.get_mut(&(ptype, pid))
    }
}

/// A hardware location. Owns its node records.
#[derive(Debug, Clone)]
pub struct LocationRecord {
    pub index: LocationIndex,
    pub fsm: PeerFsm,
    pub keepalive_period_ms: u32,
    pub keepalive_missed: u32,
    /// Count of nodes in state ACTIVE. Kept in lock-step with the node
    /// table; a drift is an invariant breach and aborts.
    active_nodes: u32,
    pub total_nodes: u32,
    /// Count of running processes across all nodes of this location.
    active_processes: u32,
    pub replay_in_progress: bool,
    /// Ordered by node index; replay emission relies on this.
    pub nodes: BTreeMap<NodeIndex, NodeRecord>,
    /// Listen transports exist on the local location only. For a remote
    /// location `peer_listen_transport` is the session to that peer.
    pub peer_listen_transport: Option<TransportId>,
    pub node_listen_transport: Option<TransportId>,
    pub peer_broadcast_transport: Option<TransportId>,
    pub keepalive_timer: Option<TimerId>,
    pub ha_timer: Option<TimerId>,
    pub is_local: bool,
}

impl LocationRecord {
    #[must_use]
    pub fn new(index: LocationIndex, is_local: bool) -> Self {
        Self {
            index,
            fsm: if is_local {
                PeerFsm::in_state(PeerState::Active)
            } else {
                PeerFsm::new()
            },
            keepalive_period_ms: 0,
            keepalive_missed: 0,
            active_nodes: 0,
            total_nodes: 0,
            active_processes: 0,
            replay_in_progress: false,
            nodes: BTreeMap::new(),
            peer_listen_transport: None,
            node_listen_transport: None,
            peer_broadcast_transport: None,
            keepalive_timer: None,
            ha_timer: None,
            is_local,
        }
    }

    #[inline]
    #[must_use]
    pub const fn active_nodes(&self) -> u32 {
        self.active_nodes
    }

    #[inline]
    #[must_use]
    pub const fn active_processes(&self) -> u32 {
        self.active_processes
    }

    pub fn incr_active_nodes(&mut self) {
        self.active_nodes += 1;
        debug!(location = %self.index, active = self.active_nodes, "active nodes up");
    }

    pub fn decr_active_nodes(&mut self) {
        assert!(self.active_nodes > 0, "active_nodes underflow at {}", self.index);
        self.active_nodes -= 1;
        debug!(location = %self.index, active = self.active_nodes, "active nodes down");
    }

    pub fn incr_active_processes(&mut self) {
        self.active_processes += 1;
    }

    pub fn decr_active_processes(&mut self) {
        assert!(
            self.active_processes > 0,
            "active_processes underflow at {}",
            self.index
        );
        self.active_processes -= 1;
    }

    /// Insert a node record, bumping `total_nodes` for a new index.
    /// Returns whether the index was new.
    pub fn add_node(&mut self, node: NodeRecord) -> bool {
        let new = !self.nodes.contains_key(&node.index);
        if new {
            self.total_nodes += 1;
        }
        self.nodes.insert(node.index, node);
        new
    }

    #[must_use]
    pub fn node(&self, index: NodeIndex) -> Option<&NodeRecord> {
        self.nodes.get(&index)
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(&index)
    }

    /// Recount invariants 3 of the model; used by tests and debug asserts.
    #[must_use]
    pub fn counters_consistent(&self) -> bool {
        let active = self
            .nodes
            .values()
            .filter(|n| n.fsm.state() == NodeState::Active)
            .count() as u32;
        let procs: u32 = self.nodes.values().map(NodeRecord::running_processes).sum();
        active == self.active_nodes && procs == self.active_processes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> LocationRecord {
        LocationRecord::new(LocationIndex(1), true)
    }

    #[test]
    fn add_node_counts_totals_once() {
        let mut loc = location();
        let node = NodeRecord::new(
            NodeIndex(42),
            GroupIndex(1),
            "mp0",
            NodeRole::Active,
            loc.index,
        );
        assert!(loc.add_node(node.clone()));
        assert!(!loc.add_node(node));
        assert_eq!(loc.total_nodes, 1);
    }

    #[test]
    fn counters_track_nodes_and_processes() {
        let mut loc = location();
        let mut node = NodeRecord::new(
            NodeIndex(42),
            GroupIndex(1),
            "mp0",
            NodeRole::Active,
            loc.index,
        );
        node.fsm = NodeFsm::in_state(NodeState::Active);
        let mut proc = ProcessRecord::new(ProcType(7), Pid(0xBBBB), "pm");
        proc.running = true;
        node.processes.insert((proc.ptype, proc.pid), proc);
        loc.add_node(node);

        loc.incr_active_nodes();
        loc.incr_active_processes();
        assert!(loc.counters_consistent());

        loc.decr_active_processes();
        assert!(!loc.counters_consistent());
    }

    #[test]
    #[should_panic(expected = "active_nodes underflow")]
    fn active_node_underflow_aborts() {
        let mut loc = location();
        loc.decr_active_nodes();
    }
}

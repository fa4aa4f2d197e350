//! Identifier newtypes and the tagged entity id.
//!
//! Every cross-reference in the system goes through one of these ids plus a
//! lookup in the owning container. The tagged [`EntityId`] replaces the
//! first-field table-type discriminator of older designs: call sites match
//! on the variant instead of reading a type word out of a control block.

use std::fmt;

/// Cluster-unique index of a hardware location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocationIndex(pub u32);

/// Index of a node. Unique within its location and, in the current
/// deployment, unique across the cluster (the global node table relies on
/// this).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(pub u32);

/// Logical bucket of nodes eligible for active/backup pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupIndex(pub u32);

/// Process type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcType(pub u32);

/// Process id, assigned by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

/// Composite key of a process: `(type, node, pid)`. Two processes of the
/// same type may coexist on different nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessKey {
    pub ptype: ProcType,
    pub node: NodeIndex,
    pub pid: Pid,
}

/// Engine-assigned handle of a transport record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportId(pub u64);

/// Engine-assigned handle of a timer table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

/// Tagged reference to any entity that owns a global index row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityId {
    Location(LocationIndex),
    Node(NodeIndex),
    Process(ProcessKey),
}

/// High-availability role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeRole {
    #[default]
    None,
    Active,
    Passive,
}

impl NodeRole {
    pub const WIRE_NONE: u32 = 0;
    pub const WIRE_ACTIVE: u32 = 1;
    pub const WIRE_PASSIVE: u32 = 2;

    #[must_use]
    pub const fn to_wire(self) -> u32 {
        match self {
            Self::None => Self::WIRE_NONE,
            Self::Active => Self::WIRE_ACTIVE,
            Self::Passive => Self::WIRE_PASSIVE,
        }
    }

    /// Unknown wire values collapse to `None`.
    #[must_use]
    pub const fn from_wire(v: u32) -> Self {
        match v {
            Self::WIRE_ACTIVE => Self::Active,
            Self::WIRE_PASSIVE => Self::Passive,
            _ => Self::None,
        }
    }
}

/// Subscription kind as carried in REGISTER frames, config files and
/// BINDING messages. The wire values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubsKind {
    Group,
    Process,
    Interface,
    Node,
    Location,
}

impl SubsKind {
    #[must_use]
    pub const fn to_wire(self) -> u32 {
        match self {
            Self::Group => 1,
            Self::Process => 2,
            Self::Interface => 3,
            Self::Node => 4,
            Self::Location => 5,
        }
    }

    #[must_use]
    pub const fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Group),
            2 => Some(Self::Process),
            3 => Some(Self::Interface),
            4 => Some(Self::Node),
            5 => Some(Self::Location),
            _ => None,
        }
    }

    /// The table a subscription of this kind attaches to. Group and node
    /// subscriptions both target the node table; they differ only in how
    /// values are matched.
    #[must_use]
    pub const fn table(self) -> TableKind {
        match self {
            Self::Group | Self::Node => TableKind::Nodes,
            Self::Process => TableKind::Process,
            Self::Interface => TableKind::Interface,
            Self::Location => TableKind::Location,
        }
    }

    /// Kinds that are matched through the wildcard list even with a
    /// non-zero value.
    #[must_use]
    pub const fn is_wildcard(self) -> bool {
        matches!(self, Self::Group | Self::Process | Self::Interface)
    }
}

/// The four subscription target tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableKind {
    Nodes,
    Process,
    Interface,
    Location,
}

impl fmt::Display for LocationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}/{}/{:#x}", self.ptype.0, self.node.0, self.pid.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_wire_round_trip() {
        for role in [NodeRole::None, NodeRole::Active, NodeRole::Passive] {
            assert_eq!(NodeRole::from_wire(role.to_wire()), role);
        }
        assert_eq!(NodeRole::from_wire(77), NodeRole::None);
    }

    #[test]
    fn subs_kind_tables() {
        assert_eq!(SubsKind::Group.table(), TableKind::Nodes);
        assert_eq!(SubsKind::Node.table(), TableKind::Nodes);
        assert_eq!(SubsKind::Process.table(), TableKind::Process);
        assert!(SubsKind::Group.is_wildcard());
        assert!(!SubsKind::Node.is_wildcard());
    }

    #[test]
    fn process_key_orders_by_type_then_node_then_pid() {
        let a = ProcessKey { ptype: ProcType(1), node: NodeIndex(5), pid: Pid(9) };
        let b = ProcessKey { ptype: ProcType(1), node: NodeIndex(6), pid: Pid(1) };
        let c = ProcessKey { ptype: ProcType(2), node: NodeIndex(1), pid: Pid(1) };
        assert!(a < b && b < c);
    }
}

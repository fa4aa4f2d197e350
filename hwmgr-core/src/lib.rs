//! Hardware Manager Core
//!
//! This crate contains the runtime-agnostic cluster-state kernel:
//! - Identifier newtypes and the tagged entity id (`ids`)
//! - Location / node / process records (`model`)
//! - Global index rows, the subscription targets (`globaldb`)
//! - Peer and node liveness state machines (`fsm`)
//! - Pending/active subscription tables with wildcards (`subs`)
//! - Id-stamped notification queue (`notify`)
//! - Active/backup role resolution (`ha`)
//! - Error types (`error`)
//!
//! Nothing in here does I/O. State machines return action lists and the
//! notification queue drains through a sink trait; the service crate owns
//! sockets and timers.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::match_same_arms)]

pub mod error;
pub mod globaldb;
pub mod ha;
pub mod ids;
pub mod model;
pub mod notify;
pub mod subs;

pub mod fsm {
    pub mod node;
    pub mod peer;
}

// Small prelude for the service crate. Kept minimal.
pub mod prelude {
    pub use crate::error::{HwmError, Result};
    pub use crate::fsm::node::{NodeAction, NodeFsm, NodeInput, NodeState};
    pub use crate::fsm::peer::{PeerAction, PeerFsm, PeerInput, PeerState};
    pub use crate::globaldb::{GlobalDb, GlobalStatus};
    pub use crate::ids::{
        EntityId, GroupIndex, LocationIndex, NodeIndex, NodeRole, Pid, ProcType, ProcessKey,
        SubsKind, TableKind, TimerId, TransportId,
    };
    pub use crate::model::{LocationRecord, NodeRecord, ProcessRecord};
    pub use crate::notify::{DeliverStatus, Notification, NotifyKind, NotifyQueue, NotifySink};
    pub use crate::subs::{SubKey, SubscribeOutcome, SubscriptionTable, WildcardSubscriber};
}

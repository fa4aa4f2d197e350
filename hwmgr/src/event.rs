//! Engine events.
//!
//! Everything that happens (socket readiness, inbound bytes, timer fires,
//! shutdown) funnels into one flume channel consumed by the engine task.
//! This is what makes the system single-threaded: pumps and timers only
//! ever enqueue; all state belongs to the engine.

use std::net::SocketAddr;

use bytes::Bytes;
use flume::Sender;

use hwmgr_core::ids::{TimerId, TransportId};

use crate::transport::WriterCmd;

/// Which listener produced an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptKind {
    Node,
    Peer,
}

/// One engine event.
#[derive(Debug)]
pub enum Event {
    /// A listener accepted a connection; its pumps are already running.
    Accepted {
        kind: AcceptKind,
        transport: TransportId,
        addr: SocketAddr,
        writer: Sender<WriterCmd>,
    },
    /// An outbound connect completed.
    Connected {
        transport: TransportId,
        writer: Sender<WriterCmd>,
    },
    /// An outbound connect failed terminally.
    ConnectFailed { transport: TransportId },
    /// Bytes arrived on a stream transport.
    Bytes { transport: TransportId, data: Bytes },
    /// A stream transport hit EOF or a hard error.
    Closed { transport: TransportId },
    /// A multicast datagram arrived.
    Beacon { data: Bytes, from: SocketAddr },
    /// A timer fired. Stale generations are discarded at the drain.
    Timer { id: TimerId, generation: u64 },
    /// Ctrl-C or equivalent.
    Shutdown,
}

/// Shared sender side of the engine channel.
pub type EventTx = Sender<Event>;

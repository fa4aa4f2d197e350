//! Engine-side transport records.
//!
//! A `Transport` is the engine's view of one socket: the outbound queue,
//! the `connected`/`hold` gates, the owning entity and the stream decoder.
//! The actual socket lives in a pump task (`sock`); frames reach it
//! through a writer channel. Sending is gated twice: `connected` (the
//! socket is up and writable) and `hold` (the owner paused emission, e.g.
//! while a REGISTER is in flight so notifications cannot overtake its
//! response). A priority enqueue jumps the queue and clears the hold.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;
use flume::Sender;
use hashbrown::HashMap;
use tracing::{debug, trace};

use hwmgr_core::ids::{LocationIndex, NodeIndex, TransportId};
use hwmgr_proto::node::NodeDecoder;
use hwmgr_proto::peer::PeerDecoder;

/// Commands understood by a socket pump's write half.
#[derive(Debug)]
pub enum WriterCmd {
    Send(Bytes),
    Close,
}

/// What a transport is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Accepted node-facing stream.
    NodeStream,
    /// Accepted peer-facing stream.
    PeerStream,
    /// Outbound peer connection (possibly still connecting).
    PeerOut,
    /// The multicast beacon socket.
    Multicast,
}

/// The entity a transport is bound to, once known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOwner {
    Node(NodeIndex),
    Peer(LocationIndex),
}

/// Per-stream frame reassembly.
#[derive(Debug)]
pub enum FrameCodec {
    Peer(PeerDecoder),
    Node(NodeDecoder),
    /// Datagram transports deliver whole frames.
    Datagram,
}

/// One engine-side transport record.
#[derive(Debug)]
pub struct Transport {
    pub id: TransportId,
    pub kind: TransportKind,
    pub remote: Option<SocketAddr>,
    pub connected: bool,
    pub hold: bool,
    pub owner: Option<TransportOwner>,
    pub codec: FrameCodec,
    outbound: VecDeque<Bytes>,
    writer: Option<Sender<WriterCmd>>,
}

impl Transport {
    fn new(id: TransportId, kind: TransportKind) -> Self {
        let codec = match kind {
            TransportKind::NodeStream => FrameCodec::Node(NodeDecoder::new()),
            TransportKind::PeerStream | TransportKind::PeerOut => {
                FrameCodec::Peer(PeerDecoder::new())
            }
            TransportKind::Multicast => FrameCodec::Datagram,
        };
        Self {
            id,
            kind,
            remote: None,
            connected: false,
            hold: false,
            owner: None,
            codec,
            outbound: VecDeque::new(),
            writer: None,
        }
    }

    /// Append a frame and try to flush.
    pub fn enqueue(&mut self, frame: Bytes) {
        self.outbound.push_back(frame);
        self.flush();
    }

    /// Insert at the head of the queue and release any hold. Responses
    /// that must precede held traffic use this.
    pub fn enqueue_priority(&mut self, frame: Bytes) {
        self.outbound.push_front(frame);
        if self.hold {
            trace!(id = ?self.id, "transport hold released");
            self.hold = false;
        }
        self.flush();
    }

    /// Drain the queue to the pump while the gates allow it.
    pub fn flush(&mut self) {
        if !self.connected || self.hold {
            return;
        }
        while let Some(frame) = self.outbound.pop_front() {
            let Some(writer) = &self.writer else {
                self.outbound.push_front(frame);
                return;
            };
            if writer.send(WriterCmd::Send(frame)).is_err() {
                // Pump is gone; the close event will follow.
                debug!(id = ?self.id, "writer gone; marking disconnected");
                self.connected = false;
                self.writer = None;
                return;
            }
        }
    }

    /// Wire up the pump's write half; flushes anything queued while the
    /// socket was still connecting.
    pub fn attach_writer(&mut self, writer: Sender<WriterCmd>) {
        self.writer = Some(writer);
        self.connected = true;
        self.flush();
    }

    /// Tear down: the queue is discarded, the pump told to close.
    pub fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.send(WriterCmd::Close);
        }
        self.outbound.clear();
        self.connected = false;
        self.hold = false;
    }

    /// Frames waiting in the queue. Tests inspect this; the engine only
    /// flushes.
    pub fn queued(&self) -> impl Iterator<Item = &Bytes> {
        self.outbound.iter()
    }

    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.outbound.len()
    }
}

/// Transport id allocator, shared with listener tasks so an accepted
/// socket's pumps know their id before the engine sees the connection.
/// Single-threaded by design, like everything else here.
#[derive(Debug, Clone, Default)]
pub struct IdAlloc(std::rc::Rc<std::cell::Cell<u64>>);

impl IdAlloc {
    #[must_use]
    pub fn next(&self) -> TransportId {
        let id = self.0.get() + 1;
        self.0.set(id);
        TransportId(id)
    }
}

/// All live transports, keyed by id.
#[derive(Debug, Default)]
pub struct TransportTable {
    map: HashMap<TransportId, Transport>,
    alloc: IdAlloc,
}

impl TransportTable {
    #[must_use]
    pub fn new(alloc: IdAlloc) -> Self {
        Self { map: HashMap::new(), alloc }
    }

    pub fn create(&mut self, kind: TransportKind) -> TransportId {
        let id = self.alloc.next();
        self.map.insert(id, Transport::new(id, kind));
        id
    }

    /// Register a transport whose id was allocated by a listener task.
    pub fn insert_accepted(&mut self, id: TransportId, kind: TransportKind) -> &mut Transport {
        self.map.entry(id).or_insert_with(|| Transport::new(id, kind))
    }

    #[must_use]
    pub fn get(&self, id: TransportId) -> Option<&Transport> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: TransportId) -> Option<&mut Transport> {
        self.map.get_mut(&id)
    }

    pub fn remove(&mut self, id: TransportId) -> Option<Transport> {
        self.map.remove(&id)
    }

    pub fn enqueue(&mut self, id: TransportId, frame: Bytes) {
        if let Some(t) = self.map.get_mut(&id) {
            t.enqueue(frame);
        }
    }

    pub fn enqueue_priority(&mut self, id: TransportId, frame: Bytes) {
        if let Some(t) = self.map.get_mut(&id) {
            t.enqueue_priority(frame);
        }
    }
}

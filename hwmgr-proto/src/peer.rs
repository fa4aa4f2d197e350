//! Peer-facing cluster codec.
//!
//! Frame layout: a 16-byte header `{hw_id, msg_type, timestamp}` followed
//! by a fixed-size body per message type. Because every type has exactly
//! one size, the stream decoder needs no length prefix: it peeks the type
//! word and waits for that many bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::error::{ProtoError, Result};

/// Peer header length.
pub const HEADER_LEN: usize = 16;

/// Records per REPLAY or BINDING chunk.
pub const TLVS_PER_UPDATE: usize = 5;

/// Stable on-wire message types.
pub const MSG_KEEPALIVE: u32 = 1;
pub const MSG_INIT: u32 = 2;
pub const MSG_REPLAY: u32 = 3;
pub const MSG_NODE_UPDATE: u32 = 4;
pub const MSG_PROCESS_UPDATE: u32 = 5;
pub const MSG_HA_UPDATE: u32 = 6;
pub const MSG_BINDING: u32 = 7;

/// Entity status as carried in updates.
pub const STATUS_ACTIVE: u32 = 1;
pub const STATUS_INACTIVE: u32 = 2;

const REPLAY_RECORD_LEN: usize = 24;
const BINDING_LEN: usize = 8;

/// Common header on every peer frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHeader {
    pub hw_id: u32,
    pub msg_type: u32,
    pub timestamp: u64,
}

/// Multicast beacon payload. The counts are the sender's *active* node
/// and process counts; receivers use them for drift detection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub listen_port: u32,
    pub num_nodes: u32,
    pub num_procs: u32,
}

/// Session establishment. A request has `request=true`; the response
/// comes back with `request=false, response_ok=true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitFlags {
    pub request: bool,
    pub response_ok: bool,
}

/// Tag of a replay record; doubles as the BINDING subscriber type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Node,
    Process,
}

impl RecordKind {
    #[must_use]
    pub const fn to_wire(self) -> u32 {
        match self {
            Self::Node => 1,
            Self::Process => 2,
        }
    }

    #[must_use]
    pub const fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Node),
            2 => Some(Self::Process),
            _ => None,
        }
    }
}

/// One replay record. For `Node` records `group` is the HA group and
/// `pid` is zero; for `Process` records `group` carries the process type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayRecord {
    pub kind: RecordKind,
    pub group: u32,
    pub node_id: u32,
    pub role: u32,
    pub running: u32,
    pub pid: u32,
}

/// A replay chunk: up to [`TLVS_PER_UPDATE`] records, on-wire order
/// authoritative. The terminator chunk has `last=true` and no records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplayChunk {
    pub last: bool,
    pub records: SmallVec<[ReplayRecord; TLVS_PER_UPDATE]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeUpdate {
    pub node_id: u32,
    pub group: u32,
    pub role: u32,
    pub status: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessUpdate {
    pub proc_type: u32,
    pub proc_id: u32,
    pub node_id: u32,
    pub status: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaUpdate {
    pub node_id: u32,
    pub group: u32,
    pub role: u32,
}

/// One propagated subscription binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub subs_kind: u32,
    pub subs_id: u32,
}

/// A batch of cross-bound subscriptions contributed by one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingBatch {
    pub subscriber_kind: RecordKind,
    pub subscriber_id: u32,
    pub bindings: SmallVec<[Binding; TLVS_PER_UPDATE]>,
}

/// Body of a peer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerBody {
    Keepalive(Beacon),
    Init(InitFlags),
    Replay(ReplayChunk),
    NodeUpdate(NodeUpdate),
    ProcessUpdate(ProcessUpdate),
    HaUpdate(HaUpdate),
    Binding(BindingBatch),
}

impl PeerBody {
    #[must_use]
    pub const fn msg_type(&self) -> u32 {
        match self {
            Self::Keepalive(_) => MSG_KEEPALIVE,
            Self::Init(_) => MSG_INIT,
            Self::Replay(_) => MSG_REPLAY,
            Self::NodeUpdate(_) => MSG_NODE_UPDATE,
            Self::ProcessUpdate(_) => MSG_PROCESS_UPDATE,
            Self::HaUpdate(_) => MSG_HA_UPDATE,
            Self::Binding(_) => MSG_BINDING,
        }
    }
}

/// A decoded peer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFrame {
    pub hdr: PeerHeader,
    pub body: PeerBody,
}

/// Total frame length for a message type.
#[must_use]
pub const fn frame_len(msg_type: u32) -> Option<usize> {
    match msg_type {
        MSG_KEEPALIVE => Some(HEADER_LEN + 12),
        MSG_INIT => Some(HEADER_LEN + 8),
        MSG_REPLAY => Some(HEADER_LEN + 8 + TLVS_PER_UPDATE * REPLAY_RECORD_LEN),
        MSG_NODE_UPDATE | MSG_PROCESS_UPDATE => Some(HEADER_LEN + 16),
        MSG_HA_UPDATE => Some(HEADER_LEN + 12),
        MSG_BINDING => Some(HEADER_LEN + 12 + TLVS_PER_UPDATE * BINDING_LEN),
        _ => None,
    }
}

/// Encode a frame.
#[must_use]
pub fn encode(hw_id: u32, timestamp: u64, body: &PeerBody) -> Bytes {
    let msg_type = body.msg_type();
    let len = frame_len(msg_type).expect("known message type");
    let mut out = BytesMut::with_capacity(len);

    out.put_u32(hw_id);
    out.put_u32(msg_type);
    out.put_u64(timestamp);

    match body {
        PeerBody::Keepalive(b) => {
            out.put_u32(b.listen_port);
            out.put_u32(b.num_nodes);
            out.put_u32(b.num_procs);
        }
        PeerBody::Init(f) => {
            out.put_u32(u32::from(f.request));
            out.put_u32(u32::from(f.response_ok));
        }
        PeerBody::Replay(chunk) => {
            debug_assert!(chunk.records.len() <= TLVS_PER_UPDATE);
            out.put_u32(chunk.records.len() as u32);
            out.put_u32(u32::from(chunk.last));
            for rec in &chunk.records {
                out.put_u32(rec.kind.to_wire());
                out.put_u32(rec.group);
                out.put_u32(rec.node_id);
                out.put_u32(rec.role);
                out.put_u32(rec.running);
                out.put_u32(rec.pid);
            }
            // Unused record slots are zero on the wire.
            out.resize(len, 0);
        }
        PeerBody::NodeUpdate(u) => {
            out.put_u32(u.node_id);
            out.put_u32(u.group);
            out.put_u32(u.role);
            out.put_u32(u.status);
        }
        PeerBody::ProcessUpdate(u) => {
            out.put_u32(u.proc_type);
            out.put_u32(u.proc_id);
            out.put_u32(u.node_id);
            out.put_u32(u.status);
        }
        PeerBody::HaUpdate(u) => {
            out.put_u32(u.node_id);
            out.put_u32(u.group);
            out.put_u32(u.role);
        }
        PeerBody::Binding(batch) => {
            debug_assert!(batch.bindings.len() <= TLVS_PER_UPDATE);
            out.put_u32(batch.subscriber_kind.to_wire());
            out.put_u32(batch.subscriber_id);
            out.put_u32(batch.bindings.len() as u32);
            for b in &batch.bindings {
                out.put_u32(b.subs_kind);
                out.put_u32(b.subs_id);
            }
            out.resize(len, 0);
        }
    }

    debug_assert_eq!(out.len(), len);
    out.freeze()
}

/// Decode one complete frame (a whole datagram, or a slice the stream
/// decoder cut to size).
pub fn decode(frame: &[u8]) -> Result<PeerFrame> {
    if frame.len() < HEADER_LEN {
        return Err(ProtoError::Incomplete);
    }
    let mut buf = frame;
    let hdr = PeerHeader {
        hw_id: buf.get_u32(),
        msg_type: buf.get_u32(),
        timestamp: buf.get_u64(),
    };
    let expected = frame_len(hdr.msg_type).ok_or(ProtoError::UnknownType(hdr.msg_type))?;
    if frame.len() < expected {
        return Err(ProtoError::Incomplete);
    }

    let body = match hdr.msg_type {
        MSG_KEEPALIVE => PeerBody::Keepalive(Beacon {
            listen_port: buf.get_u32(),
            num_nodes: buf.get_u32(),
            num_procs: buf.get_u32(),
        }),
        MSG_INIT => PeerBody::Init(InitFlags {
            request: buf.get_u32() != 0,
            response_ok: buf.get_u32() != 0,
        }),
        MSG_REPLAY => {
            let num = buf.get_u32() as usize;
            let last = buf.get_u32() != 0;
            if num > TLVS_PER_UPDATE {
                return Err(ProtoError::Malformed("replay record count"));
            }
            let mut records = SmallVec::new();
            for _ in 0..num {
                let kind = RecordKind::from_wire(buf.get_u32())
                    .ok_or(ProtoError::Malformed("replay record kind"))?;
                records.push(ReplayRecord {
                    kind,
                    group: buf.get_u32(),
                    node_id: buf.get_u32(),
                    role: buf.get_u32(),
                    running: buf.get_u32(),
                    pid: buf.get_u32(),
                });
            }
            PeerBody::Replay(ReplayChunk { last, records })
        }
        MSG_NODE_UPDATE => PeerBody::NodeUpdate(NodeUpdate {
            node_id: buf.get_u32(),
            group: buf.get_u32(),
            role: buf.get_u32(),
            status: buf.get_u32(),
        }),
        MSG_PROCESS_UPDATE => PeerBody::ProcessUpdate(ProcessUpdate {
            proc_type: buf.get_u32(),
            proc_id: buf.get_u32(),
            node_id: buf.get_u32(),
            status: buf.get_u32(),
        }),
        MSG_HA_UPDATE => PeerBody::HaUpdate(HaUpdate {
            node_id: buf.get_u32(),
            group: buf.get_u32(),
            role: buf.get_u32(),
        }),
        MSG_BINDING => {
            let kind = RecordKind::from_wire(buf.get_u32())
                .ok_or(ProtoError::Malformed("binding subscriber kind"))?;
            let subscriber_id = buf.get_u32();
            let num = buf.get_u32() as usize;
            if num > TLVS_PER_UPDATE {
                return Err(ProtoError::Malformed("binding count"));
            }
            let mut bindings = SmallVec::new();
            for _ in 0..num {
                bindings.push(Binding { subs_kind: buf.get_u32(), subs_id: buf.get_u32() });
            }
            PeerBody::Binding(BindingBatch {
                subscriber_kind: kind,
                subscriber_id,
                bindings,
            })
        }
        other => return Err(ProtoError::UnknownType(other)),
    };

    Ok(PeerFrame { hdr, body })
}

/// Stateful decoder for the peer TCP stream.
///
/// - `Ok(Some(frame))`: frame decoded
/// - `Ok(None)`: need more bytes
/// - `Err`: protocol violation; the caller decides the connection's fate
#[derive(Debug, Default)]
pub struct PeerDecoder {
    buf: BytesMut,
}

impl PeerDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next(&mut self) -> Result<Option<PeerFrame>> {
        if self.buf.len() < 8 {
            return Ok(None);
        }
        let msg_type = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
        let len = frame_len(msg_type).ok_or(ProtoError::UnknownType(msg_type))?;
        if self.buf.len() < len {
            return Ok(None);
        }
        let frame = self.buf.split_to(len);
        decode(&frame).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_survives_the_wire() {
        let body = PeerBody::Keepalive(Beacon { listen_port: 5000, num_nodes: 3, num_procs: 7 });
        let bytes = encode(1, 0x1122_3344, &body);
        assert_eq!(bytes.len(), frame_len(MSG_KEEPALIVE).unwrap());

        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.hdr.hw_id, 1);
        assert_eq!(frame.hdr.timestamp, 0x1122_3344);
        assert_eq!(frame.body, body);
    }

    #[test]
    fn header_integers_are_big_endian() {
        let body = PeerBody::Init(InitFlags { request: true, response_ok: false });
        let bytes = encode(0x0102_0304, 0, &body);
        assert_eq!(&bytes[0..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, MSG_INIT as u8]);
    }

    #[test]
    fn mixed_replay_chunk_preserves_record_order() {
        let mut records = SmallVec::new();
        records.push(ReplayRecord {
            kind: RecordKind::Node,
            group: 1,
            node_id: 42,
            role: 1,
            running: STATUS_ACTIVE,
            pid: 0,
        });
        records.push(ReplayRecord {
            kind: RecordKind::Process,
            group: 7,
            node_id: 42,
            role: 0,
            running: 0,
            pid: 0xBBBB,
        });
        let body = PeerBody::Replay(ReplayChunk { last: false, records });
        let bytes = encode(1, 0, &body);
        assert_eq!(bytes.len(), frame_len(MSG_REPLAY).unwrap());

        let frame = decode(&bytes).unwrap();
        let PeerBody::Replay(chunk) = frame.body else { panic!("not a replay") };
        assert_eq!(chunk.records.len(), 2);
        assert_eq!(chunk.records[0].kind, RecordKind::Node);
        assert_eq!(chunk.records[1].kind, RecordKind::Process);
        assert_eq!(chunk.records[1].pid, 0xBBBB);
    }

    #[test]
    fn oversized_record_count_is_rejected() {
        let body = PeerBody::Replay(ReplayChunk::default());
        let bytes = encode(1, 0, &body);
        let mut broken = bytes.to_vec();
        broken[HEADER_LEN + 3] = 9; // num_tlvs = 9
        assert!(matches!(decode(&broken), Err(ProtoError::Malformed(_))));
    }

    #[test]
    fn stream_decoder_handles_split_and_coalesced_frames() {
        let a = encode(1, 0, &PeerBody::Init(InitFlags { request: true, response_ok: false }));
        let b = encode(
            1,
            0,
            &PeerBody::NodeUpdate(NodeUpdate { node_id: 42, group: 1, role: 0, status: 1 }),
        );

        let mut dec = PeerDecoder::new();
        // First frame arrives in two pieces, second glued to its tail.
        dec.push(&a[..10]);
        assert!(dec.next().unwrap().is_none());
        let mut rest = a[10..].to_vec();
        rest.extend_from_slice(&b);
        dec.push(&rest);

        let f1 = dec.next().unwrap().unwrap();
        assert_eq!(f1.hdr.msg_type, MSG_INIT);
        let f2 = dec.next().unwrap().unwrap();
        assert_eq!(f2.hdr.msg_type, MSG_NODE_UPDATE);
        assert!(dec.next().unwrap().is_none());
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let mut bytes = encode(1, 0, &PeerBody::Init(InitFlags { request: true, response_ok: false })).to_vec();
        bytes[7] = 99;
        assert!(matches!(decode(&bytes), Err(ProtoError::UnknownType(99))));
    }

    #[test]
    fn binding_batch_round_trip() {
        let mut bindings = SmallVec::new();
        bindings.push(Binding { subs_kind: 2, subs_id: 7 });
        let body = PeerBody::Binding(BindingBatch {
            subscriber_kind: RecordKind::Process,
            subscriber_id: 0xAAAA,
            bindings,
        });
        let bytes = encode(1, 0, &body);
        assert_eq!(bytes.len(), frame_len(MSG_BINDING).unwrap());
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.body, body);
    }
}

//! Node-facing application codec.
//!
//! Header (20 bytes): `{msg_id, msg_len, msg_type, request, response_ok,
//! pad}`. `msg_len` covers the whole frame, which is how the stream
//! decoder cuts variable-length REGISTER frames. Responses reuse the
//! request's type with the flags flipped; rejections carry
//! `request=false, response_ok=false`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::error::{ProtoError, Result};

/// Node header length.
pub const HEADER_LEN: usize = 20;

/// Largest frame the decoder will accept. REGISTER is the only
/// variable-length type; this bounds it at ~500 TLVs.
pub const MAX_FRAME_LEN: usize = 4096;

pub const MSG_INIT: u32 = 1;
pub const MSG_KEEPALIVE: u32 = 2;
pub const MSG_REGISTER: u32 = 3;
pub const MSG_UNREGISTER: u32 = 4;
pub const MSG_PROCESS_CREATE: u32 = 5;
pub const MSG_PROCESS_DESTROY: u32 = 6;
pub const MSG_HA_UPDATE: u32 = 7;
pub const MSG_NOTIFY: u32 = 8;

/// NOTIFY types.
pub const NOTIFY_NODE_UP: u32 = 1;
pub const NOTIFY_NODE_DOWN: u32 = 2;
pub const NOTIFY_PROC_AVAILABLE: u32 = 3;
pub const NOTIFY_PROC_GONE: u32 = 4;
pub const NOTIFY_INTERFACE_ADD: u32 = 5;
pub const NOTIFY_INTERFACE_DELETE: u32 = 6;
pub const NOTIFY_HA_ROLE: u32 = 7;

/// Address families in `addr_info`.
pub const ADDR_TYPE_NONE: u32 = 0;
pub const ADDR_TYPE_TCP_V4: u32 = 1;
pub const ADDR_TYPE_TCP_V6: u32 = 2;

const PROC_NAME_LEN: usize = 24;
const ADDR_INFO_LEN: usize = 40;
const NOTIFY_LEN: usize = HEADER_LEN + 20 + ADDR_INFO_LEN;

/// Offset of `subs_pid` inside a NOTIFY frame, for per-subscriber
/// patching of a shared frame.
const NOTIFY_SUBS_PID_OFFSET: usize = HEADER_LEN + 8;

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub msg_id: u32,
    pub request: bool,
    pub response_ok: bool,
}

impl NodeHeader {
    #[must_use]
    pub const fn request(msg_id: u32) -> Self {
        Self { msg_id, request: true, response_ok: false }
    }

    #[must_use]
    pub const fn response(msg_id: u32, ok: bool) -> Self {
        Self { msg_id, request: false, response_ok: ok }
    }
}

/// One REGISTER TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterTlv {
    pub id: u32,
    pub cross_bind: bool,
}

/// REGISTER payload. `subs_kind` uses the shared subscription-kind wire
/// values; `subscriber_pid == 0` subscribes the node itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub subscriber_pid: u32,
    pub subs_kind: u32,
    pub tlvs: SmallVec<[RegisterTlv; 4]>,
}

/// PROCESS_CREATE / PROCESS_DESTROY payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub proc_type: u32,
    pub pid: u32,
    pub name: String,
}

/// Transport coordinates carried in a NOTIFY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrInfo {
    pub addr_type: u32,
    pub addr: [u8; 16],
    pub port: u32,
    pub hw_index: u32,
    pub group: u32,
    pub node_id: u32,
    pub role: u32,
}

impl AddrInfo {
    /// The "no transport known" placeholder.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            addr_type: ADDR_TYPE_NONE,
            addr: [0; 16],
            port: 0,
            hw_index: 0,
            group: 0,
            node_id: 0,
            role: 0,
        }
    }
}

/// NOTIFY payload. `id` carries the pid for process notifications and the
/// partner-present flag for HA_ROLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notify {
    pub notify_type: u32,
    pub id: u32,
    pub subs_pid: u32,
    pub if_id: u32,
    pub proc_type: u32,
    pub addr_info: AddrInfo,
}

/// Body of a node-facing frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBody {
    InitRequest { node_index: u32, group: u32, keepalive_ms: u32 },
    InitResponse { hardware_index: u32, role: u32, keepalive_ms: u32 },
    Keepalive,
    Register(Register),
    Unregister,
    ProcessCreate(ProcessInfo),
    ProcessDestroy(ProcessInfo),
    HaUpdate { node_index: u32, role: u32 },
    Notify(Notify),
}

impl NodeBody {
    #[must_use]
    pub const fn msg_type(&self) -> u32 {
        match self {
            Self::InitRequest { .. } | Self::InitResponse { .. } => MSG_INIT,
            Self::Keepalive => MSG_KEEPALIVE,
            Self::Register(_) => MSG_REGISTER,
            Self::Unregister => MSG_UNREGISTER,
            Self::ProcessCreate(_) => MSG_PROCESS_CREATE,
            Self::ProcessDestroy(_) => MSG_PROCESS_DESTROY,
            Self::HaUpdate { .. } => MSG_HA_UPDATE,
            Self::Notify(_) => MSG_NOTIFY,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Self::InitRequest { .. } | Self::InitResponse { .. } => 12,
            Self::Keepalive | Self::Unregister => 0,
            Self::Register(r) => 12 + r.tlvs.len() * 8,
            Self::ProcessCreate(_) | Self::ProcessDestroy(_) => 8 + PROC_NAME_LEN,
            Self::HaUpdate { .. } => 8,
            Self::Notify(_) => 20 + ADDR_INFO_LEN,
        }
    }
}

/// A decoded node-facing frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFrame {
    pub hdr: NodeHeader,
    pub body: NodeBody,
}

/// Encode a frame.
#[must_use]
pub fn encode(hdr: NodeHeader, body: &NodeBody) -> Bytes {
    let len = HEADER_LEN + body.body_len();
    let mut out = BytesMut::with_capacity(len);

    out.put_u32(hdr.msg_id);
    out.put_u32(len as u32);
    out.put_u32(body.msg_type());
    out.put_u8(u8::from(hdr.request));
    out.put_u8(u8::from(hdr.response_ok));
    out.put_u16(0);

    match body {
        NodeBody::InitRequest { node_index, group, keepalive_ms } => {
            out.put_u32(*node_index);
            out.put_u32(*group);
            out.put_u32(*keepalive_ms);
        }
        NodeBody::InitResponse { hardware_index, role, keepalive_ms } => {
            out.put_u32(*hardware_index);
            out.put_u32(*role);
            out.put_u32(*keepalive_ms);
        }
        NodeBody::Keepalive | NodeBody::Unregister => {}
        NodeBody::Register(r) => {
            out.put_u32(r.subscriber_pid);
            out.put_u32(r.subs_kind);
            out.put_u32(r.tlvs.len() as u32);
            for tlv in &r.tlvs {
                out.put_u32(tlv.id);
                out.put_u32(u32::from(tlv.cross_bind));
            }
        }
        NodeBody::ProcessCreate(p) | NodeBody::ProcessDestroy(p) => {
            out.put_u32(p.proc_type);
            out.put_u32(p.pid);
            let mut name = [0u8; PROC_NAME_LEN];
            let n = p.name.len().min(PROC_NAME_LEN - 1);
            name[..n].copy_from_slice(&p.name.as_bytes()[..n]);
            out.put_slice(&name);
        }
        NodeBody::HaUpdate { node_index, role } => {
            out.put_u32(*node_index);
            out.put_u32(*role);
        }
        NodeBody::Notify(n) => {
            out.put_u32(n.notify_type);
            out.put_u32(n.id);
            out.put_u32(n.subs_pid);
            out.put_u32(n.if_id);
            out.put_u32(n.proc_type);
            out.put_u32(n.addr_info.addr_type);
            out.put_slice(&n.addr_info.addr);
            out.put_u32(n.addr_info.port);
            out.put_u32(n.addr_info.hw_index);
            out.put_u32(n.addr_info.group);
            out.put_u32(n.addr_info.node_id);
            out.put_u32(n.addr_info.role);
        }
    }

    debug_assert_eq!(out.len(), len);
    out.freeze()
}

/// Copy a NOTIFY frame with its `subs_pid` field replaced. The base frame
/// is built once per notification and patched per subscriber.
#[must_use]
pub fn notify_with_subs_pid(frame: &Bytes, subs_pid: u32) -> Bytes {
    debug_assert_eq!(frame.len(), NOTIFY_LEN);
    let mut out = BytesMut::from(frame.as_ref());
    out[NOTIFY_SUBS_PID_OFFSET..NOTIFY_SUBS_PID_OFFSET + 4]
        .copy_from_slice(&subs_pid.to_be_bytes());
    out.freeze()
}

/// Decode one complete frame.
pub fn decode(frame: &[u8]) -> Result<NodeFrame> {
    if frame.len() < HEADER_LEN {
        return Err(ProtoError::Incomplete);
    }
    let mut buf = frame;
    let msg_id = buf.get_u32();
    let msg_len = buf.get_u32() as usize;
    let msg_type = buf.get_u32();
    let request = buf.get_u8() != 0;
    let response_ok = buf.get_u8() != 0;
    let _pad = buf.get_u16();

    if msg_len < HEADER_LEN || msg_len > MAX_FRAME_LEN || frame.len() < msg_len {
        return Err(ProtoError::BadLength { msg_type, len: msg_len });
    }
    let hdr = NodeHeader { msg_id, request, response_ok };
    let body_len = msg_len - HEADER_LEN;

    let body = match msg_type {
        MSG_INIT => {
            if body_len != 12 {
                return Err(ProtoError::BadLength { msg_type, len: msg_len });
            }
            let (a, b, c) = (buf.get_u32(), buf.get_u32(), buf.get_u32());
            if request {
                NodeBody::InitRequest { node_index: a, group: b, keepalive_ms: c }
            } else {
                NodeBody::InitResponse { hardware_index: a, role: b, keepalive_ms: c }
            }
        }
        MSG_KEEPALIVE => NodeBody::Keepalive,
        MSG_REGISTER => {
            if body_len < 12 {
                return Err(ProtoError::BadLength { msg_type, len: msg_len });
            }
            let subscriber_pid = buf.get_u32();
            let subs_kind = buf.get_u32();
            let num = buf.get_u32() as usize;
            if body_len != 12 + num * 8 {
                return Err(ProtoError::Malformed("register tlv count"));
            }
            let mut tlvs = SmallVec::new();
            for _ in 0..num {
                tlvs.push(RegisterTlv { id: buf.get_u32(), cross_bind: buf.get_u32() != 0 });
            }
            NodeBody::Register(Register { subscriber_pid, subs_kind, tlvs })
        }
        MSG_UNREGISTER => NodeBody::Unregister,
        MSG_PROCESS_CREATE | MSG_PROCESS_DESTROY => {
            if body_len != 8 + PROC_NAME_LEN {
                return Err(ProtoError::BadLength { msg_type, len: msg_len });
            }
            let proc_type = buf.get_u32();
            let pid = buf.get_u32();
            let mut name = [0u8; PROC_NAME_LEN];
            buf.copy_to_slice(&mut name);
            let end = name.iter().position(|b| *b == 0).unwrap_or(PROC_NAME_LEN);
            let info = ProcessInfo {
                proc_type,
                pid,
                name: String::from_utf8_lossy(&name[..end]).into_owned(),
            };
            if msg_type == MSG_PROCESS_CREATE {
                NodeBody::ProcessCreate(info)
            } else {
                NodeBody::ProcessDestroy(info)
            }
        }
        MSG_HA_UPDATE => {
            if body_len != 8 {
                return Err(ProtoError::BadLength { msg_type, len: msg_len });
            }
            NodeBody::HaUpdate { node_index: buf.get_u32(), role: buf.get_u32() }
        }
        MSG_NOTIFY => {
            if body_len != 20 + ADDR_INFO_LEN {
                return Err(ProtoError::BadLength { msg_type, len: msg_len });
            }
            let notify_type = buf.get_u32();
            let id = buf.get_u32();
            let subs_pid = buf.get_u32();
            let if_id = buf.get_u32();
            let proc_type = buf.get_u32();
            let addr_type = buf.get_u32();
            let mut addr = [0u8; 16];
            buf.copy_to_slice(&mut addr);
            NodeBody::Notify(Notify {
                notify_type,
                id,
                subs_pid,
                if_id,
                proc_type,
                addr_info: AddrInfo {
                    addr_type,
                    addr,
                    port: buf.get_u32(),
                    hw_index: buf.get_u32(),
                    group: buf.get_u32(),
                    node_id: buf.get_u32(),
                    role: buf.get_u32(),
                },
            })
        }
        other => return Err(ProtoError::UnknownType(other)),
    };

    Ok(NodeFrame { hdr, body })
}

/// Stateful decoder for a node TCP stream.
#[derive(Debug, Default)]
pub struct NodeDecoder {
    buf: BytesMut,
}

impl NodeDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next(&mut self) -> Result<Option<NodeFrame>> {
        if self.buf.len() < 8 {
            return Ok(None);
        }
        let msg_len =
            u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if msg_len < HEADER_LEN || msg_len > MAX_FRAME_LEN {
            return Err(ProtoError::BadLength { msg_type: 0, len: msg_len });
        }
        if self.buf.len() < msg_len {
            return Ok(None);
        }
        let frame = self.buf.split_to(msg_len);
        decode(&frame).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_exchange_round_trip() {
        let req = NodeBody::InitRequest { node_index: 42, group: 1, keepalive_ms: 1000 };
        let bytes = encode(NodeHeader::request(1), &req);
        let frame = decode(&bytes).unwrap();
        assert!(frame.hdr.request);
        assert_eq!(frame.body, req);

        let rsp = NodeBody::InitResponse { hardware_index: 1, role: 1, keepalive_ms: 1000 };
        let bytes = encode(NodeHeader::response(1, true), &rsp);
        let frame = decode(&bytes).unwrap();
        assert!(frame.hdr.response_ok);
        assert_eq!(frame.body, rsp);
    }

    #[test]
    fn register_with_tlvs_round_trip() {
        let mut tlvs = SmallVec::new();
        tlvs.push(RegisterTlv { id: 7, cross_bind: true });
        tlvs.push(RegisterTlv { id: 9, cross_bind: false });
        let body = NodeBody::Register(Register { subscriber_pid: 0xAAAA, subs_kind: 2, tlvs });

        let bytes = encode(NodeHeader::request(5), &body);
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.body, body);
    }

    #[test]
    fn register_tlv_count_must_match_length() {
        let body = NodeBody::Register(Register {
            subscriber_pid: 1,
            subs_kind: 2,
            tlvs: SmallVec::new(),
        });
        let mut bytes = encode(NodeHeader::request(5), &body).to_vec();
        // Claim one TLV without carrying it.
        bytes[HEADER_LEN + 11] = 1;
        assert!(matches!(decode(&bytes), Err(ProtoError::Malformed(_))));
    }

    #[test]
    fn process_name_is_nul_padded() {
        let body = NodeBody::ProcessCreate(ProcessInfo {
            proc_type: 7,
            pid: 0xBBBB,
            name: "pktmgr".into(),
        });
        let bytes = encode(NodeHeader::request(2), &body);
        let frame = decode(&bytes).unwrap();
        let NodeBody::ProcessCreate(info) = frame.body else { panic!("wrong body") };
        assert_eq!(info.name, "pktmgr");
    }

    #[test]
    fn notify_subs_pid_patch_leaves_rest_intact() {
        let body = NodeBody::Notify(Notify {
            notify_type: NOTIFY_PROC_AVAILABLE,
            id: 0xBBBB,
            subs_pid: 0,
            if_id: 0,
            proc_type: 7,
            addr_info: AddrInfo { addr_type: ADDR_TYPE_TCP_V4, ..AddrInfo::none() },
        });
        let base = encode(NodeHeader::request(9), &body);
        let patched = notify_with_subs_pid(&base, 0xAAAA);

        let frame = decode(&patched).unwrap();
        let NodeBody::Notify(n) = frame.body else { panic!("wrong body") };
        assert_eq!(n.subs_pid, 0xAAAA);
        assert_eq!(n.id, 0xBBBB);
        assert_eq!(n.proc_type, 7);
    }

    #[test]
    fn stream_decoder_waits_for_full_register() {
        let mut tlvs = SmallVec::new();
        tlvs.push(RegisterTlv { id: 7, cross_bind: true });
        let body = NodeBody::Register(Register { subscriber_pid: 1, subs_kind: 1, tlvs });
        let bytes = encode(NodeHeader::request(5), &body);

        let mut dec = NodeDecoder::new();
        dec.push(&bytes[..HEADER_LEN + 3]);
        assert!(dec.next().unwrap().is_none());
        dec.push(&bytes[HEADER_LEN + 3..]);
        let frame = dec.next().unwrap().unwrap();
        assert_eq!(frame.body, body);
    }

    #[test]
    fn absurd_length_kills_the_frame() {
        let bytes = encode(NodeHeader::request(1), &NodeBody::Keepalive);
        let mut broken = bytes.to_vec();
        broken[4] = 0xFF; // msg_len high byte
        let mut dec = NodeDecoder::new();
        dec.push(&broken);
        assert!(dec.next().is_err());
    }
}

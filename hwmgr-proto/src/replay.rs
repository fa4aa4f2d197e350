//! Replay chunk builder.
//!
//! A replay transfers one location's inventory to a peer: every known
//! node first (running or not; a peer that later sees a FAILED update for
//! a node must already have the entry), then only the running processes.
//! Records pack five to a chunk; the last node chunk is topped up with
//! process records rather than padded, so a chunk may mix kinds. The
//! receiver walks records in on-wire order, which is why the node-before-
//! process rule is load-bearing. The sequence always ends with an empty
//! `last=1` chunk.

use smallvec::SmallVec;

use crate::peer::{RecordKind, ReplayChunk, ReplayRecord, TLVS_PER_UPDATE};

/// A node entry to replay.
#[derive(Debug, Clone, Copy)]
pub struct ReplayNode {
    pub node_id: u32,
    pub group: u32,
    pub role: u32,
    pub active: bool,
}

/// A running process entry to replay.
#[derive(Debug, Clone, Copy)]
pub struct ReplayProcess {
    pub proc_type: u32,
    pub node_id: u32,
    pub pid: u32,
}

/// Build the full chunk sequence for one replay session.
#[must_use]
pub fn build_chunks(nodes: &[ReplayNode], procs: &[ReplayProcess]) -> Vec<ReplayChunk> {
    let mut chunks = Vec::new();
    let mut records: SmallVec<[ReplayRecord; TLVS_PER_UPDATE]> = SmallVec::new();

    let node_records = nodes.iter().map(|n| ReplayRecord {
        kind: RecordKind::Node,
        group: n.group,
        node_id: n.node_id,
        role: n.role,
        running: u32::from(n.active),
        pid: 0,
    });
    let proc_records = procs.iter().map(|p| ReplayRecord {
        kind: RecordKind::Process,
        group: p.proc_type,
        node_id: p.node_id,
        role: 0,
        running: 1,
        pid: p.pid,
    });

    for record in node_records.chain(proc_records) {
        records.push(record);
        if records.len() == TLVS_PER_UPDATE {
            chunks.push(ReplayChunk { last: false, records: std::mem::take(&mut records) });
        }
    }
    if !records.is_empty() {
        chunks.push(ReplayChunk { last: false, records });
    }

    chunks.push(ReplayChunk { last: true, records: SmallVec::new() });
    chunks
}

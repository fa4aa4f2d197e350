//! Node-side engine paths: INIT handshake, keepalives, registration,
//! process lifecycle and the node FSM driver.

use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use hwmgr_core::fsm::node::{NodeAction, NodeInput};
use hwmgr_core::globaldb::GlobalStatus;
use hwmgr_core::ids::{
    EntityId, GroupIndex, NodeIndex, NodeRole, Pid, ProcType, ProcessKey, SubsKind,
    TransportId,
};
use hwmgr_core::model::{NodeRecord, ProcessRecord};
use hwmgr_proto::node::{
    self as node_proto, NodeBody, NodeFrame, NodeHeader, ProcessInfo, Register,
};
use hwmgr_proto::peer::{Binding, BindingBatch, PeerBody, RecordKind, TLVS_PER_UPDATE};

use super::Cluster;
use crate::config::ConfigNode;
use crate::transport::TransportOwner;

impl Cluster {
    /// Install one configured node: record, timer, global row,
    /// subscription hooks, then the CREATE leg of its FSM.
    pub(crate) fn add_local_node(&mut self, cfg: &ConfigNode) {
        let ix = NodeIndex(cfg.index);
        let group = GroupIndex(cfg.group);
        info!(node = %ix, group = cfg.group, name = %cfg.name, "configuring local node");

        let mut node = NodeRecord::new(ix, group, cfg.name.clone(), cfg.role.into(), self.local);
        node.keepalive_period_ms = self.node_keepalive_ms as u32;
        let timer = self.timers.create(self.node_keepalive_ms, true);
        node.keepalive_timer = Some(timer);
        self.node_timers.insert(timer, ix);

        let Some(home) = self.locations.get_mut(&self.local) else { return };
        if !home.add_node(node) {
            warn!(node = %ix, "duplicate node in configuration");
            return;
        }
        if let Err(err) =
            self.db
                .add_node(ix, self.local, group, NodeRole::None, GlobalStatus::Inactive)
        {
            warn!(node = %ix, %err, "global node row");
            return;
        }
        self.subs.on_node_added(ix, group, &self.db, &mut self.notify);
        self.run_node_fsm(ix, NodeInput::Create);
    }

    /// Run one input through a local node's FSM and execute the actions.
    pub(crate) fn run_node_fsm(&mut self, ix: NodeIndex, input: NodeInput) {
        let actions = {
            let Some(node) = self.locations.get_mut(&self.local).and_then(|l| l.node_mut(ix))
            else {
                return;
            };
            match node.fsm.step(input) {
                Ok(actions) => actions,
                Err(err) => {
                    warn!(node = %ix, %err, "node fsm rejected input");
                    return;
                }
            }
        };

        let mut escalate: Option<NodeInput> = None;
        for action in actions {
            match action {
                NodeAction::ArmInitTimer => {
                    if let Some(timer) = self.node_record(ix).and_then(|n| n.keepalive_timer) {
                        self.timers.modify(timer, self.node_keepalive_ms);
                        self.timers.start(timer);
                    }
                }
                NodeAction::StopTimer => {
                    if let Some(timer) = self.node_record(ix).and_then(|n| n.keepalive_timer) {
                        self.timers.stop(timer);
                    }
                }
                NodeAction::SendInitResponse => self.send_init_response(ix),
                NodeAction::StartKeepalive => {
                    self.send_node_keepalive(ix);
                    if let Some(node) =
                        self.locations.get_mut(&self.local).and_then(|l| l.node_mut(ix))
                    {
                        node.keepalive_missed += 1;
                    }
                    if let Some(timer) = self.node_record(ix).and_then(|n| n.keepalive_timer) {
                        self.timers.start(timer);
                    }
                }
                NodeAction::IncrementActiveNodes => {
                    if let Some(home) = self.locations.get_mut(&self.local) {
                        home.incr_active_nodes();
                    }
                }
                NodeAction::DecrementActiveNodes => {
                    if let Some(home) = self.locations.get_mut(&self.local) {
                        home.decr_active_nodes();
                    }
                }
                NodeAction::DispatchData => {
                    // Application payloads belong to the node-side stack.
                    trace!(node = %ix, "data frame dispatched");
                }
                NodeAction::MarkProcessesDown => self.mark_node_processes_down(ix),
                NodeAction::KeepaliveTick => {
                    self.send_node_keepalive(ix);
                    let missed = {
                        let Some(node) =
                            self.locations.get_mut(&self.local).and_then(|l| l.node_mut(ix))
                        else {
                            continue;
                        };
                        node.keepalive_missed += 1;
                        node.keepalive_missed
                    };
                    if missed >= self.node_threshold {
                        warn!(node = %ix, missed, "node keepalive threshold crossed");
                        escalate = Some(NodeInput::Timeout);
                    }
                }
                NodeAction::PublishRunStatus => self.publish_node_status(ix),
                NodeAction::CloseTransport => {
                    let tid = self
                        .locations
                        .get_mut(&self.local)
                        .and_then(|l| l.node_mut(ix))
                        .and_then(|n| n.transport.take());
                    if let Some(tid) = tid {
                        if let Some(mut t) = self.transports.remove(tid) {
                            t.close();
                        }
                    }
                }
            }
        }

        if let Some(input) = escalate {
            self.run_node_fsm(ix, input);
        }
    }

    /// One decoded frame from a node-facing transport.
    pub(crate) fn handle_node_frame(&mut self, transport: TransportId, frame: NodeFrame) {
        let owner = self.transports.get(transport).and_then(|t| t.owner);

        match frame.body {
            NodeBody::InitRequest { node_index, group, keepalive_ms } => {
                self.on_node_init(transport, node_index, group, keepalive_ms);
            }
            NodeBody::Keepalive => {
                if let Some(TransportOwner::Node(ix)) = owner {
                    if let Some(node) =
                        self.locations.get_mut(&self.local).and_then(|l| l.node_mut(ix))
                    {
                        node.keepalive_missed = node.keepalive_missed.saturating_sub(1);
                    }
                }
            }
            NodeBody::Register(register) => {
                if let Some(TransportOwner::Node(ix)) = owner {
                    self.on_register(transport, ix, frame.hdr.msg_id, register);
                } else {
                    warn!(?transport, "REGISTER before INIT");
                }
            }
            NodeBody::ProcessCreate(info) => {
                if let Some(TransportOwner::Node(ix)) = owner {
                    self.on_process_create(transport, ix, frame.hdr.msg_id, info);
                }
            }
            NodeBody::ProcessDestroy(info) => {
                if let Some(TransportOwner::Node(ix)) = owner {
                    self.on_process_destroy(transport, ix, frame.hdr.msg_id, info);
                }
            }
            NodeBody::HaUpdate { node_index, role } => {
                if let Some(TransportOwner::Node(ix)) = owner {
                    if ix.0 != node_index {
                        warn!(node = %ix, claimed = node_index, "HA update for foreign node");
                        return;
                    }
                    self.on_node_ha_update(ix, NodeRole::from_wire(role));
                }
            }
            NodeBody::Unregister => {
                // Recognized but unsupported; explicit rejection.
                let rsp = node_proto::encode(
                    NodeHeader::response(frame.hdr.msg_id, false),
                    &NodeBody::Unregister,
                );
                self.transports.enqueue_priority(transport, rsp);
            }
            NodeBody::InitResponse { .. } | NodeBody::Notify(_) => {
                warn!(?transport, "unexpected message direction from node");
            }
        }
    }

    /// INIT_REQUEST on an accepted node socket: match it to a configured
    /// node and drive the FSM.
    fn on_node_init(
        &mut self,
        transport: TransportId,
        node_index: u32,
        group: u32,
        keepalive_ms: u32,
    ) {
        let ix = NodeIndex(node_index);
        info!(node = %ix, group, keepalive_ms, "node INIT request");

        let Some(node) = self.locations.get(&self.local).and_then(|l| l.node(ix)) else {
            warn!(node = %ix, "INIT from unconfigured node; ignored");
            return;
        };
        if node.group.0 != group {
            warn!(
                node = %ix,
                configured = node.group.0,
                reported = group,
                "group mismatch; INIT ignored"
            );
            return;
        }

        if let Some(t) = self.transports.get_mut(transport) {
            t.owner = Some(TransportOwner::Node(ix));
        }
        if let Some(node) = self.locations.get_mut(&self.local).and_then(|l| l.node_mut(ix)) {
            node.transport = Some(transport);
        }
        self.run_node_fsm(ix, NodeInput::Init);
    }

    fn send_init_response(&mut self, ix: NodeIndex) {
        let Some(node) = self.locations.get(&self.local).and_then(|l| l.node(ix)) else {
            return;
        };
        let Some(tid) = node.transport else { return };
        let body = NodeBody::InitResponse {
            hardware_index: self.local.0,
            role: node.current_role.to_wire(),
            keepalive_ms: node.keepalive_period_ms,
        };
        let frame = node_proto::encode(NodeHeader::response(0, true), &body);
        self.transports.enqueue_priority(tid, frame);
    }

    fn send_node_keepalive(&mut self, ix: NodeIndex) {
        let Some(tid) = self.node_record(ix).and_then(|n| n.transport) else { return };
        let frame = node_proto::encode(NodeHeader::request(0), &NodeBody::Keepalive);
        self.transports.enqueue(tid, frame);
    }

    /// REGISTER: resolve the subscriber, hold the transport, apply every
    /// TLV, respond, then propagate the cross-bound subset to the peers.
    fn on_register(
        &mut self,
        transport: TransportId,
        ix: NodeIndex,
        msg_id: u32,
        register: Register,
    ) {
        let Some(kind) = SubsKind::from_wire(register.subs_kind) else {
            warn!(node = %ix, kind = register.subs_kind, "REGISTER with unknown kind");
            self.respond_register(transport, msg_id, &register, false);
            return;
        };
        if register.tlvs.is_empty() {
            warn!(node = %ix, "REGISTER without TLVs");
            self.respond_register(transport, msg_id, &register, false);
            return;
        }

        // Process-level subscriptions fall back to the node when the pid
        // is unknown.
        let subscriber = if register.subscriber_pid != 0 {
            let pid = Pid(register.subscriber_pid);
            self.locations
                .get(&self.local)
                .and_then(|l| l.node(ix))
                .and_then(|n| n.processes.values().find(|p| p.pid == pid))
                .map_or_else(
                    || {
                        warn!(node = %ix, pid = pid.0, "subscriber pid not found; using node");
                        EntityId::Node(ix)
                    },
                    |p| EntityId::Process(p.key(ix)),
                )
        } else {
            EntityId::Node(ix)
        };
        debug!(node = %ix, ?kind, tlvs = register.tlvs.len(), "processing REGISTER");

        // Hold the transport so subscription-triggered notifications
        // cannot race the response.
        if let Some(t) = self.transports.get_mut(transport) {
            t.hold = true;
        }
        for tlv in &register.tlvs {
            self.subs.subscribe(
                kind,
                tlv.id,
                subscriber,
                tlv.cross_bind,
                &self.db,
                &mut self.notify,
            );
        }
        self.respond_register(transport, msg_id, &register, true);

        // Cross-bound TLVs travel to every peer as BINDING batches.
        let bindings: Vec<Binding> = register
            .tlvs
            .iter()
            .filter(|t| t.cross_bind)
            .map(|t| Binding { subs_kind: register.subs_kind, subs_id: t.id })
            .collect();
        if !bindings.is_empty() {
            let (subscriber_kind, subscriber_id) = match subscriber {
                EntityId::Node(n) => (RecordKind::Node, n.0),
                EntityId::Process(k) => (RecordKind::Process, k.pid.0),
                EntityId::Location(l) => (RecordKind::Node, l.0),
            };
            for chunk in bindings.chunks(TLVS_PER_UPDATE) {
                let batch = BindingBatch {
                    subscriber_kind,
                    subscriber_id,
                    bindings: SmallVec::from_slice(chunk),
                };
                self.send_to_peers(&PeerBody::Binding(batch));
            }
        }

        self.drain_notifications();
    }

    fn respond_register(
        &mut self,
        transport: TransportId,
        msg_id: u32,
        register: &Register,
        ok: bool,
    ) {
        let frame = node_proto::encode(
            NodeHeader::response(msg_id, ok),
            &NodeBody::Register(register.clone()),
        );
        self.transports.enqueue_priority(transport, frame);
    }

    fn on_process_create(
        &mut self,
        transport: TransportId,
        ix: NodeIndex,
        msg_id: u32,
        info: ProcessInfo,
    ) {
        let key = ProcessKey { ptype: ProcType(info.proc_type), node: ix, pid: Pid(info.pid) };
        info!(%key, name = %info.name, "process created");

        let mut is_new = false;
        {
            let Some(home) = self.locations.get_mut(&self.local) else { return };
            let Some(node) = home.node_mut(ix) else { return };
            match node.process(key.ptype, key.pid).map(|p| p.running) {
                Some(true) => {
                    warn!(%key, "duplicate PROCESS_CREATE");
                }
                Some(false) => {
                    if let Some(proc) = node.process_mut(key.ptype, key.pid) {
                        proc.running = true;
                        proc.name = info.name.clone();
                    }
                    home.incr_active_processes();
                }
                None => {
                    let mut proc = ProcessRecord::new(key.ptype, key.pid, info.name.clone());
                    proc.running = true;
                    node.processes.insert((key.ptype, key.pid), proc);
                    home.incr_active_processes();
                    is_new = true;
                }
            }
        }

        let ack = node_proto::encode(
            NodeHeader::response(msg_id, true),
            &NodeBody::ProcessCreate(info),
        );
        self.transports.enqueue_priority(transport, ack);

        if is_new {
            if let Err(err) = self.db.add_process(key, self.local, GlobalStatus::Running) {
                warn!(%key, %err, "global process row");
                return;
            }
            self.subs.on_process_added(key, &self.db, &mut self.notify);
        }
        self.publish_process_status(key);
    }

    fn on_process_destroy(
        &mut self,
        transport: TransportId,
        ix: NodeIndex,
        msg_id: u32,
        info: ProcessInfo,
    ) {
        let key = ProcessKey { ptype: ProcType(info.proc_type), node: ix, pid: Pid(info.pid) };
        info!(%key, "process destroyed");

        let known = {
            let Some(home) = self.locations.get_mut(&self.local) else { return };
            let Some(node) = home.node_mut(ix) else { return };
            match node.process(key.ptype, key.pid).map(|p| p.running) {
                Some(true) => {
                    if let Some(proc) = node.process_mut(key.ptype, key.pid) {
                        proc.running = false;
                    }
                    home.decr_active_processes();
                    true
                }
                Some(false) => true,
                None => false,
            }
        };

        let ack = node_proto::encode(
            NodeHeader::response(msg_id, known),
            &NodeBody::ProcessDestroy(info),
        );
        self.transports.enqueue_priority(transport, ack);

        if known {
            self.publish_process_status(key);
        }
    }

    /// The node asserted a role of its own accord: adopt it, persist it,
    /// tell the cluster.
    fn on_node_ha_update(&mut self, ix: NodeIndex, role: NodeRole) {
        info!(node = %ix, ?role, "node-initiated role update");
        let group = {
            let Some(node) = self.locations.get_mut(&self.local).and_then(|l| l.node_mut(ix))
            else {
                return;
            };
            node.desired_role = role;
            node.current_role = role;
            node.group
        };
        self.publish_node_role(ix);
        self.resolve_ha_group(group);
    }

    /// Per-node timer fired: INIT window in WAITING, keepalive duty in
    /// ACTIVE.
    pub(crate) fn on_node_timer(&mut self, ix: NodeIndex) {
        trace!(node = %ix, "node timer pop");
        self.run_node_fsm(ix, NodeInput::TimerPop);
    }

    /// Every running process of a failing node goes down, each with its
    /// own notification.
    pub(crate) fn mark_node_processes_down(&mut self, ix: NodeIndex) {
        let keys: Vec<ProcessKey> = self
            .locations
            .get(&self.local)
            .and_then(|l| l.node(ix))
            .map(|n| {
                n.processes.values().filter(|p| p.running).map(|p| p.key(ix)).collect()
            })
            .unwrap_or_default();

        for key in keys {
            {
                let Some(home) = self.locations.get_mut(&self.local) else { return };
                if let Some(proc) =
                    home.node_mut(ix).and_then(|n| n.process_mut(key.ptype, key.pid))
                {
                    proc.running = false;
                }
                home.decr_active_processes();
            }
            self.publish_process_status(key);
        }
    }

    fn node_record(&self, ix: NodeIndex) -> Option<&NodeRecord> {
        self.locations.get(&self.local).and_then(|l| l.node(ix))
    }
}

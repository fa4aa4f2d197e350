//! Cluster-side engine paths: beacons, peer sessions, replay, incremental
//! updates and binding propagation.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, trace, warn};

use hwmgr_core::error::HwmError;
use hwmgr_core::fsm::node::NodeState;
use hwmgr_core::fsm::peer::{PeerAction, PeerInput};
use hwmgr_core::globaldb::{GlobalDb, GlobalStatus};
use hwmgr_core::ids::{
    EntityId, GroupIndex, LocationIndex, NodeIndex, NodeRole, Pid, ProcType, ProcessKey,
    SubsKind,
};
use hwmgr_core::model::{LocationRecord, NodeRecord, ProcessRecord};
use hwmgr_core::notify::{NotifyKind, NotifyScope};
use hwmgr_proto::peer::{
    self as peer_proto, Beacon, BindingBatch, HaUpdate, InitFlags, NodeUpdate, PeerBody,
    PeerFrame, ProcessUpdate, RecordKind, ReplayChunk, ReplayRecord, STATUS_ACTIVE,
};
use hwmgr_proto::replay::{self, ReplayNode, ReplayProcess};

use super::Cluster;
use crate::transport::{TransportKind, TransportOwner};

impl Cluster {
    /// A multicast beacon arrived.
    pub(crate) fn handle_beacon(&mut self, data: &[u8], from: SocketAddr) {
        let frame = match peer_proto::decode(data) {
            Ok(f) => f,
            Err(err) => {
                warn!(%from, %err, "undecodable beacon");
                return;
            }
        };
        let PeerBody::Keepalive(beacon) = frame.body else {
            warn!(%from, msg_type = frame.hdr.msg_type, "non-keepalive on beacon socket");
            return;
        };
        let ix = LocationIndex(frame.hdr.hw_id);
        if ix == self.local {
            return;
        }

        match self.locations.get(&ix).map(|l| l.fsm.state()) {
            None => self.discover_location(ix, &beacon, from),
            Some(hwmgr_core::fsm::peer::PeerState::Failed) => {
                info!(location = %ix, "failed location beaconing again; reconnecting");
                self.open_peer_session(ix, &beacon, from);
            }
            Some(_) => self.beacon_from_known(ix, &beacon),
        }
    }

    /// First beacon from an unknown location: allocate the record and
    /// start the outbound session.
    fn discover_location(&mut self, ix: LocationIndex, beacon: &Beacon, from: SocketAddr) {
        info!(location = %ix, %from, "new location detected");

        let mut loc = LocationRecord::new(ix, false);
        loc.keepalive_period_ms = self.peer_keepalive_ms as u32;
        self.locations.insert(ix, loc);
        self.open_peer_session(ix, beacon, from);
    }

    /// Allocate the outbound transport for a peer and kick off the
    /// non-blocking connect.
    fn open_peer_session(&mut self, ix: LocationIndex, beacon: &Beacon, from: SocketAddr) {
        let tid = self.transports.create(TransportKind::PeerOut);
        let remote = SocketAddr::new(from.ip(), beacon.listen_port as u16);
        if let Some(t) = self.transports.get_mut(tid) {
            t.owner = Some(TransportOwner::Peer(ix));
            t.remote = Some(remote);
        }
        if let Some(loc) = self.locations.get_mut(&ix) {
            loc.peer_listen_transport = Some(tid);
        }

        self.run_peer_fsm(ix, PeerInput::Connect);
        if self.io_enabled {
            crate::sock::spawn_connector(tid, remote, self.tx.clone());
        }
    }

    /// Beacon bookkeeping for a location we already track: liveness
    /// credit plus drift detection against our mirror of the peer.
    fn beacon_from_known(&mut self, ix: LocationIndex, beacon: &Beacon) {
        let Some(loc) = self.locations.get_mut(&ix) else { return };
        if !loc.fsm.is_active() {
            trace!(location = %ix, "beacon while session not active");
            return;
        }
        loc.keepalive_missed = loc.keepalive_missed.saturating_sub(1);

        if loc.replay_in_progress {
            trace!(location = %ix, "replay in progress; counts will converge");
            return;
        }
        if beacon.num_nodes != loc.active_nodes() || beacon.num_procs != loc.active_processes()
        {
            warn!(
                location = %ix,
                advertised = beacon.num_nodes,
                mirrored = loc.active_nodes(),
                "peer state drift; replaying"
            );
            loc.replay_in_progress = true;
            if let Err(err) = self.start_replay_to(ix) {
                warn!(location = %ix, %err, "replay not started");
            }
        }
    }

    /// Run one input through a location's FSM and execute the actions.
    pub(crate) fn run_peer_fsm(&mut self, ix: LocationIndex, input: PeerInput) {
        let actions = {
            let Some(loc) = self.locations.get_mut(&ix) else { return };
            match loc.fsm.step(input) {
                Ok(actions) => actions,
                Err(err) => {
                    warn!(location = %ix, %err, "peer fsm rejected input");
                    return;
                }
            }
        };

        for action in actions {
            match action {
                PeerAction::SendInitRequest => {
                    let body = PeerBody::Init(InitFlags { request: true, response_ok: false });
                    let frame = peer_proto::encode(self.local.0, 0, &body);
                    if let Some(tid) =
                        self.locations.get(&ix).and_then(|l| l.peer_listen_transport)
                    {
                        self.transports.enqueue(tid, frame);
                    }
                }
                PeerAction::StartReplay => {
                    if let Some(loc) = self.locations.get_mut(&ix) {
                        loc.replay_in_progress = true;
                    }
                    if let Err(err) = self.start_replay_to(ix) {
                        warn!(location = %ix, %err, "replay not started");
                    }
                }
                PeerAction::PublishLocationActive => self.publish_location_status(ix, true),
                PeerAction::FailAllNodes => self.fail_all_nodes(ix),
                PeerAction::PublishLocationInactive => self.publish_location_status(ix, false),
                PeerAction::ClearReplayInProgress => {
                    if let Some(loc) = self.locations.get_mut(&ix) {
                        loc.replay_in_progress = false;
                    }
                }
                PeerAction::SendBeacon => self.send_beacon(),
                PeerAction::CloseTransport => {
                    let tid = self
                        .locations
                        .get_mut(&ix)
                        .and_then(|l| l.peer_listen_transport.take());
                    if let Some(tid) = tid {
                        if let Some(mut t) = self.transports.remove(tid) {
                            t.close();
                        }
                    }
                }
            }
        }
    }

    /// One peer frame from a stream transport. A handler error means the
    /// frame is dropped; only a non-recoverable one costs the connection.
    pub(crate) fn handle_peer_frame(
        &mut self,
        transport: hwmgr_core::ids::TransportId,
        frame: PeerFrame,
    ) {
        let sender = LocationIndex(frame.hdr.hw_id);
        let result = match frame.body {
            PeerBody::Init(flags) => {
                self.on_peer_init(transport, sender, flags);
                Ok(())
            }
            PeerBody::Replay(chunk) => self.on_replay(transport, chunk),
            PeerBody::NodeUpdate(update) => self.on_node_update(transport, update),
            PeerBody::ProcessUpdate(update) => self.on_process_update(transport, update),
            PeerBody::HaUpdate(update) => self.on_peer_ha_update(transport, update),
            PeerBody::Binding(batch) => self.on_binding(transport, batch),
            PeerBody::Keepalive(_) => {
                Err(HwmError::protocol("beacon received on a unicast transport"))
            }
        };

        if let Err(err) = result {
            warn!(location = %sender, %err, "peer frame rejected");
            if !err.is_recoverable() {
                self.on_closed(transport);
            }
        }
    }

    fn on_peer_init(
        &mut self,
        transport: hwmgr_core::ids::TransportId,
        sender: LocationIndex,
        flags: InitFlags,
    ) {
        if flags.request {
            debug!(location = %sender, "peer INIT request");
            if !self.locations.contains_key(&sender) {
                let mut loc = LocationRecord::new(sender, false);
                loc.keepalive_period_ms = self.peer_keepalive_ms as u32;
                self.locations.insert(sender, loc);
            }
            // Bind the inbound socket as this peer's transport if it has
            // none (the accepted side of simultaneous discovery).
            {
                let loc = self.locations.get_mut(&sender).expect("just inserted");
                if loc.peer_listen_transport.is_none() {
                    loc.peer_listen_transport = Some(transport);
                }
            }
            if let Some(t) = self.transports.get_mut(transport) {
                if t.owner.is_none() {
                    t.owner = Some(TransportOwner::Peer(sender));
                }
            }

            let body = PeerBody::Init(InitFlags { request: false, response_ok: true });
            let frame = peer_proto::encode(self.local.0, 0, &body);
            self.transports.enqueue_priority(transport, frame);
            self.run_peer_fsm(sender, PeerInput::InitRcvd);
        } else {
            debug!(location = %sender, ok = flags.response_ok, "peer INIT response");
            if !flags.response_ok {
                warn!(location = %sender, "peer rejected our INIT");
                return;
            }
            self.run_peer_fsm(sender, PeerInput::InitRcvd);
        }
    }

    /// Replay our full local inventory to one peer.
    pub(crate) fn start_replay_to(&mut self, ix: LocationIndex) -> Result<(), HwmError> {
        let Some(tid) = self.locations.get(&ix).and_then(|l| l.peer_listen_transport) else {
            return Err(HwmError::TransportUnavailable);
        };
        let Some(home) = self.locations.get(&self.local) else {
            return Err(HwmError::UnknownEntity(EntityId::Location(self.local)));
        };

        let nodes: Vec<ReplayNode> = home
            .nodes
            .values()
            .map(|n| ReplayNode {
                node_id: n.index.0,
                group: n.group.0,
                role: if n.current_role == NodeRole::None {
                    n.desired_role.to_wire()
                } else {
                    n.current_role.to_wire()
                },
                active: n.fsm.is_active(),
            })
            .collect();
        let procs: Vec<ReplayProcess> = home
            .nodes
            .values()
            .flat_map(|n| {
                n.processes.values().filter(|p| p.running).map(|p| ReplayProcess {
                    proc_type: p.ptype.0,
                    node_id: n.index.0,
                    pid: p.pid.0,
                })
            })
            .collect();

        debug!(location = %ix, nodes = nodes.len(), procs = procs.len(), "replaying inventory");
        for chunk in replay::build_chunks(&nodes, &procs) {
            let frame = peer_proto::encode(self.local.0, 0, &PeerBody::Replay(chunk));
            self.transports.enqueue(tid, frame);
        }
        Ok(())
    }

    fn on_replay(
        &mut self,
        transport: hwmgr_core::ids::TransportId,
        chunk: ReplayChunk,
    ) -> Result<(), HwmError> {
        let Some(TransportOwner::Peer(ix)) =
            self.transports.get(transport).and_then(|t| t.owner)
        else {
            return Err(HwmError::protocol("replay on unbound transport"));
        };

        if chunk.last {
            debug!(location = %ix, "end of replay");
            self.run_peer_fsm(ix, PeerInput::ReplayDone);
            return Ok(());
        }

        for record in &chunk.records {
            match record.kind {
                RecordKind::Node => self.apply_replay_node(ix, record),
                // A process before its node breaks the replay ordering
                // contract and voids the rest of the chunk.
                RecordKind::Process => self.apply_replay_process(ix, record)?,
            }
        }
        Ok(())
    }

    fn apply_replay_node(&mut self, loc_ix: LocationIndex, record: &ReplayRecord) {
        let node_ix = NodeIndex(record.node_id);
        let group = GroupIndex(record.group);
        let role = NodeRole::from_wire(record.role);
        let active = record.running != 0;

        let known = self
            .locations
            .get(&loc_ix)
            .is_some_and(|l| l.nodes.contains_key(&node_ix));
        if known {
            let Some(loc) = self.locations.get_mut(&loc_ix) else { return };
            let Some(node) = loc.node_mut(node_ix) else { return };
            if node.fsm.is_active() {
                // We already track it live; nothing a replay can add.
                trace!(node = %node_ix, "replay for live node ignored");
                return;
            }
            node.group = group;
            node.desired_role = role;
            node.current_role = role;
            if active {
                node.fsm.force(NodeState::Active);
                loc.incr_active_nodes();
                self.publish_node_status(node_ix);
            }
        } else {
            let state = if active { NodeState::Active } else { NodeState::Waiting };
            let mut node = NodeRecord::remote(node_ix, group, role, state, loc_ix);
            node.desired_role = role;
            node.transport = self.locations.get(&loc_ix).and_then(|l| l.peer_listen_transport);

            let Some(loc) = self.locations.get_mut(&loc_ix) else { return };
            loc.add_node(node);
            if active {
                loc.incr_active_nodes();
            }
            let status = if active { GlobalStatus::Active } else { GlobalStatus::Inactive };
            if let Err(err) = self.db.add_node(node_ix, loc_ix, group, role, status) {
                warn!(node = %node_ix, %err, "replayed node rejected");
                return;
            }
            self.subs.on_node_added(node_ix, group, &self.db, &mut self.notify);
            if active {
                self.publish_node_status(node_ix);
            } else {
                self.drain_notifications();
            }
        }

        self.resolve_ha_group(group);
    }

    /// A process record must follow its node within the session; one that
    /// references an unknown node is an ordering violation.
    fn apply_replay_process(
        &mut self,
        loc_ix: LocationIndex,
        record: &ReplayRecord,
    ) -> Result<(), HwmError> {
        let node_ix = NodeIndex(record.node_id);
        let key = ProcessKey {
            ptype: ProcType(record.group),
            node: node_ix,
            pid: Pid(record.pid),
        };

        let Some(loc) = self.locations.get_mut(&loc_ix) else {
            return Err(HwmError::ReplayOutOfOrder(record.node_id));
        };
        let Some(node) = loc.node_mut(node_ix) else {
            return Err(HwmError::ReplayOutOfOrder(record.node_id));
        };

        match node.process(key.ptype, key.pid).map(|p| p.running) {
            Some(true) => {}
            Some(false) => {
                if let Some(proc) = node.process_mut(key.ptype, key.pid) {
                    proc.running = true;
                }
                loc.incr_active_processes();
                self.publish_process_status(key);
            }
            None => {
                let mut proc = ProcessRecord::new(key.ptype, key.pid, String::new());
                proc.running = true;
                node.processes.insert((key.ptype, key.pid), proc);
                loc.incr_active_processes();
                if let Err(err) = self.db.add_process(key, loc_ix, GlobalStatus::Running) {
                    warn!(%key, %err, "replayed process rejected");
                    return Ok(());
                }
                self.subs.on_process_added(key, &self.db, &mut self.notify);
                self.publish_process_status(key);
            }
        }
        Ok(())
    }

    fn on_node_update(
        &mut self,
        transport: hwmgr_core::ids::TransportId,
        update: NodeUpdate,
    ) -> Result<(), HwmError> {
        let Some(TransportOwner::Peer(loc_ix)) =
            self.transports.get(transport).and_then(|t| t.owner)
        else {
            return Err(HwmError::protocol("node update on unbound transport"));
        };
        let node_ix = NodeIndex(update.node_id);
        let group = GroupIndex(update.group);
        let role = NodeRole::from_wire(update.role);
        let goes_active = update.status == STATUS_ACTIVE;

        let known = self
            .locations
            .get(&loc_ix)
            .is_some_and(|l| l.nodes.contains_key(&node_ix));
        if !known {
            // A creation we have not replayed yet; synthesize it.
            debug!(node = %node_ix, location = %loc_ix, "node update for unknown node");
            let state = if goes_active { NodeState::Active } else { NodeState::Failing };
            let mut node = NodeRecord::remote(node_ix, group, role, state, loc_ix);
            node.desired_role = role;
            node.transport = self.locations.get(&loc_ix).and_then(|l| l.peer_listen_transport);
            let Some(loc) = self.locations.get_mut(&loc_ix) else {
                return Err(HwmError::UnknownEntity(EntityId::Location(loc_ix)));
            };
            loc.add_node(node);
            if goes_active {
                loc.incr_active_nodes();
            }
            let status = if goes_active { GlobalStatus::Active } else { GlobalStatus::Inactive };
            if let Err(err) = self.db.add_node(node_ix, loc_ix, group, role, status) {
                warn!(node = %node_ix, %err, "synthesized node rejected");
                return Ok(());
            }
            self.subs.on_node_added(node_ix, group, &self.db, &mut self.notify);
            if goes_active {
                self.publish_node_status(node_ix);
            } else {
                self.drain_notifications();
            }
            return Ok(());
        }

        let state = {
            let Some(node) = self.locations.get(&loc_ix).and_then(|l| l.node(node_ix)) else {
                return Err(HwmError::UnknownEntity(EntityId::Node(node_ix)));
            };
            node.fsm.state()
        };
        match (goes_active, state) {
            (true, NodeState::Active) => {
                trace!(node = %node_ix, "already active");
            }
            (true, _) => {
                let loc = self.locations.get_mut(&loc_ix).expect("checked");
                let node = loc.node_mut(node_ix).expect("checked");
                node.fsm.force(NodeState::Active);
                node.current_role = role;
                loc.incr_active_nodes();
                self.publish_node_status(node_ix);
            }
            (false, NodeState::Waiting) => {
                // Failed to start.
                info!(node = %node_ix, "remote node failed to start");
                let loc = self.locations.get_mut(&loc_ix).expect("checked");
                loc.node_mut(node_ix).expect("checked").fsm.force(NodeState::Failing);
                self.publish_node_status(node_ix);
                self.force_node_state(loc_ix, node_ix, NodeState::Failed);
            }
            (false, NodeState::Active) => {
                info!(node = %node_ix, location = %loc_ix, "remote node failed");
                let loc = self.locations.get_mut(&loc_ix).expect("checked");
                loc.decr_active_nodes();
                loc.node_mut(node_ix).expect("checked").fsm.force(NodeState::Failing);
                self.publish_node_status(node_ix);
                self.force_node_state(loc_ix, node_ix, NodeState::Failed);
            }
            (false, _) => {
                trace!(node = %node_ix, "already down");
            }
        }
        Ok(())
    }

    fn on_process_update(
        &mut self,
        transport: hwmgr_core::ids::TransportId,
        update: ProcessUpdate,
    ) -> Result<(), HwmError> {
        let Some(TransportOwner::Peer(loc_ix)) =
            self.transports.get(transport).and_then(|t| t.owner)
        else {
            return Err(HwmError::protocol("process update on unbound transport"));
        };
        let key = ProcessKey {
            ptype: ProcType(update.proc_type),
            node: NodeIndex(update.node_id),
            pid: Pid(update.proc_id),
        };
        let running = update.status == STATUS_ACTIVE;

        let Some(loc) = self.locations.get_mut(&loc_ix) else {
            return Err(HwmError::UnknownEntity(EntityId::Location(loc_ix)));
        };
        let Some(node) = loc.node_mut(key.node) else {
            return Err(HwmError::UnknownEntity(EntityId::Node(key.node)));
        };

        match node.process(key.ptype, key.pid).map(|p| p.running) {
            Some(state) if state == running => {}
            Some(_) => {
                if let Some(proc) = node.process_mut(key.ptype, key.pid) {
                    proc.running = running;
                }
                if running {
                    loc.incr_active_processes();
                } else {
                    loc.decr_active_processes();
                }
                self.publish_process_status(key);
            }
            None => {
                let mut proc = ProcessRecord::new(key.ptype, key.pid, String::new());
                proc.running = running;
                node.processes.insert((key.ptype, key.pid), proc);
                if running {
                    loc.incr_active_processes();
                }
                let status = if running { GlobalStatus::Running } else { GlobalStatus::Down };
                if let Err(err) = self.db.add_process(key, loc_ix, status) {
                    warn!(%key, %err, "synthesized process rejected");
                    return Ok(());
                }
                self.subs.on_process_added(key, &self.db, &mut self.notify);
                if running {
                    self.publish_process_status(key);
                } else {
                    self.drain_notifications();
                }
            }
        }
        Ok(())
    }

    fn on_peer_ha_update(
        &mut self,
        transport: hwmgr_core::ids::TransportId,
        update: HaUpdate,
    ) -> Result<(), HwmError> {
        let Some(TransportOwner::Peer(loc_ix)) =
            self.transports.get(transport).and_then(|t| t.owner)
        else {
            return Err(HwmError::protocol("role update on unbound transport"));
        };
        let node_ix = NodeIndex(update.node_id);
        let role = NodeRole::from_wire(update.role);
        debug!(node = %node_ix, location = %loc_ix, ?role, "peer role update");

        let Some(node) = self.locations.get_mut(&loc_ix).and_then(|l| l.node_mut(node_ix))
        else {
            return Err(HwmError::UnknownEntity(EntityId::Node(node_ix)));
        };
        node.desired_role = role;
        node.current_role = role;
        self.db.set_node_role(node_ix, role);
        let group = node.group;
        self.resolve_ha_group(group);
        Ok(())
    }

    fn on_binding(
        &mut self,
        transport: hwmgr_core::ids::TransportId,
        batch: BindingBatch,
    ) -> Result<(), HwmError> {
        let Some(TransportOwner::Peer(loc_ix)) =
            self.transports.get(transport).and_then(|t| t.owner)
        else {
            return Err(HwmError::protocol("binding on unbound transport"));
        };

        // The initiator's create always precedes its bindings, so the
        // subscriber is resolvable here.
        let subscriber = match batch.subscriber_kind {
            RecordKind::Node => {
                let ix = NodeIndex(batch.subscriber_id);
                if !self.locations.get(&loc_ix).is_some_and(|l| l.nodes.contains_key(&ix)) {
                    return Err(HwmError::UnknownEntity(EntityId::Node(ix)));
                }
                EntityId::Node(ix)
            }
            RecordKind::Process => {
                let pid = Pid(batch.subscriber_id);
                let Some(key) = self.locations.get(&loc_ix).and_then(|l| {
                    l.nodes.values().find_map(|n| {
                        n.processes
                            .values()
                            .find(|p| p.pid == pid)
                            .map(|p| p.key(n.index))
                    })
                }) else {
                    return Err(HwmError::protocol(format!(
                        "binding subscriber pid {:#x} unknown",
                        pid.0
                    )));
                };
                EntityId::Process(key)
            }
        };

        for binding in &batch.bindings {
            let Some(kind) = SubsKind::from_wire(binding.subs_kind) else {
                warn!(kind = binding.subs_kind, "binding with unknown kind");
                continue;
            };
            // cross_bind=false: bindings never propagate further.
            self.subs.subscribe(
                kind,
                binding.subs_id,
                subscriber,
                false,
                &self.db,
                &mut self.notify,
            );
        }
        self.drain_notifications();
        Ok(())
    }

    /// Location row transition plus its notification.
    pub(crate) fn publish_location_status(&mut self, ix: LocationIndex, up: bool) {
        if up {
            if self.db.location(ix).is_none() {
                if let Err(err) = self.db.add_location(ix, GlobalStatus::Active) {
                    warn!(location = %ix, %err, "location row");
                }
                self.subs.on_location_added(ix, &self.db, &mut self.notify);
            } else {
                self.db.set_location_status(ix, GlobalStatus::Active);
            }
            self.subs.promote(GlobalDb::sub_key_of(EntityId::Location(ix)));
            if let Some(loc) = self.locations.get_mut(&ix) {
                loc.keepalive_missed = 0;
            }
            info!(location = %ix, "location active");
            self.notify
                .push(NotifyKind::LocationActive, EntityId::Location(ix), NotifyScope::Subscribers);
        } else {
            self.db.set_location_status(ix, GlobalStatus::Inactive);
            info!(location = %ix, "location inactive");
            self.notify.push(
                NotifyKind::LocationInactive,
                EntityId::Location(ix),
                NotifyScope::Subscribers,
            );
        }
        self.drain_notifications();
    }

    /// A peer died: every node and process it hosted goes down, each with
    /// its own notifications.
    pub(crate) fn fail_all_nodes(&mut self, ix: LocationIndex) {
        let node_ids: Vec<NodeIndex> = self
            .locations
            .get(&ix)
            .map(|l| l.nodes.keys().copied().collect())
            .unwrap_or_default();

        for node_ix in node_ids {
            // Processes first, one notification each.
            let proc_keys: Vec<ProcessKey> = self
                .locations
                .get(&ix)
                .and_then(|l| l.node(node_ix))
                .map(|n| {
                    n.processes
                        .values()
                        .filter(|p| p.running)
                        .map(|p| p.key(node_ix))
                        .collect()
                })
                .unwrap_or_default();
            for key in proc_keys {
                let loc = self.locations.get_mut(&ix).expect("location exists");
                if let Some(proc) =
                    loc.node_mut(node_ix).and_then(|n| n.process_mut(key.ptype, key.pid))
                {
                    proc.running = false;
                    loc.decr_active_processes();
                }
                self.publish_process_status(key);
            }

            let Some(loc) = self.locations.get_mut(&ix) else { continue };
            let Some(node) = loc.node_mut(node_ix) else { continue };
            match node.fsm.state() {
                NodeState::Failed => {}
                state => {
                    if state == NodeState::Active {
                        node.fsm.force(NodeState::Failing);
                        loc.decr_active_nodes();
                    } else {
                        node.fsm.force(NodeState::Failing);
                    }
                    self.publish_node_status(node_ix);
                    self.force_node_state(ix, node_ix, NodeState::Failed);
                }
            }
        }
    }

    pub(crate) fn force_node_state(
        &mut self,
        loc_ix: LocationIndex,
        node_ix: NodeIndex,
        state: NodeState,
    ) {
        if let Some(node) = self.locations.get_mut(&loc_ix).and_then(|l| l.node_mut(node_ix)) {
            node.fsm.force(state);
        }
    }

    /// Local cluster tick: beacon out, liveness debit for every active
    /// peer, kickout past the threshold.
    pub(crate) fn on_cluster_tick(&mut self) {
        self.send_beacon();

        let mut failed: Vec<LocationIndex> = Vec::new();
        for loc in self.locations.values_mut() {
            if loc.is_local || !loc.fsm.is_active() {
                continue;
            }
            loc.keepalive_missed += 1;
            if loc.keepalive_missed >= self.peer_threshold {
                warn!(location = %loc.index, missed = loc.keepalive_missed, "peer kickout");
                failed.push(loc.index);
            }
        }
        for ix in failed {
            self.run_peer_fsm(ix, PeerInput::Fail);
        }
    }

    /// Multicast our beacon with the current active counts.
    pub(crate) fn send_beacon(&mut self) {
        let Some(home) = self.locations.get(&self.local) else { return };
        let Some(tid) = home.peer_broadcast_transport else {
            trace!("no beacon transport");
            return;
        };
        let beacon = Beacon {
            listen_port: u32::from(self.cfg.instance.addresses.peer_listen.port),
            num_nodes: home.active_nodes(),
            num_procs: home.active_processes(),
        };
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let frame = peer_proto::encode(self.local.0, timestamp, &PeerBody::Keepalive(beacon));
        self.transports.enqueue(tid, frame);
    }
}

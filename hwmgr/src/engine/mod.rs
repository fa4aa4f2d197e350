//! The engine: one task owning all cluster state.
//!
//! Socket pumps, listeners and timers funnel everything into a single
//! event channel; the engine drains it and mutates the `Cluster` context
//! with no locks anywhere. Handlers are plain synchronous methods, which
//! is also what makes the whole machine drivable from tests without any
//! sockets.

mod node;
mod peer;

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;
use hashbrown::HashMap;
use tracing::{debug, info, warn};

use hwmgr_core::globaldb::{GlobalDb, GlobalStatus};
use hwmgr_core::ids::{
    EntityId, GroupIndex, LocationIndex, NodeIndex, NodeRole, TimerId, TransportId,
};
use hwmgr_core::fsm::node::NodeState;
use hwmgr_core::ha::{self, HaCandidate, HaEffect};
use hwmgr_core::model::LocationRecord;
use hwmgr_core::notify::{
    DeliverStatus, Notification, NotifyKind, NotifyQueue, NotifyScope, NotifySink,
};
use hwmgr_core::subs::SubscriptionTable;
use hwmgr_proto::node as node_proto;
use hwmgr_proto::peer as peer_proto;

use crate::config::Config;
use crate::event::{AcceptKind, Event, EventTx};
use crate::sock;
use crate::timer::{TimerMode, TimerService};
use crate::transport::{
    FrameCodec, IdAlloc, TransportKind, TransportOwner, TransportTable,
};

/// The application context: every table and record the manager owns.
pub struct Cluster {
    cfg: Config,
    local: LocationIndex,
    locations: BTreeMap<LocationIndex, LocationRecord>,
    db: GlobalDb,
    subs: SubscriptionTable,
    notify: NotifyQueue,
    transports: TransportTable,
    timers: TimerService,
    tx: EventTx,
    alloc: IdAlloc,
    /// Per-node keepalive/INIT timers.
    node_timers: HashMap<TimerId, NodeIndex>,
    cluster_tick: TimerId,
    ha_timer: TimerId,
    node_keepalive_ms: u64,
    node_threshold: u32,
    peer_keepalive_ms: u64,
    peer_threshold: u32,
    /// Set once listeners and the beacon socket are up; gates task
    /// spawning so the engine stays fully drivable without a runtime.
    io_enabled: bool,
    running: bool,
}

impl Cluster {
    /// Build the context from configuration: the local location, its
    /// configured nodes, their subscriptions, and the initial HA pass.
    #[must_use]
    pub fn new(cfg: Config, tx: EventTx, timer_mode: TimerMode) -> Self {
        let local = LocationIndex(cfg.instance.index);
        let node_keepalive_ms = cfg.instance.heartbeat.node.period_ms();
        let peer_keepalive_ms = cfg.instance.heartbeat.cluster.period_ms();

        let alloc = IdAlloc::default();
        let mut timers = TimerService::new(tx.clone(), timer_mode);
        let cluster_tick = timers.create(peer_keepalive_ms, true);
        let ha_timer = timers.create(cfg.instance.heartbeat.ha.period_ms(), false);

        let mut engine = Self {
            local,
            locations: BTreeMap::new(),
            db: GlobalDb::new(),
            subs: SubscriptionTable::new(),
            notify: NotifyQueue::new(),
            transports: TransportTable::new(alloc.clone()),
            timers,
            tx,
            alloc,
            node_timers: HashMap::new(),
            cluster_tick,
            ha_timer,
            node_keepalive_ms,
            node_threshold: cfg.instance.heartbeat.node.threshold,
            peer_keepalive_ms,
            peer_threshold: cfg.instance.heartbeat.cluster.threshold,
            io_enabled: false,
            running: true,
            cfg,
        };

        let mut home = LocationRecord::new(local, true);
        home.keepalive_period_ms = peer_keepalive_ms as u32;
        engine.locations.insert(local, home);
        if let Err(err) = engine.db.add_location(local, GlobalStatus::Active) {
            warn!(%err, "local location row");
        }
        engine
            .subs
            .on_location_added(local, &engine.db, &mut engine.notify);

        // Configured nodes, their subscriptions, then a first HA pass.
        let nodes = engine.cfg.nodes.clone();
        for node_cfg in &nodes {
            engine.add_local_node(node_cfg);
        }
        for node_cfg in &nodes {
            let subscriber = EntityId::Node(NodeIndex(node_cfg.index));
            for sub in &node_cfg.subscriptions {
                engine.subs.subscribe(
                    sub.kind.into(),
                    sub.value,
                    subscriber,
                    sub.cross_bind,
                    &engine.db,
                    &mut engine.notify,
                );
            }
        }
        let groups: Vec<GroupIndex> =
            { let mut g: Vec<_> = nodes.iter().map(|n| GroupIndex(n.group)).collect();
              g.sort_unstable();
              g.dedup();
              g };
        for group in groups {
            engine.resolve_ha_group(group);
        }
        engine.drain_notifications();

        engine.timers.start(engine.cluster_tick);
        engine.timers.start(engine.ha_timer);
        info!(%local, "cluster context initialized");
        engine
    }

    /// Bring up the listeners and the beacon socket, then announce
    /// ourselves.
    pub async fn start_io(&mut self) -> std::io::Result<()> {
        let addrs = self.cfg.instance.addresses;

        let node_listener = compio::net::TcpListener::bind(SocketAddr::new(
            addrs.node_listen.ip,
            addrs.node_listen.port,
        ))
        .await?;
        sock::spawn_listener(AcceptKind::Node, node_listener, self.alloc.clone(), self.tx.clone());

        let peer_listener = compio::net::TcpListener::bind(SocketAddr::new(
            addrs.peer_listen.ip,
            addrs.peer_listen.port,
        ))
        .await?;
        sock::spawn_listener(AcceptKind::Peer, peer_listener, self.alloc.clone(), self.tx.clone());

        let writer =
            sock::spawn_multicast(self.cfg.multicast_group(), addrs.multicast_port, self.tx.clone())
                .await?;
        let mcast = self.transports.create(TransportKind::Multicast);
        if let Some(t) = self.transports.get_mut(mcast) {
            t.attach_writer(writer);
        }
        if let Some(home) = self.locations.get_mut(&self.local) {
            home.peer_broadcast_transport = Some(mcast);
        }

        self.io_enabled = true;
        info!(
            node_port = addrs.node_listen.port,
            peer_port = addrs.peer_listen.port,
            mcast = %self.cfg.multicast_group(),
            "transports up"
        );
        self.send_beacon();
        Ok(())
    }

    /// Main loop: drain events until shutdown.
    pub async fn run(mut self, rx: flume::Receiver<Event>) {
        while self.running {
            match rx.recv_async().await {
                Ok(event) => self.handle_event(event),
                Err(_) => break,
            }
        }
        info!("engine stopped");
    }

    /// Dispatch one event. Public so tests can drive the engine without
    /// sockets or a runtime.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Accepted { kind, transport, addr, writer } => {
                let tkind = match kind {
                    AcceptKind::Node => TransportKind::NodeStream,
                    AcceptKind::Peer => TransportKind::PeerStream,
                };
                let t = self.transports.insert_accepted(transport, tkind);
                t.remote = Some(addr);
                t.attach_writer(writer);
                debug!(?kind, ?transport, %addr, "transport registered");
            }
            Event::Connected { transport, writer } => {
                let owner = {
                    let Some(t) = self.transports.get_mut(transport) else { return };
                    t.attach_writer(writer);
                    t.owner
                };
                if let Some(TransportOwner::Peer(ix)) = owner {
                    self.run_peer_fsm(ix, hwmgr_core::fsm::peer::PeerInput::ConnectComplete);
                }
            }
            Event::ConnectFailed { transport } => {
                let owner = self.transports.get(transport).and_then(|t| t.owner);
                if let Some(TransportOwner::Peer(ix)) = owner {
                    self.run_peer_fsm(ix, hwmgr_core::fsm::peer::PeerInput::Close);
                } else {
                    self.transports.remove(transport);
                }
            }
            Event::Bytes { transport, data } => self.on_bytes(transport, &data),
            Event::Closed { transport } => self.on_closed(transport),
            Event::Beacon { data, from } => self.handle_beacon(&data, from),
            Event::Timer { id, generation } => {
                if !self.timers.on_fire(id, generation) {
                    return;
                }
                if id == self.cluster_tick {
                    self.on_cluster_tick();
                } else if id == self.ha_timer {
                    self.on_ha_timer();
                } else if let Some(node) = self.node_timers.get(&id).copied() {
                    self.on_node_timer(node);
                }
            }
            Event::Shutdown => {
                info!("shutdown requested");
                self.running = false;
            }
        }
    }

    /// Route inbound stream bytes through the transport's decoder.
    fn on_bytes(&mut self, transport: TransportId, data: &[u8]) {
        enum Decoded {
            Peer(Vec<peer_proto::PeerFrame>),
            Node(Vec<node_proto::NodeFrame>),
        }

        let decoded = {
            let Some(t) = self.transports.get_mut(transport) else { return };
            match &mut t.codec {
                FrameCodec::Peer(dec) => {
                    dec.push(data);
                    let mut frames = Vec::new();
                    loop {
                        match dec.next() {
                            Ok(Some(frame)) => frames.push(frame),
                            Ok(None) => break Some(Decoded::Peer(frames)),
                            Err(err) => {
                                warn!(?transport, %err, "peer stream violation");
                                break None;
                            }
                        }
                    }
                }
                FrameCodec::Node(dec) => {
                    dec.push(data);
                    let mut frames = Vec::new();
                    loop {
                        match dec.next() {
                            Ok(Some(frame)) => frames.push(frame),
                            Ok(None) => break Some(Decoded::Node(frames)),
                            Err(err) => {
                                warn!(?transport, %err, "node stream violation");
                                break None;
                            }
                        }
                    }
                }
                // Datagram transports deliver through Beacon events.
                FrameCodec::Datagram => return,
            }
        };

        match decoded {
            Some(Decoded::Peer(frames)) => {
                for frame in frames {
                    self.handle_peer_frame(transport, frame);
                }
            }
            Some(Decoded::Node(frames)) => {
                for frame in frames {
                    self.handle_node_frame(transport, frame);
                }
            }
            // Structural violation: tear the connection down.
            None => self.on_closed(transport),
        }
    }

    /// EOF or hard error on a stream: surface it to the owning FSM.
    fn on_closed(&mut self, transport: TransportId) {
        let owner = self.transports.get(transport).and_then(|t| t.owner);
        match owner {
            Some(TransportOwner::Node(ix)) => {
                debug!(?transport, node = %ix, "node transport closed");
                self.run_node_fsm(ix, hwmgr_core::fsm::node::NodeInput::Term);
            }
            Some(TransportOwner::Peer(ix)) => {
                debug!(?transport, peer = %ix, "peer transport closed");
                self.run_peer_fsm(ix, hwmgr_core::fsm::peer::PeerInput::Close);
            }
            None => {
                if let Some(mut t) = self.transports.remove(transport) {
                    t.close();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared publication paths
    // ------------------------------------------------------------------

    /// Propagate a node's run-status transition: promote its row, mirror
    /// the status, notify, and tell the peers if the node is ours.
    pub(crate) fn publish_node_status(&mut self, node: NodeIndex) {
        let Some(loc_ix) = self.db.node(node).map(|r| r.location) else { return };
        let Some(record) = self.locations.get(&loc_ix).and_then(|l| l.node(node)) else {
            return;
        };

        let (kind, status, wire_status) = match record.fsm.state() {
            NodeState::Active => {
                (NotifyKind::NodeActive, GlobalStatus::Active, peer_proto::STATUS_ACTIVE)
            }
            NodeState::Failing => {
                (NotifyKind::NodeInactive, GlobalStatus::Inactive, peer_proto::STATUS_INACTIVE)
            }
            // FAILED and earlier states have nothing new to say.
            _ => return,
        };
        let update = peer_proto::NodeUpdate {
            node_id: node.0,
            group: record.group.0,
            role: record.current_role.to_wire(),
            status: wire_status,
        };

        self.subs.promote(GlobalDb::sub_key_of(EntityId::Node(node)));
        self.db.set_node_status(node, status);
        self.notify.push(kind, EntityId::Node(node), NotifyScope::Subscribers);
        self.drain_notifications();

        if loc_ix == self.local {
            self.send_to_peers(&peer_proto::PeerBody::NodeUpdate(update));
        }
    }

    /// Propagate a process run-status transition.
    pub(crate) fn publish_process_status(&mut self, key: hwmgr_core::ids::ProcessKey) {
        let Some(loc_ix) = self.db.process(key).map(|r| r.location) else { return };
        let Some(running) = self
            .locations
            .get(&loc_ix)
            .and_then(|l| l.node(key.node))
            .and_then(|n| n.process(key.ptype, key.pid))
            .map(|p| p.running)
        else {
            return;
        };

        let (kind, status, wire_status) = if running {
            (NotifyKind::ProcessCreated, GlobalStatus::Running, peer_proto::STATUS_ACTIVE)
        } else {
            (NotifyKind::ProcessDestroyed, GlobalStatus::Down, peer_proto::STATUS_INACTIVE)
        };

        if running {
            self.subs.promote(GlobalDb::sub_key_of(EntityId::Process(key)));
        }
        self.db.set_process_status(key, status);
        self.notify.push(kind, EntityId::Process(key), NotifyScope::Subscribers);
        self.drain_notifications();

        if loc_ix == self.local {
            let update = peer_proto::ProcessUpdate {
                proc_type: key.ptype.0,
                proc_id: key.pid.0,
                node_id: key.node.0,
                status: wire_status,
            };
            self.send_to_peers(&peer_proto::PeerBody::ProcessUpdate(update));
        }
    }

    /// Propagate a node's resolved role: HA_ROLE notification to the node
    /// itself, HA_UPDATE to peers and config persistence for local nodes.
    pub(crate) fn publish_node_role(&mut self, node: NodeIndex) {
        let Some(loc_ix) = self.db.node(node).map(|r| r.location) else { return };
        let Some((role, group)) = self
            .locations
            .get(&loc_ix)
            .and_then(|l| l.node(node))
            .map(|n| (n.current_role, n.group))
        else {
            return;
        };

        self.db.set_node_role(node, role);
        let kind = if role == NodeRole::Passive {
            NotifyKind::RolePassive
        } else {
            NotifyKind::RoleActive
        };
        self.notify
            .push(kind, EntityId::Node(node), NotifyScope::Only(EntityId::Node(node)));
        self.drain_notifications();

        if loc_ix == self.local {
            let update = peer_proto::HaUpdate {
                node_id: node.0,
                group: group.0,
                role: role.to_wire(),
            };
            self.send_to_peers(&peer_proto::PeerBody::HaUpdate(update));
            if let Err(err) = self.cfg.persist_role(node.0, role) {
                warn!(%node, %err, "role persistence failed");
            }
        }
    }

    /// Run the resolver over one group across every known location and
    /// apply its effects.
    pub(crate) fn resolve_ha_group(&mut self, group: GroupIndex) {
        let candidates: Vec<HaCandidate> = self
            .locations
            .values()
            .flat_map(|loc| {
                loc.nodes.values().filter(|n| n.group == group).map(|n| HaCandidate {
                    location: loc.index,
                    node: n.index,
                    desired: n.desired_role,
                    current: n.current_role,
                })
            })
            .collect();

        for effect in ha::resolve_group(&candidates) {
            match effect {
                HaEffect::Assign { node, role, partner } => {
                    if let Some(record) = self.find_node_mut(node) {
                        record.current_role = role;
                        record.partner = partner;
                    }
                    self.publish_node_role(node);
                }
                HaEffect::Demote { node } => {
                    if let Some(record) = self.find_node_mut(node) {
                        record.current_role = NodeRole::None;
                        record.partner = None;
                    }
                    self.publish_node_role(node);
                }
            }
        }
    }

    /// HA wait expired: settle every group we host nodes for.
    fn on_ha_timer(&mut self) {
        debug!("HA wait interval expired; resolving groups");
        let mut groups: Vec<GroupIndex> = self
            .locations
            .get(&self.local)
            .map(|l| l.nodes.values().map(|n| n.group).collect())
            .unwrap_or_default();
        groups.sort_unstable();
        groups.dedup();
        for group in groups {
            self.resolve_ha_group(group);
        }
    }

    /// Unicast a frame to every connected peer, excluding ourselves.
    pub(crate) fn send_to_peers(&mut self, body: &peer_proto::PeerBody) {
        let frame = peer_proto::encode(self.local.0, 0, body);
        let targets: Vec<TransportId> = self
            .locations
            .values()
            .filter(|l| !l.is_local && l.fsm.is_active())
            .filter_map(|l| l.peer_listen_transport)
            .collect();
        for tid in targets {
            self.transports.enqueue(tid, frame.clone());
        }
    }

    /// Service the notification queue against the live transports.
    pub(crate) fn drain_notifications(&mut self) {
        let mut sink = EngineSink {
            transports: &mut self.transports,
            locations: &self.locations,
            db: &self.db,
            local: self.local,
            frames: HashMap::new(),
        };
        self.notify.drain(&mut self.subs, &mut sink);
    }

    pub(crate) fn find_node_mut(
        &mut self,
        node: NodeIndex,
    ) -> Option<&mut hwmgr_core::model::NodeRecord> {
        let loc = self.db.node(node)?.location;
        self.locations.get_mut(&loc)?.node_mut(node)
    }

    // ------------------------------------------------------------------
    // Introspection (used by the binary and by tests)
    // ------------------------------------------------------------------

    #[must_use]
    pub fn local_index(&self) -> LocationIndex {
        self.local
    }

    #[must_use]
    pub fn location(&self, ix: LocationIndex) -> Option<&LocationRecord> {
        self.locations.get(&ix)
    }

    #[must_use]
    pub fn global(&self) -> &GlobalDb {
        &self.db
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subs
    }

    #[must_use]
    pub fn transports(&self) -> &TransportTable {
        &self.transports
    }

    pub fn transports_mut(&mut self) -> &mut TransportTable {
        &mut self.transports
    }

    #[must_use]
    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    #[must_use]
    pub fn cluster_tick_timer(&self) -> TimerId {
        self.cluster_tick
    }

    #[must_use]
    pub fn ha_wait_timer(&self) -> TimerId {
        self.ha_timer
    }

    #[must_use]
    pub fn node_timer(&self, node: NodeIndex) -> Option<TimerId> {
        self.node_timers
            .iter()
            .find(|(_, n)| **n == node)
            .map(|(t, _)| *t)
    }

    #[must_use]
    pub fn pending_notifications(&self) -> usize {
        self.notify.len()
    }
}

/// Delivery backend: resolves a subscriber to a local node transport,
/// builds the NOTIFY frame once per notification, patches `subs_pid` per
/// process subscriber.
struct EngineSink<'a> {
    transports: &'a mut TransportTable,
    locations: &'a BTreeMap<LocationIndex, LocationRecord>,
    db: &'a GlobalDb,
    local: LocationIndex,
    /// Frame cache, one entry per notification id. `None` marks kinds
    /// that have no wire form (location transitions).
    frames: HashMap<u64, Option<Bytes>>,
}

impl NotifySink for EngineSink<'_> {
    fn deliver(&mut self, note: &Notification, subscriber: EntityId) -> DeliverStatus {
        let (node_ix, subs_pid) = match subscriber {
            EntityId::Node(ix) => (ix, None),
            EntityId::Process(key) => (key.node, Some(key.pid.0)),
            // Locations are not deliverable endpoints.
            EntityId::Location(_) => return DeliverStatus::DiscardedRemote,
        };

        let Some(row) = self.db.node(node_ix) else {
            return DeliverStatus::DiscardedRemote;
        };
        if row.location != self.local {
            // Peers learn through NODE_UPDATE / PROCESS_UPDATE.
            return DeliverStatus::DiscardedRemote;
        }
        let Some(record) = self.locations.get(&self.local).and_then(|l| l.node(node_ix))
        else {
            return DeliverStatus::DiscardedRemote;
        };
        let Some(tid) = record.transport else {
            return match record.fsm.state() {
                // Dead subscriber: skip silently, others still receive.
                NodeState::Failing | NodeState::Failed => DeliverStatus::Delivered,
                _ => DeliverStatus::NoTransport,
            };
        };

        if !self.frames.contains_key(&note.id) {
            let frame = build_notify_frame(note, self.locations, self.db, self.transports);
            self.frames.insert(note.id, frame);
        }
        let Some(frame) = self.frames.get(&note.id).cloned().flatten() else {
            // No wire form; counts as handled.
            return DeliverStatus::Delivered;
        };
        let frame = match subs_pid {
            Some(pid) => node_proto::notify_with_subs_pid(&frame, pid),
            None => frame,
        };

        let Some(t) = self.transports.get_mut(tid) else {
            return DeliverStatus::NoTransport;
        };
        if !t.connected {
            return DeliverStatus::NoTransport;
        }
        t.enqueue(frame);
        DeliverStatus::Delivered
    }
}

/// Build the base NOTIFY frame for a notification, if the kind has a wire
/// form.
fn build_notify_frame(
    note: &Notification,
    locations: &BTreeMap<LocationIndex, LocationRecord>,
    db: &GlobalDb,
    transports: &TransportTable,
) -> Option<Bytes> {
    let node_of = |ix: NodeIndex| {
        let loc = db.node(ix)?.location;
        locations.get(&loc).and_then(|l| l.node(ix)).map(|n| (loc, n))
    };
    let addr_of = |record: &hwmgr_core::model::NodeRecord| {
        record
            .transport
            .and_then(|tid| transports.get(tid))
            .and_then(|t| t.remote)
            .map_or(node_proto::AddrInfo::none(), |addr| {
                let (addr_type, bytes) = match addr {
                    SocketAddr::V4(v4) => {
                        let mut b = [0u8; 16];
                        b[..4].copy_from_slice(&v4.ip().octets());
                        (node_proto::ADDR_TYPE_TCP_V4, b)
                    }
                    SocketAddr::V6(v6) => (node_proto::ADDR_TYPE_TCP_V6, v6.ip().octets()),
                };
                node_proto::AddrInfo {
                    addr_type,
                    addr: bytes,
                    port: u32::from(addr.port()),
                    ..node_proto::AddrInfo::none()
                }
            })
    };

    let body = match (note.kind, note.entity) {
        (NotifyKind::RoleActive | NotifyKind::RolePassive, EntityId::Node(ix)) => {
            let (_, record) = node_of(ix)?;
            let partner = record.partner.and_then(node_of);
            let mut addr_info = partner
                .as_ref()
                .map_or(node_proto::AddrInfo::none(), |&(_, p)| addr_of(p));
            if let Some((ploc, p)) = &partner {
                addr_info.hw_index = ploc.0;
                addr_info.group = p.group.0;
                addr_info.node_id = p.index.0;
            }
            addr_info.role = record.current_role.to_wire();
            node_proto::Notify {
                notify_type: node_proto::NOTIFY_HA_ROLE,
                id: u32::from(partner.is_some()),
                subs_pid: 0,
                if_id: 0,
                proc_type: 0,
                addr_info,
            }
        }
        (NotifyKind::NodeActive | NotifyKind::NodeInactive, EntityId::Node(ix)) => {
            let (loc, record) = node_of(ix)?;
            let mut addr_info = addr_of(record);
            addr_info.hw_index = loc.0;
            addr_info.group = record.group.0;
            addr_info.node_id = ix.0;
            node_proto::Notify {
                notify_type: if note.kind == NotifyKind::NodeActive {
                    node_proto::NOTIFY_NODE_UP
                } else {
                    node_proto::NOTIFY_NODE_DOWN
                },
                id: 0,
                subs_pid: 0,
                if_id: 0,
                proc_type: 0,
                addr_info,
            }
        }
        (
            NotifyKind::ProcessCreated | NotifyKind::ProcessDestroyed,
            EntityId::Process(key),
        ) => {
            let (loc, parent) = node_of(key.node)?;
            let mut addr_info = addr_of(parent);
            addr_info.hw_index = loc.0;
            addr_info.group = parent.group.0;
            addr_info.node_id = key.node.0;
            addr_info.role = parent.current_role.to_wire();
            node_proto::Notify {
                notify_type: if note.kind == NotifyKind::ProcessCreated {
                    node_proto::NOTIFY_PROC_AVAILABLE
                } else {
                    node_proto::NOTIFY_PROC_GONE
                },
                id: key.pid.0,
                subs_pid: 0,
                if_id: 0,
                proc_type: key.ptype.0,
                addr_info,
            }
        }
        (NotifyKind::InterfaceAdded | NotifyKind::InterfaceDeleted, _) => {
            let notify_type = if note.kind == NotifyKind::InterfaceAdded {
                node_proto::NOTIFY_INTERFACE_ADD
            } else {
                node_proto::NOTIFY_INTERFACE_DELETE
            };
            node_proto::Notify {
                notify_type,
                id: 0,
                subs_pid: 0,
                if_id: 0,
                proc_type: 0,
                addr_info: node_proto::AddrInfo::none(),
            }
        }
        // Location transitions have no node-facing wire form.
        (NotifyKind::LocationActive | NotifyKind::LocationInactive, _) => return None,
        _ => return None,
    };

    Some(node_proto::encode(
        node_proto::NodeHeader::request(note.id as u32),
        &node_proto::NodeBody::Notify(body),
    ))
}

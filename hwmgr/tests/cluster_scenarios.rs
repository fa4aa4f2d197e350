//! End-to-end scenarios over two engines wired with in-memory links.
//!
//! No sockets, no runtime: the engines run in `TimerMode::Manual` and the
//! tests shuttle frames between their transports by hand, which keeps
//! every interleaving deterministic.

use bytes::Bytes;
use flume::Receiver;

use hwmgr::config::{Config, ConfigNode, ConfigRole, ConfigSubsKind, ConfigSubscription};
use hwmgr::{AcceptKind, Cluster, Event, TimerMode, WriterCmd};
use hwmgr_core::prelude::*;
use hwmgr_proto::node as node_proto;
use hwmgr_proto::peer as peer_proto;
use smallvec::SmallVec;

struct Instance {
    cluster: Cluster,
    _rx: Receiver<Event>,
}

fn instance(index: u32, nodes: Vec<ConfigNode>) -> Instance {
    let mut cfg = Config::default();
    cfg.instance.index = index;
    cfg.instance.heartbeat.cluster.period = 100;
    cfg.instance.heartbeat.cluster.threshold = 3;
    cfg.nodes = nodes;
    let (tx, rx) = flume::unbounded();
    Instance { cluster: Cluster::new(cfg, tx, TimerMode::Manual), _rx: rx }
}

fn config_node(index: u32, group: u32, role: ConfigRole) -> ConfigNode {
    ConfigNode {
        index,
        name: format!("node{index}"),
        role,
        group,
        subscriptions: Vec::new(),
    }
}

/// One direction of a peer link: frames written by `from` are replayed
/// into `to` on the given transport.
fn pump_into(rx: &Receiver<WriterCmd>, to: &mut Instance, transport: TransportId) -> usize {
    let mut moved = 0;
    while let Ok(cmd) = rx.try_recv() {
        if let WriterCmd::Send(frame) = cmd {
            to.cluster.handle_event(Event::Bytes { transport, data: frame });
            moved += 1;
        }
    }
    moved
}

struct Link {
    /// Transport id of the link on A (A's view of B).
    a_tid: TransportId,
    /// Transport id of the link on B (B's view of A).
    b_tid: TransportId,
    a_out: Receiver<WriterCmd>,
    b_out: Receiver<WriterCmd>,
}

impl Link {
    /// Shuttle frames in both directions until neither side has output.
    fn settle(&self, a: &mut Instance, b: &mut Instance) {
        loop {
            let moved = pump_into(&self.a_out, b, self.b_tid)
                + pump_into(&self.b_out, a, self.a_tid);
            if moved == 0 {
                break;
            }
        }
    }
}

fn beacon_from(instance: &Instance, listen_port: u32) -> Bytes {
    let home = instance.cluster.location(instance.cluster.local_index()).unwrap();
    peer_proto::encode(
        instance.cluster.local_index().0,
        0,
        &peer_proto::PeerBody::Keepalive(peer_proto::Beacon {
            listen_port,
            num_nodes: home.active_nodes(),
            num_procs: home.active_processes(),
        }),
    )
}

/// Full discovery: B beacons, A connects, INIT handshake, mutual replay.
fn connect(a: &mut Instance, b: &mut Instance) -> Link {
    let b_index = b.cluster.local_index();
    a.cluster.handle_event(Event::Beacon {
        data: beacon_from(b, 5000),
        from: "127.0.0.2:5001".parse().unwrap(),
    });

    let a_tid = a
        .cluster
        .location(b_index)
        .and_then(|l| l.peer_listen_transport)
        .expect("outbound transport allocated on discovery");
    let (a_writer, a_out) = flume::unbounded();
    a.cluster.handle_event(Event::Connected { transport: a_tid, writer: a_writer });

    let b_tid = TransportId(9001);
    let (b_writer, b_out) = flume::unbounded();
    b.cluster.handle_event(Event::Accepted {
        kind: AcceptKind::Peer,
        transport: b_tid,
        addr: "127.0.0.1:40000".parse().unwrap(),
        writer: b_writer,
    });

    let link = Link { a_tid, b_tid, a_out, b_out };
    link.settle(a, b);
    link
}

/// Attach a node-facing client socket and complete its INIT exchange.
fn attach_node(
    instance: &mut Instance,
    transport: TransportId,
    node_index: u32,
    group: u32,
) -> Receiver<WriterCmd> {
    let (writer, out) = flume::unbounded();
    instance.cluster.handle_event(Event::Accepted {
        kind: AcceptKind::Node,
        transport,
        addr: "127.0.0.1:33000".parse().unwrap(),
        writer,
    });
    let init = node_proto::encode(
        node_proto::NodeHeader::request(1),
        &node_proto::NodeBody::InitRequest { node_index, group, keepalive_ms: 1000 },
    );
    instance.cluster.handle_event(Event::Bytes { transport, data: init });
    out
}

/// Drain a node writer channel into decoded frames.
fn node_frames(rx: &Receiver<WriterCmd>) -> Vec<node_proto::NodeFrame> {
    let mut frames = Vec::new();
    let mut decoder = node_proto::NodeDecoder::new();
    while let Ok(cmd) = rx.try_recv() {
        if let WriterCmd::Send(bytes) = cmd {
            decoder.push(&bytes);
            while let Ok(Some(frame)) = decoder.next() {
                frames.push(frame);
            }
        }
    }
    frames
}

fn fire_cluster_tick(instance: &mut Instance) {
    let id = instance.cluster.cluster_tick_timer();
    let generation = instance.cluster.timers().generation(id).unwrap();
    instance.cluster.handle_event(Event::Timer { id, generation });
}

#[test]
fn bootstrap_two_managers() {
    let mut a = instance(1, vec![]);
    let mut b = instance(2, vec![]);

    connect(&mut a, &mut b);

    let a_view = a.cluster.location(LocationIndex(2)).unwrap();
    assert_eq!(a_view.fsm.state(), PeerState::Active);
    assert_eq!(
        a.cluster.global().location(LocationIndex(2)).unwrap().status,
        GlobalStatus::Active
    );

    let b_view = b.cluster.location(LocationIndex(1)).unwrap();
    assert_eq!(b_view.fsm.state(), PeerState::Active);
    assert_eq!(
        b.cluster.global().location(LocationIndex(1)).unwrap().status,
        GlobalStatus::Active
    );
}

#[test]
fn node_registration_propagates_to_peer() {
    let mut a = instance(1, vec![config_node(42, 1, ConfigRole::None)]);
    let mut b = instance(2, vec![]);
    let link = connect(&mut a, &mut b);

    let node_out = attach_node(&mut a, TransportId(7001), 42, 1);

    // Local view: NULL -> WAITING -> ACTIVE.
    let node = a.cluster.location(LocationIndex(1)).unwrap().node(NodeIndex(42)).unwrap();
    assert_eq!(node.fsm.state(), NodeState::Active);
    assert_eq!(a.cluster.location(LocationIndex(1)).unwrap().active_nodes(), 1);

    // The node got its INIT response before anything else.
    let frames = node_frames(&node_out);
    assert!(matches!(
        frames.first().map(|f| &f.body),
        Some(node_proto::NodeBody::InitResponse { hardware_index: 1, .. })
    ));

    // Peer learns about node 42 under location 1.
    link.settle(&mut a, &mut b);
    let mirror = b.cluster.location(LocationIndex(1)).unwrap().node(NodeIndex(42)).unwrap();
    assert_eq!(mirror.fsm.state(), NodeState::Active);
    assert_eq!(b.cluster.location(LocationIndex(1)).unwrap().active_nodes(), 1);
    assert_eq!(
        b.cluster.global().node(NodeIndex(42)).unwrap().status,
        GlobalStatus::Active
    );
}

#[test]
fn wrong_group_init_is_ignored() {
    let mut a = instance(1, vec![config_node(42, 1, ConfigRole::None)]);
    let _ = attach_node(&mut a, TransportId(7001), 42, 9);

    let node = a.cluster.location(LocationIndex(1)).unwrap().node(NodeIndex(42)).unwrap();
    assert_eq!(node.fsm.state(), NodeState::Waiting);
}

#[test]
fn process_subscription_with_cross_binding() {
    let mut a = instance(1, vec![config_node(42, 1, ConfigRole::None)]);
    let mut b = instance(2, vec![config_node(43, 2, ConfigRole::None)]);
    let link = connect(&mut a, &mut b);

    let a_node_out = attach_node(&mut a, TransportId(7001), 42, 1);
    let b_node_out = attach_node(&mut b, TransportId(7002), 43, 2);
    link.settle(&mut a, &mut b);

    // The subscriber process registers itself first, then subscribes to
    // process type 7 with cross-binding.
    let create_subscriber = node_proto::encode(
        node_proto::NodeHeader::request(2),
        &node_proto::NodeBody::ProcessCreate(node_proto::ProcessInfo {
            proc_type: 9,
            pid: 0xAAAA,
            name: "subscriber".into(),
        }),
    );
    a.cluster.handle_event(Event::Bytes { transport: TransportId(7001), data: create_subscriber });
    link.settle(&mut a, &mut b);

    let mut tlvs = SmallVec::new();
    tlvs.push(node_proto::RegisterTlv { id: 7, cross_bind: true });
    let register = node_proto::encode(
        node_proto::NodeHeader::request(3),
        &node_proto::NodeBody::Register(node_proto::Register {
            subscriber_pid: 0xAAAA,
            subs_kind: SubsKind::Process.to_wire(),
            tlvs,
        }),
    );
    a.cluster.handle_event(Event::Bytes { transport: TransportId(7001), data: register });
    let _ = node_frames(&a_node_out);
    link.settle(&mut a, &mut b);

    // A process of type 7 appears locally.
    let create_target = node_proto::encode(
        node_proto::NodeHeader::request(4),
        &node_proto::NodeBody::ProcessCreate(node_proto::ProcessInfo {
            proc_type: 7,
            pid: 0xBBBB,
            name: "provider".into(),
        }),
    );
    a.cluster.handle_event(Event::Bytes { transport: TransportId(7001), data: create_target });

    let frames = node_frames(&a_node_out);
    let notify = frames
        .iter()
        .find_map(|f| match &f.body {
            node_proto::NodeBody::Notify(n)
                if n.notify_type == node_proto::NOTIFY_PROC_AVAILABLE =>
            {
                Some(*n)
            }
            _ => None,
        })
        .expect("subscriber notified of local process");
    assert_eq!(notify.subs_pid, 0xAAAA);
    assert_eq!(notify.proc_type, 7);
    assert_eq!(notify.id, 0xBBBB);
    assert_eq!(notify.addr_info.hw_index, 1);

    link.settle(&mut a, &mut b);

    // A remote process of the same type triggers a second notification,
    // referencing location 2 this time.
    let create_remote = node_proto::encode(
        node_proto::NodeHeader::request(5),
        &node_proto::NodeBody::ProcessCreate(node_proto::ProcessInfo {
            proc_type: 7,
            pid: 0xCCCC,
            name: "remote-provider".into(),
        }),
    );
    b.cluster.handle_event(Event::Bytes { transport: TransportId(7002), data: create_remote });
    let _ = node_frames(&b_node_out);
    link.settle(&mut a, &mut b);

    let frames = node_frames(&a_node_out);
    let notify = frames
        .iter()
        .find_map(|f| match &f.body {
            node_proto::NodeBody::Notify(n)
                if n.notify_type == node_proto::NOTIFY_PROC_AVAILABLE && n.id == 0xCCCC =>
            {
                Some(*n)
            }
            _ => None,
        })
        .expect("subscriber notified of remote process");
    assert_eq!(notify.subs_pid, 0xAAAA);
    assert_eq!(notify.addr_info.hw_index, 2);

    // Cross-binding propagated: location 2 runs the subscription rule
    // for the remote subscriber locally.
    assert!(b
        .cluster
        .subscriptions()
        .wildcards()
        .iter()
        .any(|w| w.kind == SubsKind::Process && w.value == 7));
}

#[test]
fn peer_silence_fails_the_location_exactly_once() {
    let mut a = instance(1, vec![config_node(42, 1, ConfigRole::None)]);
    let mut b = instance(2, vec![]);
    let link = connect(&mut a, &mut b);

    let _node_out = attach_node(&mut a, TransportId(7001), 42, 1);
    link.settle(&mut a, &mut b);
    assert_eq!(b.cluster.location(LocationIndex(1)).unwrap().active_nodes(), 1);

    // Three silent ticks cross the threshold on B.
    for _ in 0..3 {
        fire_cluster_tick(&mut b);
    }

    let dead = b.cluster.location(LocationIndex(1)).unwrap();
    assert_eq!(dead.fsm.state(), PeerState::Failed);
    assert_eq!(dead.active_nodes(), 0);
    assert_eq!(
        b.cluster.global().location(LocationIndex(1)).unwrap().status,
        GlobalStatus::Inactive
    );
    assert_eq!(
        b.cluster.global().node(NodeIndex(42)).unwrap().status,
        GlobalStatus::Inactive
    );
    let mirror = b.cluster.location(LocationIndex(1)).unwrap().node(NodeIndex(42)).unwrap();
    assert_eq!(mirror.fsm.state(), NodeState::Failed);

    // Further ticks change nothing; the failure fired once.
    fire_cluster_tick(&mut b);
    assert_eq!(
        b.cluster.location(LocationIndex(1)).unwrap().fsm.state(),
        PeerState::Failed
    );
}

#[test]
fn ha_pairing_across_locations() {
    let mut a = instance(1, vec![config_node(100, 1, ConfigRole::Active)]);
    let mut b = instance(2, vec![config_node(101, 1, ConfigRole::Passive)]);
    let link = connect(&mut a, &mut b);
    link.settle(&mut a, &mut b);

    let active = a.cluster.location(LocationIndex(1)).unwrap().node(NodeIndex(100)).unwrap();
    assert_eq!(active.current_role, NodeRole::Active);
    assert_eq!(active.partner, Some(NodeIndex(101)));

    let passive_mirror =
        a.cluster.location(LocationIndex(2)).unwrap().node(NodeIndex(101)).unwrap();
    assert_eq!(passive_mirror.current_role, NodeRole::Passive);

    let passive = b.cluster.location(LocationIndex(2)).unwrap().node(NodeIndex(101)).unwrap();
    assert_eq!(passive.current_role, NodeRole::Passive);
    assert_eq!(passive.partner, Some(NodeIndex(100)));

    // Role notifications for the unconnected nodes wait for a transport.
    assert!(a.cluster.pending_notifications() > 0);
}

#[test]
fn beacon_count_drift_triggers_replay() {
    let mut a = instance(1, vec![]);
    let mut b = instance(2, vec![]);
    let link = connect(&mut a, &mut b);

    // B suddenly advertises a node A has never heard of.
    let drifted = peer_proto::encode(
        2,
        0,
        &peer_proto::PeerBody::Keepalive(peer_proto::Beacon {
            listen_port: 5000,
            num_nodes: 1,
            num_procs: 0,
        }),
    );
    a.cluster.handle_event(Event::Beacon {
        data: drifted,
        from: "127.0.0.2:5001".parse().unwrap(),
    });

    assert!(a.cluster.location(LocationIndex(2)).unwrap().replay_in_progress);

    // A replays its inventory to B; B answers with its own end-of-replay,
    // which clears the flag.
    link.settle(&mut a, &mut b);
    let end = peer_proto::encode(
        2,
        0,
        &peer_proto::PeerBody::Replay(peer_proto::ReplayChunk {
            last: true,
            records: SmallVec::new(),
        }),
    );
    a.cluster.handle_event(Event::Bytes { transport: link.a_tid, data: end });
    assert!(!a.cluster.location(LocationIndex(2)).unwrap().replay_in_progress);
}

#[test]
fn out_of_order_replay_record_is_dropped() {
    let mut a = instance(1, vec![]);
    let mut b = instance(2, vec![]);
    let link = connect(&mut a, &mut b);

    // A process record for a node that was never replayed violates the
    // ordering contract; the frame is dropped, the session survives.
    let mut records = SmallVec::new();
    records.push(peer_proto::ReplayRecord {
        kind: peer_proto::RecordKind::Process,
        group: 7,
        node_id: 999,
        role: 0,
        running: 1,
        pid: 0x1,
    });
    let chunk = peer_proto::encode(
        2,
        0,
        &peer_proto::PeerBody::Replay(peer_proto::ReplayChunk { last: false, records }),
    );
    a.cluster.handle_event(Event::Bytes { transport: link.a_tid, data: chunk });

    let peer = a.cluster.location(LocationIndex(2)).unwrap();
    assert_eq!(peer.fsm.state(), PeerState::Active);
    assert!(peer.nodes.is_empty());
}

#[test]
fn duplicate_register_is_idempotent() {
    let mut a = instance(
        1,
        vec![ConfigNode {
            index: 42,
            name: "mp0".into(),
            role: ConfigRole::None,
            group: 1,
            subscriptions: vec![ConfigSubscription {
                kind: ConfigSubsKind::Group,
                value: 2,
                cross_bind: false,
            }],
        }],
    );
    let _out = attach_node(&mut a, TransportId(7001), 42, 1);

    let register = || {
        let mut tlvs = SmallVec::new();
        tlvs.push(node_proto::RegisterTlv { id: 2, cross_bind: false });
        node_proto::encode(
            node_proto::NodeHeader::request(9),
            &node_proto::NodeBody::Register(node_proto::Register {
                subscriber_pid: 0,
                subs_kind: SubsKind::Group.to_wire(),
                tlvs,
            }),
        )
    };
    a.cluster.handle_event(Event::Bytes { transport: TransportId(7001), data: register() });
    a.cluster.handle_event(Event::Bytes { transport: TransportId(7001), data: register() });

    // One wildcard entry total: config subscription plus the two
    // REGISTERs collapse into a single rule.
    let wildcards = a.cluster.subscriptions().wildcards();
    let matching: Vec<_> = wildcards
        .iter()
        .filter(|w| w.kind == SubsKind::Group && w.value == 2)
        .collect();
    assert_eq!(matching.len(), 1);
}

#[test]
fn node_keepalive_timeout_fails_the_node() {
    let mut a = instance(1, vec![config_node(42, 1, ConfigRole::None)]);
    let node_out = attach_node(&mut a, TransportId(7001), 42, 1);
    let _ = node_frames(&node_out);

    // Default threshold is 3; the INIT path already accounted one miss.
    let timer = a.cluster.node_timer(NodeIndex(42)).unwrap();
    for _ in 0..2 {
        let generation = a.cluster.timers().generation(timer).unwrap();
        a.cluster.handle_event(Event::Timer { id: timer, generation });
    }

    let node = a.cluster.location(LocationIndex(1)).unwrap().node(NodeIndex(42)).unwrap();
    assert_eq!(node.fsm.state(), NodeState::Waiting); // failed and re-armed
    assert_eq!(a.cluster.location(LocationIndex(1)).unwrap().active_nodes(), 0);
    assert_eq!(
        a.cluster.global().node(NodeIndex(42)).unwrap().status,
        GlobalStatus::Inactive
    );
}

#[test]
fn counters_stay_consistent_through_churn() {
    let mut a = instance(1, vec![config_node(42, 1, ConfigRole::None)]);
    let mut b = instance(2, vec![]);
    let link = connect(&mut a, &mut b);

    let _out = attach_node(&mut a, TransportId(7001), 42, 1);
    for pid in [0x10u32, 0x11, 0x12] {
        let create = node_proto::encode(
            node_proto::NodeHeader::request(pid),
            &node_proto::NodeBody::ProcessCreate(node_proto::ProcessInfo {
                proc_type: 7,
                pid,
                name: format!("p{pid}"),
            }),
        );
        a.cluster.handle_event(Event::Bytes { transport: TransportId(7001), data: create });
    }
    let destroy = node_proto::encode(
        node_proto::NodeHeader::request(0x11),
        &node_proto::NodeBody::ProcessDestroy(node_proto::ProcessInfo {
            proc_type: 7,
            pid: 0x11,
            name: String::new(),
        }),
    );
    a.cluster.handle_event(Event::Bytes { transport: TransportId(7001), data: destroy });
    link.settle(&mut a, &mut b);

    let home = a.cluster.location(LocationIndex(1)).unwrap();
    assert_eq!(home.active_processes(), 2);
    assert!(home.counters_consistent());

    let mirror = b.cluster.location(LocationIndex(1)).unwrap();
    assert_eq!(mirror.active_processes(), 2);
    assert!(mirror.counters_consistent());
}

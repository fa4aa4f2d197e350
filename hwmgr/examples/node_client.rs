//! Minimal node-side client.
//!
//! Attaches to a running manager as a configured node, registers interest
//! in a process type, announces one process of its own and then prints
//! every notification the manager sends.
//!
//! ```text
//! cargo run -p hwmgr -- -c hwmgr/examples/manager.toml
//! cargo run -p hwmgr --example node_client -- 127.0.0.1:4999 100 1 7
//! ```
//!
//! Arguments: `<manager addr> <node index> <group> <watched proc type>`.

use std::env;
use std::io;
use std::process::ExitCode;

use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::TcpStream;
use smallvec::SmallVec;

use hwmgr_proto::node::{
    self, NodeBody, NodeDecoder, NodeHeader, ProcessInfo, Register, RegisterTlv,
};

async fn send(stream: &mut TcpStream, frame: Bytes) -> io::Result<()> {
    let BufResult(res, _) = stream.write_all(frame.to_vec()).await;
    res
}

async fn recv_frame(
    stream: &mut TcpStream,
    decoder: &mut NodeDecoder,
) -> io::Result<node::NodeFrame> {
    loop {
        if let Some(frame) = decoder.next().map_err(io::Error::from)? {
            return Ok(frame);
        }
        let buf = Vec::with_capacity(2048);
        let BufResult(res, buf) = stream.read(buf).await;
        match res? {
            0 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "manager closed")),
            _ => decoder.push(&buf),
        }
    }
}

fn describe(notify: &node::Notify) -> String {
    let what = match notify.notify_type {
        node::NOTIFY_NODE_UP => "node up",
        node::NOTIFY_NODE_DOWN => "node down",
        node::NOTIFY_PROC_AVAILABLE => "process available",
        node::NOTIFY_PROC_GONE => "process gone",
        node::NOTIFY_HA_ROLE => "ha role",
        _ => "notification",
    };
    format!(
        "{what}: type={} id={:#x} location={} node={} group={}",
        notify.proc_type,
        notify.id,
        notify.addr_info.hw_index,
        notify.addr_info.node_id,
        notify.addr_info.group,
    )
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let (addr, node_index, group, watched) = match args.as_slice() {
        [addr, node_index, group, watched] => (
            addr.clone(),
            node_index.parse::<u32>().unwrap_or(100),
            group.parse::<u32>().unwrap_or(1),
            watched.parse::<u32>().unwrap_or(7),
        ),
        _ => {
            eprintln!("usage: node_client <addr> <node index> <group> <proc type>");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match compio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result: io::Result<()> = runtime.block_on(async move {
        let mut stream = TcpStream::connect(&addr).await?;
        let mut decoder = NodeDecoder::new();
        println!("connected to {addr}");

        // INIT handshake.
        let init = node::encode(
            NodeHeader::request(1),
            &NodeBody::InitRequest { node_index, group, keepalive_ms: 1000 },
        );
        send(&mut stream, init).await?;
        let frame = recv_frame(&mut stream, &mut decoder).await?;
        match frame.body {
            NodeBody::InitResponse { hardware_index, role, keepalive_ms } => {
                println!(
                    "registered with location {hardware_index} (role {role}, keepalive {keepalive_ms} ms)"
                );
            }
            other => {
                eprintln!("unexpected reply to INIT: {other:?}");
                return Ok(());
            }
        }

        // Watch a process type, cross-bound so remote managers learn of us.
        let mut tlvs = SmallVec::new();
        tlvs.push(RegisterTlv { id: watched, cross_bind: true });
        let register = node::encode(
            NodeHeader::request(2),
            &NodeBody::Register(Register { subscriber_pid: 0, subs_kind: 2, tlvs }),
        );
        send(&mut stream, register).await?;

        // Announce one process of our own.
        let create = node::encode(
            NodeHeader::request(3),
            &NodeBody::ProcessCreate(ProcessInfo {
                proc_type: watched,
                pid: std::process::id(),
                name: "node_client".into(),
            }),
        );
        send(&mut stream, create).await?;

        // Answer keepalives, print notifications.
        loop {
            let frame = recv_frame(&mut stream, &mut decoder).await?;
            match frame.body {
                NodeBody::Keepalive => {
                    let ka = node::encode(NodeHeader::request(0), &NodeBody::Keepalive);
                    send(&mut stream, ka).await?;
                }
                NodeBody::Notify(notify) => println!("{}", describe(&notify)),
                NodeBody::Register(_) if frame.hdr.response_ok => {
                    println!("subscription acknowledged");
                }
                NodeBody::ProcessCreate(_) if frame.hdr.response_ok => {
                    println!("process announced");
                }
                other => println!("frame: {other:?}"),
            }
        }
    });

    if let Err(err) = result {
        eprintln!("client stopped: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

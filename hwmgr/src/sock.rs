//! Socket pumps.
//!
//! One accepted or connected stream gets two tasks sharing the socket: a
//! read pump that forwards inbound bytes to the engine channel and a
//! write pump that drains the transport's writer channel. Neither holds
//! any protocol state; framing happens engine-side in the transport's
//! decoder. Listeners and the multicast receiver are tasks of the same
//! shape.
//!
//! # Safety
//!
//! Socket options not exposed by the runtime (TCP_NODELAY, multicast
//! membership, loop suppression) are set through `socket2` on the raw fd.
//! The socket is borrowed, configured and immediately forgotten so the fd
//! is never closed twice.

#![allow(unsafe_code)]

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;

use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::{TcpListener, TcpStream, UdpSocket};
use flume::Sender;
use tracing::{debug, trace, warn};

use hwmgr_core::ids::TransportId;

use crate::event::{AcceptKind, Event, EventTx};
use crate::transport::{IdAlloc, WriterCmd};

const READ_BUF_SIZE: usize = 8192;

/// Enable TCP_NODELAY on a compio stream.
fn enable_tcp_nodelay(stream: &TcpStream) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        sock.set_nodelay(true)?;
        std::mem::forget(sock); // Don't close the fd
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = stream;
        Ok(())
    }
}

/// Join the beacon group on a bound UDP socket and suppress loopback of
/// our own beacons.
fn configure_multicast(socket: &UdpSocket, group: Ipv4Addr) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = socket.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        let result = sock
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .and_then(|()| sock.set_multicast_loop_v4(false));
        std::mem::forget(sock); // Don't close the fd
        result
    }

    #[cfg(not(unix))]
    {
        let _ = (socket, group);
        Ok(())
    }
}

/// Spawn read and write pumps for a stream. Returns the writer channel
/// the engine attaches to the transport record.
pub fn spawn_stream_pumps(
    stream: TcpStream,
    id: TransportId,
    tx: EventTx,
) -> Sender<WriterCmd> {
    if let Err(err) = enable_tcp_nodelay(&stream) {
        debug!(?id, %err, "TCP_NODELAY not set");
    }

    let stream = Rc::new(stream);
    let (writer_tx, writer_rx) = flume::unbounded::<WriterCmd>();

    // Write pump: drain the writer channel into the socket.
    let write_stream = Rc::clone(&stream);
    compio::runtime::spawn(async move {
        while let Ok(cmd) = writer_rx.recv_async().await {
            match cmd {
                WriterCmd::Send(frame) => {
                    // Ownership-passing I/O wants an owned buffer.
                    let BufResult(res, _) = (&mut &*write_stream).write_all(frame.to_vec()).await;
                    if let Err(err) = res {
                        trace!(?id, %err, "write pump done");
                        break;
                    }
                }
                WriterCmd::Close => break,
            }
        }
    })
    .detach();

    // Read pump: kernel to engine until EOF or error.
    let read_tx = tx;
    compio::runtime::spawn(async move {
        loop {
            let buf = Vec::with_capacity(READ_BUF_SIZE);
            let BufResult(res, buf) = (&mut &*stream).read(buf).await;
            match res {
                Ok(0) => {
                    trace!(?id, "stream EOF");
                    let _ = read_tx.send(Event::Closed { transport: id });
                    break;
                }
                Ok(_) => {
                    let _ = read_tx.send(Event::Bytes {
                        transport: id,
                        data: Bytes::from(buf),
                    });
                }
                Err(err) => {
                    trace!(?id, %err, "stream read error");
                    let _ = read_tx.send(Event::Closed { transport: id });
                    break;
                }
            }
        }
    })
    .detach();

    writer_tx
}

/// Accept loop for one listener. Pumps are running before the engine
/// hears about the connection, so nothing the peer sends is lost.
pub fn spawn_listener(kind: AcceptKind, listener: TcpListener, alloc: IdAlloc, tx: EventTx) {
    compio::runtime::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let id = alloc.next();
                    debug!(?kind, ?id, %addr, "connection accepted");
                    let writer = spawn_stream_pumps(stream, id, tx.clone());
                    let _ = tx.send(Event::Accepted { kind, transport: id, addr, writer });
                }
                Err(err) => {
                    warn!(?kind, %err, "accept failed");
                }
            }
        }
    })
    .detach();
}

/// Non-blocking outbound connect; completion surfaces as an engine event.
pub fn spawn_connector(id: TransportId, addr: SocketAddr, tx: EventTx) {
    compio::runtime::spawn(async move {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!(?id, %addr, "peer connect completed");
                let writer = spawn_stream_pumps(stream, id, tx.clone());
                let _ = tx.send(Event::Connected { transport: id, writer });
            }
            Err(err) => {
                warn!(?id, %addr, %err, "peer connect failed");
                let _ = tx.send(Event::ConnectFailed { transport: id });
            }
        }
    })
    .detach();
}

/// Open the beacon socket: bind the configured port, join the group,
/// disable loopback. Returns the writer channel for beacon sends; inbound
/// datagrams arrive as [`Event::Beacon`].
pub async fn spawn_multicast(
    group: Ipv4Addr,
    port: u16,
    tx: EventTx,
) -> io::Result<Sender<WriterCmd>> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
    configure_multicast(&socket, group)?;

    let socket = Rc::new(socket);
    let dest = SocketAddr::from((group, port));
    let (writer_tx, writer_rx) = flume::unbounded::<WriterCmd>();

    // Beacon sender.
    let send_socket = Rc::clone(&socket);
    compio::runtime::spawn(async move {
        while let Ok(cmd) = writer_rx.recv_async().await {
            match cmd {
                WriterCmd::Send(frame) => {
                    let BufResult(res, _) = send_socket.send_to(frame.to_vec(), dest).await;
                    if let Err(err) = res {
                        warn!(%err, "beacon send failed");
                    }
                }
                WriterCmd::Close => break,
            }
        }
    })
    .detach();

    // Beacon receiver.
    compio::runtime::spawn(async move {
        loop {
            let buf = Vec::with_capacity(2048);
            let BufResult(res, buf) = socket.recv_from(buf).await;
            match res {
                Ok((_, from)) => {
                    let _ = tx.send(Event::Beacon { data: Bytes::from(buf), from });
                }
                Err(err) => {
                    warn!(%err, "beacon receive failed");
                    break;
                }
            }
        }
    })
    .detach();

    Ok(writer_tx)
}

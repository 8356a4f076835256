//! Kernel UDP datagram driver. Message boundaries are preserved: every
//! received datagram becomes one eom bvec delivered inline as `RecvMsg`,
//! and every queued message goes out as one gathered sendmsg.

use std::io::{self, IoSlice};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;

use mio::{Interest, Token};
use tracing::debug;

use crate::bind::{BindFlags, BindId, Notify, TransportState};
use crate::buffer::Bvec;
use crate::event::Event;
use crate::protocol::{Protocol, ProtocolId};
use crate::runtime::Runtime;
use crate::socket::common;

/// Largest payload a UDP datagram can carry; the staging bvec is replaced
/// once its remainder could truncate one.
const MAX_DATAGRAM: usize = 64 * 1024;

pub(crate) struct UdpState {
    pub socket: mio::net::UdpSocket,
    pub connected: bool,
    /// One whole buffer serves many datagrams: each receive slices off an
    /// eom bvec and advances the remainder.
    pub staging: Option<Bvec>,
}

pub(crate) const PROTOCOL: Protocol = Protocol {
    id: ProtocolId::DatagramSocketUdp,
    name: "DATAGRAM_SOCKET_UDP",
    stream: false,
    connected: false,
    connect,
    listen,
    close: common::close,
    flush: common::flush,
};

fn setup(rt: &mut Runtime, bind: BindId, socket: mio::net::UdpSocket, connected: bool) {
    let mut socket = socket;
    common::set_socket_buf_size(
        socket.as_raw_fd(),
        rt.cfg.socket_sndbuf,
        rt.cfg.socket_rcvbuf,
    );
    let event = rt.events.insert(Event::new(bind, read, write, error));
    rt.poller
        .registry()
        .register(&mut socket, Token(event.0), Interest::READABLE | Interest::WRITABLE)
        .expect("failed to register udp socket");

    let b = &mut rt.binds[bind.0];
    b.transport = TransportState::Udp(UdpState { socket, connected, staging: None });
    b.event = Some(event);
    rt.events.read_interest(event);
}

/// Vtable `listen` slot: local bind of an unconnected datagram socket.
fn listen(rt: &mut Runtime, bind: BindId) {
    let local = rt.binds[bind.0]
        .local
        .expect("datagram bind without local")
        .socket_addr();
    let socket = mio::net::UdpSocket::bind(local).expect("failed to bind udp socket");
    setup(rt, bind, socket, false);
}

/// Connected datagram bind: kernel-filtered peer, no per-send address.
fn connect(rt: &mut Runtime, bind: BindId) {
    let remote = rt.binds[bind.0]
        .remote
        .expect("udp connect without remote")
        .socket_addr();
    let local = rt.binds[bind.0].local.map_or_else(
        || {
            let ip: std::net::IpAddr = if remote.is_ipv4() {
                Ipv4Addr::UNSPECIFIED.into()
            } else {
                Ipv6Addr::UNSPECIFIED.into()
            };
            SocketAddr::new(ip, 0)
        },
        |e| e.socket_addr(),
    );
    let socket = mio::net::UdpSocket::bind(local).expect("failed to bind udp socket");
    socket.connect(remote).expect("failed to connect udp socket");
    setup(rt, bind, socket, true);
    rt.emit(bind, &Notify::Connected);
}

fn read(rt: &mut Runtime, bind: BindId) {
    loop {
        let (res, staged) = {
            let (binds, pool) = (&mut rt.binds, &mut rt.pool);
            let Some(b) = binds.get_mut(bind.0) else { return };
            let TransportState::Udp(u) = &mut b.transport else { return };

            let threshold = MAX_DATAGRAM.min(pool.buffer_size());
            if u.staging.as_ref().is_none_or(|s| s.len() < threshold) {
                if let Some(old) = u.staging.take() {
                    pool.release(old);
                }
                u.staging = Some(pool.alloc_whole());
            }
            let staged = *u.staging.as_ref().expect("udp staging missing");
            (u.socket.recv_from(pool.slice_mut(&staged)), staged)
        };

        match res {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(event) = common::event_of(rt, bind) {
                    rt.events.mark_unreadable(event);
                }
                return;
            }
            Err(e) => {
                let connected = rt
                    .binds
                    .get(bind.0)
                    .is_some_and(|b| matches!(&b.transport, TransportState::Udp(u) if u.connected));
                if connected {
                    debug!(err = ?e, bind = ?bind, "udp: recv failed");
                    rt.defer_close(bind, e.raw_os_error().unwrap_or(-1));
                    return;
                }
                // Stray async error (e.g. ICMP) on an unconnected socket;
                // the recv consumed it.
                debug!(err = ?e, bind = ?bind, "udp: transient recv error");
            }
            Ok((n, src)) => {
                let msg = {
                    let (binds, pool) = (&mut rt.binds, &mut rt.pool);
                    let Some(b) = binds.get_mut(bind.0) else { return };
                    let TransportState::Udp(u) = &mut b.transport else { return };
                    let msg = staged.front(n, true);
                    pool.incref(&msg);
                    u.staging.as_mut().expect("udp staging missing").advance(n);
                    msg
                };
                let iovecs = [msg];
                rt.emit(
                    bind,
                    &Notify::RecvMsg { iovecs: &iovecs, length: n, addr: Some(src) },
                );
                rt.pool.release(msg);
            }
        }
    }
}

fn write(rt: &mut Runtime, bind: BindId) {
    let mut bytes = 0_u64;
    let mut msgs = 0_u64;

    loop {
        let (res, msg_len) = {
            let binds = &mut rt.binds;
            let Some(b) = binds.get_mut(bind.0) else { return };
            let TransportState::Udp(u) = &mut b.transport else { return };
            if b.send_ring.is_empty() {
                break;
            }
            let mut iovs: Vec<IoSlice<'_>> = Vec::with_capacity(rt.cfg.max_num_iovec);
            let msg_len = b.send_ring.iov(&rt.pool, rt.cfg.max_num_iovec, true, &mut iovs);
            let dest = if u.connected { None } else { b.dgram_dest.front().copied() };
            iomux_utils::invariant!(
                u.connected || dest.is_some(),
                "message queued without destination on unconnected {bind:?}"
            );
            (
                common::sendmsg(u.socket.as_raw_fd(), &iovs, dest.as_ref()),
                msg_len,
            )
        };

        match res {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(event) = common::event_of(rt, bind) {
                    rt.events.mark_unwritable(event);
                }
                break;
            }
            Err(e) => {
                debug!(err = ?e, bind = ?bind, "udp: send failed");
                rt.defer_close(bind, e.raw_os_error().unwrap_or(-1));
                break;
            }
            Ok(_) => {
                let (binds, pool) = (&mut rt.binds, &mut rt.pool);
                let Some(b) = binds.get_mut(bind.0) else { return };
                b.send_ring.consume(pool, msg_len as usize);
                let unconnected =
                    matches!(&b.transport, TransportState::Udp(u) if !u.connected);
                if unconnected {
                    b.dgram_dest.pop_front();
                }
                bytes += msg_len;
                msgs += 1;
            }
        }
    }

    let wants_sent = rt
        .binds
        .get(bind.0)
        .is_some_and(|b| b.flags.contains(BindFlags::SENT_NOTIFY));
    if msgs > 0 && wants_sent {
        rt.emit(bind, &Notify::Sent { bytes, msgs });
    }

    let drained = rt.binds.get(bind.0).map(|b| {
        (
            b.send_ring.is_empty(),
            b.flags.contains(BindFlags::FINISH),
        )
    });
    if let Some((true, finish)) = drained {
        if let Some(event) = common::event_of(rt, bind) {
            rt.events.write_disinterest(event);
        }
        if finish {
            rt.defer_close(bind, 0);
        }
    }
}

fn error(rt: &mut Runtime, bind: BindId) {
    debug!(bind = ?bind, "udp: socket error");
    rt.defer_close(bind, libc::EIO);
}

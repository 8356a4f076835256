//! Kernel TCP stream driver: scatter readv into pooled staging buffers,
//! gathered writev out of the send ring, deferred close on every error
//! path.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::AsRawFd;

use mio::{Interest, Token};
use tracing::{debug, warn};

use crate::bind::{BindFlags, BindId, Notify, Segment, TransportState};
use crate::buffer::Bvec;
use crate::endpoint::Endpoint;
use crate::event::{Event, event_noop};
use crate::protocol::{Protocol, ProtocolId};
use crate::runtime::Runtime;
use crate::socket::common;

pub(crate) struct TcpState {
    pub stream: mio::net::TcpStream,
    /// False until the async connect resolved via SO_ERROR.
    pub connected: bool,
    /// Staging bvecs the next readv scatters into; consumed incrementally
    /// across wakes so received bytes coalesce in the recv ring.
    pub recv1: Option<Bvec>,
    pub recv2: Option<Bvec>,
}

pub(crate) struct TcpListenerState {
    pub listener: mio::net::TcpListener,
}

pub(crate) const PROTOCOL: Protocol = Protocol {
    id: ProtocolId::StreamSocketTcp,
    name: "STREAM_SOCKET_TCP",
    stream: true,
    connected: true,
    connect,
    listen,
    close: common::close,
    flush: common::flush,
};

fn connect(rt: &mut Runtime, bind: BindId) {
    let (local, remote) = {
        let b = &rt.binds[bind.0];
        (
            b.local.map(|e| e.socket_addr()),
            b.remote.expect("tcp connect without remote").socket_addr(),
        )
    };
    let mut stream =
        common::tcp_connect(local, remote).expect("failed to create tcp socket");
    stream.set_nodelay(true).expect("failed to set TCP_NODELAY");
    common::set_socket_buf_size(
        stream.as_raw_fd(),
        rt.cfg.socket_sndbuf,
        rt.cfg.socket_rcvbuf,
    );

    let event = rt.events.insert(Event::new(bind, read, write, error));
    rt.poller
        .registry()
        .register(&mut stream, Token(event.0), Interest::READABLE | Interest::WRITABLE)
        .expect("failed to register tcp stream");

    let b = &mut rt.binds[bind.0];
    b.transport = TransportState::Tcp(TcpState {
        stream,
        connected: false,
        recv1: None,
        recv2: None,
    });
    b.event = Some(event);
    rt.events.read_interest(event);
}

fn listen(rt: &mut Runtime, bind: BindId) {
    let local = rt.binds[bind.0]
        .local
        .expect("tcp listen without local")
        .socket_addr();
    let mut listener = common::tcp_listener(local, rt.cfg.max_pending as i32)
        .expect("failed to create tcp listener");

    let event = rt.events.insert(Event::new(bind, accept, event_noop, error));
    rt.poller
        .registry()
        .register(&mut listener, Token(event.0), Interest::READABLE)
        .expect("failed to register tcp listener");

    let b = &mut rt.binds[bind.0];
    b.transport = TransportState::TcpListener(TcpListenerState { listener });
    b.event = Some(event);
    rt.events.read_interest(event);
}

/// Read handler of a listener bind: accept until EAGAIN, wiring each new
/// connection up as its own bind.
fn accept(rt: &mut Runtime, bind: BindId) {
    loop {
        let accepted = {
            let Some(b) = rt.binds.get_mut(bind.0) else { return };
            let TransportState::TcpListener(l) = &mut b.transport else { return };
            l.listener.accept()
        };
        let (mut stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    warn!(err = ?e, "tcp: accept failed");
                }
                if let Some(event) = common::event_of(rt, bind) {
                    rt.events.mark_unreadable(event);
                }
                return;
            }
        };

        stream.set_nodelay(true).expect("failed to set TCP_NODELAY");
        common::set_socket_buf_size(
            stream.as_raw_fd(),
            rt.cfg.socket_sndbuf,
            rt.cfg.socket_rcvbuf,
        );

        let peer_ep = Endpoint::from(peer);
        let (protocol, local) = {
            let lb = &rt.binds[bind.0];
            (lb.protocol, lb.local)
        };
        let new_bind = rt.insert_bind(protocol, local, Some(peer_ep));

        let event = rt.events.insert(Event::new(new_bind, read, write, error));
        rt.poller
            .registry()
            .register(&mut stream, Token(event.0), Interest::READABLE | Interest::WRITABLE)
            .expect("failed to register accepted tcp stream");

        let nb = &mut rt.binds[new_bind.0];
        nb.transport = TransportState::Tcp(TcpState {
            stream,
            connected: true,
            recv1: None,
            recv2: None,
        });
        nb.event = Some(event);
        rt.events.read_interest(event);

        // The accept callback decides the new bind's handlers.
        let Some(mut accept_cb) = rt.binds[bind.0].accept.take() else {
            rt.defer_close(new_bind, 0);
            continue;
        };
        let ops = accept_cb(rt, new_bind, &peer_ep);
        if let Some(lb) = rt.binds.get_mut(bind.0) {
            if lb.accept.is_none() {
                lb.accept = Some(accept_cb);
            }
        }
        if let Some(nb) = rt.binds.get_mut(new_bind.0) {
            nb.notify = Some(ops.notify);
            nb.segment = ops.segment;
        }
        debug!(%peer_ep, bind = ?new_bind, "tcp: accepted");
        rt.emit(new_bind, &Notify::Connected);
    }
}

/// Resolves a pending async connect on the first readiness wake. Returns
/// false when the bind is unusable (connect failed, close deferred).
fn check_conn(rt: &mut Runtime, bind: BindId) -> bool {
    let taken = {
        let Some(b) = rt.binds.get_mut(bind.0) else { return false };
        if b.flags.contains(BindFlags::CLOSED) || rt.deferrals.is_armed(b.close_deferral) {
            // The error handler already claimed this bind; don't let a
            // consumed SO_ERROR read as a successful connect.
            return false;
        }
        let TransportState::Tcp(s) = &mut b.transport else { return false };
        if s.connected {
            return true;
        }
        s.connected = true;
        s.stream.take_error()
    };
    match taken {
        Ok(None) => {
            rt.emit(bind, &Notify::Connected);
            true
        }
        Ok(Some(e)) | Err(e) => {
            debug!(err = ?e, bind = ?bind, "tcp: connect failed");
            rt.defer_close(bind, e.raw_os_error().unwrap_or(-1));
            false
        }
    }
}

fn read(rt: &mut Runtime, bind: BindId) {
    if !check_conn(rt, bind) {
        return;
    }

    let (res, total) = {
        let (binds, pool) = (&mut rt.binds, &mut rt.pool);
        let Some(b) = binds.get_mut(bind.0) else { return };
        let TransportState::Tcp(s) = &mut b.transport else { return };

        // Double-buffered staging: one wake can fill across a buffer
        // boundary without copying.
        if s.recv1.is_none() {
            s.recv1 = match s.recv2.take() {
                Some(v) => Some(v),
                None => Some(pool.alloc_whole()),
            };
        }
        if s.recv2.is_none() {
            s.recv2 = Some(pool.alloc_whole());
        }
        let v1 = *s.recv1.as_ref().expect("recv1 staging missing");
        let v2 = *s.recv2.as_ref().expect("recv2 staging missing");
        let total = v1.len() + v2.len();

        let (s1, s2) = pool.slice_pair_mut(&v1, &v2);
        let mut iovs = [IoSliceMut::new(s1), IoSliceMut::new(s2)];
        (s.stream.read_vectored(&mut iovs), total)
    };

    let n = match res {
        Ok(0) => {
            // Graceful peer close.
            rt.defer_close(bind, 0);
            return;
        }
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            if let Some(event) = common::event_of(rt, bind) {
                rt.events.mark_unreadable(event);
            }
            return;
        }
        Err(e) => {
            debug!(err = ?e, bind = ?bind, "tcp: read failed");
            rt.defer_close(bind, e.raw_os_error().unwrap_or(-1));
            return;
        }
    };

    {
        let (binds, pool) = (&mut rt.binds, &mut rt.pool);
        let Some(b) = binds.get_mut(bind.0) else { return };
        let TransportState::Tcp(s) = &mut b.transport else { return };

        let mut v1 = s.recv1.take().expect("recv1 staging missing");
        let take1 = n.min(v1.len());
        b.recv_ring.append(pool, &mut v1, take1, false);
        if !v1.is_empty() {
            s.recv1 = Some(v1);
        }
        if n > take1 {
            let mut v2 = s.recv2.take().expect("recv2 staging missing");
            b.recv_ring.append(pool, &mut v2, n - take1, false);
            if !v2.is_empty() {
                s.recv2 = Some(v2);
            }
        }
    }

    if n < total {
        if let Some(event) = common::event_of(rt, bind) {
            rt.events.mark_unreadable(event);
        }
    }

    let segmented = rt.binds.get(bind.0).is_some_and(|b| b.segment.is_some());
    if segmented {
        segment_loop(rt, bind);
    } else {
        rt.emit(bind, &Notify::RecvData);
    }
}

/// Frames queued stream bytes into `RecvMsg` notifications using the
/// bind's segment callback.
fn segment_loop(rt: &mut Runtime, bind: BindId) {
    loop {
        let Some(verdict) = rt.run_segment(bind) else { return };
        let length = match verdict {
            Segment::Incomplete => return,
            Segment::Invalid => {
                warn!(bind = ?bind, "tcp: segment callback rejected stream");
                rt.defer_close(bind, libc::EPROTO);
                return;
            }
            Segment::Complete(0) => return,
            Segment::Complete(n) => n,
        };
        let queued = rt.binds.get(bind.0).map_or(0, |b| b.recv_ring.bytes());
        if queued < length as u64 {
            return;
        }

        let mut scratch = std::mem::take(&mut rt.msg_scratch);
        {
            let (binds, pool) = (&mut rt.binds, &mut rt.pool);
            let Some(b) = binds.get_mut(bind.0) else { return };
            b.recv_ring.copy_out(pool, &mut scratch, length);
        }
        let addr = rt
            .binds
            .get(bind.0)
            .and_then(|b| b.remote)
            .map(|e| e.socket_addr());
        rt.emit(bind, &Notify::RecvMsg { iovecs: &scratch, length, addr });
        for bv in scratch.drain(..) {
            rt.pool.release(bv);
        }
        rt.msg_scratch = scratch;
    }
}

fn write(rt: &mut Runtime, bind: BindId) {
    if !check_conn(rt, bind) {
        return;
    }

    let (res, total) = {
        let binds = &mut rt.binds;
        let Some(b) = binds.get_mut(bind.0) else { return };
        let TransportState::Tcp(s) = &mut b.transport else { return };
        if b.send_ring.is_empty() {
            (None, 0)
        } else {
            let mut iovs: Vec<IoSlice<'_>> = Vec::with_capacity(rt.cfg.max_num_iovec);
            let total = b.send_ring.iov(&rt.pool, rt.cfg.max_num_iovec, false, &mut iovs);
            (Some(s.stream.write_vectored(&iovs)), total)
        }
    };

    match res {
        None => {}
        Some(Ok(0)) => {
            rt.defer_close(bind, 0);
            return;
        }
        Some(Ok(n)) => {
            {
                let (binds, pool) = (&mut rt.binds, &mut rt.pool);
                let Some(b) = binds.get_mut(bind.0) else { return };
                b.send_ring.consume(pool, n);
            }
            if (n as u64) < total {
                if let Some(event) = common::event_of(rt, bind) {
                    rt.events.mark_unwritable(event);
                }
            }
            let wants_sent = rt
                .binds
                .get(bind.0)
                .is_some_and(|b| b.flags.contains(BindFlags::SENT_NOTIFY));
            if wants_sent {
                rt.emit(bind, &Notify::Sent { bytes: n as u64, msgs: 0 });
            }
        }
        Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {
            if let Some(event) = common::event_of(rt, bind) {
                rt.events.mark_unwritable(event);
            }
            return;
        }
        Some(Err(e)) => {
            debug!(err = ?e, bind = ?bind, "tcp: write failed");
            rt.defer_close(bind, e.raw_os_error().unwrap_or(-1));
            return;
        }
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
    let status = {
        match rt.binds.get_mut(bind.0).map(|b| &mut b.transport) {
            Some(TransportState::Tcp(s)) => s
                .stream
                .take_error()
                .ok()
                .flatten()
                .and_then(|e| e.raw_os_error())
                .unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    };
    debug!(bind = ?bind, status, "tcp: socket error");
    rt.defer_close(bind, status);
}

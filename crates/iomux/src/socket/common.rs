//! Shared plumbing for the kernel socket drivers: raw socket setup (the
//! options mio does not expose), sockaddr conversion, gathered sendmsg, and
//! the vtable slots both drivers share.

use std::io::{self, IoSlice};
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};

use crate::bind::{BindId, TransportState};
use crate::runtime::Runtime;

/// Sets kernel SO_SNDBUF / SO_RCVBUF where configured.
pub(crate) fn set_socket_buf_size(fd: RawFd, sndbuf: Option<usize>, rcvbuf: Option<usize>) {
    unsafe {
        if let Some(size) = sndbuf {
            let size = size as libc::c_int;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        if let Some(size) = rcvbuf {
            let size = size as libc::c_int;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}

pub(crate) fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            (storage, size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            (storage, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Non-blocking listener with an explicit backlog and SO_REUSEADDR /
/// SO_REUSEPORT, which mio's bind does not expose.
pub(crate) fn tcp_listener(addr: SocketAddr, backlog: i32) -> io::Result<mio::net::TcpListener> {
    let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    unsafe {
        let fd = libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let yes: libc::c_int = 1;
        for opt in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &yes as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                return Err(close_on_error(fd));
            }
        }
        let (storage, len) = sockaddr_from(&addr);
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
            return Err(close_on_error(fd));
        }
        if libc::listen(fd, backlog) < 0 {
            return Err(close_on_error(fd));
        }
        Ok(mio::net::TcpListener::from_raw_fd(fd))
    }
}

/// Non-blocking connect, optionally from a bound local address. EINPROGRESS
/// is the expected path; completion is observed via SO_ERROR on the first
/// readiness wake.
pub(crate) fn tcp_connect(
    local: Option<SocketAddr>,
    remote: SocketAddr,
) -> io::Result<mio::net::TcpStream> {
    let family = if remote.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    unsafe {
        let fd = libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if let Some(local) = local {
            let (storage, len) = sockaddr_from(&local);
            if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
                return Err(close_on_error(fd));
            }
        }
        let (storage, len) = sockaddr_from(&remote);
        if libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                libc::close(fd);
                return Err(err);
            }
        }
        Ok(mio::net::TcpStream::from_raw_fd(fd))
    }
}

unsafe fn close_on_error(fd: RawFd) -> io::Error {
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    err
}

/// Gathered datagram send. `IoSlice` is ABI-compatible with `iovec`.
pub(crate) fn sendmsg(
    fd: RawFd,
    iovs: &[IoSlice<'_>],
    dest: Option<&SocketAddr>,
) -> io::Result<usize> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    if let Some(addr) = dest {
        let (ss, len) = sockaddr_from(addr);
        storage = ss;
        msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = len;
    }
    msg.msg_iov = iovs.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iovs.len();
    let res = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Shared `flush` vtable slot: a send ring went non-empty, raise write
/// interest and let the write handler drain it.
pub(crate) fn flush(rt: &mut Runtime, bind: BindId) {
    if let Some(event) = rt.binds.get(bind.0).and_then(|b| b.event) {
        rt.events.write_interest(event);
    }
}

/// Shared `close` vtable slot: deregister, release staging refs, drop the
/// socket. Ring drain and the terminal notification stay with the caller
/// (the bind's close deferral).
pub(crate) fn close(rt: &mut Runtime, bind: BindId) {
    let Some(b) = rt.binds.get_mut(bind.0) else { return };
    let event = b.event.take();
    let transport = std::mem::replace(&mut b.transport, TransportState::Closed);
    match transport {
        TransportState::Tcp(mut s) => {
            let _ = rt.poller.registry().deregister(&mut s.stream);
            let _ = s.stream.shutdown(std::net::Shutdown::Both);
            if let Some(v) = s.recv1.take() {
                rt.pool.release(v);
            }
            if let Some(v) = s.recv2.take() {
                rt.pool.release(v);
            }
        }
        TransportState::TcpListener(mut l) => {
            let _ = rt.poller.registry().deregister(&mut l.listener);
        }
        TransportState::Udp(mut u) => {
            let _ = rt.poller.registry().deregister(&mut u.socket);
            if let Some(v) = u.staging.take() {
                rt.pool.release(v);
            }
        }
        TransportState::Closed => {}
    }
    if let Some(event) = event {
        rt.events.remove(event);
    }
}

/// Readiness event id of a bind's transport, if it still has one.
#[inline]
pub(crate) fn event_of(rt: &Runtime, bind: BindId) -> Option<crate::event::EventId> {
    rt.binds.get(bind.0).and_then(|b| b.event)
}

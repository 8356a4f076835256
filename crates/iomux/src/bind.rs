use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use bitflags::bitflags;

use crate::buffer::Bvec;
use crate::deferral::DeferralId;
use crate::endpoint::Endpoint;
use crate::event::EventId;
use crate::protocol::ProtocolId;
use crate::ring::IovecRing;
use crate::runtime::Runtime;
use crate::socket::tcp::{TcpListenerState, TcpState};
use crate::socket::udp::UdpState;

/// Handle for a connection-like endpoint instance: a listener, a connected
/// peer, or an unconnected datagram socket.
///
/// Ids are slab keys owned by one runtime; they are recycled after the bind
/// is destroyed and must not be used across runtimes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindId(pub(crate) usize);

impl fmt::Debug for BindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bind#{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct BindFlags: u32 {
        /// Deliver `Sent` notifications as the send ring drains.
        const SENT_NOTIFY = 0x01;
        /// Graceful close requested; close defers once the send ring drains.
        const FINISH = 0x02;
        /// Teardown has started; any further use is a contract violation.
        const CLOSED = 0x04;
    }
}

/// Events delivered to a bind's notify callback.
///
/// Per bind, `Connected` precedes all data notifications, wire order is
/// preserved across `RecvMsg`/`RecvData`/`Sent`, and `Disconnected` is
/// terminal.
#[derive(Debug)]
pub enum Notify<'a> {
    Connected,
    /// Terminal. `status` is zero for a graceful peer close and non-zero for
    /// protocol or socket errors.
    Disconnected { status: i32 },
    /// Stream data arrived; pull it with `recv`/`peek`.
    RecvData,
    /// A complete message, delivered inline. The bvecs are only valid for
    /// the duration of the callback.
    RecvMsg {
        iovecs: &'a [Bvec],
        length: usize,
        addr: Option<SocketAddr>,
    },
    /// Bytes and (for datagram binds) messages just drained from the send
    /// ring. Only delivered after `request_send_notifications`.
    Sent { bytes: u64, msgs: u64 },
}

/// Verdict of a segment callback inspecting the head of the recv ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Not enough bytes to determine a message boundary yet.
    Incomplete,
    /// The stream is corrupt; the bind is torn down.
    Invalid,
    /// The next message spans exactly this many bytes.
    Complete(usize),
}

pub type NotifyFn = Box<dyn for<'a> FnMut(&mut Runtime, BindId, &Notify<'a>)>;
pub type SegmentFn = Box<dyn FnMut(&mut Runtime, BindId) -> Segment>;
pub type AcceptFn = Box<dyn FnMut(&mut Runtime, BindId, &Endpoint) -> BindOps>;

/// Per-connection handlers handed to `connect`/`bind`, or produced by a
/// listener's accept callback for each inbound connection.
pub struct BindOps {
    pub(crate) notify: NotifyFn,
    pub(crate) segment: Option<SegmentFn>,
}

impl BindOps {
    pub fn new(notify: impl for<'a> FnMut(&mut Runtime, BindId, &Notify<'a>) + 'static) -> Self {
        Self { notify: Box::new(notify), segment: None }
    }

    /// Installs a segment callback: received bytes are framed into
    /// `RecvMsg` notifications instead of whole-stream `RecvData`.
    pub fn with_segment(
        mut self,
        segment: impl FnMut(&mut Runtime, BindId) -> Segment + 'static,
    ) -> Self {
        self.segment = Some(Box::new(segment));
        self
    }
}

/// Transport-private state, dispatched by discriminant through the
/// protocol vtable.
pub(crate) enum TransportState {
    TcpListener(TcpListenerState),
    Tcp(TcpState),
    Udp(UdpState),
    /// Transport already shut down by the close deferral.
    Closed,
}

pub(crate) struct Bind {
    pub protocol: ProtocolId,
    pub local: Option<Endpoint>,
    pub remote: Option<Endpoint>,
    pub send_ring: IovecRing,
    pub recv_ring: IovecRing,
    /// Destination per queued outbound message on unconnected datagram
    /// binds; parallel to the eom boundaries in `send_ring`.
    pub dgram_dest: VecDeque<SocketAddr>,
    pub notify: Option<NotifyFn>,
    pub segment: Option<SegmentFn>,
    pub accept: Option<AcceptFn>,
    pub flags: BindFlags,
    pub transport: TransportState,
    pub event: Option<EventId>,
    pub close_deferral: DeferralId,
    /// Status carried by the terminal `Disconnected` notification.
    pub close_status: i32,
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::Waker;
use slab::Slab;
use tracing::debug;

use crate::bind::{Bind, BindFlags, BindId, BindOps, Notify, Segment, TransportState};
use crate::buffer::{BufferPool, Bvec};
use crate::config::Config;
use crate::deferral::{DeferralId, DeferralKind, DeferralQueue};
use crate::endpoint::Endpoint;
use crate::event::{EventFlags, EventId, EventSet};
use crate::framework;
use crate::poll::{Poller, UserPollId};
use crate::protocol::{Protocol, ProtocolId};
use crate::ring::IovecRing;
use crate::socket;

/// Thread-safe stop signal for a running [`Runtime`].
///
/// Obtain one with [`Runtime::stop_handle`] before handing the runtime to
/// its loop; `stop` may then be called from any thread. The loop returns
/// after finishing the current turn and draining pending deferrals — no
/// in-flight callback is interrupted.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

/// The per-thread event loop and its owned state: buffer pool, bind table,
/// event machine, deferral queue, and readiness sources.
///
/// Single-threaded by construction — every method other than
/// [`StopHandle::stop`] must be called from the thread that created the
/// runtime, and callbacks re-enter it on that same thread. Local resource
/// failures (fd or memory exhaustion) and contract violations abort with a
/// diagnostic rather than limping on.
pub struct Runtime {
    pub(crate) cfg: Config,
    pub(crate) pool: BufferPool,
    pub(crate) binds: Slab<Bind>,
    pub(crate) events: EventSet,
    pub(crate) deferrals: DeferralQueue,
    pub(crate) poller: Poller,
    protocols: Vec<Protocol>,
    framework_state: Vec<Option<Box<dyn std::any::Any>>>,
    stop: Arc<AtomicBool>,
    /// Scratch for `RecvMsg` descriptor arrays; taken out while a
    /// notification is being delivered.
    pub(crate) msg_scratch: Vec<Bvec>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Runtime {
    pub fn new(cfg: Config) -> Self {
        let pool = BufferPool::new(cfg.buffer_size, cfg.pool_hiwater);
        let poller = Poller::new(cfg.poll_events);
        let mut rt = Self {
            cfg,
            pool,
            binds: Slab::new(),
            events: EventSet::new(),
            deferrals: DeferralQueue::new(),
            poller,
            protocols: vec![socket::tcp::PROTOCOL, socket::udp::PROTOCOL],
            framework_state: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            msg_scratch: Vec::new(),
        };
        let mut states = Vec::new();
        framework::with_frameworks(|id, fw, handle| {
            debug_assert_eq!(states.len(), id);
            states.push(Some(fw.create(&mut rt, handle)));
        });
        rt.framework_state = states;
        rt
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { stop: Arc::clone(&self.stop), waker: self.poller.waker() }
    }

    /// One loop turn: poll readiness, run user polls, dispatch runnable
    /// events, drain deferrals.
    ///
    /// `timeout_ms` of -1 blocks, 0 polls, positive values bound the wait.
    /// The wait collapses to zero whenever an event is already runnable, a
    /// deferral is armed, or a user poll is registered.
    pub fn wait(&mut self, timeout_ms: i32) {
        let eager = self.events.has_runnable()
            || self.deferrals.pending()
            || self.poller.has_user_polls()
            || self.cfg.busy_poll;
        let timeout = if eager || timeout_ms == 0 {
            Some(Duration::ZERO)
        } else if timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms as u64))
        };

        self.poller.poll(timeout);
        let wakes = self.poller.take_wakes();
        for wake in &wakes {
            if self.events.get(wake.event).is_none() {
                // A closed fd's token was recycled between poll and dispatch.
                continue;
            }
            if wake.error {
                self.events.mark_error(wake.event);
            }
            if wake.readable {
                self.events.mark_readable(wake.event);
            }
            if wake.writable {
                self.events.mark_writable(wake.event);
            }
        }
        self.poller.put_wakes(wakes);

        if self.poller.has_user_polls() {
            self.run_user_polls();
        }

        let mut i = 0;
        while i < self.events.active_len() {
            let id = self.events.active_at(i);
            i += 1;
            self.dispatch(id);
        }
        self.events.sweep();

        // Only deferrals armed before this point run now; re-arms land in
        // the next turn.
        let armed = self.deferrals.armed_len();
        for _ in 0..armed {
            let Some(id) = self.deferrals.pop_armed() else { break };
            self.run_deferral(id);
        }
    }

    /// Loops until a [`StopHandle`] fires, then drains pending deferrals
    /// and returns.
    pub fn run(&mut self) {
        while !self.stop.load(Ordering::Acquire) {
            self.wait(-1);
        }
        while let Some(id) = self.deferrals.pop_armed() {
            self.run_deferral(id);
        }
    }

    // ---- bind creation -------------------------------------------------

    /// Starts a listener. `accept` runs once per inbound connection and
    /// returns the handlers for the new bind.
    pub fn listen(
        &mut self,
        protocol: ProtocolId,
        local: &Endpoint,
        accept: impl FnMut(&mut Self, BindId, &Endpoint) -> BindOps + 'static,
    ) -> BindId {
        let driver = self.driver(protocol);
        assert!(driver.connected, "listen on connectionless protocol {protocol}");
        let id = self.insert_bind(protocol, Some(*local), None);
        self.binds[id.0].accept = Some(Box::new(accept));
        (driver.listen)(self, id);
        debug!(%local, %protocol, bind = ?id, "listening");
        id
    }

    /// Initiates an outbound connection. `Connected` (or a terminal
    /// `Disconnected`) is delivered once the attempt resolves.
    pub fn connect(
        &mut self,
        protocol: ProtocolId,
        local: Option<&Endpoint>,
        remote: &Endpoint,
        ops: BindOps,
    ) -> BindId {
        let driver = self.driver(protocol);
        let id = self.insert_bind(protocol, local.copied(), Some(*remote));
        let bind = &mut self.binds[id.0];
        bind.notify = Some(ops.notify);
        bind.segment = ops.segment;
        (driver.connect)(self, id);
        debug!(%remote, %protocol, bind = ?id, "connecting");
        id
    }

    /// Creates an unconnected datagram bind on `local`. Messages are sent
    /// with `sendto`/`sendtov` and arrive as `RecvMsg` carrying the source
    /// address.
    pub fn bind(&mut self, protocol: ProtocolId, local: &Endpoint, ops: BindOps) -> BindId {
        let driver = self.driver(protocol);
        assert!(
            !driver.stream,
            "bind requires a datagram protocol, {protocol} is stream"
        );
        let id = self.insert_bind(protocol, Some(*local), None);
        let bind = &mut self.binds[id.0];
        bind.notify = Some(ops.notify);
        bind.segment = ops.segment;
        (driver.listen)(self, id);
        debug!(%local, %protocol, bind = ?id, "bound");
        id
    }

    // ---- data plane ----------------------------------------------------

    /// Copying send: allocates pooled bvecs, copies `data`, and enqueues.
    pub fn send(&mut self, bind: BindId, data: &[u8]) {
        self.assert_sendable(bind);
        let bvecs = self.alloc_and_fill(data);
        self.enqueue_send(bind, &bvecs, data.len(), None);
    }

    /// Zero-copy send: takes ownership of one refcount unit per bvec. The
    /// caller must not release them afterwards.
    pub fn sendv(&mut self, bind: BindId, bvecs: &[Bvec], length: usize) {
        self.assert_sendable(bind);
        self.enqueue_send(bind, bvecs, length, None);
    }

    /// Copying send to an explicit destination (unconnected datagram binds).
    pub fn sendto(&mut self, bind: BindId, remote: &Endpoint, data: &[u8]) {
        self.assert_sendable(bind);
        let bvecs = self.alloc_and_fill(data);
        self.enqueue_send(bind, &bvecs, data.len(), Some(remote.socket_addr()));
    }

    /// Zero-copy send to an explicit destination.
    pub fn sendtov(&mut self, bind: BindId, remote: &Endpoint, bvecs: &[Bvec], length: usize) {
        self.assert_sendable(bind);
        self.enqueue_send(bind, bvecs, length, Some(remote.socket_addr()));
    }

    /// Sending on a closing, closed, or finished bind is a contract
    /// violation, checked before any refcounts move.
    fn assert_sendable(&self, bind: BindId) {
        let b = self.binds.get(bind.0).expect("send on unknown bind");
        assert!(
            !b.flags.contains(BindFlags::CLOSED) && !self.deferrals.is_armed(b.close_deferral),
            "send on closed {bind:?}"
        );
        assert!(!b.flags.contains(BindFlags::FINISH), "send on finished {bind:?}");
    }

    /// Pulls `want` bytes of stream data as bvec descriptors, transferring
    /// their refcounts to the caller. Returns 0 without touching the ring
    /// when fewer than `want` bytes are queued; otherwise returns `want`.
    ///
    /// Fatal on a segmented bind — framed binds deliver `RecvMsg` inline
    /// and have no pullable byte stream.
    pub fn recv(&mut self, bind: BindId, out: &mut Vec<Bvec>, max_bvecs: usize, want: usize) -> usize {
        let b = self.binds.get_mut(bind.0).expect("recv on unknown bind");
        assert!(b.segment.is_none(), "recv on segmented {bind:?}");
        if (b.recv_ring.bytes() as usize) < want {
            return 0;
        }
        let niov = b.recv_ring.copy_out(&mut self.pool, out, want);
        assert!(
            niov <= max_bvecs,
            "recv of {want} bytes on {bind:?} spans {niov} bvecs (max {max_bvecs})"
        );
        want
    }

    /// Copies queued receive bytes without consuming them; the tool segment
    /// callbacks use to decode frame headers.
    pub fn peek(&self, bind: BindId, out: &mut [u8]) -> usize {
        let b = self.binds.get(bind.0).expect("peek on unknown bind");
        b.recv_ring.peek(&self.pool, out)
    }

    /// Graceful close: the close deferral arms once the send ring drains.
    pub fn finish(&mut self, bind: BindId) {
        let (drained, deferral) = {
            let b = self.binds.get_mut(bind.0).expect("finish on unknown bind");
            assert!(
                !b.flags.contains(BindFlags::CLOSED),
                "finish on closed {bind:?}"
            );
            b.flags.insert(BindFlags::FINISH);
            (b.send_ring.is_empty(), b.close_deferral)
        };
        if drained {
            self.deferrals.arm(deferral);
        }
    }

    /// Arms the bind's close deferral. Teardown happens at the end of the
    /// turn, so it is always safe to call from inside a handler running on
    /// the same bind. Idempotent.
    pub fn close(&mut self, bind: BindId) {
        let deferral = self.binds.get(bind.0).expect("close on unknown bind").close_deferral;
        self.deferrals.arm(deferral);
    }

    /// Enables `Sent` notifications as the send ring drains.
    pub fn request_send_notifications(&mut self, bind: BindId) {
        self.binds
            .get_mut(bind.0)
            .expect("request_send_notifications on unknown bind")
            .flags
            .insert(BindFlags::SENT_NOTIFY);
    }

    // ---- buffers -------------------------------------------------------

    /// Allocates `length` bytes as up to `max_bvecs` pooled segments, each
    /// aligned to `alignment`. The caller owns one refcount unit per bvec.
    pub fn alloc(&mut self, length: usize, alignment: usize, max_bvecs: usize) -> Vec<Bvec> {
        let mut out = Vec::new();
        self.pool.alloc(length, alignment, max_bvecs, &mut out);
        out
    }

    #[inline]
    pub fn bvec(&self, bvec: &Bvec) -> &[u8] {
        self.pool.slice(bvec)
    }

    #[inline]
    pub fn bvec_mut(&mut self, bvec: &Bvec) -> &mut [u8] {
        self.pool.slice_mut(bvec)
    }

    #[inline]
    pub fn release(&mut self, bvec: Bvec) {
        self.pool.release(bvec);
    }

    // ---- introspection -------------------------------------------------

    pub fn send_pending(&self, bind: BindId) -> u64 {
        self.binds.get(bind.0).map_or(0, |b| b.send_ring.bytes())
    }

    pub fn recv_pending(&self, bind: BindId) -> u64 {
        self.binds.get(bind.0).map_or(0, |b| b.recv_ring.bytes())
    }

    /// The bind's actual local address, once the transport is set up.
    pub fn local_endpoint(&self, bind: BindId) -> Option<Endpoint> {
        let b = self.binds.get(bind.0)?;
        let addr = match &b.transport {
            TransportState::TcpListener(l) => l.listener.local_addr().ok(),
            TransportState::Tcp(s) => s.stream.local_addr().ok(),
            TransportState::Udp(u) => u.socket.local_addr().ok(),
            TransportState::Closed => None,
        };
        addr.map(Endpoint::from).or(b.local)
    }

    pub fn remote_endpoint(&self, bind: BindId) -> Option<Endpoint> {
        self.binds.get(bind.0).and_then(|b| b.remote)
    }

    // ---- extension points ---------------------------------------------

    /// Registers a transport driver; used by frameworks from their `create`
    /// hook.
    pub fn register_protocol(&mut self, protocol: Protocol) {
        assert!(
            self.protocols.iter().all(|p| p.id != protocol.id),
            "protocol {} registered twice",
            protocol.id
        );
        self.protocols.push(protocol);
    }

    /// Registers a callback polled once per loop turn; while any user poll
    /// exists the loop spins with a zero timeout.
    pub fn add_user_poll(&mut self, f: impl FnMut(&mut Self) + 'static) -> UserPollId {
        self.poller.add_user_poll(Box::new(f))
    }

    pub fn remove_user_poll(&mut self, id: UserPollId) {
        self.poller.remove_user_poll(id);
    }

    /// Creates a single-shot callback runnable via [`defer`](Self::defer).
    pub fn add_deferral(&mut self, f: impl FnMut(&mut Self) + 'static) -> DeferralId {
        self.deferrals.create(DeferralKind::Callback(Box::new(f)))
    }

    /// Arms a deferral for the end of the current turn. Arming an armed
    /// deferral is a no-op.
    pub fn defer(&mut self, id: DeferralId) {
        self.deferrals.arm(id);
    }

    pub fn remove_deferral(&mut self, id: DeferralId) {
        self.deferrals.remove(id);
    }

    /// Per-runtime state created by a registered framework.
    pub fn framework_state(&mut self, id: framework::FrameworkId) -> Option<&mut (dyn std::any::Any)> {
        self.framework_state.get_mut(id).and_then(|s| s.as_deref_mut())
    }

    // ---- internals -----------------------------------------------------

    pub(crate) fn driver(&self, id: ProtocolId) -> Protocol {
        *self
            .protocols
            .iter()
            .find(|p| p.id == id)
            .unwrap_or_else(|| panic!("no driver registered for protocol {id}"))
    }

    pub(crate) fn insert_bind(
        &mut self,
        protocol: ProtocolId,
        local: Option<Endpoint>,
        remote: Option<Endpoint>,
    ) -> BindId {
        let entry = self.binds.vacant_entry();
        let id = BindId(entry.key());
        let close_deferral = self.deferrals.create(DeferralKind::CloseBind(id));
        entry.insert(Bind {
            protocol,
            local,
            remote,
            send_ring: IovecRing::with_capacity(self.cfg.ring_size),
            recv_ring: IovecRing::with_capacity(self.cfg.ring_size),
            dgram_dest: std::collections::VecDeque::new(),
            notify: None,
            segment: None,
            accept: None,
            flags: BindFlags::empty(),
            transport: TransportState::Closed,
            event: None,
            close_deferral,
            close_status: 0,
        });
        id
    }

    fn alloc_and_fill(&mut self, data: &[u8]) -> Vec<Bvec> {
        let max = self.cfg.max_num_iovec;
        let bvecs = self.alloc(data.len(), 0, max);
        let mut off = 0;
        for bv in &bvecs {
            let chunk = bv.len();
            self.pool.slice_mut(bv).copy_from_slice(&data[off..off + chunk]);
            off += chunk;
        }
        bvecs
    }

    fn enqueue_send(
        &mut self,
        bind: BindId,
        bvecs: &[Bvec],
        length: usize,
        dest: Option<SocketAddr>,
    ) {
        assert!(!bvecs.is_empty(), "send of zero bvecs on {bind:?}");
        let (protocol, was_empty) = {
            let b = self.binds.get_mut(bind.0).expect("send on unknown bind");
            debug_assert_eq!(bvecs.iter().map(Bvec::len).sum::<usize>(), length);
            (b.protocol, b.send_ring.is_empty())
        };
        let driver = self.driver(protocol);
        {
            let b = &mut self.binds[bind.0];
            let unconnected =
                matches!(&b.transport, TransportState::Udp(u) if !u.connected);
            if unconnected {
                let addr =
                    dest.expect("send on unconnected datagram bind requires a destination");
                b.dgram_dest.push_back(addr);
            } else {
                assert!(dest.is_none(), "sendto on connected {bind:?}");
            }
            let last = bvecs.len() - 1;
            for (i, bv) in bvecs.iter().enumerate() {
                let mut v = *bv;
                v.set_eom(!driver.stream && i == last);
                b.send_ring.add(v);
            }
        }
        if was_empty {
            (driver.flush)(self, bind);
        }
    }

    /// Delivers a notification through the bind's notify callback. The
    /// callback is moved out while it runs so it can freely re-enter the
    /// runtime; a replacement installed mid-call wins over the old one.
    pub(crate) fn emit(&mut self, bind: BindId, notify: &Notify<'_>) {
        let Some(b) = self.binds.get_mut(bind.0) else { return };
        let Some(mut cb) = b.notify.take() else { return };
        cb(self, bind, notify);
        if let Some(b) = self.binds.get_mut(bind.0) {
            if b.notify.is_none() {
                b.notify = Some(cb);
            }
        }
    }

    /// Runs the bind's segment callback once, if installed.
    pub(crate) fn run_segment(&mut self, bind: BindId) -> Option<Segment> {
        let mut cb = self.binds.get_mut(bind.0)?.segment.take()?;
        let verdict = cb(self, bind);
        if let Some(b) = self.binds.get_mut(bind.0) {
            if b.segment.is_none() {
                b.segment = Some(cb);
            }
        }
        Some(verdict)
    }

    /// Arms the bind's close deferral with a terminal status. The first
    /// non-zero status wins.
    pub(crate) fn defer_close(&mut self, bind: BindId, status: i32) {
        if let Some(b) = self.binds.get_mut(bind.0) {
            if b.close_status == 0 {
                b.close_status = status;
            }
            let deferral = b.close_deferral;
            self.deferrals.arm(deferral);
        }
    }

    fn dispatch(&mut self, id: EventId) {
        let Some(ev) = self.events.get(id) else { return };
        let (bind, read_fn, write_fn, error_fn) = (ev.bind, ev.read_fn, ev.write_fn, ev.error_fn);
        if ev.flags.contains(EventFlags::ERROR) {
            error_fn(self, bind);
        }
        if self.events.get(id).is_some_and(|e| e.flags.read_ready()) {
            read_fn(self, bind);
        }
        if self.events.get(id).is_some_and(|e| e.flags.write_ready()) {
            write_fn(self, bind);
        }
    }

    fn run_user_polls(&mut self) {
        for id in self.poller.user_poll_ids() {
            if let Some(mut f) = self.poller.take_user_poll(id) {
                f(self);
                self.poller.restore_user_poll(id, f);
            }
        }
    }

    fn run_deferral(&mut self, id: DeferralId) {
        match self.deferrals.take_kind(id) {
            DeferralKind::CloseBind(bind) => {
                self.deferrals.restore(id, DeferralKind::CloseBind(bind));
                self.teardown_bind(bind);
            }
            DeferralKind::Callback(mut f) => {
                f(self);
                self.deferrals.restore(id, DeferralKind::Callback(f));
            }
            DeferralKind::Vacant => {}
        }
    }

    /// The single teardown site: shuts the transport, drains both rings,
    /// emits the terminal `Disconnected`, and frees the bind.
    pub(crate) fn teardown_bind(&mut self, bind: BindId) {
        let (protocol, status) = {
            let Some(b) = self.binds.get_mut(bind.0) else { return };
            if b.flags.contains(BindFlags::CLOSED) {
                return;
            }
            b.flags.insert(BindFlags::CLOSED);
            (b.protocol, b.close_status)
        };
        let driver = self.driver(protocol);
        (driver.close)(self, bind);
        {
            let b = &mut self.binds[bind.0];
            b.send_ring.clear(&mut self.pool);
            b.recv_ring.clear(&mut self.pool);
            b.dgram_dest.clear();
        }
        debug!(bind = ?bind, status, "bind closed");
        self.emit(bind, &Notify::Disconnected { status });
        if let Some(b) = self.binds.try_remove(bind.0) {
            self.deferrals.remove(b.close_deferral);
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let ids: Vec<BindId> = self.binds.iter().map(|(k, _)| BindId(k)).collect();
        for id in ids {
            self.teardown_bind(id);
        }
        let states = std::mem::take(&mut self.framework_state);
        for (id, state) in states.into_iter().enumerate() {
            if let Some(state) = state {
                framework::framework(id).destroy(self, state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn deferral_runs_once_per_arming() {
        let mut rt = Runtime::new(Config::default());
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let d = rt.add_deferral(move |_| h.set(h.get() + 1));

        rt.defer(d);
        rt.defer(d); // no-op: already armed
        rt.wait(0);
        assert_eq!(hits.get(), 1);

        rt.wait(0);
        assert_eq!(hits.get(), 1);

        rt.defer(d);
        rt.wait(0);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn deferral_rearm_runs_next_turn() {
        let mut rt = Runtime::new(Config::default());
        let hits = Rc::new(Cell::new(0_u32));
        let slot: Rc<Cell<Option<DeferralId>>> = Rc::new(Cell::new(None));

        let h = Rc::clone(&hits);
        let s = Rc::clone(&slot);
        let d = rt.add_deferral(move |rt| {
            h.set(h.get() + 1);
            if h.get() < 3 {
                rt.defer(s.get().expect("deferral id unset"));
            }
        });
        slot.set(Some(d));

        rt.defer(d);
        rt.wait(0);
        // The re-arm lands behind the drain snapshot: one execution per turn.
        assert_eq!(hits.get(), 1);
        rt.wait(0);
        assert_eq!(hits.get(), 2);
        rt.wait(0);
        assert_eq!(hits.get(), 3);
        rt.wait(0);
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn user_poll_runs_every_turn() {
        let mut rt = Runtime::new(Config::default());
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let id = rt.add_user_poll(move |_| h.set(h.get() + 1));

        rt.wait(-1); // user polls force a zero timeout; this cannot block
        rt.wait(-1);
        assert_eq!(hits.get(), 2);

        rt.remove_user_poll(id);
    }

    #[test]
    fn stop_handle_wakes_blocking_run() {
        let mut rt = Runtime::new(Config::default());
        let handle = rt.stop_handle();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            handle.stop();
        });
        rt.run();
        t.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "no driver registered")]
    fn rdma_without_framework_is_unavailable() {
        let mut rt = Runtime::new(Config::default());
        let ep = Endpoint::new("127.0.0.1", 0).unwrap();
        rt.bind(ProtocolId::DatagramRdmacmRc, &ep, BindOps::new(|_, _, _| {}));
    }
}

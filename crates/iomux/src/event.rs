use bitflags::bitflags;
use slab::Slab;

use crate::bind::BindId;
use crate::runtime::Runtime;

bitflags! {
    /// Per-fd readiness and interest bits.
    ///
    /// Readiness (`READABLE`/`WRITABLE`/`ERROR`) records what the kernel or
    /// driver last reported; interest records what the runtime wants to make
    /// progress on. Dispatch fires only when both halves agree, so handlers
    /// can drop interest without discarding cached edge-triggered readiness,
    /// and readiness survives loop turns without re-arming the kernel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        const READABLE = 0x01;
        const WRITABLE = 0x02;
        const ERROR = 0x04;
        const ACTIVE = 0x08;
        const READ_INTEREST = 0x10;
        const WRITE_INTEREST = 0x20;
    }
}

impl EventFlags {
    #[inline]
    pub fn read_ready(self) -> bool {
        self.contains(Self::READABLE | Self::READ_INTEREST)
    }

    #[inline]
    pub fn write_ready(self) -> bool {
        self.contains(Self::WRITABLE | Self::WRITE_INTEREST)
    }

    #[inline]
    pub fn runnable(self) -> bool {
        self.read_ready() || self.write_ready() || self.contains(Self::ERROR)
    }
}

/// Handler slot: plain function routed through the owning bind.
pub(crate) type EventFn = fn(&mut Runtime, BindId);

pub(crate) fn event_noop(_: &mut Runtime, _: BindId) {}

pub(crate) struct Event {
    pub flags: EventFlags,
    pub bind: BindId,
    pub read_fn: EventFn,
    pub write_fn: EventFn,
    pub error_fn: EventFn,
}

impl Event {
    pub(crate) fn new(bind: BindId, read_fn: EventFn, write_fn: EventFn, error_fn: EventFn) -> Self {
        Self { flags: EventFlags::empty(), bind, read_fn, write_fn, error_fn }
    }
}

/// Key of an event inside the runtime's event set; doubles as the mio
/// poll token.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EventId(pub(crate) usize);

/// The readiness flag machine plus the list of events with pending work.
///
/// Enqueueing is guarded by the `ACTIVE` flag; dequeueing is lazy — entries
/// whose flags are no longer runnable are dropped by the dispatch sweep, so
/// handlers may mark each other unreadable mid-turn without invalidating the
/// list the loop is walking.
pub(crate) struct EventSet {
    events: Slab<Event>,
    active: Vec<EventId>,
}

impl EventSet {
    pub(crate) fn new() -> Self {
        Self { events: Slab::new(), active: Vec::new() }
    }

    pub(crate) fn insert(&mut self, event: Event) -> EventId {
        EventId(self.events.insert(event))
    }

    pub(crate) fn remove(&mut self, id: EventId) {
        if self.events.try_remove(id.0).is_some() {
            self.active.retain(|a| *a != id);
        }
    }

    #[inline]
    pub(crate) fn get(&self, id: EventId) -> Option<&Event> {
        self.events.get(id.0)
    }

    pub(crate) fn read_interest(&mut self, id: EventId) {
        let ev = &mut self.events[id.0];
        ev.flags.insert(EventFlags::READ_INTEREST);
        if ev.flags.contains(EventFlags::READABLE) {
            self.activate(id);
        }
    }

    pub(crate) fn read_disinterest(&mut self, id: EventId) {
        self.events[id.0].flags.remove(EventFlags::READ_INTEREST);
    }

    pub(crate) fn write_interest(&mut self, id: EventId) {
        let ev = &mut self.events[id.0];
        ev.flags.insert(EventFlags::WRITE_INTEREST);
        if ev.flags.contains(EventFlags::WRITABLE) {
            self.activate(id);
        }
    }

    pub(crate) fn write_disinterest(&mut self, id: EventId) {
        self.events[id.0].flags.remove(EventFlags::WRITE_INTEREST);
    }

    pub(crate) fn mark_readable(&mut self, id: EventId) {
        let ev = &mut self.events[id.0];
        ev.flags.insert(EventFlags::READABLE);
        if ev.flags.contains(EventFlags::READ_INTEREST) {
            self.activate(id);
        }
    }

    pub(crate) fn mark_unreadable(&mut self, id: EventId) {
        self.events[id.0].flags.remove(EventFlags::READABLE);
    }

    pub(crate) fn mark_writable(&mut self, id: EventId) {
        let ev = &mut self.events[id.0];
        ev.flags.insert(EventFlags::WRITABLE);
        if ev.flags.contains(EventFlags::WRITE_INTEREST) {
            self.activate(id);
        }
    }

    pub(crate) fn mark_unwritable(&mut self, id: EventId) {
        self.events[id.0].flags.remove(EventFlags::WRITABLE);
    }

    /// Errors always activate; the dispatcher runs the error handler before
    /// any further read/write dispatch on the same event.
    pub(crate) fn mark_error(&mut self, id: EventId) {
        self.events[id.0].flags.insert(EventFlags::ERROR);
        self.activate(id);
    }

    fn activate(&mut self, id: EventId) {
        let ev = &mut self.events[id.0];
        if !ev.flags.contains(EventFlags::ACTIVE) {
            ev.flags.insert(EventFlags::ACTIVE);
            self.active.push(id);
        }
    }

    #[inline]
    pub(crate) fn active_len(&self) -> usize {
        self.active.len()
    }

    #[inline]
    pub(crate) fn active_at(&self, i: usize) -> EventId {
        self.active[i]
    }

    /// True when any listed event still has dispatchable work; drives the
    /// zero-timeout decision in the loop.
    pub(crate) fn has_runnable(&self) -> bool {
        self.active
            .iter()
            .any(|id| self.events.get(id.0).is_some_and(|ev| ev.flags.runnable()))
    }

    /// Drops entries that are no longer runnable, clearing their `ACTIVE`
    /// flag so they can re-enqueue later.
    pub(crate) fn sweep(&mut self) {
        let events = &mut self.events;
        self.active.retain(|id| match events.get_mut(id.0) {
            Some(ev) if ev.flags.runnable() => true,
            Some(ev) => {
                ev.flags.remove(EventFlags::ACTIVE);
                false
            }
            None => false,
        });
    }
}

use std::collections::VecDeque;

use slab::Slab;

use crate::bind::BindId;
use crate::runtime::Runtime;

/// Key of a deferral inside the runtime's deferral queue.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeferralId(pub(crate) usize);

pub(crate) enum DeferralKind {
    /// Tear down a bind: the only site that frees bind state, so handlers
    /// running on top of that bind can never free themselves mid-call.
    CloseBind(BindId),
    /// General single-shot callback.
    Callback(Box<dyn FnMut(&mut Runtime)>),
    /// Placeholder while a callback is out being executed.
    Vacant,
}

struct Entry {
    kind: DeferralKind,
    armed: bool,
}

/// FIFO of armed single-shot callbacks, drained at the end of each loop
/// turn.
///
/// Arming an armed deferral is a no-op; `armed` is cleared before the
/// callback runs, so a callback may re-arm itself for the next turn. Only
/// the deferrals armed when the drain starts run in that turn.
pub(crate) struct DeferralQueue {
    entries: Slab<Entry>,
    fifo: VecDeque<DeferralId>,
}

impl DeferralQueue {
    pub(crate) fn new() -> Self {
        Self { entries: Slab::new(), fifo: VecDeque::new() }
    }

    pub(crate) fn create(&mut self, kind: DeferralKind) -> DeferralId {
        DeferralId(self.entries.insert(Entry { kind, armed: false }))
    }

    pub(crate) fn remove(&mut self, id: DeferralId) {
        self.entries.try_remove(id.0);
        // A stale fifo reference is skipped by pop_armed.
    }

    pub(crate) fn arm(&mut self, id: DeferralId) {
        let entry = &mut self.entries[id.0];
        if !entry.armed {
            entry.armed = true;
            self.fifo.push_back(id);
        }
    }

    #[inline]
    pub(crate) fn is_armed(&self, id: DeferralId) -> bool {
        self.entries.get(id.0).is_some_and(|e| e.armed)
    }

    #[inline]
    pub(crate) fn pending(&self) -> bool {
        !self.fifo.is_empty()
    }

    /// Number of queued arms at the start of a drain; re-arms during the
    /// drain land behind this snapshot and run next turn.
    #[inline]
    pub(crate) fn armed_len(&self) -> usize {
        self.fifo.len()
    }

    /// Pops the next armed deferral, clearing `armed` before it runs.
    /// Stale ids (removed entries) are skipped.
    pub(crate) fn pop_armed(&mut self) -> Option<DeferralId> {
        while let Some(id) = self.fifo.pop_front() {
            if let Some(entry) = self.entries.get_mut(id.0) {
                if entry.armed {
                    entry.armed = false;
                    return Some(id);
                }
            }
        }
        None
    }

    /// Takes the kind out for execution; [`restore`](Self::restore) puts a
    /// callback back if the entry still exists.
    pub(crate) fn take_kind(&mut self, id: DeferralId) -> DeferralKind {
        let entry = self.entries.get_mut(id.0).expect("deferral vanished mid-drain");
        std::mem::replace(&mut entry.kind, DeferralKind::Vacant)
    }

    pub(crate) fn restore(&mut self, id: DeferralId, kind: DeferralKind) {
        if let Some(entry) = self.entries.get_mut(id.0) {
            if matches!(entry.kind, DeferralKind::Vacant) {
                entry.kind = kind;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arming_is_idempotent() {
        let mut q = DeferralQueue::new();
        let d = q.create(DeferralKind::CloseBind(BindId(0)));
        q.arm(d);
        q.arm(d);
        assert_eq!(q.armed_len(), 1);
        assert!(q.is_armed(d));

        assert_eq!(q.pop_armed(), Some(d));
        assert!(!q.is_armed(d));
        assert_eq!(q.pop_armed(), None);
    }

    #[test]
    fn fifo_order() {
        let mut q = DeferralQueue::new();
        let a = q.create(DeferralKind::CloseBind(BindId(0)));
        let b = q.create(DeferralKind::CloseBind(BindId(1)));
        q.arm(b);
        q.arm(a);
        assert_eq!(q.pop_armed(), Some(b));
        assert_eq!(q.pop_armed(), Some(a));
    }

    #[test]
    fn rearm_after_pop_queues_again() {
        let mut q = DeferralQueue::new();
        let d = q.create(DeferralKind::CloseBind(BindId(0)));
        q.arm(d);
        let popped = q.pop_armed().unwrap();
        // armed was cleared before execution, so re-arming queues a fresh run.
        q.arm(popped);
        assert_eq!(q.armed_len(), 1);
        assert_eq!(q.pop_armed(), Some(d));
    }

    #[test]
    fn removed_entries_are_skipped() {
        let mut q = DeferralQueue::new();
        let a = q.create(DeferralKind::CloseBind(BindId(0)));
        let b = q.create(DeferralKind::CloseBind(BindId(1)));
        q.arm(a);
        q.arm(b);
        q.remove(a);
        assert_eq!(q.pop_armed(), Some(b));
        assert_eq!(q.pop_armed(), None);
    }
}

use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Poll, Token, Waker};
use slab::Slab;

use crate::event::EventId;
use crate::runtime::Runtime;

/// Reserved token for the cross-thread stop waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Key of a registered user poll.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UserPollId(pub(crate) usize);

/// Driver callback polled once per loop turn, for readiness sources the
/// kernel cannot wait on (e.g. user-space completion queues).
pub type UserPollFn = Box<dyn FnMut(&mut Runtime)>;

/// A readiness wake translated out of the kernel poller.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Wake {
    pub event: EventId,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// The runtime's readiness sources: a blocking kernel poll (mio, edge
/// triggered) plus any registered user polls.
///
/// While user polls exist the loop must spin with a zero timeout, since the
/// kernel cannot wake it for them.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    user: Slab<Option<UserPollFn>>,
    wakes: Vec<Wake>,
}

impl Poller {
    pub(crate) fn new(event_capacity: usize) -> Self {
        let poll = Poll::new().expect("failed to create kernel poller");
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).expect("failed to create waker"));
        Self {
            poll,
            events: Events::with_capacity(event_capacity),
            waker,
            user: Slab::new(),
            wakes: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    #[inline]
    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    #[inline]
    pub(crate) fn has_user_polls(&self) -> bool {
        !self.user.is_empty()
    }

    pub(crate) fn add_user_poll(&mut self, f: UserPollFn) -> UserPollId {
        UserPollId(self.user.insert(Some(f)))
    }

    pub(crate) fn remove_user_poll(&mut self, id: UserPollId) {
        self.user.try_remove(id.0);
    }

    pub(crate) fn user_poll_ids(&self) -> Vec<UserPollId> {
        self.user.iter().map(|(k, _)| UserPollId(k)).collect()
    }

    /// Takes a user poll callback out for execution; the slot survives so
    /// the callback can be restored after it ran.
    pub(crate) fn take_user_poll(&mut self, id: UserPollId) -> Option<UserPollFn> {
        self.user.get_mut(id.0).and_then(Option::take)
    }

    pub(crate) fn restore_user_poll(&mut self, id: UserPollId, f: UserPollFn) {
        if let Some(slot) = self.user.get_mut(id.0) {
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }

    /// One kernel poll; readiness lands in the wake list for the runtime to
    /// feed into the event machine. EINTR retries with a zero timeout so a
    /// signal cannot stretch the wait.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) {
        let mut timeout = timeout;
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    timeout = Some(Duration::ZERO);
                }
                Err(e) => panic!("kernel poll failed: {e}"),
            }
        }

        self.wakes.clear();
        for event in &self.events {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            self.wakes.push(Wake {
                event: EventId(token.0),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
                error: event.is_error(),
            });
        }
    }

    pub(crate) fn take_wakes(&mut self) -> Vec<Wake> {
        std::mem::take(&mut self.wakes)
    }

    /// Returns the wake buffer after the runtime walked it, keeping its
    /// capacity for the next turn.
    pub(crate) fn put_wakes(&mut self, mut wakes: Vec<Wake>) {
        wakes.clear();
        self.wakes = wakes;
    }
}

use std::collections::{HashMap, HashSet};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::wait::{Readiness, WaitState};

/// Per-tick readiness interest: which fiber waits on which descriptor, and
/// the earliest deadline among all of them.
#[derive(Debug, Default)]
pub(crate) struct Interest {
    recv: HashMap<RawFd, usize>,
    send: HashMap<RawFd, usize>,
    /// Descriptors whose fiber was stepped since they were last armed.
    rearm: HashSet<RawFd>,
    deadline: Option<Instant>,
}

impl Interest {
    pub(crate) fn clear(&mut self) {
        self.recv.clear();
        self.send.clear();
        self.rearm.clear();
        self.deadline = None;
    }

    /// Records the state of the fiber at `index`.
    pub(crate) fn add(&mut self, index: usize, state: &WaitState, rearm: bool) {
        if let Some((fd, readiness)) = state.interest() {
            let (map, other) = match readiness {
                Readiness::Readable => (&mut self.recv, &mut self.send),
                Readiness::Writable => (&mut self.send, &mut self.recv),
            };
            if other.remove(&fd).is_some() || map.insert(fd, index).is_some() {
                tracing::warn!(fd, "descriptor claimed by more than one fiber");
                map.insert(fd, index);
            }
            if rearm {
                self.rearm.insert(fd);
            }
        }
        self.fold(state.expire_at());
    }

    fn fold(&mut self, expire_at: Option<Instant>) {
        self.deadline = match (self.deadline, expire_at) {
            (Some(current), Some(next)) => Some(current.min(next)),
            (current, None) => current,
            (None, next) => next,
        };
    }

    /// How long the next multiplex may block. `None` means no fiber has a
    /// deadline.
    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub(crate) fn lookup(&self, fd: RawFd) -> Option<(usize, Readiness)> {
        self.recv
            .get(&fd)
            .map(|&index| (index, Readiness::Readable))
            .or_else(|| self.send.get(&fd).map(|&index| (index, Readiness::Writable)))
    }

    pub(crate) fn wants_rearm(&self, fd: RawFd) -> bool {
        self.rearm.contains(&fd)
    }

    pub(crate) fn wanted(&self) -> impl Iterator<Item = (RawFd, Readiness)> + '_ {
        let recv = self.recv.keys().map(|&fd| (fd, Readiness::Readable));
        let send = self.send.keys().map(|&fd| (fd, Readiness::Writable));
        recv.chain(send)
    }
}

/// The multiplex timeout for a set of states: the time left until the
/// earliest expiration, never negative, or `None` when nothing expires.
pub fn tick_timeout(states: impl IntoIterator<Item = WaitState>, now: Instant) -> Option<Duration> {
    let mut interest = Interest::default();
    for state in states {
        interest.fold(state.expire_at());
    }
    interest.timeout(now)
}

//! Wait descriptors yielded by handlers.
//!
//! Every time a handler suspends it declares exactly one [`WaitState`]: the
//! descriptor it needs to become writable or readable, or a plain timer. The
//! scheduler never sees anything else from a suspended handler.

use std::fmt;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use chrono::{Local, TimeDelta};

/// What a suspended handler is waiting for, and until when.
///
/// Expirations are absolute points in monotonic time, computed when the state
/// is created. They never drift across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Resume when `fd` is writable, or cancel at `expire_at`.
    Send { fd: RawFd, expire_at: Instant },
    /// Resume when `fd` is readable, or cancel at `expire_at`.
    Recv { fd: RawFd, expire_at: Instant },
    /// Resume at `expire_at`. Without an expiration the handler only moves
    /// when something re-queues it through its waker.
    Wait { expire_at: Option<Instant> },
}

/// The readiness a descriptor is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Readiness {
    Readable,
    Writable,
}

impl WaitState {
    /// Waits for `fd` to become writable for at most `timeout`.
    pub fn send(fd: RawFd, timeout: Duration) -> Self {
        WaitState::Send {
            fd,
            expire_at: Instant::now() + timeout,
        }
    }

    /// Waits for `fd` to become readable for at most `timeout`.
    pub fn recv(fd: RawFd, timeout: Duration) -> Self {
        WaitState::Recv {
            fd,
            expire_at: Instant::now() + timeout,
        }
    }

    /// Waits on the clock alone.
    pub fn wait(timeout: Option<Duration>) -> Self {
        WaitState::Wait {
            expire_at: timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    pub fn expire_at(&self) -> Option<Instant> {
        match *self {
            WaitState::Send { expire_at, .. } | WaitState::Recv { expire_at, .. } => {
                Some(expire_at)
            }
            WaitState::Wait { expire_at } => expire_at,
        }
    }

    /// Returns `true` once `now` has passed the expiration. A state without
    /// an expiration never expires.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expire_at().is_some_and(|expire_at| now > expire_at)
    }

    /// The descriptor this state waits on, if any.
    pub fn fd(&self) -> Option<RawFd> {
        match *self {
            WaitState::Send { fd, .. } | WaitState::Recv { fd, .. } => Some(fd),
            WaitState::Wait { .. } => None,
        }
    }

    /// The descriptor together with the readiness it waits for.
    pub fn interest(&self) -> Option<(RawFd, Readiness)> {
        match *self {
            WaitState::Send { fd, .. } => Some((fd, Readiness::Writable)),
            WaitState::Recv { fd, .. } => Some((fd, Readiness::Readable)),
            WaitState::Wait { .. } => None,
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, WaitState::Wait { .. })
    }
}

/// Shown for deadlines beyond what the wall clock can represent.
const UNREPRESENTABLE: &str = "--:--:--";

/// Local wall-clock rendering of a monotonic deadline.
fn clock(expire_at: Instant) -> String {
    let now = Instant::now();
    let wall = if expire_at >= now {
        TimeDelta::from_std(expire_at - now)
            .ok()
            .and_then(|delta| Local::now().checked_add_signed(delta))
    } else {
        TimeDelta::from_std(now - expire_at)
            .ok()
            .and_then(|delta| Local::now().checked_sub_signed(delta))
    };
    match wall {
        Some(wall) => wall.format("%H:%M:%S").to_string(),
        None => UNREPRESENTABLE.to_owned(),
    }
}

impl fmt::Display for WaitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            WaitState::Send { fd, expire_at } => write!(f, "SEND({fd},{})", clock(expire_at)),
            WaitState::Recv { fd, expire_at } => write!(f, "RECV({fd},{})", clock(expire_at)),
            WaitState::Wait {
                expire_at: Some(expire_at),
            } => write!(f, "WAIT({})", clock(expire_at)),
            WaitState::Wait { expire_at: None } => f.write_str("WAIT(None)"),
        }
    }
}

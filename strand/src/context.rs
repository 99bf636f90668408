//! The capability a handler runs with.
//!
//! [`FiberCx`] is the only channel between a handler and its fiber: yields go
//! into its slot, output goes into its journal, and cancellations come back
//! out of it at the next resume.

use std::cell::{Cell, RefCell, RefMut};
use std::fmt;
use std::future::Future;
use std::os::fd::AsRawFd;
use std::panic::Location;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::error::{HandlerError, Violation};
use crate::journal::Journal;
use crate::wait::WaitState;

struct Shared {
    /// The state yielded by the current resume.
    yielded: Cell<Option<WaitState>>,
    violation: RefCell<Option<Violation>>,
    /// Cancellation waiting to be observed at the suspension point.
    injected: RefCell<Option<String>>,
    /// Where the handler last suspended.
    at: Cell<Option<&'static Location<'static>>>,
    journal: RefCell<Box<dyn Journal>>,
    waker: Waker,
}

/// Handle given to every handler. Cheap to clone; not `Send`.
#[derive(Clone)]
pub struct FiberCx {
    shared: Rc<Shared>,
}

impl FiberCx {
    pub(crate) fn new(journal: Box<dyn Journal>, waker: Waker) -> Self {
        Self {
            shared: Rc::new(Shared {
                yielded: Cell::new(None),
                violation: RefCell::new(None),
                injected: RefCell::new(None),
                at: Cell::new(None),
                journal: RefCell::new(journal),
                waker,
            }),
        }
    }

    /// Suspends until `source` is writable. Resolves to
    /// [`HandlerError::Cancelled`] if `timeout` elapses first.
    #[track_caller]
    pub fn send(&self, source: &impl AsRawFd, timeout: Duration) -> Suspend {
        self.suspend(WaitState::send(source.as_raw_fd(), timeout))
    }

    /// Suspends until `source` is readable. Resolves to
    /// [`HandlerError::Cancelled`] if `timeout` elapses first.
    #[track_caller]
    pub fn recv(&self, source: &impl AsRawFd, timeout: Duration) -> Suspend {
        self.suspend(WaitState::recv(source.as_raw_fd(), timeout))
    }

    /// Suspends on the clock. With `None` the fiber sleeps until its
    /// [`waker`](Self::waker) is woken.
    #[track_caller]
    pub fn wait(&self, timeout: Option<Duration>) -> Suspend {
        self.suspend(WaitState::wait(timeout))
    }

    #[track_caller]
    pub fn sleep(&self, timeout: Duration) -> Suspend {
        self.wait(Some(timeout))
    }

    #[track_caller]
    fn suspend(&self, state: WaitState) -> Suspend {
        Suspend {
            cx: self.clone(),
            state,
            at: Location::caller(),
            parked: false,
        }
    }

    /// Re-queues this fiber for a step. Only honoured while it is in a
    /// `Wait` state; safe to wake from any thread.
    pub fn waker(&self) -> Waker {
        self.shared.waker.clone()
    }

    /// Writes one line to the fiber's journal.
    pub fn line(&self, text: impl fmt::Display) {
        self.print(&format!("{text}\n"));
    }

    pub fn print(&self, text: &str) {
        self.journal().write(text);
    }

    pub(crate) fn journal(&self) -> RefMut<'_, Box<dyn Journal>> {
        self.shared.journal.borrow_mut()
    }

    /// Records the state the current resume yields.
    pub(crate) fn park(&self, state: WaitState, at: &'static Location<'static>) {
        match self.shared.yielded.get() {
            Some(first) => {
                let mut violation = self.shared.violation.borrow_mut();
                if violation.is_none() {
                    *violation = Some(Violation::Overlapping {
                        first,
                        second: state,
                    });
                }
            }
            None => {
                self.shared.yielded.set(Some(state));
                self.shared.at.set(Some(at));
            }
        }
    }

    /// What the last resume yielded, if it kept to the protocol.
    pub(crate) fn take_yield(&self) -> Result<Option<WaitState>, Violation> {
        let yielded = self.shared.yielded.take();
        match self.shared.violation.borrow_mut().take() {
            Some(violation) => Err(violation),
            None => Ok(yielded),
        }
    }

    /// Called by a leaf future when it is polled again after parking.
    pub(crate) fn resumed(&self) -> Result<(), HandlerError> {
        match self.take_injection() {
            Some(reason) => Err(HandlerError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    pub(crate) fn inject(&self, reason: &str) {
        *self.shared.injected.borrow_mut() = Some(reason.to_owned());
    }

    pub(crate) fn take_injection(&self) -> Option<String> {
        self.shared.injected.borrow_mut().take()
    }

    pub(crate) fn waker_ref(&self) -> &Waker {
        &self.shared.waker
    }

    /// Source location of the last suspension point.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        self.shared.at.get()
    }
}

impl fmt::Write for FiberCx {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        self.print(text);
        Ok(())
    }
}

impl fmt::Debug for FiberCx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberCx")
            .field("yielded", &self.shared.yielded.get())
            .field("at", &self.shared.at.get())
            .finish_non_exhaustive()
    }
}

/// A single yield. The first poll parks the state and returns `Pending`;
/// the next poll reports how the fiber was resumed.
#[must_use = "a yield does nothing unless awaited"]
pub struct Suspend {
    cx: FiberCx,
    state: WaitState,
    at: &'static Location<'static>,
    parked: bool,
}

impl Future for Suspend {
    type Output = Result<(), HandlerError>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.parked {
            return Poll::Ready(self.cx.resumed());
        }
        self.parked = true;
        self.cx.park(self.state, self.at);
        Poll::Pending
    }
}

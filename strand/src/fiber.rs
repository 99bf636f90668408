//! The handler driver.
//!
//! A [`Fiber`] owns one handler and advances it a single suspension at a
//! time. Whatever the handler does, a fiber never fails outward: completion,
//! errors, panics and protocol violations all end with the fiber's state set
//! to `None` and, where there is something to say, a journal entry.

use std::fmt;
use std::future::Future;
use std::task::Waker;

use metrics::counter;

use crate::context::FiberCx;
use crate::error::{Failure, HandlerResult};
use crate::journal::Journal;
use crate::task::{HandlerFuture, Resume, Task};
use crate::wait::WaitState;

/// Scheduler-wide fiber identifier. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub(crate) u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct Fiber {
    id: FiberId,
    task: Task,
    cx: FiberCx,
    state: Option<WaitState>,
    /// Set whenever the state may have changed since the scheduler last
    /// armed this fiber's descriptor.
    rearm: bool,
}

impl Fiber {
    /// Creates a fiber in `Wait(None)`. The handler does not run until the
    /// first [`step`](Self::step).
    pub fn new<F, Fut>(id: FiberId, journal: Box<dyn Journal>, waker: Waker, build: F) -> Self
    where
        F: FnOnce(FiberCx) -> Fut,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        let cx = FiberCx::new(journal, waker);
        let future: HandlerFuture = Box::pin(build(cx.clone()));
        Self {
            id,
            task: Task::new(future, cx.clone()),
            cx,
            state: Some(WaitState::Wait { expire_at: None }),
            rearm: true,
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Current state; `None` once the fiber has terminated.
    pub fn state(&self) -> Option<WaitState> {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_none()
    }

    /// Resumes the handler up to its next suspension point.
    pub fn step(&mut self) {
        if self.is_terminated() {
            return;
        }
        self.rearm = true;
        let outcome = self.task.resume();
        self.settle(outcome);
    }

    /// Raises `reason` as a cancellation inside the handler. A handler that
    /// cannot take it is terminated instead.
    pub fn cancel(&mut self, reason: &str) {
        if self.is_terminated() {
            return;
        }
        self.rearm = true;
        match self.task.throw(reason) {
            Resume::Rejected => {
                self.cx.print(&format!("Terminating fiber: {reason}\n"));
                self.state = None;
            }
            outcome => self.settle(outcome),
        }
    }

    fn settle(&mut self, outcome: Resume) {
        match outcome {
            Resume::Suspended(state) => {
                self.state = Some(state);
                self.cx.journal().stepped(&*self);
            }
            Resume::Done => self.state = None,
            Resume::Failed(failure) => self.fail(failure),
            Resume::Rejected => self.state = None,
        }
    }

    fn fail(&mut self, failure: Failure) {
        counter!("strand_fiber_failures_total", "kind" => failure.kind()).increment(1);
        // reported with the state the handler was last waiting in
        let repr = self.to_string();
        self.state = None;
        self.cx.journal().failed(&failure, &repr);
    }

    /// Clears and returns the re-arm flag.
    pub(crate) fn take_rearm(&mut self) -> bool {
        std::mem::take(&mut self.rearm)
    }
}

impl fmt::Display for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cx.location() {
            Some(at) => write!(f, "{at}: ")?,
            None => f.write_str("<start>: ")?,
        }
        match self.state {
            Some(state) => write!(f, "{state}"),
            None => f.write_str("None"),
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // anything the handler writes while unwinding still lands in the buffer
        self.task.abort();
        self.cx.journal().close();
    }
}

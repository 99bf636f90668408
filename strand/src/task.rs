//! The handler future and the two ways of resuming it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;

use crate::context::FiberCx;
use crate::error::{Failure, HandlerResult, Violation};
use crate::wait::WaitState;

/// A pinned, heap-allocated handler.
///
/// Handlers run on the scheduler thread only, so they need not be `Send`.
pub type HandlerFuture = LocalBoxFuture<'static, HandlerResult>;

/// Outcome of resuming a task once.
#[derive(Debug)]
pub(crate) enum Resume {
    /// The handler suspended on a new state.
    Suspended(WaitState),
    /// The handler ran to completion.
    Done,
    /// The handler failed; the task is finished.
    Failed(Failure),
    /// An injected cancellation was not taken up by the handler.
    Rejected,
}

/// Owns a handler future and polls it one suspension at a time.
pub(crate) struct Task {
    future: Option<HandlerFuture>,
    cx: FiberCx,
}

impl Task {
    pub(crate) fn new(future: HandlerFuture, cx: FiberCx) -> Self {
        Self {
            future: Some(future),
            cx,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.future.is_none()
    }

    /// Resumes the handler with nothing injected.
    pub(crate) fn resume(&mut self) -> Resume {
        let Some(future) = self.future.as_mut() else {
            return Resume::Done;
        };

        let mut context = Context::from_waker(self.cx.waker_ref());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut context)));
        let yielded = self.cx.take_yield();

        let outcome = match polled {
            Err(payload) => Resume::Failed(Failure::Panic(panic_message(payload))),
            Ok(Poll::Ready(Ok(()))) => Resume::Done,
            Ok(Poll::Ready(Err(err))) => Resume::Failed(err.into()),
            Ok(Poll::Pending) => match yielded {
                Ok(Some(state)) => Resume::Suspended(state),
                Ok(None) => Resume::Failed(Violation::Unannounced.into()),
                Err(violation) => Resume::Failed(violation.into()),
            },
        };

        if !matches!(outcome, Resume::Suspended(_)) {
            self.future = None;
        }
        outcome
    }

    /// Resumes the handler with a cancellation raised at its suspension
    /// point.
    pub(crate) fn throw(&mut self, reason: &str) -> Resume {
        if self.is_finished() {
            return Resume::Rejected;
        }

        self.cx.inject(reason);
        let outcome = self.resume();
        match (self.cx.take_injection(), outcome) {
            (Some(_), Resume::Suspended(_)) => {
                self.future = None;
                Resume::Rejected
            }
            (_, outcome) => outcome,
        }
    }

    /// Drops the handler without resuming it.
    pub(crate) fn abort(&mut self) {
        self.future = None;
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use std::future::Future;
    use std::panic::Location;
    use std::task::Poll;

    use futures::future;
    use futures::task::noop_waker;

    use super::*;
    use crate::error::HandlerError;
    use crate::journal::{Console, GatherJournal};

    fn context() -> FiberCx {
        let (console, _) = Console::capture();
        FiberCx::new(Box::new(GatherJournal::new(console)), noop_waker())
    }

    fn task(cx: FiberCx, handler: impl Future<Output = HandlerResult> + 'static) -> Task {
        Task::new(Box::pin(handler), cx)
    }

    #[test]
    fn test_immediate_completion_is_done() {
        let cx = context();
        let mut task = task(cx, async { Ok(()) });
        assert!(matches!(task.resume(), Resume::Done));
        assert!(task.is_finished());
        // resuming a finished task stays done
        assert!(matches!(task.resume(), Resume::Done));
    }

    #[test]
    fn test_suspends_on_each_yield() {
        let cx = context();
        let handler = {
            let cx = cx.clone();
            async move {
                cx.sleep(Duration::from_secs(1)).await?;
                cx.wait(None).await?;
                Ok(())
            }
        };
        let mut task = task(cx, handler);

        assert!(matches!(task.resume(), Resume::Suspended(s) if s.expire_at().is_some()));
        assert!(matches!(
            task.resume(),
            Resume::Suspended(WaitState::Wait { expire_at: None })
        ));
        assert!(matches!(task.resume(), Resume::Done));
    }

    #[test]
    fn test_error_return_is_failure() {
        let cx = context();
        let mut task = task(cx, async { Err(HandlerError::invalid("bad request")) });
        match task.resume() {
            Resume::Failed(Failure::Error(HandlerError::Invalid(message))) => {
                assert_eq!(message, "bad request")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(task.is_finished());
    }

    #[test]
    fn test_panic_is_caught() {
        let cx = context();
        let mut task = task(cx, async {
            if true {
                panic!("handler exploded");
            }
            Ok(())
        });
        match task.resume() {
            Resume::Failed(Failure::Panic(message)) => assert_eq!(message, "handler exploded"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(task.is_finished());
    }

    #[test]
    fn test_foreign_pending_is_a_violation() {
        let cx = context();
        let mut task = task(cx, future::pending());
        assert!(matches!(
            task.resume(),
            Resume::Failed(Failure::Protocol(Violation::Unannounced))
        ));
        assert!(task.is_finished());
    }

    #[test]
    fn test_joined_yields_are_a_violation() {
        let cx = context();
        let handler = {
            let cx = cx.clone();
            async move {
                let (a, b) = future::join(cx.wait(None), cx.sleep(Duration::from_secs(1))).await;
                a.and(b)
            }
        };
        let mut task = task(cx, handler);
        assert!(matches!(
            task.resume(),
            Resume::Failed(Failure::Protocol(Violation::Overlapping { .. }))
        ));
    }

    #[test]
    fn test_throw_reaches_suspension_point() {
        let cx = context();
        let handler = {
            let cx = cx.clone();
            async move {
                match cx.wait(None).await {
                    Err(HandlerError::Cancelled(reason)) => {
                        cx.line(format_args!("caught {reason}"));
                        cx.sleep(Duration::from_secs(1)).await
                    }
                    other => other,
                }
            }
        };
        let mut task = task(cx, handler);
        assert!(matches!(task.resume(), Resume::Suspended(_)));
        // the handler recovers and yields again
        assert!(matches!(task.throw("Connection timed out"), Resume::Suspended(s) if s.expire_at().is_some()));
        assert!(matches!(task.resume(), Resume::Done));
    }

    #[test]
    fn test_throw_propagates_as_failure() {
        let cx = context();
        let handler = {
            let cx = cx.clone();
            async move { cx.wait(None).await }
        };
        let mut task = task(cx, handler);
        task.resume();
        match task.throw("Connection timed out") {
            Resume::Failed(Failure::Error(HandlerError::Cancelled(reason))) => {
                assert_eq!(reason, "Connection timed out")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_unobserved_throw_is_rejected() {
        let cx = context();
        // a suspension point that never looks at injected cancellations
        let handler = {
            let cx = cx.clone();
            future::poll_fn(move |_| {
                cx.park(WaitState::wait(None), Location::caller());
                Poll::<HandlerResult>::Pending
            })
        };
        let mut task = task(cx, handler);
        assert!(matches!(task.resume(), Resume::Suspended(_)));
        assert!(matches!(task.throw("Connection timed out"), Resume::Rejected));
        assert!(task.is_finished());
    }

    #[test]
    fn test_throw_into_finished_task_is_rejected() {
        let cx = context();
        let mut task = task(cx, async { Ok(()) });
        task.resume();
        assert!(matches!(task.throw("late"), Resume::Rejected));
    }
}

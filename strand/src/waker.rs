use std::io;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};

use crossbeam_queue::SegQueue;
use mio::{Registry, Token};

use crate::fiber::FiberId;

/// Fibers waiting to be stepped outside the readiness path.
///
/// The scheduler drains this queue once per tick. Wakers from other threads
/// push here and then interrupt the poll so the tick happens promptly.
pub(crate) struct Requeue {
    queue: SegQueue<FiberId>,
    waker: mio::Waker,
}

impl Requeue {
    pub(crate) fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        Ok(Self {
            queue: SegQueue::new(),
            waker: mio::Waker::new(registry, token)?,
        })
    }

    /// Queues a fiber from inside the tick loop. The poller is not woken.
    pub(crate) fn enqueue(&self, id: FiberId) {
        self.queue.push(id);
    }

    /// Queues a fiber and interrupts a blocked poll.
    pub(crate) fn push(&self, id: FiberId) {
        self.queue.push(id);
        if let Err(err) = self.waker.wake() {
            tracing::warn!(fiber = %id, error = %err, "failed to wake the scheduler");
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn drain(&self) -> impl Iterator<Item = FiberId> + '_ {
        std::iter::from_fn(|| self.queue.pop())
    }
}

/// Re-queues one fiber for a step.
///
/// Handed to handlers through [`FiberCx::waker`](crate::FiberCx::waker) and
/// used as the waker of every poll, so leaf futures from other libraries can
/// nudge the fiber too.
struct WakerData {
    id: FiberId,
    requeue: Arc<Requeue>,
}

pub(crate) fn fiber_waker(id: FiberId, requeue: Arc<Requeue>) -> Waker {
    let data = Box::new(WakerData { id, requeue });
    let ptr = Box::into_raw(data) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(ptr, &VTABLE)) }
}

unsafe fn clone(data: *const ()) -> RawWaker {
    // Borrow, do not take ownership
    let data = unsafe { &*(data as *const WakerData) };
    let cloned = Box::new(WakerData {
        id: data.id,
        requeue: data.requeue.clone(),
    });
    RawWaker::new(Box::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn wake(data: *const ()) {
    let data = unsafe { Box::from_raw(data as *mut WakerData) };
    data.requeue.push(data.id);
}

unsafe fn wake_by_ref(data: *const ()) {
    let data = unsafe { &*(data as *const WakerData) };
    data.requeue.push(data.id);
}

unsafe fn drop(data: *const ()) {
    let _ = unsafe { Box::from_raw(data as *mut WakerData) };
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);

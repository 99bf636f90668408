use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use mio::net::TcpListener;
use mio::{Events, Poll, Token};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use tracing::{debug, info, warn};

use super::interest::{Interest, tick_timeout};
use super::registry::Armed;
use crate::context::FiberCx;
use crate::error::{HandlerResult, RuntimeError};
use crate::fiber::{Fiber, FiberId};
use crate::handler::HandlerFactory;
use crate::journal::{self, Console, Journal, Mode, TagAllocator, ctime};
use crate::net::Connection;
use crate::wait::Readiness;
use crate::waker::{Requeue, fiber_waker};

// Descriptor tokens are the descriptor numbers themselves; these sit at the
// far end of the range, clear of any fd.
const LISTENER: Token = Token(usize::MAX - 1);
const WAKER: Token = Token(usize::MAX - 2);
const SIGNALS: Token = Token(usize::MAX - 3);

const TIMED_OUT: &str = "Connection timed out";

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    /// Read/write timeout handed to every accepted connection.
    pub io_timeout: Duration,
    pub console: Console,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            io_timeout: Duration::from_secs(30),
            console: Console::stdout(),
        }
    }
}

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Running,
    /// SIGINT or SIGTERM arrived.
    Interrupted,
}

enum Ready {
    Listener,
    Fiber(usize),
}

pub struct Scheduler<F> {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    fibers: Vec<Fiber>,
    /// Index of each fiber in `fibers`. Rebuilt by every scan.
    positions: HashMap<FiberId, usize>,
    factory: F,
    settings: Settings,
    tags: TagAllocator,
    next_id: u64,
    interest: Interest,
    armed: Armed,
    requeue: Arc<Requeue>,
    signals: Option<Signals>,
    /// The listener needs re-arming after an accept error cut a drain short.
    listener_rearm: bool,
}

impl<F: HandlerFactory> Scheduler<F> {
    /// Binds the listening socket and prepares the poller.
    pub fn bind(addr: SocketAddr, factory: F, settings: Settings) -> Result<Self, RuntimeError> {
        let poll = Poll::new().map_err(RuntimeError::Poll)?;
        let mut listener = TcpListener::bind(addr).map_err(RuntimeError::Bind)?;
        poll.registry()
            .register(&mut listener, LISTENER, mio::Interest::READABLE)
            .map_err(RuntimeError::Register)?;
        let requeue = Requeue::new(poll.registry(), WAKER).map_err(RuntimeError::Register)?;

        Ok(Self {
            listener,
            poll,
            events: Events::with_capacity(1024),
            fibers: Vec::new(),
            positions: HashMap::new(),
            factory,
            settings,
            tags: TagAllocator::default(),
            next_id: 0,
            interest: Interest::default(),
            armed: Armed::default(),
            requeue: Arc::new(requeue),
            signals: None,
            listener_rearm: false,
        })
    }

    /// Ends [`run`](Self::run) on SIGINT or SIGTERM.
    pub fn handle_signals(&mut self) -> Result<(), RuntimeError> {
        let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(RuntimeError::Signals)?;
        self.poll
            .registry()
            .register(&mut signals, SIGNALS, mio::Interest::READABLE)
            .map_err(RuntimeError::Register)?;
        self.signals = Some(signals);
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn console(&self) -> &Console {
        &self.settings.console
    }

    /// Number of fibers still owned by the scheduler.
    pub fn live(&self) -> usize {
        self.fibers.len()
    }

    pub fn fibers(&self) -> &[Fiber] {
        &self.fibers
    }

    /// Starts a fiber that is not tied to a connection. Its first step
    /// happens in the current or next tick.
    pub fn spawn<B, Fut>(&mut self, build: B) -> FiberId
    where
        B: FnOnce(FiberCx) -> Fut,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        let (id, journal, waker) = self.prepare();
        self.admit(Fiber::new(id, journal, waker, build))
    }

    fn prepare(&mut self) -> (FiberId, Box<dyn Journal>, Waker) {
        let id = FiberId(self.next_id);
        self.next_id += 1;
        let journal = journal::open(self.settings.mode, &self.settings.console, &mut self.tags);
        (id, journal, fiber_waker(id, self.requeue.clone()))
    }

    fn admit(&mut self, fiber: Fiber) -> FiberId {
        let id = fiber.id();
        self.positions.insert(id, self.fibers.len());
        self.fibers.push(fiber);
        self.requeue.enqueue(id);
        counter!("strand_fibers_spawned_total").increment(1);
        id
    }

    /// Ticks until interrupted.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.tick()? == Tick::Interrupted {
                return Ok(());
            }
        }
    }

    /// How long the next poll would block given the current fiber states.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        tick_timeout(self.fibers.iter().filter_map(Fiber::state), now)
    }

    /// Runs one iteration of the loop: expire, arm, poll once, dispatch.
    pub fn tick(&mut self) -> Result<Tick, RuntimeError> {
        counter!("strand_ticks_total").increment(1);
        let now = Instant::now();
        self.scan(now);
        gauge!("strand_fibers_live").set(self.fibers.len() as f64);

        self.armed.sync(self.poll.registry(), &self.interest);
        if std::mem::take(&mut self.listener_rearm) {
            self.poll
                .registry()
                .reregister(&mut self.listener, LISTENER, mio::Interest::READABLE)
                .map_err(RuntimeError::Register)?;
        }

        // fibers spawned since the last tick still need their first step.
        // Deadlines are measured after the scan, which may have stepped handlers.
        let timeout = if self.requeue.is_empty() {
            self.interest.timeout(Instant::now())
        } else {
            Some(Duration::ZERO)
        };
        self.multiplex(timeout)?;

        let mut reads = Vec::new();
        let mut writes = Vec::new();
        let mut interrupted = false;
        for event in self.events.iter() {
            match event.token() {
                LISTENER => reads.push(Ready::Listener),
                WAKER => {}
                SIGNALS => {
                    if let Some(signals) = self.signals.as_mut() {
                        for signal in signals.pending() {
                            info!(signal, "received termination signal");
                            interrupted = true;
                        }
                    }
                }
                Token(token) => match self.interest.lookup(token as RawFd) {
                    Some((index, Readiness::Readable)) => reads.push(Ready::Fiber(index)),
                    Some((index, Readiness::Writable)) => writes.push(index),
                    None => {}
                },
            }
        }
        if interrupted {
            return Ok(Tick::Interrupted);
        }

        for ready in reads {
            match ready {
                Ready::Listener => self.accept(),
                Ready::Fiber(index) => self.fibers[index].step(),
            }
        }
        for index in writes {
            self.fibers[index].step();
        }
        self.restep();

        Ok(Tick::Running)
    }

    /// Expires overdue fibers, drops terminated ones and rebuilds the
    /// interest maps for the survivors.
    fn scan(&mut self, now: Instant) {
        let interest = &mut self.interest;
        let positions = &mut self.positions;
        interest.clear();
        positions.clear();
        let mut index = 0;
        self.fibers.retain_mut(|fiber| {
            if let Some(state) = fiber.state().filter(|state| state.is_expired(now)) {
                if state.is_wait() {
                    fiber.step();
                } else {
                    debug!(fiber = %fiber.id(), %state, "timed out");
                    counter!("strand_fiber_timeouts_total").increment(1);
                    fiber.cancel(TIMED_OUT);
                }
            }
            let Some(state) = fiber.state() else {
                return false;
            };
            interest.add(index, &state, fiber.take_rearm());
            positions.insert(fiber.id(), index);
            index += 1;
            true
        });
    }

    fn multiplex(&mut self, timeout: Option<Duration>) -> Result<(), RuntimeError> {
        let idle = timeout.is_none();
        if idle {
            self.settings.console.line(format_args!("[ IDLE ] {}", ctime()));
        }
        let polled = self.poll.poll(&mut self.events, timeout);
        if idle {
            self.settings.console.line(format_args!("[ BUSY ] {}", ctime()));
        }
        match polled {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                self.events.clear();
                Ok(())
            }
            Err(err) => Err(RuntimeError::Poll(err)),
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let (id, journal, waker) = self.prepare();
                    debug!(fiber = %id, %peer, "accepted connection");
                    let timeout = self.settings.io_timeout;
                    let factory = &mut self.factory;
                    let fiber = Fiber::new(id, journal, waker, |cx| {
                        factory.build(Connection::new(stream, peer, cx.clone(), timeout), cx)
                    });
                    self.admit(fiber);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    self.listener_rearm = true;
                    break;
                }
            }
        }
    }

    /// Steps fibers woken through their waker since the last tick.
    fn restep(&mut self) {
        let queued: Vec<FiberId> = self.requeue.drain().collect();
        let mut seen = HashSet::with_capacity(queued.len());
        for id in queued {
            if !seen.insert(id) {
                continue;
            }
            // only fibers parked on the clock take external wake-ups
            let Some(&index) = self.positions.get(&id) else {
                continue;
            };
            let fiber = &mut self.fibers[index];
            if fiber.state().is_some_and(|state| state.is_wait()) {
                fiber.step();
            }
        }
    }
}

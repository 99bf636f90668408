use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::thread;
use std::time::{Duration, Instant};

use strand::journal::Capture;
use strand::{
    Connection, Console, FiberCx, HandlerError, HandlerFactory, HandlerResult, Mode, Scheduler,
    Settings, WaitState, factory,
};

fn settings(mode: Mode, io_timeout: Duration) -> (Settings, Capture) {
    let (console, capture) = Console::capture();
    let settings = Settings {
        mode,
        io_timeout,
        console,
    };
    (settings, capture)
}

fn bind<F: HandlerFactory>(factory: F, settings: Settings) -> Scheduler<F> {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    Scheduler::bind(addr, factory, settings).unwrap()
}

/// Keeps every poll bounded so a test can never block forever.
fn heartbeat<F: HandlerFactory>(scheduler: &mut Scheduler<F>) {
    scheduler.spawn(|cx| async move {
        loop {
            cx.sleep(Duration::from_millis(10)).await?;
        }
    });
}

fn connect<F: HandlerFactory>(scheduler: &Scheduler<F>) -> TcpStream {
    TcpStream::connect(scheduler.local_addr().unwrap()).unwrap()
}

fn settle<F: HandlerFactory>(scheduler: &mut Scheduler<F>, mut done: impl FnMut(&Scheduler<F>) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(scheduler) {
        assert!(Instant::now() < deadline, "scheduler did not settle");
        scheduler.tick().unwrap();
    }
}

#[test]
fn test_accept_spawns_one_fiber_per_connection() {
    let peers = Rc::new(RefCell::new(Vec::new()));
    let seen = peers.clone();
    let (settings, _) = settings(Mode::Buffering, Duration::from_secs(5));
    let mut scheduler = bind(
        factory(move |mut conn: Connection, _cx: FiberCx| {
            seen.borrow_mut().push(conn.peer_addr());
            async move {
                let mut buf = [0u8; 8];
                conn.read(&mut buf).await?;
                Ok(())
            }
        }),
        settings,
    );
    heartbeat(&mut scheduler);

    let first = connect(&scheduler);
    settle(&mut scheduler, |_| peers.borrow().len() == 1);
    assert_eq!(peers.borrow()[0], first.local_addr().unwrap());
    assert_eq!(scheduler.live(), 2);

    let _second = connect(&scheduler);
    settle(&mut scheduler, |_| peers.borrow().len() == 2);
    assert_eq!(scheduler.live(), 3);

    // both handlers got their first step and now wait on their sockets
    let receiving = scheduler
        .fibers()
        .iter()
        .filter(|fiber| matches!(fiber.state(), Some(WaitState::Recv { .. })))
        .count();
    assert_eq!(receiving, 2);
}

#[test]
fn test_completed_handler_removed_on_next_scan() {
    let accepted = Rc::new(Cell::new(0));
    let count = accepted.clone();
    let (settings, _) = settings(Mode::Buffering, Duration::from_secs(5));
    let mut scheduler = bind(
        factory(move |_conn: Connection, _cx: FiberCx| {
            count.set(count.get() + 1);
            async { Ok(()) }
        }),
        settings,
    );
    heartbeat(&mut scheduler);

    let _client = connect(&scheduler);
    settle(&mut scheduler, |_| accepted.get() == 1);
    assert_eq!(scheduler.live(), 2);
    assert!(scheduler.fibers().iter().any(|fiber| fiber.is_terminated()));

    scheduler.tick().unwrap();
    assert_eq!(scheduler.live(), 1);
    assert!(scheduler.fibers().iter().all(|fiber| !fiber.is_terminated()));
}

#[test]
fn test_recv_timeout_cancels_exactly_once() {
    let cancelled = Rc::new(Cell::new(0));
    let count = cancelled.clone();
    let (settings, capture) = settings(Mode::Buffering, Duration::from_millis(50));
    let mut scheduler = bind(
        factory(move |mut conn: Connection, cx: FiberCx| {
            let count = count.clone();
            async move {
                let mut buf = [0u8; 8];
                match conn.read(&mut buf).await {
                    Err(HandlerError::Cancelled(reason)) => {
                        count.set(count.get() + 1);
                        cx.line(format_args!("cancelled: {reason}"));
                        Ok(())
                    }
                    other => other.map(drop),
                }
            }
        }),
        settings,
    );
    heartbeat(&mut scheduler);

    // silent client
    let _client = connect(&scheduler);
    settle(&mut scheduler, |s| cancelled.get() == 1 && s.live() == 1);
    for _ in 0..5 {
        scheduler.tick().unwrap();
    }
    assert_eq!(cancelled.get(), 1);
    assert_eq!(
        capture
            .contents()
            .matches("cancelled: Connection timed out")
            .count(),
        1
    );
}

#[test]
fn test_send_timeout_cancels_exactly_once() {
    let cancelled = Rc::new(Cell::new(0));
    let count = cancelled.clone();
    let (settings, capture) = settings(Mode::Buffering, Duration::from_millis(50));
    let mut scheduler = bind(
        factory(move |mut conn: Connection, cx: FiberCx| {
            let count = count.clone();
            async move {
                let chunk = [0u8; 65536];
                loop {
                    match conn.write_all(&chunk).await {
                        Ok(()) => continue,
                        Err(HandlerError::Cancelled(reason)) => {
                            count.set(count.get() + 1);
                            cx.line(format_args!("cancelled: {reason}"));
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }),
        settings,
    );
    heartbeat(&mut scheduler);

    // the client never reads, so the socket buffers fill up
    let _client = connect(&scheduler);
    settle(&mut scheduler, |s| {
        s.fibers()
            .iter()
            .any(|fiber| matches!(fiber.state(), Some(WaitState::Send { .. })))
            || cancelled.get() == 1
    });
    settle(&mut scheduler, |s| cancelled.get() == 1 && s.live() == 1);
    for _ in 0..5 {
        scheduler.tick().unwrap();
    }
    assert_eq!(cancelled.get(), 1);
    assert_eq!(
        capture
            .contents()
            .matches("cancelled: Connection timed out")
            .count(),
        1
    );
}

#[test]
fn test_unhandled_timeout_is_reported_softly() {
    let (settings, capture) = settings(Mode::Buffering, Duration::from_millis(30));
    let mut scheduler = bind(
        factory(|mut conn: Connection, _cx: FiberCx| async move {
            let mut buf = [0u8; 8];
            conn.read(&mut buf).await?;
            Ok(())
        }),
        settings,
    );
    heartbeat(&mut scheduler);

    let _client = connect(&scheduler);
    settle(&mut scheduler, |_| {
        capture.contents().contains("Error: Connection timed out")
    });
    assert!(!capture.contents().contains("Traceback"));
}

#[test]
fn test_wait_expiry_resumes_fiber() {
    let (settings, _) = settings(Mode::Buffering, Duration::from_secs(5));
    let mut scheduler = bind(factory(|_: Connection, _: FiberCx| async { Ok(()) }), settings);
    let woke = Rc::new(Cell::new(false));
    let flag = woke.clone();
    scheduler.spawn(move |cx| async move {
        cx.sleep(Duration::from_millis(30)).await?;
        flag.set(true);
        Ok(())
    });
    heartbeat(&mut scheduler);

    let started = Instant::now();
    settle(&mut scheduler, |_| woke.get());
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn test_tick_timeout_is_earliest_deadline() {
    let (settings, _) = settings(Mode::Buffering, Duration::from_secs(5));
    let mut scheduler = bind(factory(|_: Connection, _: FiberCx| async { Ok(()) }), settings);
    for secs in [2, 7] {
        scheduler.spawn(move |cx| async move { cx.sleep(Duration::from_secs(secs)).await });
    }
    scheduler.tick().unwrap();

    let timeout = scheduler.next_timeout(Instant::now()).unwrap();
    assert!(timeout <= Duration::from_secs(2));
    assert!(timeout > Duration::from_millis(1500));
}

#[test]
fn test_echo_round_trip() {
    let (settings, _) = settings(Mode::Buffering, Duration::from_secs(5));
    let mut scheduler = bind(
        factory(|mut conn: Connection, _cx: FiberCx| async move {
            let mut buf = [0u8; 64];
            loop {
                let n = conn.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                conn.write_all(&buf[..n]).await?;
            }
        }),
        settings,
    );
    heartbeat(&mut scheduler);

    let mut client = connect(&scheduler);
    client.set_nonblocking(true).unwrap();
    client.write_all(b"hello fiber").unwrap();

    let mut got = Vec::new();
    settle(&mut scheduler, |_| {
        let mut buf = [0u8; 64];
        match client.read(&mut buf) {
            Ok(n) => got.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("client read failed: {e}"),
        }
        got.len() == 11
    });
    assert_eq!(got, b"hello fiber");

    drop(client);
    settle(&mut scheduler, |s| s.live() == 1);
}

#[test]
fn test_waker_restarts_waiting_fiber() {
    let (settings, _) = settings(Mode::Buffering, Duration::from_secs(5));
    let mut scheduler = bind(factory(|_: Connection, _: FiberCx| async { Ok(()) }), settings);
    let slot: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));
    let done = Rc::new(Cell::new(false));

    let (waker, flag) = (slot.clone(), done.clone());
    scheduler.spawn(move |cx| async move {
        *waker.lock().unwrap() = Some(cx.waker());
        cx.wait(None).await?;
        flag.set(true);
        Ok(())
    });
    heartbeat(&mut scheduler);
    settle(&mut scheduler, |_| slot.lock().unwrap().is_some());
    for _ in 0..3 {
        scheduler.tick().unwrap();
    }
    assert!(!done.get());

    let waker = slot.lock().unwrap().take().unwrap();
    thread::spawn(move || waker.wake()).join().unwrap();
    settle(&mut scheduler, |_| done.get());
}

#[test]
fn test_buffered_output_flushed_once_in_order() {
    let (settings, capture) = settings(Mode::Buffering, Duration::from_secs(5));
    let mut scheduler = bind(
        factory(|mut conn: Connection, cx: FiberCx| async move {
            cx.line("before read");
            let mut buf = [0u8; 8];
            let n = conn.read(&mut buf).await?;
            cx.line(format_args!("read {n} bytes"));
            Ok(())
        }),
        settings,
    );
    heartbeat(&mut scheduler);

    let mut client = connect(&scheduler);
    settle(&mut scheduler, |s| s.live() == 2);
    assert_eq!(capture.contents(), "");

    client.write_all(b"abc").unwrap();
    settle(&mut scheduler, |s| s.live() == 1);

    let out = capture.contents();
    assert_eq!(capture.flushes(), 1);
    assert!(out.starts_with("[ 0.00 ] "));
    let before = out.find("before read").unwrap();
    let after = out.find("read 3 bytes").unwrap();
    assert!(before < after);
}

#[test]
fn test_tagging_mode_tags_each_connection() {
    let (settings, capture) = settings(Mode::Tagging, Duration::from_secs(5));
    let mut scheduler = bind(
        factory(|mut conn: Connection, cx: FiberCx| async move {
            cx.line(format_args!("hello {}", conn.peer_addr()));
            let mut buf = [0u8; 8];
            conn.read(&mut buf).await?;
            Ok(())
        }),
        settings,
    );
    heartbeat(&mut scheduler);

    let _first = connect(&scheduler);
    let _second = connect(&scheduler);
    settle(&mut scheduler, |s| s.live() == 3);

    // the heartbeat took tag 0000
    let out = capture.contents();
    assert!(out.contains("[ 0001 ] "), "{out}");
    assert!(out.contains("[ 0002 ] "), "{out}");
    assert!(out.contains("  0001   hello 127.0.0.1:"));
    assert!(out.contains("  0002   Waiting at "));
}

#[test]
fn test_misbehaving_handlers_are_contained() {
    let (settings, capture) = settings(Mode::Buffering, Duration::from_secs(5));
    let mut scheduler = bind(
        factory(|_conn: Connection, _cx: FiberCx| async move {
            // a future that never parks a wait state
            futures::future::pending::<()>().await;
            Ok(())
        }),
        settings,
    );
    heartbeat(&mut scheduler);

    let _client = connect(&scheduler);
    settle(&mut scheduler, |_| capture.contents().contains("Traceback"));
    assert!(capture.contents().contains("protocol violation"));
    settle(&mut scheduler, |s| s.live() == 1);

    // the scheduler keeps serving
    let _again = connect(&scheduler);
    settle(&mut scheduler, |_| {
        capture.contents().matches("protocol violation").count() == 2
    });
}

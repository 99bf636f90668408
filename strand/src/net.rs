use std::future::Future;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::Location;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use mio::net::TcpStream;

use crate::context::FiberCx;
use crate::error::HandlerError;
use crate::wait::WaitState;

/// An accepted connection, owned by its handler.
///
/// Reads and writes never block the scheduler: when the socket is not ready
/// they yield `Recv`/`Send` with the connection's timeout and retry once the
/// fiber is resumed.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    cx: FiberCx,
    timeout: Duration,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, cx: FiberCx, timeout: Duration) -> Self {
        Self {
            stream,
            peer,
            cx,
            timeout,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// How long a single read or write may wait for readiness.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn context(&self) -> &FiberCx {
        &self.cx
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.stream.shutdown(how)
    }

    /// Reads into `buf`. Resolves to `Ok(0)` at end of stream.
    #[track_caller]
    pub fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> ReadFuture<'a> {
        ReadFuture {
            conn: self,
            buf,
            at: Location::caller(),
            parked: false,
        }
    }

    /// Writes some prefix of `buf`.
    #[track_caller]
    pub fn write<'a>(&'a mut self, buf: &'a [u8]) -> WriteFuture<'a> {
        WriteFuture {
            conn: self,
            buf,
            at: Location::caller(),
            parked: false,
        }
    }

    /// Writes all of `buf`.
    #[track_caller]
    pub fn write_all<'a>(&'a mut self, buf: &'a [u8]) -> WriteAllFuture<'a> {
        WriteAllFuture {
            conn: self,
            buf,
            at: Location::caller(),
            parked: false,
        }
    }

    fn park(&self, state: WaitState, at: &'static Location<'static>) {
        self.cx.park(state, at);
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Leaf future for [`Connection::read`].
pub struct ReadFuture<'a> {
    conn: &'a mut Connection,
    buf: &'a mut [u8],
    at: &'static Location<'static>,
    parked: bool,
}

impl Future for ReadFuture<'_> {
    type Output = Result<usize, HandlerError>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if std::mem::take(&mut this.parked) {
            this.conn.cx.resumed()?;
        }
        loop {
            match this.conn.stream.read(this.buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let state = WaitState::recv(this.conn.as_raw_fd(), this.conn.timeout);
                    this.conn.park(state, this.at);
                    this.parked = true;
                    return Poll::Pending;
                }
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }
}

/// Leaf future for [`Connection::write`].
pub struct WriteFuture<'a> {
    conn: &'a mut Connection,
    buf: &'a [u8],
    at: &'static Location<'static>,
    parked: bool,
}

impl Future for WriteFuture<'_> {
    type Output = Result<usize, HandlerError>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if std::mem::take(&mut this.parked) {
            this.conn.cx.resumed()?;
        }
        loop {
            match this.conn.stream.write(this.buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let state = WaitState::send(this.conn.as_raw_fd(), this.conn.timeout);
                    this.conn.park(state, this.at);
                    this.parked = true;
                    return Poll::Pending;
                }
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }
}

/// Leaf future for [`Connection::write_all`].
pub struct WriteAllFuture<'a> {
    conn: &'a mut Connection,
    buf: &'a [u8],
    at: &'static Location<'static>,
    parked: bool,
}

impl Future for WriteAllFuture<'_> {
    type Output = Result<(), HandlerError>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if std::mem::take(&mut this.parked) {
            this.conn.cx.resumed()?;
        }
        while !this.buf.is_empty() {
            match this.conn.stream.write(this.buf) {
                Ok(0) => return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero).into())),
                Ok(n) => this.buf = &this.buf[n..],
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let state = WaitState::send(this.conn.as_raw_fd(), this.conn.timeout);
                    this.conn.park(state, this.at);
                    this.parked = true;
                    return Poll::Pending;
                }
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
        Poll::Ready(Ok(()))
    }
}
